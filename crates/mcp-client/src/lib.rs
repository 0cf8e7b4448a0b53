//! mcp-client: Rust client library for the MetaTrader Connection Protocol.
//!
//! Connects to an `mcp-server` broker over TCP, authenticates with a static
//! token, and sends trading commands that the broker relays to MetaTrader.
//!
//! # Quick Start
//!
//! ```no_run
//! use mcp_client::{ClientConfig, McpClient};
//!
//! # async fn example() -> mcp_core::McpResult<()> {
//! let client = McpClient::connect("127.0.0.1:5555", ClientConfig {
//!     auth_token: Some("3f6c...".into()),
//!     ..Default::default()
//! }).await?;
//!
//! let price = client.get_price("EURUSD").await?;
//! println!("{price}");
//!
//! client.disconnect().await;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod commands;

// Re-export primary public types.
pub use client::{ClientConfig, McpClient};
pub use commands::{OrderRequest, OrderType};

// Re-export mcp-core error types for convenience.
pub use mcp_core::{McpError, McpResult};
