//! mcp-server: MetaTrader Connection Protocol broker.
//!
//! Accepts TCP connections from control clients and from one MetaTrader EA,
//! authenticates clients with static tokens, and relays their commands to the
//! EA strictly one at a time, forwarding each reply to the client that asked.

pub mod auth;
pub mod config;
pub mod handler;
pub mod relay;
pub mod server;
pub mod transport;

pub use config::{ConfigOverrides, ServerConfig};
pub use server::McpServer;
