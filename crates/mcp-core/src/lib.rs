//! mcp-core: Shared protocol library for the MetaTrader Connection Protocol bridge.
//!
//! Provides the JSON message shapes, the streaming frame codec, the error
//! type shared by server and client, and identifier generation.

pub mod codec;
pub mod error;
pub mod messages;
pub mod token;

// Re-export commonly used items at crate root.
pub use codec::{encode_line, encode_text, FrameDecoder};
pub use error::{McpError, McpResult};
pub use messages::{Envelope, Reply, UPSTREAM_IDENTITY};
pub use token::{generate_request_id, generate_token};
