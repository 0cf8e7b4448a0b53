use thiserror::Error;

/// Errors produced by the MCP bridge.
#[derive(Debug, Error)]
pub enum McpError {
    #[error("codec error: {0}")]
    Codec(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("MetaTrader EA not connected")]
    UpstreamAbsent,

    #[error("timeout waiting for response to request {0}")]
    UpstreamTimeout(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("connection limit reached ({0})")]
    LimitReached(usize),

    #[error("not connected")]
    NotConnected,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

pub type McpResult<T> = Result<T, McpError>;
