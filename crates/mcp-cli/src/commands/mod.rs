//! CLI subcommand implementations.

pub mod call;
pub mod trade;
pub mod watch;

use anyhow::{Context, Result};
use mcp_client::{ClientConfig, McpClient};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// Where and how to reach the broker, after config and flag merging.
#[derive(Debug, Clone)]
pub struct Target {
    pub host: String,
    pub port: u16,
    pub token: Option<String>,
    pub timeout: Duration,
}

impl Target {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Connect and, when a token is set, authenticate.
    pub async fn connect(&self) -> Result<McpClient> {
        let addr = self.addr();
        debug!(addr = %addr, auth = self.token.is_some(), "connecting");
        McpClient::connect(
            &addr,
            ClientConfig {
                auth_token: self.token.clone(),
                response_timeout: self.timeout,
                ..Default::default()
            },
        )
        .await
        .with_context(|| format!("failed to connect to {addr}"))
    }
}

/// Print a reply as pretty JSON. An error status is reported as a failure.
pub fn print_reply(reply: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(reply)?);
    if reply.get("status").and_then(Value::as_str) == Some("error") {
        let message = reply
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        anyhow::bail!("server returned an error: {message}");
    }
    Ok(())
}
