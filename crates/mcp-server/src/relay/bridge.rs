//! Upstream bridge: the single link to the MetaTrader EA.
//!
//! Whichever connection most recently declared the EA identity owns the link.
//! A superseded EA connection is left open but is no longer addressed.

use super::registry::{ConnectionId, Outbound};
use mcp_core::messages::CommandForward;
use mcp_core::{encode_text, McpError, McpResult};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

struct UpstreamLink {
    conn_id: ConnectionId,
    outbound: Outbound,
}

/// Holds the active EA link, if any.
pub struct UpstreamBridge {
    link: RwLock<Option<UpstreamLink>>,
}

impl Default for UpstreamBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl UpstreamBridge {
    pub fn new() -> Self {
        Self {
            link: RwLock::new(None),
        }
    }

    /// Install `conn_id` as the EA link, replacing any previous one.
    ///
    /// Returns the id of the superseded link, if it was a different connection.
    pub async fn set_link(&self, conn_id: ConnectionId, outbound: Outbound) -> Option<ConnectionId> {
        let previous = self
            .link
            .write()
            .await
            .replace(UpstreamLink { conn_id, outbound })
            .map(|old| old.conn_id)
            .filter(|old| *old != conn_id);

        match previous {
            Some(old) => warn!(conn_id, superseded = old, "EA link replaced by newer identity"),
            None => info!(conn_id, "EA link established"),
        }
        previous
    }

    pub async fn is_linked(&self) -> bool {
        self.link.read().await.is_some()
    }

    pub async fn linked_id(&self) -> Option<ConnectionId> {
        self.link.read().await.as_ref().map(|l| l.conn_id)
    }

    /// Hand a command envelope to the EA's transport.
    ///
    /// Success means the bytes were queued for the socket, not that the EA
    /// processed them. Returns the id of the connection written to.
    pub async fn send(
        &self,
        request_id: &str,
        command: &str,
        parameters: Value,
    ) -> McpResult<ConnectionId> {
        let (conn_id, outbound) = match self.link.read().await.as_ref() {
            Some(link) => (link.conn_id, link.outbound.clone()),
            None => return Err(McpError::UpstreamAbsent),
        };

        let text = encode_text(&CommandForward::new(request_id, command, parameters))?;
        outbound
            .push(text)
            .map_err(|e| McpError::Transport(format!("EA connection {conn_id}: {e}")))?;
        debug!(conn_id, request_id, command, "command forwarded to EA");
        Ok(conn_id)
    }

    /// Clear the link if `conn_id` currently holds it.
    pub async fn clear_link(&self, conn_id: ConnectionId) -> bool {
        let mut link = self.link.write().await;
        if link.as_ref().map(|l| l.conn_id) == Some(conn_id) {
            *link = None;
            info!(conn_id, "EA link cleared");
            true
        } else {
            false
        }
    }

    /// Drop the link unconditionally (server teardown).
    pub async fn clear(&self) {
        self.link.write().await.take();
    }
}
