//! Registry of live connections.
//!
//! Every accepted socket is tracked here with its role, auth state, and the
//! sender feeding its writer task. Callers only ever get cloned snapshots;
//! nothing outside this module touches the map directly.

use mcp_core::{McpError, McpResult};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Notify, RwLock};
use tracing::{debug, info};

/// Opaque connection identifier, unique for the lifetime of the process.
pub type ConnectionId = u64;

/// Lines a connection may have waiting for its socket.
pub const OUTBOUND_CAPACITY: usize = 256;

/// Sender half of a connection's outbound queue (one JSON text per item).
///
/// Pushes never wait. A peer that stops reading fills the queue, and the
/// push that finds it full trips the overflow signal its handler watches.
#[derive(Debug, Clone)]
pub struct Outbound {
    tx: mpsc::Sender<String>,
    overflow: Arc<Notify>,
}

impl Outbound {
    /// A queue holding at most `capacity` lines, plus its receiving end.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity);
        let outbound = Self {
            tx,
            overflow: Arc::new(Notify::new()),
        };
        (outbound, rx)
    }

    /// Queue `text` for the writer task.
    pub fn push(&self, text: String) -> McpResult<()> {
        match self.tx.try_send(text) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.overflow.notify_one();
                Err(McpError::Transport("outbound queue full".into()))
            }
            Err(TrySendError::Closed(_)) => Err(McpError::Transport("connection closed".into())),
        }
    }

    /// Resolves once a push has found the queue full.
    pub async fn overflowed(&self) {
        self.overflow.notified().await;
    }
}

/// What a connection turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Nothing routable received yet.
    Unclassified,
    /// A control client submitting commands.
    Client,
    /// The MetaTrader EA.
    Upstream,
}

/// Snapshot of one registered connection.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub remote_addr: SocketAddr,
    pub role: Role,
    pub authenticated: bool,
    pub connected_at: Instant,
    pub last_activity: Instant,
    pub outbound: Outbound,
}

/// Registry of live connections.
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnectionId, ConnectionInfo>>,
    next_id: AtomicU64,
    max_connections: usize,
}

impl ConnectionRegistry {
    /// Create an empty registry admitting at most `max_connections` entries.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            max_connections,
        }
    }

    /// Register a freshly accepted connection.
    ///
    /// `authenticated` is the initial auth state (true when auth is disabled).
    pub async fn register(
        &self,
        remote_addr: SocketAddr,
        outbound: Outbound,
        authenticated: bool,
    ) -> McpResult<ConnectionId> {
        let mut connections = self.connections.write().await;
        if connections.len() >= self.max_connections {
            return Err(McpError::LimitReached(self.max_connections));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        connections.insert(
            id,
            ConnectionInfo {
                id,
                remote_addr,
                role: Role::Unclassified,
                authenticated,
                connected_at: now,
                last_activity: now,
                outbound,
            },
        );
        info!(conn_id = id, remote = %remote_addr, total = connections.len(), "connection registered");
        Ok(id)
    }

    /// Remove a connection, returning its final snapshot.
    pub async fn unregister(&self, id: ConnectionId) -> Option<ConnectionInfo> {
        let removed = self.connections.write().await.remove(&id);
        if removed.is_some() {
            debug!(conn_id = id, "connection unregistered");
        }
        removed
    }

    /// Record activity on a connection.
    pub async fn touch(&self, id: ConnectionId) {
        if let Some(conn) = self.connections.write().await.get_mut(&id) {
            conn.last_activity = Instant::now();
        }
    }

    pub async fn get(&self, id: ConnectionId) -> Option<ConnectionInfo> {
        self.connections.read().await.get(&id).cloned()
    }

    /// Set the role. Returns false for an unknown id.
    pub async fn set_role(&self, id: ConnectionId, role: Role) -> bool {
        match self.connections.write().await.get_mut(&id) {
            Some(conn) => {
                conn.role = role;
                true
            }
            None => false,
        }
    }

    /// Set the auth flag. Returns false for an unknown id.
    pub async fn set_authenticated(&self, id: ConnectionId, authenticated: bool) -> bool {
        match self.connections.write().await.get_mut(&id) {
            Some(conn) => {
                conn.authenticated = authenticated;
                true
            }
            None => false,
        }
    }

    pub async fn is_authenticated(&self, id: ConnectionId) -> bool {
        self.connections
            .read()
            .await
            .get(&id)
            .map(|c| c.authenticated)
            .unwrap_or(false)
    }

    pub async fn role(&self, id: ConnectionId) -> Option<Role> {
        self.connections.read().await.get(&id).map(|c| c.role)
    }

    /// Time since the connection last showed activity.
    pub async fn idle_for(&self, id: ConnectionId) -> Option<Duration> {
        self.connections
            .read()
            .await
            .get(&id)
            .map(|c| c.last_activity.elapsed())
    }

    /// Queue `text` for delivery to `id`.
    ///
    /// Returns false when the connection is gone; that is not an error.
    pub async fn send(&self, id: ConnectionId, text: String) -> bool {
        let outbound = match self.connections.read().await.get(&id) {
            Some(conn) => conn.outbound.clone(),
            None => {
                debug!(conn_id = id, "send to unknown connection dropped");
                return false;
            }
        };
        match outbound.push(text) {
            Ok(()) => true,
            Err(e) => {
                debug!(conn_id = id, error = %e, "message to connection dropped");
                false
            }
        }
    }

    /// Point-in-time copy of every connection.
    pub async fn snapshot(&self) -> Vec<ConnectionInfo> {
        self.connections.read().await.values().cloned().collect()
    }

    pub async fn count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Drop every connection. Their writer tasks end once the senders are gone.
    pub async fn close_all(&self) -> usize {
        let mut connections = self.connections.write().await;
        let count = connections.len();
        connections.clear();
        count
    }
}
