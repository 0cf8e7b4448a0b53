//! Command dispatcher: serializes client commands onto the EA link.
//!
//! Commands enter a FIFO and are drained by exactly one worker task. The
//! worker sends one command, waits for its correlated reply (or deadline),
//! delivers the outcome to the originating client, and only then moves on.
//! The EA handles one request at a time, so nothing is ever pipelined.
//!
//! ```text
//! submit ──► process ──► Completed
//!   │           ├───────► TimedOut
//!   │           ├───────► Failed     (write to the EA link failed)
//!   │           └───────► Rejected   (EA link gone before sending)
//!   └─────────────────► refused at submit (not authenticated / no EA linked)
//! ```

use super::bridge::UpstreamBridge;
use super::correlator::ResponseCorrelator;
use super::registry::{ConnectionId, ConnectionRegistry};
use mcp_core::messages::{MSG_NOT_AUTHENTICATED, MSG_UPSTREAM_ABSENT, MSG_UPSTREAM_TIMEOUT};
use mcp_core::{encode_text, McpError, McpResult, Reply};
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// A command accepted from a client, waiting for the EA.
#[derive(Debug, Clone)]
pub struct QueuedCommand {
    pub request_id: String,
    pub origin: ConnectionId,
    pub command: String,
    pub parameters: Value,
    pub enqueued_at: Instant,
}

impl QueuedCommand {
    pub fn new(request_id: String, origin: ConnectionId, command: String, parameters: Value) -> Self {
        Self {
            request_id,
            origin,
            command,
            parameters,
            enqueued_at: Instant::now(),
        }
    }
}

/// Where a processed command ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandState {
    Completed,
    TimedOut,
    Rejected,
    Failed,
}

/// Producer side of the queue, shared by every connection handler.
#[derive(Clone)]
pub struct CommandDispatcher {
    queue: mpsc::UnboundedSender<QueuedCommand>,
    depth: Arc<AtomicUsize>,
    registry: Arc<ConnectionRegistry>,
    bridge: Arc<UpstreamBridge>,
}

/// Consumer side; run exactly one per server.
pub struct DispatchWorker {
    queue: mpsc::UnboundedReceiver<QueuedCommand>,
    depth: Arc<AtomicUsize>,
    registry: Arc<ConnectionRegistry>,
    bridge: Arc<UpstreamBridge>,
    correlator: Arc<ResponseCorrelator>,
    command_timeout: Duration,
}

impl CommandDispatcher {
    /// Create the queue and its single worker.
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        bridge: Arc<UpstreamBridge>,
        correlator: Arc<ResponseCorrelator>,
        command_timeout: Duration,
    ) -> (Self, DispatchWorker) {
        let (tx, rx) = mpsc::unbounded_channel();
        let depth = Arc::new(AtomicUsize::new(0));
        let dispatcher = Self {
            queue: tx,
            depth: depth.clone(),
            registry: registry.clone(),
            bridge: bridge.clone(),
        };
        let worker = DispatchWorker {
            queue: rx,
            depth,
            registry,
            bridge,
            correlator,
            command_timeout,
        };
        (dispatcher, worker)
    }

    /// Admit a command into the queue.
    ///
    /// Rejects without queueing when the origin is not authenticated
    /// (`AuthFailed`) or no EA is linked (`UpstreamAbsent`). On acceptance the
    /// `queued` ack is sent to the origin before the worker can see the
    /// command, so it always precedes the terminal reply.
    pub async fn submit(&self, cmd: QueuedCommand) -> McpResult<()> {
        if !self.registry.is_authenticated(cmd.origin).await {
            return Err(McpError::AuthFailed(MSG_NOT_AUTHENTICATED.to_string()));
        }
        if !self.bridge.is_linked().await {
            return Err(McpError::UpstreamAbsent);
        }

        debug!(
            conn_id = cmd.origin,
            request_id = %cmd.request_id,
            command = %cmd.command,
            "command queued"
        );
        if let Ok(ack) = encode_text(&Reply::queued(&cmd.request_id, &cmd.command)) {
            self.registry.send(cmd.origin, ack).await;
        }
        self.depth.fetch_add(1, Ordering::Relaxed);
        self.queue.send(cmd).map_err(|_| {
            self.depth.fetch_sub(1, Ordering::Relaxed);
            McpError::Other("command dispatcher is not running".into())
        })
    }

    /// Commands queued and not yet picked up by the worker.
    pub fn pending(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }
}

impl DispatchWorker {
    /// Drain the queue until every producer is gone.
    pub async fn run(mut self) {
        info!(timeout_ms = self.command_timeout.as_millis() as u64, "command dispatcher started");
        while let Some(cmd) = self.queue.recv().await {
            self.depth.fetch_sub(1, Ordering::Relaxed);
            self.process(cmd).await;
        }
        info!("command dispatcher stopped");
    }

    /// Carry one command to a terminal state and notify its client.
    pub async fn process(&self, cmd: QueuedCommand) -> CommandState {
        let QueuedCommand {
            request_id,
            origin,
            command,
            parameters,
            enqueued_at,
        } = cmd;
        info!(
            conn_id = origin,
            request_id = %request_id,
            command = %command,
            queued_ms = enqueued_at.elapsed().as_millis() as u64,
            "executing command"
        );

        if !self.bridge.is_linked().await {
            error!(request_id = %request_id, command = %command, "EA not connected, rejecting command");
            self.reply(origin, Reply::error_for(&request_id, MSG_UPSTREAM_ABSENT)).await;
            return CommandState::Rejected;
        }

        // A reused request id must not pick up an old, unclaimed reply.
        if self.correlator.take(&request_id).await.is_some() {
            debug!(request_id = %request_id, "discarded stale reply for reused request id");
        }

        match self.bridge.send(&request_id, &command, parameters).await {
            Ok(_) => {}
            Err(McpError::UpstreamAbsent) => {
                self.reply(origin, Reply::error_for(&request_id, MSG_UPSTREAM_ABSENT)).await;
                return CommandState::Rejected;
            }
            Err(e) => {
                error!(request_id = %request_id, command = %command, error = %e, "failed to forward command");
                self.reply(
                    origin,
                    Reply::error_for(&request_id, format!("Error executing command: {e}")),
                )
                .await;
                return CommandState::Failed;
            }
        }

        match self.correlator.wait(&request_id, self.command_timeout).await {
            Some(payload) => {
                if self.registry.send(origin, payload).await {
                    debug!(request_id = %request_id, "reply forwarded to client");
                } else {
                    debug!(request_id = %request_id, conn_id = origin, "client gone, reply dropped");
                }
                CommandState::Completed
            }
            None => {
                warn!(
                    request_id = %request_id,
                    command = %command,
                    "timeout waiting for response from EA"
                );
                self.reply(origin, Reply::error_for(&request_id, MSG_UPSTREAM_TIMEOUT)).await;
                CommandState::TimedOut
            }
        }
    }

    async fn reply(&self, conn_id: ConnectionId, reply: Reply) {
        match encode_text(&reply) {
            Ok(text) => {
                self.registry.send(conn_id, text).await;
            }
            Err(e) => error!(conn_id, error = %e, "failed to encode reply"),
        }
    }
}
