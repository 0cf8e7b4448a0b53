//! The main MCP client.
//!
//! `McpClient` owns one TCP connection to the broker. A reader task decodes
//! everything the server sends and routes it: replies carrying a `requestId`
//! go to whoever is waiting on that id, replies without one go to the pending
//! control request (authentication). Every message is also published on a
//! broadcast channel for subscribers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time;

use mcp_core::messages::{AuthRequest, CommandRequest};
use mcp_core::{encode_line, generate_request_id, Envelope, FrameDecoder, McpError, McpResult};

type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<Value>>>>;
type ControlSlot = Arc<Mutex<Option<oneshot::Sender<Value>>>>;

/// Configuration for connecting to an MCP broker.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Token sent on connect and repeated on every command.
    pub auth_token: Option<String>,
    /// Bound on TCP connect and on the authentication exchange.
    pub connect_timeout: Duration,
    /// How long `send_command` waits for a terminal reply.
    pub response_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            auth_token: None,
            connect_timeout: Duration::from_secs(10),
            response_timeout: Duration::from_secs(30),
        }
    }
}

/// The main MCP client.
pub struct McpClient {
    config: ClientConfig,
    /// Encoded lines waiting for the writer task.
    outgoing_tx: mpsc::UnboundedSender<Vec<u8>>,
    /// Synchronous callers waiting on a request id.
    pending: PendingMap,
    /// Waiter for the next reply without a request id.
    control: ControlSlot,
    events: broadcast::Sender<Value>,
    connected: Arc<AtomicBool>,
    authenticated: AtomicBool,
    reader_handle: JoinHandle<()>,
    writer_handle: JoinHandle<()>,
}

impl McpClient {
    /// Connect to a broker at `addr` (`host:port`).
    ///
    /// Authenticates immediately when the config carries a token.
    pub async fn connect(addr: &str, config: ClientConfig) -> McpResult<Self> {
        let stream = time::timeout(config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| McpError::Transport(format!("connect to {addr} timed out")))?
            .map_err(|e| McpError::Transport(format!("connect to {addr} failed: {e}")))?;
        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();

        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let control: ControlSlot = Arc::new(Mutex::new(None));
        let (events, _) = broadcast::channel(256);
        let connected = Arc::new(AtomicBool::new(true));

        let writer_handle = tokio::spawn(Self::write_loop(writer, outgoing_rx, connected.clone()));
        let reader_handle = tokio::spawn(Self::read_loop(
            reader,
            pending.clone(),
            control.clone(),
            events.clone(),
            connected.clone(),
        ));

        tracing::info!(addr, "connected to MCP server");

        let client = Self {
            config,
            outgoing_tx,
            pending,
            control,
            events,
            connected,
            authenticated: AtomicBool::new(false),
            reader_handle,
            writer_handle,
        };

        if client.config.auth_token.is_some() {
            client.authenticate().await?;
        }

        Ok(client)
    }

    /// Authenticate with the configured token.
    pub async fn authenticate(&self) -> McpResult<()> {
        self.ensure_connected()?;
        let token = self
            .config
            .auth_token
            .clone()
            .ok_or_else(|| McpError::AuthFailed("no authentication token configured".into()))?;

        let (tx, rx) = oneshot::channel();
        *self.control.lock().await = Some(tx);
        self.send_line(&AuthRequest { auth: token })?;

        let reply = match time::timeout(self.config.connect_timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => return Err(McpError::NotConnected),
            Err(_) => {
                self.control.lock().await.take();
                return Err(McpError::AuthFailed("authentication timed out".into()));
            }
        };

        if reply.get("status").and_then(Value::as_str) == Some("authenticated") {
            self.authenticated.store(true, Ordering::SeqCst);
            tracing::info!("authenticated with MCP server");
            Ok(())
        } else {
            let message = reply
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string();
            tracing::error!(%message, "authentication failed");
            Err(McpError::AuthFailed(message))
        }
    }

    /// Send a command and wait for its terminal reply.
    ///
    /// The `queued` acknowledgement is skipped. Whatever the server finally
    /// answers (EA payload or error status) is returned as-is.
    pub async fn send_command(&self, command: &str, parameters: Value) -> McpResult<Value> {
        self.ensure_ready()?;
        let request_id = generate_request_id();

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id.clone(), tx);

        if let Err(e) = self.send_request(&request_id, command, parameters) {
            self.forget(&request_id).await;
            return Err(e);
        }
        tracing::debug!(request_id = %request_id, command, "command sent");

        match time::timeout(self.config.response_timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(McpError::NotConnected),
            Err(_) => {
                self.forget(&request_id).await;
                tracing::warn!(request_id = %request_id, command, "timeout waiting for response");
                Err(McpError::UpstreamTimeout(request_id))
            }
        }
    }

    /// Send a command without waiting. Replies arrive on [`subscribe`](Self::subscribe).
    pub async fn submit(&self, command: &str, parameters: Value) -> McpResult<String> {
        self.ensure_ready()?;
        let request_id = generate_request_id();
        self.send_request(&request_id, command, parameters)?;
        tracing::debug!(request_id = %request_id, command, "command submitted");
        Ok(request_id)
    }

    /// Stop waiting for `request_id`. Returns whether a waiter was removed.
    pub async fn forget(&self, request_id: &str) -> bool {
        self.pending.lock().await.remove(request_id).is_some()
    }

    /// Every message the server sends, in arrival order.
    pub fn subscribe(&self) -> broadcast::Receiver<Value> {
        self.events.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    /// Close the connection. Pending callers fail with `NotConnected`.
    pub async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.authenticated.store(false, Ordering::SeqCst);
        self.reader_handle.abort();
        self.writer_handle.abort();
        self.pending.lock().await.clear();
        self.control.lock().await.take();
        tracing::info!("disconnected from MCP server");
    }

    // ── Internal ─────────────────────────────────────────────────────

    fn ensure_connected(&self) -> McpResult<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(McpError::NotConnected)
        }
    }

    fn ensure_ready(&self) -> McpResult<()> {
        self.ensure_connected()?;
        if self.config.auth_token.is_some() && !self.is_authenticated() {
            return Err(McpError::AuthFailed("not authenticated with MCP server".into()));
        }
        Ok(())
    }

    fn send_request(&self, request_id: &str, command: &str, parameters: Value) -> McpResult<()> {
        self.send_line(&CommandRequest {
            command: command.to_string(),
            request_id: request_id.to_string(),
            parameters,
            auth: self.config.auth_token.clone(),
        })
    }

    fn send_line<T: serde::Serialize>(&self, message: &T) -> McpResult<()> {
        let line = encode_line(message)?;
        self.outgoing_tx
            .send(line)
            .map_err(|_| McpError::Transport("outgoing channel closed".into()))
    }

    async fn write_loop(
        mut writer: OwnedWriteHalf,
        mut outgoing_rx: mpsc::UnboundedReceiver<Vec<u8>>,
        connected: Arc<AtomicBool>,
    ) {
        while let Some(line) = outgoing_rx.recv().await {
            if let Err(e) = writer.write_all(&line).await {
                tracing::error!("failed to send message: {}", e);
                connected.store(false, Ordering::SeqCst);
                break;
            }
        }
        tracing::debug!("write loop ended");
    }

    async fn read_loop(
        mut reader: OwnedReadHalf,
        pending: PendingMap,
        control: ControlSlot,
        events: broadcast::Sender<Value>,
        connected: Arc<AtomicBool>,
    ) {
        let mut decoder = FrameDecoder::new();
        let mut buf = vec![0u8; 8192];

        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => {
                    tracing::warn!("server closed connection");
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    tracing::error!("error receiving data: {}", e);
                    break;
                }
            };

            for frame in decoder.feed(&buf[..n]) {
                match frame.and_then(|raw| Envelope::parse(&raw)) {
                    Ok(envelope) => Self::route(envelope, &pending, &control, &events).await,
                    Err(e) => tracing::warn!("invalid message from server: {}", e),
                }
            }
        }

        connected.store(false, Ordering::SeqCst);
        // Dropping the senders fails every waiter with `NotConnected`.
        pending.lock().await.clear();
        control.lock().await.take();
        tracing::debug!("read loop ended");
    }

    /// Hand one server message to its waiter and to subscribers.
    async fn route(
        envelope: Envelope,
        pending: &PendingMap,
        control: &ControlSlot,
        events: &broadcast::Sender<Value>,
    ) {
        let request_id = envelope.request_id();
        let is_ack = envelope.status() == Some("queued");
        let message = envelope.into_value();

        match request_id {
            Some(id) if is_ack => {
                tracing::debug!(request_id = %id, "command queued by server");
            }
            Some(id) => {
                if let Some(waiter) = pending.lock().await.remove(&id) {
                    let _ = waiter.send(message.clone());
                }
            }
            None => {
                if let Some(waiter) = control.lock().await.take() {
                    let _ = waiter.send(message.clone());
                }
            }
        }

        // No subscribers is fine.
        let _ = events.send(message);
    }
}

impl Drop for McpClient {
    fn drop(&mut self) {
        self.reader_handle.abort();
        self.writer_handle.abort();
    }
}
