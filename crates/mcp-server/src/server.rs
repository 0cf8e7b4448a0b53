//! Core server: owns the listener and the shared broker state.
//!
//! Construction binds the socket and wires the registry, EA link, correlator,
//! and dispatcher together. `run_until` accepts connections, drives the single
//! dispatch worker and the correlator sweep, and tears everything down when
//! the shutdown future resolves.

use crate::auth::AuthStore;
use crate::config::ServerConfig;
use crate::handler;
use crate::relay::{
    CommandDispatcher, ConnectionRegistry, DispatchWorker, ResponseCorrelator, UpstreamBridge,
};
use crate::transport::tcp;
use mcp_core::McpResult;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// State shared by every connection task.
pub struct BrokerContext {
    pub config: ServerConfig,
    pub auth: AuthStore,
    pub registry: Arc<ConnectionRegistry>,
    pub bridge: Arc<UpstreamBridge>,
    pub correlator: Arc<ResponseCorrelator>,
    pub dispatcher: CommandDispatcher,
    /// Fires once when the server stops.
    pub shutdown_tx: broadcast::Sender<()>,
}

/// The broker instance.
pub struct McpServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    ctx: Arc<BrokerContext>,
    worker: DispatchWorker,
}

impl McpServer {
    /// Bind the listener and assemble the broker.
    pub async fn bind(config: ServerConfig, auth: AuthStore) -> McpResult<Self> {
        let listener = tcp::bind_listener(&config.bind_addr()).await?;
        let local_addr = listener.local_addr()?;

        let registry = Arc::new(ConnectionRegistry::new(config.max_clients));
        let bridge = Arc::new(UpstreamBridge::new());
        let correlator = Arc::new(ResponseCorrelator::new());
        let (dispatcher, worker) = CommandDispatcher::new(
            registry.clone(),
            bridge.clone(),
            correlator.clone(),
            config.command_timeout,
        );

        let ctx = Arc::new(BrokerContext {
            config,
            auth,
            registry,
            bridge,
            correlator,
            dispatcher,
            shutdown_tx: broadcast::channel(1).0,
        });

        Ok(Self {
            listener,
            local_addr,
            ctx,
            worker,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serve until the process is killed.
    pub async fn run(self) -> McpResult<()> {
        self.run_until(std::future::pending()).await
    }

    /// Serve until `shutdown` resolves, then close every connection.
    pub async fn run_until<F>(self, shutdown: F) -> McpResult<()>
    where
        F: Future<Output = ()>,
    {
        let Self {
            listener,
            local_addr,
            ctx,
            worker,
        } = self;

        let worker_task = tokio::spawn(worker.run());
        let sweeper_task = tokio::spawn(sweep_loop(ctx.clone()));
        let mut accepted = tcp::start_acceptor(listener, ctx.shutdown_tx.subscribe());

        info!(
            addr = %local_addr,
            auth = ctx.config.auth_enabled,
            max_clients = ctx.config.max_clients,
            tokens = ctx.auth.len(),
            "mcp-server ready"
        );

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    break;
                }
                Some(conn) = accepted.recv() => {
                    tokio::spawn(handler::handle_connection(ctx.clone(), conn));
                }
                else => {
                    info!("listener closed, shutting down");
                    break;
                }
            }
        }

        let _ = ctx.shutdown_tx.send(());
        let closed = ctx.registry.close_all().await;
        ctx.bridge.clear().await;
        worker_task.abort();
        sweeper_task.abort();
        info!(connections = closed, "server stopped");
        Ok(())
    }
}

/// Periodically evict unclaimed EA replies.
async fn sweep_loop(ctx: Arc<BrokerContext>) {
    let mut interval = tokio::time::interval(ctx.config.sweep_interval);
    loop {
        interval.tick().await;
        let removed = ctx
            .correlator
            .sweep(Instant::now(), ctx.config.cache_ttl)
            .await;
        if removed > 0 {
            debug!(removed, "correlator sweep");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
    use tokio::net::TcpStream;
    use tokio::sync::oneshot;

    const TOKEN: &str = "test-token";

    struct Running {
        addr: SocketAddr,
        ctx: Arc<BrokerContext>,
        stop: Option<oneshot::Sender<()>>,
    }

    impl Drop for Running {
        fn drop(&mut self) {
            if let Some(stop) = self.stop.take() {
                let _ = stop.send(());
            }
        }
    }

    fn test_config() -> ServerConfig {
        let mut config = ServerConfig::default();
        config.host = "127.0.0.1".into();
        config.port = 0;
        config.command_timeout = Duration::from_secs(5);
        config
    }

    async fn start(config: ServerConfig) -> Running {
        let auth = AuthStore::from_tokens([(TOKEN, "all")]);
        let server = McpServer::bind(config, auth).await.unwrap();
        let addr = server.local_addr();
        let ctx = server.ctx.clone();
        let (stop, stopped) = oneshot::channel::<()>();
        tokio::spawn(server.run_until(async {
            let _ = stopped.await;
        }));
        Running {
            addr,
            ctx,
            stop: Some(stop),
        }
    }

    struct Peer {
        lines: tokio::io::Lines<BufReader<OwnedReadHalf>>,
        writer: OwnedWriteHalf,
    }

    impl Peer {
        async fn connect(addr: SocketAddr) -> Self {
            let (read, writer) = TcpStream::connect(addr).await.unwrap().into_split();
            Self {
                lines: BufReader::new(read).lines(),
                writer,
            }
        }

        async fn send_raw(&mut self, text: &str) {
            self.writer.write_all(text.as_bytes()).await.unwrap();
        }

        async fn send(&mut self, value: Value) {
            self.send_raw(&format!("{value}\n")).await;
        }

        async fn recv_line(&mut self) -> String {
            tokio::time::timeout(Duration::from_secs(5), self.lines.next_line())
                .await
                .expect("timed out waiting for a line")
                .unwrap()
                .expect("connection closed")
        }

        async fn recv(&mut self) -> Value {
            serde_json::from_str(&self.recv_line().await).unwrap()
        }

        /// Wait for the server to close the connection.
        async fn expect_closed(&mut self, within: Duration) {
            match tokio::time::timeout(within, self.lines.next_line()).await {
                Ok(Ok(None)) | Ok(Err(_)) => {}
                Ok(Ok(Some(line))) => panic!("unexpected message: {line}"),
                Err(_) => panic!("connection still open"),
            }
        }

        async fn expect_silence(&mut self, wait: Duration) {
            if let Ok(line) = tokio::time::timeout(wait, self.lines.next_line()).await {
                panic!("unexpected message: {line:?}");
            }
        }

        async fn client(addr: SocketAddr) -> Self {
            let mut peer = Self::connect(addr).await;
            peer.send(json!({"auth": TOKEN})).await;
            assert_eq!(peer.recv().await["status"], "authenticated");
            peer
        }

        async fn ea(addr: SocketAddr) -> Self {
            let mut peer = Self::connect(addr).await;
            peer.send(json!({"identity": "MT5_EA"})).await;
            let ack = peer.recv().await;
            assert_eq!(ack["status"], "connected");
            assert!(ack["server_time"].is_string());
            peer
        }
    }

    #[tokio::test]
    async fn valid_token_authenticates() {
        let server = start(test_config()).await;
        let mut peer = Peer::connect(server.addr).await;
        peer.send(json!({"auth": TOKEN})).await;
        assert_eq!(
            peer.recv().await,
            json!({"status": "authenticated", "message": "Authentication successful"})
        );
    }

    #[tokio::test]
    async fn invalid_token_is_rejected_and_connection_stays_unauthenticated() {
        let server = start(test_config()).await;
        let mut peer = Peer::connect(server.addr).await;
        peer.send(json!({"auth": "wrong"})).await;
        assert_eq!(
            peer.recv().await,
            json!({"status": "error", "message": "Authentication failed"})
        );

        peer.send(json!({"command": "get_price", "requestId": "r1"})).await;
        assert_eq!(
            peer.recv().await,
            json!({"status": "error", "requestId": "r1", "message": "Not authenticated"})
        );
    }

    #[tokio::test]
    async fn get_price_reply_is_forwarded_byte_for_byte() {
        let server = start(test_config()).await;
        let mut ea = Peer::ea(server.addr).await;
        let mut client = Peer::client(server.addr).await;

        client
            .send(json!({"command": "get_price", "requestId": "r1", "parameters": {"symbol": "EURUSD"}}))
            .await;
        assert_eq!(
            client.recv().await,
            json!({"status": "queued", "requestId": "r1", "message": "Command 'get_price' queued for processing"})
        );

        let forwarded = ea.recv().await;
        assert_eq!(forwarded["command"], "get_price");
        assert_eq!(forwarded["requestId"], "r1");
        assert_eq!(forwarded["parameters"], json!({"symbol": "EURUSD"}));
        assert!(forwarded["timestamp"].is_string());

        let raw = r#"{ "requestId":"r1", "status":"success", "bid":1.08501, "ask":1.08512 }"#;
        ea.send_raw(raw).await;
        assert_eq!(client.recv_line().await, raw);
    }

    #[tokio::test]
    async fn command_without_upstream_fails_immediately() {
        let server = start(test_config()).await;
        let mut client = Peer::client(server.addr).await;

        let started = Instant::now();
        client.send(json!({"command": "get_orders", "requestId": "r1"})).await;
        assert_eq!(
            client.recv().await,
            json!({"status": "error", "requestId": "r1", "message": "MetaTrader EA not connected"})
        );
        assert!(started.elapsed() < Duration::from_secs(1));
        client.expect_silence(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn timeout_sends_one_error_and_drops_late_reply() {
        let mut config = test_config();
        config.command_timeout = Duration::from_millis(200);
        let server = start(config).await;
        let mut ea = Peer::ea(server.addr).await;
        let mut client = Peer::client(server.addr).await;

        client.send(json!({"command": "get_account_info", "requestId": "r1"})).await;
        assert_eq!(client.recv().await["status"], "queued");
        ea.recv().await;

        let reply = client.recv().await;
        assert_eq!(
            reply,
            json!({"status": "error", "requestId": "r1", "message": "Timeout waiting for response from MetaTrader"})
        );

        ea.send(json!({"requestId": "r1", "status": "success"})).await;
        client.expect_silence(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn newest_ea_identity_receives_commands() {
        let server = start(test_config()).await;
        let mut old_ea = Peer::ea(server.addr).await;
        let mut new_ea = Peer::ea(server.addr).await;
        let mut client = Peer::client(server.addr).await;

        client.send(json!({"command": "get_orders", "requestId": "r1"})).await;
        assert_eq!(client.recv().await["status"], "queued");

        assert_eq!(new_ea.recv().await["requestId"], "r1");
        old_ea.expect_silence(Duration::from_millis(100)).await;

        new_ea.send(json!({"responseToId": "r1", "orders": []})).await;
        assert_eq!(client.recv().await["orders"], json!([]));
    }

    #[tokio::test]
    async fn upstream_disconnect_mid_wait_times_out() {
        let mut config = test_config();
        config.command_timeout = Duration::from_millis(300);
        let server = start(config).await;
        let mut ea = Peer::ea(server.addr).await;
        let mut client = Peer::client(server.addr).await;

        client.send(json!({"command": "get_price", "requestId": "r1"})).await;
        assert_eq!(client.recv().await["status"], "queued");
        ea.recv().await;
        drop(ea);

        let started = Instant::now();
        let reply = client.recv().await;
        assert_eq!(reply["message"], "Timeout waiting for response from MetaTrader");
        assert!(started.elapsed() >= Duration::from_millis(100));

        client.send(json!({"command": "get_price", "requestId": "r2"})).await;
        assert_eq!(
            client.recv().await,
            json!({"status": "error", "requestId": "r2", "message": "MetaTrader EA not connected"})
        );
    }

    #[tokio::test]
    async fn malformed_input_keeps_connection_open() {
        let server = start(test_config()).await;
        let mut client = Peer::client(server.addr).await;

        client.send_raw("{not json}\n").await;
        assert_eq!(
            client.recv().await,
            json!({"status": "error", "message": "Invalid JSON format"})
        );
        client.send_raw("[1,2,3]\n").await;
        assert_eq!(client.recv().await["message"], "Invalid JSON format");

        client.send(json!({"hello": "world"})).await;
        assert_eq!(
            client.recv().await,
            json!({"status": "error", "message": "Unrecognized message"})
        );
    }

    #[tokio::test]
    async fn unauthenticated_command_is_not_queued() {
        let server = start(test_config()).await;
        let mut ea = Peer::ea(server.addr).await;
        let mut peer = Peer::connect(server.addr).await;

        peer.send(json!({"command": "open_order"})).await;
        assert_eq!(
            peer.recv().await,
            json!({"status": "error", "message": "Not authenticated"})
        );
        ea.expect_silence(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn auth_disabled_accepts_commands_directly() {
        let mut config = test_config();
        config.auth_enabled = false;
        let server = start(config).await;
        let mut ea = Peer::ea(server.addr).await;
        let mut client = Peer::connect(server.addr).await;

        client.send(json!({"command": "get_orders"})).await;
        let ack = client.recv().await;
        assert_eq!(ack["status"], "queued");
        let request_id = ack["requestId"].as_str().unwrap().to_string();
        assert!(!request_id.is_empty());
        assert_eq!(ea.recv().await["requestId"], request_id.as_str());
    }

    #[tokio::test]
    async fn connections_beyond_limit_are_refused() {
        let mut config = test_config();
        config.max_clients = 1;
        let server = start(config).await;
        let _first = Peer::client(server.addr).await;

        let mut second = Peer::connect(server.addr).await;
        assert_eq!(
            second.recv().await,
            json!({"status": "error", "message": "Server connection limit reached"})
        );
        let next = tokio::time::timeout(Duration::from_secs(2), second.lines.next_line())
            .await
            .unwrap()
            .unwrap();
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn split_and_concatenated_frames_are_decoded() {
        let server = start(test_config()).await;
        let mut peer = Peer::connect(server.addr).await;

        peer.send_raw("{\"au").await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        peer.send_raw(&format!("th\":\"{TOKEN}\"}}{{\"bogus\":1}}")).await;

        assert_eq!(peer.recv().await["status"], "authenticated");
        assert_eq!(peer.recv().await["message"], "Unrecognized message");
    }

    #[tokio::test]
    async fn running_server_sweeps_unclaimed_replies() {
        let mut config = test_config();
        config.cache_ttl = Duration::from_millis(200);
        config.sweep_interval = Duration::from_millis(50);
        let server = start(config).await;
        let mut ea = Peer::ea(server.addr).await;

        ea.send(json!({"requestId": "orphan", "status": "success"})).await;
        // Messages on one connection are handled in order, so the ack
        // means the orphan reply has been stored.
        ea.send(json!({"identity": "MT5_EA"})).await;
        assert_eq!(ea.recv().await["status"], "connected");
        assert_eq!(server.ctx.correlator.len().await, 1);

        let deadline = Instant::now() + Duration::from_secs(2);
        while server.ctx.correlator.len().await > 0 {
            assert!(Instant::now() < deadline, "orphan reply was never swept");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    fn short_timers() -> ServerConfig {
        let mut config = test_config();
        config.auth_enabled = false;
        config.read_timeout = Duration::from_millis(100);
        config.idle_timeout = Duration::from_millis(250);
        config
    }

    #[tokio::test]
    async fn silent_connection_is_closed_after_idle_limit() {
        let server = start(short_timers()).await;
        let mut peer = Peer::connect(server.addr).await;

        let started = Instant::now();
        peer.expect_closed(Duration::from_secs(2)).await;
        assert!(started.elapsed() >= Duration::from_millis(250));
    }

    #[tokio::test]
    async fn active_connection_survives_read_timeouts() {
        let server = start(short_timers()).await;
        let mut peer = Peer::connect(server.addr).await;

        // Six rounds span several read timeouts and well past the idle limit.
        for _ in 0..6 {
            tokio::time::sleep(Duration::from_millis(150)).await;
            peer.send(json!({"ping": true})).await;
            assert_eq!(peer.recv().await["message"], "Unrecognized message");
        }
        peer.expect_closed(Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn peer_that_never_reads_is_disconnected() {
        let mut config = test_config();
        config.auth_enabled = false;
        let server = start(config).await;
        let mut stream = TcpStream::connect(server.addr).await.unwrap();

        // Every `{}` earns an error reply that is never read.
        let chunk = "{}".repeat(32 * 1024);
        let flood = async {
            loop {
                if stream.write_all(chunk.as_bytes()).await.is_err() {
                    return;
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(20), flood)
            .await
            .expect("server kept accepting input from a peer that never reads");

        let deadline = Instant::now() + Duration::from_secs(2);
        while server.ctx.registry.count().await > 0 {
            assert!(Instant::now() < deadline, "connection still registered");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}
