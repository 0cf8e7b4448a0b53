//! Per-connection handler.
//!
//! Each accepted socket gets a reader (this task) and a writer task fed by a
//! bounded queue. Every decoded message is routed by who sent it and what
//! it carries: EA identity, EA reply, client auth, or client command. A
//! failed write or a full queue tears the connection down like a read
//! failure does.

use crate::relay::{ConnectionId, Outbound, QueuedCommand, Role, OUTBOUND_CAPACITY};
use crate::server::BrokerContext;
use crate::transport::tcp::{self, ReadOutcome, TcpConnection, READ_CHUNK_SIZE};
use mcp_core::messages::{
    MSG_AUTH_FAILED, MSG_INVALID_JSON, MSG_LIMIT_REACHED, MSG_NOT_AUTHENTICATED,
    MSG_UNRECOGNIZED, MSG_UPSTREAM_ABSENT,
};
use mcp_core::{
    encode_text, generate_request_id, Envelope, FrameDecoder, McpError, McpResult, Reply,
};
use serde_json::value::RawValue;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Serve one connection until it closes, idles out, or the server stops.
pub async fn handle_connection(ctx: Arc<BrokerContext>, conn: TcpConnection) {
    let TcpConnection {
        stream,
        remote_addr,
    } = conn;
    let (reader, mut writer) = stream.into_split();
    let (outbound, out_rx) = Outbound::channel(OUTBOUND_CAPACITY);

    let conn_id = match ctx
        .registry
        .register(remote_addr, outbound.clone(), !ctx.config.auth_enabled)
        .await
    {
        Ok(id) => id,
        Err(e) => {
            warn!(remote = %remote_addr, error = %e, "rejecting connection");
            if let Ok(text) = encode_text(&Reply::error(MSG_LIMIT_REACHED)) {
                let _ = tcp::write_line(&mut writer, &text).await;
            }
            let _ = writer.shutdown().await;
            return;
        }
    };

    info!(conn_id, remote = %remote_addr, "client connected");
    let writer_task = tokio::spawn(write_loop(conn_id, writer, out_rx));
    serve(&ctx, conn_id, reader, &outbound, writer_task).await;
    info!(conn_id, remote = %remote_addr, "client disconnected");
}

/// Run the read side, then tear the connection down however it ended.
async fn serve(
    ctx: &BrokerContext,
    conn_id: ConnectionId,
    reader: OwnedReadHalf,
    outbound: &Outbound,
    mut writer_task: JoinHandle<()>,
) {
    if let Err(e) = read_loop(ctx, conn_id, reader, outbound, &mut writer_task).await {
        debug!(conn_id, error = %e, "connection ended with error");
    }

    ctx.registry.unregister(conn_id).await;
    if ctx.bridge.clear_link(conn_id).await {
        warn!(conn_id, "MetaTrader EA disconnected");
    }
    writer_task.abort();
}

async fn write_loop(conn_id: ConnectionId, mut writer: OwnedWriteHalf, mut rx: mpsc::Receiver<String>) {
    while let Some(text) = rx.recv().await {
        if let Err(e) = tcp::write_line(&mut writer, &text).await {
            warn!(conn_id, error = %e, "write failed, closing connection");
            return;
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_loop(
    ctx: &BrokerContext,
    conn_id: ConnectionId,
    mut reader: OwnedReadHalf,
    outbound: &Outbound,
    writer_task: &mut JoinHandle<()>,
) -> McpResult<()> {
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; READ_CHUNK_SIZE];
    let mut shutdown_rx = ctx.shutdown_tx.subscribe();

    loop {
        let outcome = tokio::select! {
            biased;
            _ = shutdown_rx.recv() => {
                debug!(conn_id, "shutdown signal received");
                return Ok(());
            }
            _ = &mut *writer_task => {
                return Err(McpError::Transport("writer stopped".into()));
            }
            _ = outbound.overflowed() => {
                warn!(conn_id, capacity = OUTBOUND_CAPACITY, "peer is not reading, closing connection");
                return Err(McpError::Transport("outbound queue full".into()));
            }
            read = tcp::read_chunk(&mut reader, &mut buf, ctx.config.read_timeout) => read?,
        };

        match outcome {
            ReadOutcome::Closed => return Ok(()),
            ReadOutcome::TimedOut => {
                let idle = ctx.registry.idle_for(conn_id).await.unwrap_or_default();
                if idle > ctx.config.idle_timeout {
                    info!(conn_id, idle_secs = idle.as_secs(), "closing idle connection");
                    return Ok(());
                }
            }
            ReadOutcome::Data(n) => {
                ctx.registry.touch(conn_id).await;
                for frame in decoder.feed(&buf[..n]) {
                    match frame {
                        Ok(raw) => process_message(ctx, conn_id, outbound, raw).await,
                        Err(e) => {
                            debug!(conn_id, error = %e, "undecodable input");
                            reply(ctx, conn_id, Reply::error(MSG_INVALID_JSON)).await;
                        }
                    }
                }
            }
        }
    }
}

/// Route one decoded message.
async fn process_message(
    ctx: &BrokerContext,
    conn_id: ConnectionId,
    outbound: &Outbound,
    raw: Box<RawValue>,
) {
    let envelope = match Envelope::parse(&raw) {
        Ok(envelope) => envelope,
        Err(e) => {
            debug!(conn_id, error = %e, "rejecting non-object message");
            reply(ctx, conn_id, Reply::error(MSG_INVALID_JSON)).await;
            return;
        }
    };

    if envelope.is_upstream_identity() {
        ctx.registry.set_role(conn_id, Role::Upstream).await;
        ctx.bridge.set_link(conn_id, outbound.clone()).await;
        info!(conn_id, "MetaTrader EA identified");
        reply(ctx, conn_id, Reply::connected()).await;
        return;
    }

    if ctx.registry.role(conn_id).await == Some(Role::Upstream) {
        match envelope.correlation_id() {
            Some(request_id) => {
                let outcome = ctx.correlator.put(&request_id, raw.get().to_string()).await;
                debug!(conn_id, request_id = %request_id, ?outcome, "EA reply received");
            }
            None => warn!(conn_id, "EA message without a request id dropped"),
        }
        return;
    }

    if !ctx.registry.is_authenticated(conn_id).await {
        if let Some(token) = envelope.auth_token() {
            authenticate(ctx, conn_id, token).await;
            return;
        }
        let rejection = match envelope.request_id() {
            Some(id) => Reply::error_for(&id, MSG_NOT_AUTHENTICATED),
            None => Reply::error(MSG_NOT_AUTHENTICATED),
        };
        reply(ctx, conn_id, rejection).await;
        return;
    }

    if let Some(command) = envelope.command() {
        submit_command(ctx, conn_id, &envelope, command).await;
        return;
    }

    if envelope.has_auth() {
        debug!(conn_id, "auth on an authenticated connection ignored");
        return;
    }

    reply(ctx, conn_id, Reply::error(MSG_UNRECOGNIZED)).await;
}

async fn authenticate(ctx: &BrokerContext, conn_id: ConnectionId, token: &str) {
    if ctx.auth.is_valid(token) {
        ctx.registry.set_authenticated(conn_id, true).await;
        let permissions = ctx
            .auth
            .permissions(token)
            .map(ToString::to_string)
            .unwrap_or_default();
        info!(conn_id, %permissions, "client authenticated");
        reply(ctx, conn_id, Reply::authenticated()).await;
    } else {
        warn!(conn_id, "authentication failed");
        reply(ctx, conn_id, Reply::error(MSG_AUTH_FAILED)).await;
    }
}

async fn submit_command(ctx: &BrokerContext, conn_id: ConnectionId, envelope: &Envelope, command: &str) {
    if ctx.registry.role(conn_id).await == Some(Role::Unclassified) {
        ctx.registry.set_role(conn_id, Role::Client).await;
    }
    let request_id = envelope.request_id().unwrap_or_else(generate_request_id);
    let queued = QueuedCommand::new(
        request_id.clone(),
        conn_id,
        command.to_string(),
        envelope.parameters(),
    );

    let rejection = match ctx.dispatcher.submit(queued).await {
        Ok(()) => return,
        Err(McpError::UpstreamAbsent) => {
            warn!(conn_id, request_id = %request_id, command, "command rejected, EA not connected");
            MSG_UPSTREAM_ABSENT.to_string()
        }
        Err(McpError::AuthFailed(message)) => message,
        Err(e) => format!("Error executing command: {e}"),
    };
    reply(ctx, conn_id, Reply::error_for(&request_id, rejection)).await;
}

async fn reply(ctx: &BrokerContext, conn_id: ConnectionId, reply: Reply) {
    match encode_text(&reply) {
        Ok(text) => {
            ctx.registry.send(conn_id, text).await;
        }
        Err(e) => warn!(conn_id, error = %e, "failed to encode reply"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthStore;
    use crate::config::ServerConfig;
    use crate::relay::{CommandDispatcher, ConnectionRegistry, ResponseCorrelator, UpstreamBridge};
    use std::time::Duration;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::broadcast;

    fn context() -> BrokerContext {
        let config = ServerConfig::default();
        let registry = Arc::new(ConnectionRegistry::new(config.max_clients));
        let bridge = Arc::new(UpstreamBridge::new());
        let correlator = Arc::new(ResponseCorrelator::new());
        let (dispatcher, _worker) = CommandDispatcher::new(
            registry.clone(),
            bridge.clone(),
            correlator.clone(),
            config.command_timeout,
        );
        BrokerContext {
            config,
            auth: AuthStore::from_tokens([("t", "all")]),
            registry,
            bridge,
            correlator,
            dispatcher,
            shutdown_tx: broadcast::channel(1).0,
        }
    }

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let peer = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (accepted, _) = listener.accept().await.unwrap();
        (accepted, peer)
    }

    #[tokio::test]
    async fn failed_write_unregisters_and_clears_the_ea_link() {
        let ctx = context();
        let (accepted, _peer) = socket_pair().await;
        let remote = accepted.peer_addr().unwrap();
        let (reader, mut writer) = accepted.into_split();
        // Writes after a local shutdown fail with EPIPE while reads stay open.
        writer.shutdown().await.unwrap();

        let (outbound, rx) = Outbound::channel(OUTBOUND_CAPACITY);
        let conn_id = ctx.registry.register(remote, outbound.clone(), true).await.unwrap();
        ctx.registry.set_role(conn_id, Role::Upstream).await;
        ctx.bridge.set_link(conn_id, outbound.clone()).await;

        let writer_task = tokio::spawn(write_loop(conn_id, writer, rx));
        outbound.push("{\"command\":\"get_price\"}".into()).unwrap();

        tokio::time::timeout(
            Duration::from_secs(2),
            serve(&ctx, conn_id, reader, &outbound, writer_task),
        )
        .await
        .expect("connection was not torn down");
        assert!(ctx.registry.get(conn_id).await.is_none());
        assert!(!ctx.bridge.is_linked().await);
    }

    #[tokio::test]
    async fn overflowing_queue_ends_the_connection() {
        let ctx = context();
        let (accepted, _peer) = socket_pair().await;
        let remote = accepted.peer_addr().unwrap();
        let (reader, _writer) = accepted.into_split();

        // No writer drains this queue, as with a peer that never reads.
        let (outbound, _rx) = Outbound::channel(1);
        let conn_id = ctx.registry.register(remote, outbound.clone(), true).await.unwrap();
        assert!(ctx.registry.send(conn_id, "{}".into()).await);
        assert!(!ctx.registry.send(conn_id, "{}".into()).await);

        let writer_task = tokio::spawn(std::future::pending::<()>());
        tokio::time::timeout(
            Duration::from_secs(2),
            serve(&ctx, conn_id, reader, &outbound, writer_task),
        )
        .await
        .expect("connection was not torn down");
        assert_eq!(ctx.registry.count().await, 0);
    }
}
