//! Plain TCP listener and per-connection I/O helpers.
//!
//! Accepted sockets are handed to the server over a channel, the same way
//! for every connection regardless of what it later turns out to be.

use mcp_core::{McpError, McpResult};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

/// Bytes requested per socket read.
pub const READ_CHUNK_SIZE: usize = 8192;

/// An accepted TCP connection.
pub struct TcpConnection {
    pub stream: TcpStream,
    pub remote_addr: SocketAddr,
}

/// Result of one bounded read.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    Data(usize),
    /// Peer closed its side.
    Closed,
    /// Nothing arrived within the read timeout.
    TimedOut,
}

/// Bind the listening socket. Failure here is fatal for the server.
pub async fn bind_listener(addr: &str) -> McpResult<TcpListener> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| McpError::Transport(format!("bind {addr} failed: {e}")))?;
    info!(addr = %listener.local_addr()?, "TCP listener started");
    Ok(listener)
}

/// Run the accept loop on its own task until `shutdown` fires.
///
/// Returns a receiver that yields accepted connections.
pub fn start_acceptor(
    listener: TcpListener,
    mut shutdown: broadcast::Receiver<()>,
) -> mpsc::Receiver<TcpConnection> {
    let (tx, rx) = mpsc::channel::<TcpConnection>(64);

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    debug!("acceptor stopping");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!(remote = %addr, error = %e, "set_nodelay failed");
                        }
                        debug!(remote = %addr, "TCP connection accepted");
                        if tx.send(TcpConnection { stream, remote_addr: addr }).await.is_err() {
                            warn!("connection channel closed");
                            break;
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "TCP accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }
    });

    rx
}

/// Read once into `buf`, giving up after `timeout`.
pub async fn read_chunk(
    reader: &mut OwnedReadHalf,
    buf: &mut [u8],
    timeout: Duration,
) -> McpResult<ReadOutcome> {
    match tokio::time::timeout(timeout, reader.read(buf)).await {
        Err(_) => Ok(ReadOutcome::TimedOut),
        Ok(Ok(0)) => Ok(ReadOutcome::Closed),
        Ok(Ok(n)) => Ok(ReadOutcome::Data(n)),
        Ok(Err(e)) => Err(McpError::Transport(format!("read failed: {e}"))),
    }
}

/// Write one JSON text followed by a newline.
pub async fn write_line(writer: &mut OwnedWriteHalf, text: &str) -> McpResult<()> {
    let mut line = Vec::with_capacity(text.len() + 1);
    line.extend_from_slice(text.as_bytes());
    line.push(b'\n');
    writer
        .write_all(&line)
        .await
        .map_err(|e| McpError::Transport(format!("write failed: {e}")))
}
