//! `mcp watch`: print every message the server sends.
//!
//! Useful next to a `call` issued from another terminal, or to observe the
//! broker's status replies while debugging an EA.

use anyhow::Result;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

use super::Target;

pub async fn run(target: &Target) -> Result<()> {
    let client = target.connect().await?;
    let mut events = client.subscribe();
    let mut liveness = tokio::time::interval(Duration::from_secs(1));
    eprintln!("mcp: watching {} (Ctrl+C to stop)", target.addr());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = liveness.tick() => {
                if !client.is_connected() {
                    eprintln!("mcp: server closed the connection");
                    break;
                }
            }
            event = events.recv() => match event {
                Ok(message) => println!("{}", serde_json::to_string_pretty(&message)?),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "output fell behind, messages dropped"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    client.disconnect().await;
    Ok(())
}
