//! Response correlator: pairs EA replies with the dispatcher waiting on them.
//!
//! Replies arrive on the EA connection's read task while the dispatcher waits
//! on its own task. A reply for a request someone is waiting on is handed
//! over through a one-shot channel; any other reply is stored until it is
//! taken or swept out after the eviction horizon.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Mutex};
use tracing::debug;

/// An EA reply nobody has claimed yet.
#[derive(Debug, Clone)]
pub struct CorrelatedResponse {
    pub request_id: String,
    /// Raw JSON text exactly as the EA sent it.
    pub payload: String,
    pub received_at: Instant,
}

/// What `put` did with a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// Handed straight to a waiting dispatcher.
    Delivered,
    /// Stored for a later `take`.
    Stored,
    /// Stored, overwriting an earlier unclaimed reply for the same id.
    Replaced,
}

#[derive(Default)]
struct State {
    entries: HashMap<String, CorrelatedResponse>,
    waiters: HashMap<String, oneshot::Sender<String>>,
}

/// Time-bounded reply store keyed by request id.
#[derive(Default)]
pub struct ResponseCorrelator {
    state: Mutex<State>,
}

impl ResponseCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a reply for `request_id`.
    pub async fn put(&self, request_id: &str, payload: String) -> PutOutcome {
        let mut state = self.state.lock().await;

        let payload = match state.waiters.remove(request_id) {
            Some(waiter) => match waiter.send(payload) {
                Ok(()) => return PutOutcome::Delivered,
                // The waiter gave up between timing out and deregistering.
                Err(payload) => payload,
            },
            None => payload,
        };

        let previous = state.entries.insert(
            request_id.to_string(),
            CorrelatedResponse {
                request_id: request_id.to_string(),
                payload,
                received_at: Instant::now(),
            },
        );
        if previous.is_some() {
            debug!(request_id, "unclaimed reply overwritten");
            PutOutcome::Replaced
        } else {
            PutOutcome::Stored
        }
    }

    /// Remove and return the stored reply for `request_id`.
    pub async fn take(&self, request_id: &str) -> Option<CorrelatedResponse> {
        self.state.lock().await.entries.remove(request_id)
    }

    /// Wait up to `timeout` for the reply to `request_id`.
    ///
    /// A reply stored before the call is returned immediately. On timeout the
    /// waiter is removed, so a reply arriving later is stored, not delivered.
    pub async fn wait(&self, request_id: &str, timeout: Duration) -> Option<String> {
        let rx = {
            let mut state = self.state.lock().await;
            if let Some(entry) = state.entries.remove(request_id) {
                return Some(entry.payload);
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.insert(request_id.to_string(), tx);
            rx
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(payload)) => Some(payload),
            Ok(Err(_)) | Err(_) => {
                self.state.lock().await.waiters.remove(request_id);
                None
            }
        }
    }

    /// Evict stored replies older than `horizon` as of `now`.
    pub async fn sweep(&self, now: Instant, horizon: Duration) -> usize {
        let mut state = self.state.lock().await;
        let before = state.entries.len();
        state
            .entries
            .retain(|_, entry| now.saturating_duration_since(entry.received_at) <= horizon);
        let removed = before - state.entries.len();
        if removed > 0 {
            debug!(count = removed, "evicted expired replies");
        }
        removed
    }

    /// Number of stored, unclaimed replies.
    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Number of dispatchers currently waiting.
    pub async fn waiting(&self) -> usize {
        self.state.lock().await.waiters.len()
    }
}
