// Request/response correlation
// Mints message ids and matches responses to the requests awaiting them

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::debug;

use crate::constants::REQUEST_TIMEOUT;
use crate::error::CorrelationError;
use crate::net::messages::Response;

/// Message id to (entry token, waiter)
type PendingTable = HashMap<u64, (u64, oneshot::Sender<Response>)>;

/// Tracks in-flight requests keyed by message id.
///
/// The broker holds one instance for forwarded requests; every peer client
/// holds its own for the requests it sends. An entry is removed exactly once,
/// either by `resolve` or by its waiter timing out or being dropped.
pub struct CorrelationManager {
    next_id: AtomicU64,
    next_token: AtomicU64,
    pending: Arc<Mutex<PendingTable>>,
    timeout: Duration,
}

impl Default for CorrelationManager {
    fn default() -> Self {
        Self::new()
    }
}

impl CorrelationManager {
    pub fn new() -> Self {
        Self::with_timeout(REQUEST_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        CorrelationManager {
            next_id: AtomicU64::new(0),
            next_token: AtomicU64::new(0),
            pending: Arc::new(Mutex::new(HashMap::new())),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Next id of the strictly increasing sequence starting at 0
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a pending entry for `id`.
    ///
    /// Call before the request goes out so a fast response can't be missed.
    /// Registering an id that is already pending replaces the older entry,
    /// whose waiter then fails as cancelled.
    pub fn await_response(&self, id: u64) -> PendingResponse {
        let (tx, rx) = oneshot::channel();
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        if lock(&self.pending).insert(id, (token, tx)).is_some() {
            debug!(message_id = id, "Replaced pending request with the same id");
        }
        PendingResponse {
            id,
            token,
            rx,
            done: false,
            pending: Arc::clone(&self.pending),
            timeout: self.timeout,
        }
    }

    /// Complete the request matching `response.id`.
    ///
    /// Unknown, expired or missing ids are discarded; this never fails.
    pub fn resolve(&self, response: Response) {
        let Some(id) = response.id else {
            debug!("Response discarded. No message-id");
            return;
        };
        let entry = lock(&self.pending).remove(&id);
        match entry {
            Some((_, tx)) => {
                if tx.send(response).is_err() {
                    debug!(message_id = id, "Response discarded. Waiter is gone");
                }
            }
            None => {
                debug!(message_id = id, "Response discarded. Request isn't pending");
            }
        }
    }

    pub fn is_pending(&self, id: u64) -> bool {
        lock(&self.pending).contains_key(&id)
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Drop every pending entry; their waiters fail as cancelled
    pub fn clear(&self) {
        lock(&self.pending).clear();
    }
}

/// Handle a caller suspends on until its response arrives or times out
pub struct PendingResponse {
    id: u64,
    token: u64,
    rx: oneshot::Receiver<Response>,
    done: bool,
    pending: Arc<Mutex<PendingTable>>,
    timeout: Duration,
}

impl PendingResponse {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the correlated response
    pub async fn wait(mut self) -> Result<Response, CorrelationError> {
        let id = self.id;
        let result = match tokio::time::timeout(self.timeout, &mut self.rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(CorrelationError::Cancelled { id }),
            Err(_) => {
                if self.remove_entry() {
                    debug!(message_id = id, "Awaited request timeout");
                    Err(CorrelationError::Timeout { id })
                } else {
                    // Resolved while the timer fired; the response is already in the channel
                    debug!(message_id = id, "Timed out request isn't pending anymore");
                    self.rx
                        .try_recv()
                        .map_err(|_| CorrelationError::Timeout { id })
                }
            }
        };
        self.done = true;
        result
    }

    /// Remove this handle's entry, leaving a newer one under the same id alone
    fn remove_entry(&self) -> bool {
        let mut pending = lock(&self.pending);
        match pending.get(&self.id) {
            Some((token, _)) if *token == self.token => pending.remove(&self.id).is_some(),
            _ => false,
        }
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        // A wait cancelled mid-flight still owns its entry
        if !self.done {
            self.remove_entry();
        }
    }
}

fn lock(pending: &Mutex<PendingTable>) -> MutexGuard<'_, PendingTable> {
    // A panic while holding the lock can't leave the map half-updated
    pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
