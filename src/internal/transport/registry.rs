use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

use super::TransportError;

pub type CallOutcome = Result<Value, TransportError>;

struct PendingRequest {
    deadline: Instant,
    timeout: Duration,
    resolver: oneshot::Sender<CallOutcome>,
}

/// Correlates outstanding requests to the responses that resolve them.
///
/// This map is the single structure touched by both the caller-facing
/// `call()` path and the read loop, so it sits behind a mutex that is never
/// held across an await. Each entry resolves exactly once: late, duplicate,
/// or unknown resolutions are logged and dropped, never an error.
#[derive(Default)]
pub struct RequestRegistry {
    pending: Mutex<HashMap<u64, PendingRequest>>,
}

impl RequestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a pending request and hand back the receiver the caller
    /// suspends on. At most one entry per id exists at a time; ids are
    /// allocated from a monotonic counter so collisions would be a bug.
    pub fn register(
        &self,
        id: u64,
        deadline: Instant,
        timeout: Duration,
    ) -> oneshot::Receiver<CallOutcome> {
        let (resolver, receiver) = oneshot::channel();
        let previous = self.pending.lock().unwrap().insert(
            id,
            PendingRequest {
                deadline,
                timeout,
                resolver,
            },
        );
        debug_assert!(previous.is_none(), "request id {id} registered twice");
        receiver
    }

    /// Complete the request for `id`, if it is still outstanding.
    pub fn resolve(&self, id: u64, outcome: CallOutcome) {
        let entry = self.pending.lock().unwrap().remove(&id);
        match entry {
            Some(pending) => {
                if pending.resolver.send(outcome).is_err() {
                    debug!(id, "caller went away before its response arrived");
                }
            }
            None => debug!(id, "dropping response for unknown or already-resolved request"),
        }
    }

    /// Remove an entry without resolving it (the caller already gave up).
    pub fn discard(&self, id: u64) {
        self.pending.lock().unwrap().remove(&id);
    }

    /// Resolve every request whose deadline has passed with a timeout.
    pub fn expire_due(&self, now: Instant) {
        let due: Vec<(u64, PendingRequest)> = {
            let mut pending = self.pending.lock().unwrap();
            let ids: Vec<u64> = pending
                .iter()
                .filter(|(_, p)| p.deadline <= now)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id).map(|p| (id, p)))
                .collect()
        };
        for (id, request) in due {
            debug!(id, "request deadline passed");
            let _ = request
                .resolver
                .send(Err(TransportError::Timeout(request.timeout)));
        }
    }

    /// Resolve every remaining request with `ConnectionClosed`. Called when
    /// the transport leaves `Connected`; guarantees no caller stays
    /// suspended after the connection is gone.
    pub fn drain(&self, reason: &str) {
        let drained: Vec<(u64, PendingRequest)> = {
            let mut pending = self.pending.lock().unwrap();
            pending.drain().collect()
        };
        if !drained.is_empty() {
            debug!(count = drained.len(), reason, "draining pending requests");
        }
        for (_, request) in drained {
            let _ = request
                .resolver
                .send(Err(TransportError::connection_closed(reason)));
        }
    }

    pub fn len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
