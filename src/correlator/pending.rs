//! Pending-request table with exactly-once settlement

use crate::utils::errors::ProtocolError;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

/// Terminal outcome of a request. Exactly one reaches the caller.
#[derive(Debug)]
pub enum Settlement {
    Result(Value),
    Error(ProtocolError),
    Cancelled,
}

/// Table of in-flight requests keyed by id. The entry is removed
/// atomically on first settlement, so a duplicate settlement or a
/// cancellation racing a remote response is a no-op for the loser.
#[derive(Default)]
pub struct PendingTable {
    entries: DashMap<i64, oneshot::Sender<Settlement>>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new pending request and hand back its settlement side.
    pub fn register(&self, id: i64) -> oneshot::Receiver<Settlement> {
        let (tx, rx) = oneshot::channel();
        self.entries.insert(id, tx);
        rx
    }

    /// Settle the request with the given id. Returns false if it was
    /// already settled (or never existed).
    pub fn settle(&self, id: i64, settlement: Settlement) -> bool {
        match self.entries.remove(&id) {
            Some((_, tx)) => {
                // A dropped receiver means the caller went away mid-settle;
                // the entry is gone either way.
                let _ = tx.send(settlement);
                true
            }
            None => {
                debug!(id, "settlement for unknown or already-settled request");
                false
            }
        }
    }

    /// Remove the entry without settling (the caller resolves locally).
    /// Returns false if a settlement already claimed it.
    pub fn take(&self, id: i64) -> bool {
        self.entries.remove(&id).is_some()
    }

    /// Force-cancel every pending request as a batch (teardown).
    pub fn cancel_all(&self) {
        let ids: Vec<i64> = self.entries.iter().map(|e| *e.key()).collect();
        for id in ids {
            self.settle(id, Settlement::Cancelled);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
