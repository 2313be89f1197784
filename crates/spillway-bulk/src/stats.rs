//! Executor statistics.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Atomic counters maintained by the executor
#[derive(Debug, Default)]
pub(crate) struct ExecutorCounters {
    pub(crate) batches_dispatched: AtomicU64,
    pub(crate) batches_retried: AtomicU64,
    pub(crate) throttle_events: AtomicU64,
    pub(crate) unclassified_errors: AtomicU64,
}

impl ExecutorCounters {
    pub(crate) fn snapshot(&self) -> ExecutorStats {
        ExecutorStats {
            batches_dispatched: self.batches_dispatched.load(Ordering::Relaxed),
            batches_retried: self.batches_retried.load(Ordering::Relaxed),
            throttle_events: self.throttle_events.load(Ordering::Relaxed),
            unclassified_errors: self.unclassified_errors.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time executor statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutorStats {
    /// Batches that completed a round trip to the server
    pub batches_dispatched: u64,

    /// Batches re-enqueued after a transient failure
    pub batches_retried: u64,

    /// Batch-level throttle signals observed
    pub throttle_events: u64,

    /// Errors that did not match any known classification
    pub unclassified_errors: u64,
}
