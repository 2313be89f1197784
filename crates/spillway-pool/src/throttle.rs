//! Per-identity throttle state shared between selection and rate control.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::debug;

use spillway_core::IdentityName;

/// Tracks server-imposed throttle windows per identity.
///
/// State is a single deadline per identity, stored as milliseconds since the
/// tracker was created. Writes go through `fetch_max`, so a later throttle
/// with a shorter retry-after never shortens an existing window. Reads are
/// plain atomic loads against the monotonic clock.
#[derive(Debug)]
pub struct ThrottleTracker {
    /// Monotonic zero point for the deadline encoding
    origin: Instant,

    /// Millisecond deadline per identity; 0 means not throttled
    entries: DashMap<IdentityName, AtomicU64>,
}

impl Default for ThrottleTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ThrottleTracker {
    /// Create an empty tracker
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            entries: DashMap::new(),
        }
    }

    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    /// Record a throttle for `name` lasting `retry_after` from now.
    ///
    /// The resulting window is `max(existing, now + retry_after)`.
    pub fn mark_throttled(&self, name: &str, retry_after: Duration) {
        let deadline = self.now_ms() + retry_after.as_millis() as u64;
        let entry = self
            .entries
            .entry(name.to_string())
            .or_insert_with(|| AtomicU64::new(0));
        let previous = entry.fetch_max(deadline, Ordering::AcqRel);
        if previous < deadline {
            debug!(identity = name, retry_after_ms = retry_after.as_millis() as u64, "identity throttled");
        }
    }

    /// Whether `name` is inside a throttle window right now
    pub fn is_throttled(&self, name: &str) -> bool {
        self.entries
            .get(name)
            .is_some_and(|entry| entry.load(Ordering::Acquire) > self.now_ms())
    }

    /// The instant at which `name`'s throttle window ends, if one is active
    pub fn throttled_until(&self, name: &str) -> Option<Instant> {
        let deadline = self.entries.get(name)?.load(Ordering::Acquire);
        if deadline > self.now_ms() {
            Some(self.origin + Duration::from_millis(deadline))
        } else {
            None
        }
    }

    /// Clear `name`'s throttle state if the window has already passed.
    /// Safe to call from any task; a concurrent `mark_throttled` wins.
    pub fn clear_if_expired(&self, name: &str) {
        if let Some(entry) = self.entries.get(name) {
            let deadline = entry.load(Ordering::Acquire);
            if deadline != 0 && deadline <= self.now_ms() {
                // Losing the race to a concurrent mark leaves the newer
                // deadline in place, which is the correct outcome.
                let _ = entry.compare_exchange(deadline, 0, Ordering::AcqRel, Ordering::Relaxed);
            }
        }
    }

    /// Snapshot of identities currently inside a throttle window
    pub fn throttled_identities(&self) -> Vec<IdentityName> {
        let now = self.now_ms();
        let mut names: Vec<IdentityName> = self
            .entries
            .iter()
            .filter(|entry| entry.value().load(Ordering::Acquire) > now)
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }
}
