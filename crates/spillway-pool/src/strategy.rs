//! Identity selection strategies for the connection pool.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use spillway_core::SelectionStrategyKind;

use crate::throttle::ThrottleTracker;

/// A candidate identity offered to a selection strategy
#[derive(Debug, Clone, Copy)]
pub struct IdentityCandidate<'a> {
    /// Position in the pool's insertion order
    pub index: usize,

    /// Identity name
    pub name: &'a str,

    /// Channels currently checked out for this identity
    pub active: usize,
}

/// Chooses which identity serves the next checkout.
///
/// Strategies are consulted with the full candidate list in insertion
/// order; they return an index into that list.
pub trait SelectionStrategy: Send + Sync + fmt::Debug {
    /// Pick one of `candidates`. Never called with an empty list.
    fn select(&self, candidates: &[IdentityCandidate<'_>], throttle: &ThrottleTracker) -> usize;
}

/// Build the strategy implementation for a configured kind
pub(crate) fn build_strategy(kind: SelectionStrategyKind) -> Box<dyn SelectionStrategy> {
    match kind {
        SelectionStrategyKind::RoundRobin => Box::new(RoundRobin::new()),
        SelectionStrategyKind::LeastConnections => Box::new(LeastConnections),
        SelectionStrategyKind::ThrottleAware => Box::new(ThrottleAware::new()),
    }
}

/// Monotonic counter over identities in insertion order
#[derive(Debug, Default)]
pub struct RoundRobin {
    counter: AtomicUsize,
}

impl RoundRobin {
    /// Create a round-robin strategy starting at the first identity
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl SelectionStrategy for RoundRobin {
    fn select(&self, candidates: &[IdentityCandidate<'_>], _throttle: &ThrottleTracker) -> usize {
        self.counter.fetch_add(1, Ordering::Relaxed) % candidates.len()
    }
}

/// Picks the identity with the fewest active checkouts, ties broken by
/// insertion order
#[derive(Debug, Default)]
pub struct LeastConnections;

impl SelectionStrategy for LeastConnections {
    fn select(&self, candidates: &[IdentityCandidate<'_>], _throttle: &ThrottleTracker) -> usize {
        candidates
            .iter()
            .enumerate()
            .min_by_key(|(_, candidate)| (candidate.active, candidate.index))
            .map(|(position, _)| position)
            .unwrap_or(0)
    }
}

/// Round-robin over identities that are not currently throttled.
///
/// When every identity is throttled, returns the one whose window ends
/// soonest so the caller can block-and-retry against it.
#[derive(Debug, Default)]
pub struct ThrottleAware {
    counter: AtomicUsize,
}

impl ThrottleAware {
    /// Create a throttle-aware strategy starting at the first identity
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl SelectionStrategy for ThrottleAware {
    fn select(&self, candidates: &[IdentityCandidate<'_>], throttle: &ThrottleTracker) -> usize {
        let eligible: Vec<usize> = candidates
            .iter()
            .enumerate()
            .filter(|(_, candidate)| !throttle.is_throttled(candidate.name))
            .map(|(position, _)| position)
            .collect();

        if eligible.is_empty() {
            // Everyone is throttled; pick the nearest window end.
            return candidates
                .iter()
                .enumerate()
                .min_by_key(|(_, candidate)| throttle.throttled_until(candidate.name))
                .map(|(position, _)| position)
                .unwrap_or(0);
        }

        eligible[self.counter.fetch_add(1, Ordering::Relaxed) % eligible.len()]
    }
}
