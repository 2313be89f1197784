//! Per-identity AIMD parallelism governor.
//!
//! Each identity carries an additive-increase / multiplicative-decrease
//! state machine over the server's recommended degree of parallelism.
//! Sustained success probes upward in small steps; a throttle cuts the
//! level multiplicatively and remembers the last stable level so recovery
//! can climb back faster than cold probing.

use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, trace};

use spillway_core::{AdaptiveRateConfig, IdentityName};
use spillway_pool::DopObserver;

/// Adaptive parallelism state for one identity
#[derive(Debug)]
struct RateState {
    current: usize,
    max: usize,
    last_known_good: usize,
    last_known_good_at: Instant,
    successes_since_throttle: u32,
    last_increase_at: Instant,
    last_activity_at: Instant,
    last_throttle_at: Option<Instant>,
    total_throttle_events: u64,
}

/// Read-only snapshot of one identity's adaptive state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateSnapshot {
    /// Identity this snapshot describes
    pub identity: IdentityName,

    /// Current recommended parallelism
    pub current: usize,

    /// Ceiling from the latest server DOP hint
    pub max: usize,

    /// Highest recently-stable parallelism
    pub last_known_good: usize,

    /// Whether the last-known-good baseline has outlived its TTL
    pub is_stale: bool,

    /// Successful batches since the last throttle
    pub successes_since_throttle: u32,

    /// Throttle events observed over the identity's lifetime
    pub total_throttle_events: u64,

    /// Time since the last throttle, when one has occurred
    pub last_throttle_age: Option<Duration>,

    /// Time since the last increase
    pub last_increase_age: Duration,

    /// Time since the last recorded activity
    pub last_activity_age: Duration,
}

/// Per-identity AIMD governor for recommended concurrency.
///
/// All transitions lock only the affected identity's state; identities are
/// fully independent.
#[derive(Debug)]
pub struct AdaptiveRateController {
    config: AdaptiveRateConfig,
    states: DashMap<IdentityName, Mutex<RateState>>,
}

impl Default for AdaptiveRateController {
    fn default() -> Self {
        Self::new(AdaptiveRateConfig::default())
    }
}

impl AdaptiveRateController {
    /// Create a controller with the given tunables
    #[must_use]
    pub fn new(config: AdaptiveRateConfig) -> Self {
        Self {
            config,
            states: DashMap::new(),
        }
    }

    fn init_state(&self, max_hint: usize, now: Instant) -> RateState {
        let max = max_hint.max(self.config.min_parallelism).max(1);
        let current = ((max as f64) * self.config.initial_factor).floor() as usize;
        let current = current.clamp(self.config.min_parallelism, max);
        RateState {
            current,
            max,
            last_known_good: current,
            last_known_good_at: now,
            successes_since_throttle: 0,
            last_increase_at: now,
            last_activity_at: now,
            last_throttle_at: None,
            total_throttle_events: 0,
        }
    }

    /// The most recent server hint is authoritative for the ceiling; a
    /// smaller ceiling caps `current` (and the baseline) without touching
    /// the stabilization counters.
    fn apply_hint(&self, state: &mut RateState, max_hint: usize) {
        let max = max_hint.max(self.config.min_parallelism).max(1);
        if max != state.max {
            state.max = max;
            state.current = state.current.min(max);
            state.last_known_good = state.last_known_good.min(max);
        }
    }

    /// Current recommended parallelism for `name`.
    ///
    /// Lazily initializes unknown identities from `max_hint`, applies the
    /// idle reset when the identity has been inactive past the configured
    /// period, and records activity.
    pub fn get_parallelism(&self, name: &str, max_hint: usize) -> usize {
        let now = Instant::now();
        let entry = self
            .states
            .entry(name.to_string())
            .or_insert_with(|| Mutex::new(self.init_state(max_hint, now)));
        let mut state = entry.lock();

        // Idleness is judged against the previous activity stamp, before
        // the stamp is refreshed; the reverse order would make the reset
        // unreachable.
        if now.duration_since(state.last_activity_at) > self.config.idle_reset_period {
            let events = state.total_throttle_events;
            *state = self.init_state(max_hint, now);
            state.total_throttle_events = events;
            debug!(identity = name, current = state.current, "idle reset");
        }

        self.apply_hint(&mut state, max_hint);
        state.last_activity_at = now;
        state.current
    }

    /// Record one successful batch for `name`.
    ///
    /// After `stabilization_batches` consecutive successes spaced at least
    /// `min_increase_interval` from the previous increase, the level rises:
    /// by `increase_step` when probing above the baseline, faster (scaled by
    /// `recovery_multiplier`) while still below it.
    pub fn record_success(&self, name: &str) {
        let Some(entry) = self.states.get(name) else {
            trace!(identity = name, "success for unknown identity ignored");
            return;
        };
        let mut state = entry.lock();
        let now = Instant::now();

        state.successes_since_throttle += 1;

        if now.duration_since(state.last_known_good_at) > self.config.last_known_good_ttl {
            state.last_known_good = state.current;
            state.last_known_good_at = now;
        }

        if state.successes_since_throttle >= self.config.stabilization_batches
            && now.duration_since(state.last_increase_at) >= self.config.min_increase_interval
        {
            let step = if state.current < state.last_known_good {
                ((self.config.increase_step as f64) * self.config.recovery_multiplier).ceil()
                    as usize
            } else {
                self.config.increase_step
            };
            let previous = state.current;
            state.current = (state.current + step).min(state.max);
            state.successes_since_throttle = 0;
            state.last_increase_at = now;
            if state.current != previous {
                trace!(
                    identity = name,
                    from = previous,
                    to = state.current,
                    recovering = previous < state.last_known_good,
                    "parallelism increased"
                );
            }
        }

        state.last_activity_at = now;
    }

    /// Record a server throttle for `name`.
    ///
    /// Cuts `current` multiplicatively, lowers the baseline to just under
    /// the level that tripped the throttle, and restarts stabilization.
    /// The retry-after window itself belongs to the throttle tracker.
    pub fn record_throttle(&self, name: &str, retry_after: Duration) {
        let Some(entry) = self.states.get(name) else {
            trace!(identity = name, "throttle for unknown identity ignored");
            return;
        };
        let mut state = entry.lock();
        let now = Instant::now();

        state.total_throttle_events += 1;
        state.last_throttle_at = Some(now);
        state.last_known_good = state
            .current
            .saturating_sub(self.config.increase_step)
            .max(self.config.min_parallelism);
        state.last_known_good_at = now;
        let previous = state.current;
        state.current = (((state.current as f64) * self.config.decrease_factor).floor() as usize)
            .max(self.config.min_parallelism);
        state.successes_since_throttle = 0;
        state.last_activity_at = now;

        debug!(
            identity = name,
            from = previous,
            to = state.current,
            retry_after_ms = retry_after.as_millis() as u64,
            "parallelism decreased on throttle"
        );
    }

    /// Re-initialize `name` as on first observation, preserving the
    /// lifetime throttle counter
    pub fn reset(&self, name: &str) {
        if let Some(entry) = self.states.get(name) {
            let mut state = entry.lock();
            let now = Instant::now();
            let events = state.total_throttle_events;
            let max = state.max;
            *state = self.init_state(max, now);
            state.total_throttle_events = events;
        }
    }

    /// Snapshot of one identity's adaptive state
    pub fn snapshot(&self, name: &str) -> Option<RateSnapshot> {
        let entry = self.states.get(name)?;
        let state = entry.lock();
        let now = Instant::now();
        Some(RateSnapshot {
            identity: name.to_string(),
            current: state.current,
            max: state.max,
            last_known_good: state.last_known_good,
            is_stale: now.duration_since(state.last_known_good_at)
                > self.config.last_known_good_ttl,
            successes_since_throttle: state.successes_since_throttle,
            total_throttle_events: state.total_throttle_events,
            last_throttle_age: state
                .last_throttle_at
                .map(|at| now.duration_since(at)),
            last_increase_age: now.duration_since(state.last_increase_at),
            last_activity_age: now.duration_since(state.last_activity_at),
        })
    }

    /// Snapshots for every identity seen so far, sorted by name
    pub fn snapshots(&self) -> Vec<RateSnapshot> {
        let mut names: Vec<IdentityName> =
            self.states.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
            .iter()
            .filter_map(|name| self.snapshot(name))
            .collect()
    }
}

impl DopObserver for AdaptiveRateController {
    fn observe_dop_hint(&self, identity: &str, hint: u32) {
        let now = Instant::now();
        let entry = self
            .states
            .entry(identity.to_string())
            .or_insert_with(|| Mutex::new(self.init_state(hint as usize, now)));
        let mut state = entry.lock();
        self.apply_hint(&mut state, hint as usize);
    }
}
