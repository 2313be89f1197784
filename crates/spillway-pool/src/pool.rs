//! Fixed-capacity, multi-identity connection pool.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use spillway_core::{ConnectionConfig, Error, IdentityName, PoolConfig, Result};

use crate::channel::PooledChannel;
use crate::factory::{BulkChannel, ChannelFactory, ChannelOptions};
use crate::strategy::{IdentityCandidate, SelectionStrategy, build_strategy};
use crate::throttle::ThrottleTracker;

/// Observer for server DOP recommendations recorded by the pool.
///
/// The rate controller implements this so that channel creation and
/// response headers keep each identity's parallelism ceiling current.
pub trait DopObserver: Send + Sync {
    /// A new DOP recommendation was observed for `identity`
    fn observe_dop_hint(&self, identity: &str, hint: u32);
}

/// Point-in-time pool statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStats {
    /// Channels currently checked out
    pub active: usize,

    /// Channels idle in sub-pools
    pub idle: usize,

    /// Checkouts served since the pool was created
    pub served: u64,

    /// Identities currently inside a throttle window
    pub throttled_identities: Vec<IdentityName>,
}

/// An idle channel parked in its identity's sub-pool
struct IdleChannel {
    channel: Arc<dyn BulkChannel>,
    channel_id: Uuid,
    created_at: Instant,
    idle_since: Instant,
}

impl std::fmt::Debug for IdleChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdleChannel")
            .field("channel_id", &self.channel_id)
            .field("created_at", &self.created_at)
            .field("idle_since", &self.idle_since)
            .finish_non_exhaustive()
    }
}

/// Per-identity sub-pool
#[derive(Debug)]
struct IdentityState {
    config: ConnectionConfig,
    idle: Mutex<VecDeque<IdleChannel>>,
    notify: Notify,
}

/// Per-identity capacity counters, guarded by the pool-level lock
#[derive(Debug, Clone, Copy, Default)]
struct IdentityCounts {
    active: usize,
    idle: usize,
    /// Channel creations currently in flight at the factory
    reserved: usize,
}

impl IdentityCounts {
    fn total(&self) -> usize {
        self.active + self.idle + self.reserved
    }
}

/// Global capacity accounting. Lock order: this lock first, identity idle
/// locks second; never the reverse.
#[derive(Debug)]
struct Accounting {
    counts: Vec<IdentityCounts>,
    total: usize,
}

impl Accounting {
    fn total_active(&self) -> usize {
        self.counts.iter().map(|c| c.active).sum()
    }

    fn total_idle(&self) -> usize {
        self.counts.iter().map(|c| c.idle).sum()
    }
}

pub(crate) struct PoolShared {
    config: PoolConfig,
    identities: Vec<IdentityState>,
    accounting: Mutex<Accounting>,
    strategy: Box<dyn SelectionStrategy>,
    factory: Arc<dyn ChannelFactory>,
    throttle: Arc<ThrottleTracker>,
    /// Latest server DOP hint per identity; 0 = not yet observed
    dop_hints: Vec<AtomicU32>,
    dop_observer: RwLock<Option<Arc<dyn DopObserver>>>,
    served: AtomicU64,
    draining: AtomicBool,
    drain_notify: Notify,
    last_eviction: Mutex<Instant>,
}

impl std::fmt::Debug for PoolShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolShared")
            .field("identities", &self.identities.len())
            .field("draining", &self.draining.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Multi-identity checkout pool over a [`ChannelFactory`].
///
/// Each identity owns a sub-pool of idle channels and an active count;
/// capacity is enforced per identity and pool-wide. Acquire blocks up to
/// the configured timeout, selection is pluggable, and idle/lifetime
/// eviction runs opportunistically on release plus on a background pulse.
#[derive(Debug, Clone)]
pub struct ConnectionPool {
    shared: Arc<PoolShared>,
}

impl ConnectionPool {
    /// Create a pool over `configs`, producing channels through `factory`.
    ///
    /// Fails with a configuration error when `configs` is empty or contains
    /// duplicate identity names.
    pub fn new(
        configs: Vec<ConnectionConfig>,
        factory: Arc<dyn ChannelFactory>,
        config: PoolConfig,
        throttle: Arc<ThrottleTracker>,
    ) -> Result<Self> {
        if configs.is_empty() {
            return Err(Error::Configuration(
                "pool requires at least one identity".to_string(),
            ));
        }
        for (i, a) in configs.iter().enumerate() {
            if configs.iter().skip(i + 1).any(|b| b.name == a.name) {
                return Err(Error::Configuration(format!(
                    "duplicate identity name: {}",
                    a.name
                )));
            }
        }

        let identity_count = configs.len();
        let strategy = build_strategy(config.selection_strategy);
        let shared = Arc::new(PoolShared {
            identities: configs
                .into_iter()
                .map(|config| IdentityState {
                    config,
                    idle: Mutex::new(VecDeque::new()),
                    notify: Notify::new(),
                })
                .collect(),
            accounting: Mutex::new(Accounting {
                counts: vec![IdentityCounts::default(); identity_count],
                total: 0,
            }),
            strategy,
            factory,
            throttle,
            dop_hints: (0..identity_count).map(|_| AtomicU32::new(0)).collect(),
            dop_observer: RwLock::new(None),
            served: AtomicU64::new(0),
            draining: AtomicBool::new(false),
            drain_notify: Notify::new(),
            last_eviction: Mutex::new(Instant::now()),
            config,
        });

        shared.clone().spawn_eviction_pulse();

        Ok(Self { shared })
    }

    /// Check a channel out of the pool.
    ///
    /// Blocks up to the configured acquire timeout for a slot on the
    /// selected identity; fails with `AcquireTimeout` when none frees up,
    /// `Cancelled` when `cancel` fires, and `PoolDrained` after shutdown.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<PooledChannel> {
        let shared = &self.shared;
        let timeout = shared.config.acquire_timeout;
        let deadline = Instant::now() + timeout;

        loop {
            if shared.draining.load(Ordering::Acquire) {
                return Err(Error::PoolDrained);
            }

            let idx = shared.select_identity();

            if let Some(channel) = shared.try_take_idle(idx) {
                return Ok(channel);
            }
            if shared.try_reserve(idx) {
                return shared.create_channel(idx).await;
            }

            // Register for the identity's release signal before re-checking,
            // so a release between the check and the wait is not lost.
            let notified = shared.identities[idx].notify.notified();
            if let Some(channel) = shared.try_take_idle(idx) {
                return Ok(channel);
            }
            if shared.try_reserve(idx) {
                return shared.create_channel(idx).await;
            }

            tokio::select! {
                () = cancel.cancelled() => return Err(Error::Cancelled),
                () = notified => {}
                () = tokio::time::sleep_until(deadline) => {
                    return Err(Error::AcquireTimeout {
                        identity: shared.identity_name(idx).to_string(),
                        timeout,
                    });
                }
            }
        }
    }

    /// Point-in-time pool statistics
    pub fn stats(&self) -> PoolStats {
        let accounting = self.shared.accounting.lock();
        PoolStats {
            active: accounting.total_active(),
            idle: accounting.total_idle(),
            served: self.shared.served.load(Ordering::Relaxed),
            throttled_identities: self.shared.throttle.throttled_identities(),
        }
    }

    /// Sum over identities of `min(per-identity cap, latest DOP hint)`.
    ///
    /// Identities with no hint observed yet contribute their cap.
    pub fn total_recommended_parallelism(&self) -> usize {
        let shared = &self.shared;
        shared
            .identities
            .iter()
            .enumerate()
            .map(|(idx, _)| shared.recommended_parallelism_idx(idx))
            .sum()
    }

    /// `min(per-identity cap, latest DOP hint)` for one identity
    pub fn recommended_parallelism(&self, name: &str) -> usize {
        self.shared
            .identity_index(name)
            .map(|idx| self.shared.recommended_parallelism_idx(idx))
            .unwrap_or(0)
    }

    /// Latest server DOP hint for `name`, when one has been observed
    pub fn dop_hint(&self, name: &str) -> Option<u32> {
        let idx = self.shared.identity_index(name)?;
        match self.shared.dop_hints[idx].load(Ordering::Acquire) {
            0 => None,
            hint => Some(hint),
        }
    }

    /// Record a DOP hint observed outside the pool (e.g. a response header)
    pub fn note_dop_hint(&self, name: &str, hint: u32) {
        if let Some(idx) = self.shared.identity_index(name) {
            self.shared.note_dop_hint_idx(idx, hint);
        }
    }

    /// Wire an observer that is told about every DOP hint the pool records
    pub fn set_dop_observer(&self, observer: Arc<dyn DopObserver>) {
        *self.shared.dop_observer.write() = Some(observer);
    }

    /// Name of the first configured identity
    pub fn primary_identity(&self) -> &str {
        self.shared.identity_name(0)
    }

    /// Names of all configured identities, in insertion order
    pub fn identity_names(&self) -> Vec<IdentityName> {
        self.shared
            .identities
            .iter()
            .map(|identity| identity.config.name.clone())
            .collect()
    }

    /// The tracker shared with selection and rate control
    pub fn throttle_tracker(&self) -> Arc<ThrottleTracker> {
        Arc::clone(&self.shared.throttle)
    }

    /// Configured acquire timeout
    pub fn acquire_timeout(&self) -> Duration {
        self.shared.config.acquire_timeout
    }

    /// Whether `drain` has been called
    pub fn is_draining(&self) -> bool {
        self.shared.draining.load(Ordering::Acquire)
    }

    /// Shut the pool down.
    ///
    /// Idempotent: refuses new acquires immediately, waits up to `timeout`
    /// for outstanding channels to come back, then closes everything idle.
    pub async fn drain(&self, timeout: Duration) {
        let shared = &self.shared;
        shared.draining.store(true, Ordering::Release);
        for identity in &shared.identities {
            identity.notify.notify_waiters();
        }

        let deadline = Instant::now() + timeout;
        loop {
            if shared.accounting.lock().total_active() == 0 {
                break;
            }
            let notified = shared.drain_notify.notified();
            if shared.accounting.lock().total_active() == 0 {
                break;
            }
            tokio::select! {
                () = notified => {}
                () = tokio::time::sleep_until(deadline) => {
                    warn!("pool drain deadline reached with channels still checked out");
                    break;
                }
            }
        }

        shared.close_all_idle();
        debug!("pool drained");
    }
}

impl PoolShared {
    pub(crate) fn identity_name(&self, idx: usize) -> &str {
        &self.identities[idx].config.name
    }

    fn identity_index(&self, name: &str) -> Option<usize> {
        self.identities
            .iter()
            .position(|identity| identity.config.name == name)
    }

    fn identity_cap(&self, idx: usize) -> usize {
        self.identities[idx]
            .config
            .max_concurrent
            .unwrap_or(self.config.max_connections_per_identity)
    }

    fn recommended_parallelism_idx(&self, idx: usize) -> usize {
        let cap = self.identity_cap(idx);
        match self.dop_hints[idx].load(Ordering::Acquire) {
            0 => cap,
            hint => cap.min(hint as usize),
        }
    }

    pub(crate) fn note_dop_hint_idx(&self, idx: usize, hint: u32) {
        let previous = self.dop_hints[idx].swap(hint, Ordering::AcqRel);
        if previous != hint {
            trace!(
                identity = self.identity_name(idx),
                hint, "server DOP recommendation updated"
            );
        }
        let observer = self.dop_observer.read().clone();
        if let Some(observer) = observer {
            observer.observe_dop_hint(self.identity_name(idx), hint);
        }
    }

    fn select_identity(&self) -> usize {
        if self.identities.len() == 1 {
            return 0;
        }
        let actives: Vec<usize> = {
            let accounting = self.accounting.lock();
            accounting.counts.iter().map(|c| c.active).collect()
        };
        let candidates: Vec<IdentityCandidate<'_>> = self
            .identities
            .iter()
            .enumerate()
            .map(|(index, identity)| IdentityCandidate {
                index,
                name: &identity.config.name,
                active: actives[index],
            })
            .collect();
        self.strategy.select(&candidates, &self.throttle)
    }

    /// Take an idle channel for `idx`, discarding any that outlived
    /// `max_lifetime` on the way.
    fn try_take_idle(self: &Arc<Self>, idx: usize) -> Option<PooledChannel> {
        let mut expired: Vec<Arc<dyn BulkChannel>> = Vec::new();
        let taken = {
            let mut accounting = self.accounting.lock();
            let mut idle = self.identities[idx].idle.lock();
            let mut taken = None;
            while let Some(entry) = idle.pop_front() {
                accounting.counts[idx].idle -= 1;
                if entry.created_at.elapsed() > self.config.max_lifetime {
                    accounting.total -= 1;
                    expired.push(entry.channel);
                    continue;
                }
                accounting.counts[idx].active += 1;
                taken = Some(entry);
                break;
            }
            taken
        };

        let freed = expired.len();
        for channel in expired {
            channel.close();
        }
        for _ in 0..freed {
            // Lifetime eviction freed capacity another waiter can use.
            self.identities[idx].notify.notify_one();
        }

        let entry = taken?;
        self.served.fetch_add(1, Ordering::Relaxed);
        trace!(identity = self.identity_name(idx), channel_id = %entry.channel_id, "reusing idle channel");
        Some(PooledChannel::new(
            idx,
            entry.channel_id,
            entry.created_at,
            entry.channel,
            Arc::clone(self),
        ))
    }

    /// Reserve capacity for one new channel on `idx`
    fn try_reserve(&self, idx: usize) -> bool {
        let mut accounting = self.accounting.lock();
        let max_pool = self.config.effective_max_pool_size(self.identities.len());
        if accounting.counts[idx].total() < self.identity_cap(idx) && accounting.total < max_pool {
            accounting.counts[idx].reserved += 1;
            accounting.total += 1;
            true
        } else {
            false
        }
    }

    /// Create a channel against a reservation made by `try_reserve`.
    ///
    /// Factory failure releases the reservation and surfaces to the current
    /// acquire only; the identity stays usable for concurrent acquires. The
    /// reservation is also released if this future is dropped mid-create.
    async fn create_channel(self: &Arc<Self>, idx: usize) -> Result<PooledChannel> {
        struct ReservationGuard<'a> {
            shared: &'a PoolShared,
            idx: usize,
            armed: bool,
        }
        impl Drop for ReservationGuard<'_> {
            fn drop(&mut self) {
                if self.armed {
                    {
                        let mut accounting = self.shared.accounting.lock();
                        accounting.counts[self.idx].reserved -= 1;
                        accounting.total -= 1;
                    }
                    // The freed reservation may unblock another waiter.
                    self.shared.identities[self.idx].notify.notify_one();
                }
            }
        }

        let mut guard = ReservationGuard {
            shared: self,
            idx,
            armed: true,
        };
        let options = ChannelOptions {
            disable_affinity_cookie: self.config.disable_affinity_cookie,
        };
        let created = self
            .factory
            .create(&self.identities[idx].config, &options)
            .await;

        match created {
            Ok((channel, dop_hint)) => {
                guard.armed = false;
                {
                    let mut accounting = self.accounting.lock();
                    accounting.counts[idx].reserved -= 1;
                    accounting.counts[idx].active += 1;
                }
                self.note_dop_hint_idx(idx, dop_hint);
                self.served.fetch_add(1, Ordering::Relaxed);
                let channel_id = Uuid::new_v4();
                debug!(identity = self.identity_name(idx), %channel_id, dop_hint, "created channel");
                Ok(PooledChannel::new(
                    idx,
                    channel_id,
                    Instant::now(),
                    channel,
                    Arc::clone(self),
                ))
            }
            Err(error) => {
                drop(guard);
                warn!(identity = self.identity_name(idx), %error, "channel creation failed");
                Err(Error::FactoryFailure {
                    identity: self.identity_name(idx).to_string(),
                    message: error.to_string(),
                })
            }
        }
    }

    /// Return a checked-out channel. Called from `PooledChannel::drop`.
    pub(crate) fn release_channel(
        &self,
        idx: usize,
        channel: Arc<dyn BulkChannel>,
        channel_id: Uuid,
        created_at: Instant,
    ) {
        let now = Instant::now();
        let draining = self.draining.load(Ordering::Acquire);
        let expired = created_at.elapsed() > self.config.max_lifetime;

        if draining || expired {
            {
                let mut accounting = self.accounting.lock();
                accounting.counts[idx].active -= 1;
                accounting.total -= 1;
            }
            channel.close();
            trace!(identity = self.identity_name(idx), %channel_id, draining, expired, "closed channel on release");
        } else {
            let mut accounting = self.accounting.lock();
            accounting.counts[idx].active -= 1;
            accounting.counts[idx].idle += 1;
            self.identities[idx].idle.lock().push_back(IdleChannel {
                channel,
                channel_id,
                created_at,
                idle_since: now,
            });
        }

        self.identities[idx].notify.notify_one();
        self.drain_notify.notify_waiters();
        self.evict_if_due(now);
    }

    fn spawn_eviction_pulse(self: Arc<Self>) {
        if self.config.eviction_interval.is_zero() {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let interval = self.config.eviction_interval;
        let weak = Arc::downgrade(&self);
        drop(self);
        handle.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(shared) = weak.upgrade() else { break };
                if shared.draining.load(Ordering::Acquire) {
                    break;
                }
                shared.evict(Instant::now());
            }
        });
    }

    /// Run an eviction sweep if one has not run within `eviction_interval`
    fn evict_if_due(&self, now: Instant) {
        {
            let mut last = self.last_eviction.lock();
            if now.duration_since(*last) < self.config.eviction_interval {
                return;
            }
            *last = now;
        }
        self.evict(now);
    }

    /// Close idle channels past `max_idle_time` (down to `min_pool_size`)
    /// and any idle channel past `max_lifetime`.
    fn evict(&self, now: Instant) {
        let mut to_close: Vec<(usize, Arc<dyn BulkChannel>)> = Vec::new();
        {
            let mut accounting = self.accounting.lock();
            for (idx, identity) in self.identities.iter().enumerate() {
                let mut idle = identity.idle.lock();
                idle.retain(|entry| {
                    let over_lifetime =
                        now.duration_since(entry.created_at) > self.config.max_lifetime;
                    let over_idle = now.duration_since(entry.idle_since) > self.config.max_idle_time
                        && accounting.total > self.config.min_pool_size;
                    if over_lifetime || over_idle {
                        accounting.counts[idx].idle -= 1;
                        accounting.total -= 1;
                        to_close.push((idx, Arc::clone(&entry.channel)));
                        false
                    } else {
                        true
                    }
                });
            }
        }

        if to_close.is_empty() {
            return;
        }
        debug!(count = to_close.len(), "evicting idle channels");
        for (idx, channel) in to_close {
            channel.close();
            self.identities[idx].notify.notify_one();
        }
    }

    fn close_all_idle(&self) {
        let mut to_close: Vec<Arc<dyn BulkChannel>> = Vec::new();
        {
            let mut accounting = self.accounting.lock();
            for (idx, identity) in self.identities.iter().enumerate() {
                let mut idle = identity.idle.lock();
                for entry in idle.drain(..) {
                    accounting.counts[idx].idle -= 1;
                    accounting.total -= 1;
                    to_close.push(entry.channel);
                }
            }
        }
        for channel in to_close {
            channel.close();
        }
    }
}
