//! Scripted in-process factory for integration tests and demos.
//!
//! The mock plays back a shared script of batch outcomes, one step per
//! `execute` call, and records creation/execution counts so tests can
//! assert on pool behavior without a real transport.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use uuid::Uuid;

use spillway_core::{
    BatchRequest, BatchResponse, ConnectionConfig, Error, IdentityName, Operation, RecordOutcome,
    Result,
};

use crate::factory::{BulkChannel, ChannelFactory, ChannelOptions};

/// One scripted batch outcome
#[derive(Debug, Clone)]
pub enum ScriptStep {
    /// Every record succeeds
    Success,
    /// Upsert where the first `created` records are created, the rest updated
    UpsertMix {
        /// Records reported as created
        created: usize,
    },
    /// Listed record indices fail; the rest succeed
    PartialFailure {
        /// Batch-relative indices of the failing records
        failed: Vec<usize>,
        /// Failure message attached to each failing record
        message: String,
    },
    /// The whole batch is rejected with a throttle
    Throttle {
        /// Advertised retry-after window
        retry_after: Duration,
    },
    /// The whole batch fails with a non-throttle error
    Fatal {
        /// Failure message
        message: String,
    },
    /// Every record succeeds and the response carries a new DOP hint
    Hint {
        /// Recommendation carried on the response
        dop_hint: u32,
    },
}

#[derive(Debug, Default)]
struct MockCounters {
    executed: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    closed: AtomicUsize,
}

/// Scripted [`ChannelFactory`] for tests.
///
/// All channels share one script queue; an empty queue plays `Success`.
#[derive(Debug)]
pub struct MockFactory {
    dop_hint: u32,
    latency: Duration,
    script: Arc<Mutex<VecDeque<ScriptStep>>>,
    failing_creates: AtomicUsize,
    creates: DashMap<IdentityName, usize>,
    counters: Arc<MockCounters>,
}

impl Default for MockFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl MockFactory {
    /// Create a factory advertising a DOP hint of 8 and no latency
    #[must_use]
    pub fn new() -> Self {
        Self {
            dop_hint: 8,
            latency: Duration::ZERO,
            script: Arc::new(Mutex::new(VecDeque::new())),
            failing_creates: AtomicUsize::new(0),
            creates: DashMap::new(),
            counters: Arc::new(MockCounters::default()),
        }
    }

    /// Set the DOP hint returned with every created channel
    #[must_use]
    pub fn dop_hint(mut self, hint: u32) -> Self {
        self.dop_hint = hint;
        self
    }

    /// Inject latency into every `execute` call
    #[must_use]
    pub fn latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Append one step to the shared script
    pub fn push_step(&self, step: ScriptStep) {
        self.script.lock().push_back(step);
    }

    /// Append several steps to the shared script
    pub fn extend_script(&self, steps: impl IntoIterator<Item = ScriptStep>) {
        self.script.lock().extend(steps);
    }

    /// Make the next `n` channel creations fail
    pub fn fail_next_creates(&self, n: usize) {
        self.failing_creates.store(n, Ordering::Release);
    }

    /// Channels created for `name`
    pub fn creates_for(&self, name: &str) -> usize {
        self.creates.get(name).map(|count| *count).unwrap_or(0)
    }

    /// Total `execute` calls across all channels
    pub fn executed(&self) -> usize {
        self.counters.executed.load(Ordering::Acquire)
    }

    /// Highest number of concurrent `execute` calls observed
    pub fn peak_in_flight(&self) -> usize {
        self.counters.peak_in_flight.load(Ordering::Acquire)
    }

    /// Channels closed so far
    pub fn closed(&self) -> usize {
        self.counters.closed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl ChannelFactory for MockFactory {
    async fn create(
        &self,
        config: &ConnectionConfig,
        _options: &ChannelOptions,
    ) -> Result<(Arc<dyn BulkChannel>, u32)> {
        let failing = self
            .failing_creates
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(Error::BatchFatal("simulated connect failure".to_string()));
        }

        *self.creates.entry(config.name.clone()).or_insert(0) += 1;
        let channel = MockChannel {
            identity: config.name.clone(),
            script: Arc::clone(&self.script),
            latency: self.latency,
            counters: Arc::clone(&self.counters),
            closed: AtomicBool::new(false),
        };
        Ok((Arc::new(channel), self.dop_hint))
    }
}

/// Channel produced by [`MockFactory`]
#[derive(Debug)]
pub struct MockChannel {
    identity: IdentityName,
    script: Arc<Mutex<VecDeque<ScriptStep>>>,
    latency: Duration,
    counters: Arc<MockCounters>,
    closed: AtomicBool,
}

impl MockChannel {
    /// Identity this channel was created for
    pub fn identity(&self) -> &str {
        &self.identity
    }

    fn success_outcome(operation: Operation) -> RecordOutcome {
        match operation {
            Operation::Create => RecordOutcome::Created { id: Uuid::new_v4() },
            Operation::Update | Operation::Upsert => RecordOutcome::Updated,
            Operation::Delete => RecordOutcome::Deleted,
        }
    }

    fn respond(step: ScriptStep, request: &BatchRequest) -> Result<BatchResponse> {
        let len = request.records.len();
        match step {
            ScriptStep::Success => Ok(BatchResponse {
                outcomes: (0..len)
                    .map(|_| Self::success_outcome(request.operation))
                    .collect(),
                ..Default::default()
            }),
            ScriptStep::UpsertMix { created } => Ok(BatchResponse {
                outcomes: (0..len)
                    .map(|i| {
                        if i < created {
                            RecordOutcome::Created { id: Uuid::new_v4() }
                        } else {
                            RecordOutcome::Updated
                        }
                    })
                    .collect(),
                ..Default::default()
            }),
            ScriptStep::PartialFailure { failed, message } => Ok(BatchResponse {
                outcomes: (0..len)
                    .map(|i| {
                        if failed.contains(&i) {
                            RecordOutcome::Failed {
                                message: message.clone(),
                            }
                        } else {
                            Self::success_outcome(request.operation)
                        }
                    })
                    .collect(),
                ..Default::default()
            }),
            ScriptStep::Throttle { retry_after } => Ok(BatchResponse {
                throttled: true,
                retry_after: Some(retry_after),
                ..Default::default()
            }),
            ScriptStep::Fatal { message } => Err(Error::BatchFatal(message)),
            ScriptStep::Hint { dop_hint } => Ok(BatchResponse {
                outcomes: (0..len)
                    .map(|_| Self::success_outcome(request.operation))
                    .collect(),
                dop_hint: Some(dop_hint),
                ..Default::default()
            }),
        }
    }
}

#[async_trait]
impl BulkChannel for MockChannel {
    async fn execute(&self, request: &BatchRequest) -> Result<BatchResponse> {
        let in_flight = self.counters.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.counters
            .peak_in_flight
            .fetch_max(in_flight, Ordering::AcqRel);

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let step = self
            .script
            .lock()
            .pop_front()
            .unwrap_or(ScriptStep::Success);
        self.counters.executed.fetch_add(1, Ordering::AcqRel);
        self.counters.in_flight.fetch_sub(1, Ordering::AcqRel);
        Self::respond(step, request)
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.counters.closed.fetch_add(1, Ordering::AcqRel);
        }
    }
}
