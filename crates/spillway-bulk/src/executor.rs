//! Chunked parallel bulk-operation dispatch.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use futures::future;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use spillway_core::{
    BatchRequest, BatchResponse, BatchResult, BulkOperationOptions, BulkOperationResult, Error,
    ErrorKind, IdentityName, Operation, RecordError, RequestFlags, Result,
};
use spillway_pool::{ConnectionPool, DopObserver};

use crate::coordinator::BatchCoordinator;
use crate::metrics::{LatencyHistogram, LatencySnapshot};
use crate::rate::{AdaptiveRateController, RateSnapshot};
use crate::stats::{ExecutorCounters, ExecutorStats};

/// Retry-after assumed when the server throttles without advertising one
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(5);

/// A batch waiting to be dispatched
#[derive(Debug)]
struct PendingBatch {
    /// Index of the first record in the caller's input sequence
    start_index: usize,
    records: Vec<serde_json::Value>,
    attempts: u32,
}

/// Outcome of one dispatch attempt
#[derive(Debug)]
enum Dispatched {
    Completed {
        identity: IdentityName,
        response: BatchResponse,
    },
    Throttled {
        identity: IdentityName,
        retry_after: Duration,
    },
    Failed(Error),
}

/// Splits record sequences into batches and dispatches them in parallel
/// chunks whose width follows the adaptive rate controller.
///
/// Throttled batches go back to the tail of the queue; the next chunk is
/// naturally narrower because the controller has decreased. Every batch
/// task is joined inside its chunk; nothing is fired and forgotten.
#[derive(Debug)]
pub struct BulkExecutor {
    pool: ConnectionPool,
    rate: Arc<AdaptiveRateController>,
    coordinator: BatchCoordinator,
    counters: Arc<ExecutorCounters>,
    latency: LatencyHistogram,
}

impl BulkExecutor {
    /// Build an executor over `pool`, governed by `rate`.
    ///
    /// Wires the controller as the pool's DOP observer so channel creation
    /// and response headers keep each identity's ceiling current.
    pub fn new(pool: ConnectionPool, rate: Arc<AdaptiveRateController>) -> Self {
        pool.set_dop_observer(Arc::clone(&rate) as Arc<dyn DopObserver>);
        let coordinator = BatchCoordinator::new(Arc::new(pool.clone()));
        Self {
            pool,
            rate,
            coordinator,
            counters: Arc::new(ExecutorCounters::default()),
            latency: LatencyHistogram::new(),
        }
    }

    /// The pool this executor dispatches through
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// The admission coordinator
    pub fn coordinator(&self) -> &BatchCoordinator {
        &self.coordinator
    }

    /// Executor statistics
    pub fn stats(&self) -> ExecutorStats {
        self.counters.snapshot()
    }

    /// Adaptive snapshots for every identity seen so far
    pub fn rate_snapshots(&self) -> Vec<RateSnapshot> {
        self.rate.snapshots()
    }

    /// Batch round-trip latency distribution
    pub fn latency_snapshot(&self) -> LatencySnapshot {
        self.latency.snapshot()
    }

    /// Run one bulk operation over `records`.
    ///
    /// Records are split into `batch_size` batches and dispatched in
    /// parallel chunks. On cancellation the accumulated partial result is
    /// returned with `cancelled` set.
    pub async fn execute(
        &self,
        entity: &str,
        operation: Operation,
        records: Vec<serde_json::Value>,
        options: &BulkOperationOptions,
        cancel: &CancellationToken,
    ) -> Result<BulkOperationResult> {
        options.validate()?;

        let flags = RequestFlags {
            bypass_custom_logic: options.bypass_custom_logic,
            bypass_power_automate_flows: options.bypass_power_automate_flows,
            suppress_duplicate_detection: options.suppress_duplicate_detection,
            tag: options.tag.clone(),
        };
        let primary = self.pool.primary_identity().to_string();
        let throttle = self.pool.throttle_tracker();
        let started = Instant::now();

        let mut queue = split_into_batches(records, options.batch_size);
        let total_batches = queue.len();
        debug!(entity, ?operation, batches = total_batches, "bulk operation started");

        let mut aggregation = Aggregation::new(operation);
        let mut cancelled = false;

        while !queue.is_empty() {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            let width = self.chunk_width(&primary, options);
            let mut chunk: Vec<PendingBatch> = Vec::with_capacity(width);
            while chunk.len() < width {
                match queue.pop_front() {
                    Some(batch) => chunk.push(batch),
                    None => break,
                }
            }
            trace!(width, in_chunk = chunk.len(), remaining = queue.len(), "dispatching chunk");

            let dispatches = chunk
                .iter()
                .map(|batch| self.dispatch_batch(entity, operation, batch, &flags, cancel));
            let outcomes = future::join_all(dispatches).await;

            for (batch, outcome) in chunk.into_iter().zip(outcomes) {
                match outcome {
                    Dispatched::Completed { identity, response } => {
                        self.counters.batches_dispatched.fetch_add(1, Ordering::Relaxed);
                        throttle.clear_if_expired(&identity);
                        self.rate.record_success(&identity);
                        let result = classify_response(&batch, identity, &response);
                        let had_failures = result.failure_count > 0;
                        aggregation.merge(result);
                        if had_failures && !options.continue_on_error {
                            warn!("aborting bulk operation on record failure");
                            return Err(Error::Aborted {
                                result: Box::new(aggregation.finish(started.elapsed(), false)),
                            });
                        }
                    }
                    Dispatched::Throttled { identity, retry_after } => {
                        self.counters.throttle_events.fetch_add(1, Ordering::Relaxed);
                        throttle.mark_throttled(&identity, retry_after);
                        self.rate.record_throttle(&identity, retry_after);
                        let message = format!(
                            "identity {identity} throttled, retry after {retry_after:?}"
                        );
                        self.requeue_or_fail(
                            batch,
                            &mut queue,
                            &mut aggregation,
                            options,
                            ErrorKind::Throttled,
                            message,
                        );
                    }
                    Dispatched::Failed(Error::Cancelled) => {
                        // Records of this batch stay uncounted; the result
                        // reflects only what completed before the signal.
                        cancelled = true;
                    }
                    Dispatched::Failed(Error::PoolDrained) => return Err(Error::PoolDrained),
                    Dispatched::Failed(error) if error.is_transient() => {
                        self.requeue_or_fail(
                            batch,
                            &mut queue,
                            &mut aggregation,
                            options,
                            error.kind(),
                            error.to_string(),
                        );
                    }
                    Dispatched::Failed(error) => {
                        if !matches!(
                            error.kind(),
                            ErrorKind::FactoryFailure | ErrorKind::BatchFatal
                        ) {
                            self.counters.unclassified_errors.fetch_add(1, Ordering::Relaxed);
                        }
                        warn!(%error, "batch failed");
                        aggregation.fail_batch(&batch, error.kind(), error.to_string());
                        if !options.continue_on_error {
                            return Err(Error::Aborted {
                                result: Box::new(aggregation.finish(started.elapsed(), false)),
                            });
                        }
                    }
                }
            }

            if cancelled {
                break;
            }
        }

        let result = aggregation.finish(started.elapsed(), cancelled);
        debug!(
            success = result.success_count,
            failed = result.failure_count,
            cancelled,
            "bulk operation finished"
        );
        Ok(result)
    }

    /// Width for the next chunk: the controller's recommendation, capped by
    /// the pool total and the caller's `max_parallel_batches`.
    fn chunk_width(&self, primary: &str, options: &BulkOperationOptions) -> usize {
        let max_hint = self.pool.recommended_parallelism(primary).max(1);
        let width = self
            .rate
            .get_parallelism(primary, max_hint)
            .min(self.pool.total_recommended_parallelism().max(1));
        options
            .max_parallel_batches
            .map_or(width, |cap| width.min(cap))
            .max(1)
    }

    /// Dispatch one batch: slot, then channel, then execute. The channel
    /// returns to the pool before the slot frees, on every path.
    async fn dispatch_batch(
        &self,
        entity: &str,
        operation: Operation,
        batch: &PendingBatch,
        flags: &RequestFlags,
        cancel: &CancellationToken,
    ) -> Dispatched {
        let timeout = self.pool.acquire_timeout();
        let permit = match self.coordinator.acquire(timeout, cancel).await {
            Ok(permit) => permit,
            Err(error) => return Dispatched::Failed(error),
        };
        let channel = match self.pool.acquire(cancel).await {
            Ok(channel) => channel,
            Err(error) => return Dispatched::Failed(error),
        };
        let identity = channel.identity().to_string();

        let request = BatchRequest {
            entity: entity.to_string(),
            operation,
            records: batch.records.clone(),
            flags: flags.clone(),
        };

        let round_trip = Instant::now();
        let outcome = tokio::select! {
            () = cancel.cancelled() => Dispatched::Failed(Error::Cancelled),
            result = channel.execute(&request) => {
                self.latency.record(round_trip.elapsed());
                match result {
                    Ok(response) if response.throttled => Dispatched::Throttled {
                        identity: identity.clone(),
                        retry_after: response.retry_after.unwrap_or(DEFAULT_RETRY_AFTER),
                    },
                    Ok(response) => Dispatched::Completed { identity, response },
                    Err(error) => Dispatched::Failed(error),
                }
            },
        };

        drop(channel);
        drop(permit);
        outcome
    }

    fn requeue_or_fail(
        &self,
        mut batch: PendingBatch,
        queue: &mut VecDeque<PendingBatch>,
        aggregation: &mut Aggregation,
        options: &BulkOperationOptions,
        kind: ErrorKind,
        message: String,
    ) {
        batch.attempts += 1;
        if batch.attempts >= options.max_batch_attempts {
            warn!(
                start_index = batch.start_index,
                attempts = batch.attempts,
                "batch exhausted its attempts"
            );
            aggregation.fail_batch(&batch, kind, message);
        } else {
            self.counters.batches_retried.fetch_add(1, Ordering::Relaxed);
            queue.push_back(batch);
        }
    }
}

fn split_into_batches(
    records: Vec<serde_json::Value>,
    batch_size: usize,
) -> VecDeque<PendingBatch> {
    let mut queue = VecDeque::new();
    let mut start_index = 0;
    let mut records = records.into_iter();
    loop {
        let chunk: Vec<serde_json::Value> = records.by_ref().take(batch_size).collect();
        if chunk.is_empty() {
            break;
        }
        let len = chunk.len();
        queue.push_back(PendingBatch {
            start_index,
            records: chunk,
            attempts: 0,
        });
        start_index += len;
    }
    queue
}

/// Map per-record outcomes to a batch result with caller-relative indices
fn classify_response(
    batch: &PendingBatch,
    identity: IdentityName,
    response: &BatchResponse,
) -> BatchResult {
    let mut result = BatchResult {
        identity,
        success_count: 0,
        failure_count: 0,
        errors: Vec::new(),
        throttled: false,
        retry_after: None,
        created_ids: Vec::new(),
        created_count: None,
        updated_count: None,
    };
    let mut created = 0usize;
    let mut updated = 0usize;

    for (offset, outcome) in response.outcomes.iter().enumerate() {
        let index = batch.start_index + offset;
        match outcome {
            spillway_core::RecordOutcome::Created { id } => {
                result.success_count += 1;
                result.created_ids.push((index, *id));
                created += 1;
            }
            spillway_core::RecordOutcome::Updated => {
                result.success_count += 1;
                updated += 1;
            }
            spillway_core::RecordOutcome::Deleted => {
                result.success_count += 1;
            }
            spillway_core::RecordOutcome::Failed { message } => {
                result.failure_count += 1;
                result.errors.push(RecordError {
                    index,
                    kind: ErrorKind::RecordFailure,
                    message: message.clone(),
                });
            }
        }
    }

    result.created_count = Some(created);
    result.updated_count = Some(updated);
    result
}

/// Accumulates batch results into the final operation result
#[derive(Debug)]
struct Aggregation {
    operation: Operation,
    success_count: usize,
    failure_count: usize,
    errors: Vec<RecordError>,
    created_ids: Vec<(usize, Uuid)>,
    created_count: usize,
    updated_count: usize,
}

impl Aggregation {
    fn new(operation: Operation) -> Self {
        Self {
            operation,
            success_count: 0,
            failure_count: 0,
            errors: Vec::new(),
            created_ids: Vec::new(),
            created_count: 0,
            updated_count: 0,
        }
    }

    fn merge(&mut self, result: BatchResult) {
        self.success_count += result.success_count;
        self.failure_count += result.failure_count;
        self.errors.extend(result.errors);
        self.created_ids.extend(result.created_ids);
        self.created_count += result.created_count.unwrap_or(0);
        self.updated_count += result.updated_count.unwrap_or(0);
    }

    fn fail_batch(&mut self, batch: &PendingBatch, kind: ErrorKind, message: String) {
        self.failure_count += batch.records.len();
        for offset in 0..batch.records.len() {
            self.errors.push(RecordError {
                index: batch.start_index + offset,
                kind,
                message: message.clone(),
            });
        }
    }

    fn finish(mut self, duration: Duration, cancelled: bool) -> BulkOperationResult {
        self.errors.sort_by_key(|error| error.index);

        let created_ids = if self.operation == Operation::Create {
            self.created_ids.sort_by_key(|(index, _)| *index);
            Some(self.created_ids.into_iter().map(|(_, id)| id).collect())
        } else {
            None
        };
        let (created_count, updated_count) = if self.operation == Operation::Upsert {
            (Some(self.created_count), Some(self.updated_count))
        } else {
            (None, None)
        };

        BulkOperationResult {
            success_count: self.success_count,
            failure_count: self.failure_count,
            errors: self.errors,
            duration,
            created_ids,
            created_count,
            updated_count,
            cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_preserves_order_and_sizes() {
        let records: Vec<serde_json::Value> = (0..250).map(|i| serde_json::json!({ "n": i })).collect();
        let queue = split_into_batches(records, 100);
        let sizes: Vec<usize> = queue.iter().map(|batch| batch.records.len()).collect();
        assert_eq!(sizes, vec![100, 100, 50]);
        let starts: Vec<usize> = queue.iter().map(|batch| batch.start_index).collect();
        assert_eq!(starts, vec![0, 100, 200]);
        assert_eq!(queue[2].records[0]["n"], 200);
    }

    #[test]
    fn classify_maps_batch_offsets_to_input_indices() {
        let batch = PendingBatch {
            start_index: 100,
            records: vec![serde_json::Value::Null; 3],
            attempts: 0,
        };
        let response = BatchResponse {
            outcomes: vec![
                spillway_core::RecordOutcome::Updated,
                spillway_core::RecordOutcome::Failed {
                    message: "bad".to_string(),
                },
                spillway_core::RecordOutcome::Updated,
            ],
            ..Default::default()
        };
        let result = classify_response(&batch, "a".to_string(), &response);
        assert_eq!(result.success_count, 2);
        assert_eq!(result.failure_count, 1);
        assert_eq!(result.errors[0].index, 101);
    }
}
