//! End-to-end bulk executor behavior over the scripted mock factory.

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;
use url::Url;

use spillway_bulk::{AdaptiveRateController, BulkExecutor};
use spillway_core::{
    AdaptiveRateConfig, BulkOperationOptions, ConnectionConfig, Error, ErrorKind, Operation,
    PoolConfig,
};
use spillway_pool::testing::{MockFactory, ScriptStep};
use spillway_pool::{ConnectionPool, ThrottleTracker};

fn records(n: usize) -> Vec<serde_json::Value> {
    (0..n).map(|i| serde_json::json!({ "seq": i })).collect()
}

fn executor_over(
    factory: Arc<MockFactory>,
    max_concurrent: Option<usize>,
    rate_config: AdaptiveRateConfig,
) -> BulkExecutor {
    let mut config = ConnectionConfig::new(
        "primary",
        Url::parse("https://bulk.example.com/api").unwrap(),
    );
    if let Some(max) = max_concurrent {
        config = config.max_concurrent(max);
    }
    let pool = ConnectionPool::new(
        vec![config],
        factory,
        PoolConfig::default(),
        Arc::new(ThrottleTracker::new()),
    )
    .unwrap();
    BulkExecutor::new(pool, Arc::new(AdaptiveRateController::new(rate_config)))
}

fn fast_increase() -> AdaptiveRateConfig {
    AdaptiveRateConfig {
        min_increase_interval: Duration::from_millis(1),
        ..AdaptiveRateConfig::default()
    }
}

#[tokio::test(start_paused = true)]
async fn chunked_dispatch_widens_after_stabilization() {
    let factory = Arc::new(MockFactory::new().dop_hint(4).latency(Duration::from_millis(5)));
    let executor = executor_over(factory.clone(), Some(4), fast_increase());

    let result = executor
        .execute(
            "account",
            Operation::Update,
            records(1_000),
            &BulkOperationOptions::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(result.success_count, 1_000);
    assert_eq!(result.failure_count, 0);
    // Exactly ten batches, never wider than the server's recommendation.
    assert_eq!(factory.executed(), 10);
    assert!(factory.peak_in_flight() <= 4);

    let snapshot = &executor.rate_snapshots()[0];
    assert_eq!(snapshot.current, 4);
    assert_eq!(executor.stats().batches_dispatched, 10);
}

#[tokio::test(start_paused = true)]
async fn upsert_reports_created_and_updated_counts() {
    let factory = Arc::new(MockFactory::new());
    factory.push_step(ScriptStep::UpsertMix { created: 30 });
    let executor = executor_over(factory, None, AdaptiveRateConfig::default());

    let result = executor
        .execute(
            "contact",
            Operation::Upsert,
            records(100),
            &BulkOperationOptions::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(result.success_count, 100);
    assert_eq!(result.failure_count, 0);
    assert_eq!(result.created_count, Some(30));
    assert_eq!(result.updated_count, Some(70));
    assert_eq!(result.created_ids, None);
}

#[tokio::test(start_paused = true)]
async fn create_returns_ids_in_input_order() {
    let factory = Arc::new(MockFactory::new());
    let executor = executor_over(factory, None, AdaptiveRateConfig::default());

    let result = executor
        .execute(
            "account",
            Operation::Create,
            records(250),
            &BulkOperationOptions::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(result.success_count, 250);
    let ids = result.created_ids.unwrap();
    assert_eq!(ids.len(), 250);
    assert_eq!(result.created_count, None);
    assert_eq!(result.updated_count, None);
}

#[tokio::test(start_paused = true)]
async fn continue_on_error_retains_failures_and_completes() {
    let factory = Arc::new(MockFactory::new());
    factory.push_step(ScriptStep::PartialFailure {
        failed: vec![3, 17],
        message: "validation failed".to_string(),
    });
    let executor = executor_over(factory, None, AdaptiveRateConfig::default());

    let result = executor
        .execute(
            "account",
            Operation::Update,
            records(100),
            &BulkOperationOptions::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(result.success_count, 98);
    assert_eq!(result.failure_count, 2);
    let indices: Vec<usize> = result.errors.iter().map(|error| error.index).collect();
    assert_eq!(indices, vec![3, 17]);
    assert!(result
        .errors
        .iter()
        .all(|error| error.kind == ErrorKind::RecordFailure));
}

#[tokio::test(start_paused = true)]
async fn record_failure_aborts_when_continue_on_error_is_off() {
    let factory = Arc::new(MockFactory::new());
    factory.push_step(ScriptStep::PartialFailure {
        failed: vec![0],
        message: "validation failed".to_string(),
    });
    let executor = executor_over(factory, None, AdaptiveRateConfig::default());

    let err = executor
        .execute(
            "account",
            Operation::Update,
            records(100),
            &BulkOperationOptions::default().continue_on_error(false),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    match err {
        Error::Aborted { result } => {
            assert_eq!(result.failure_count, 1);
            assert_eq!(result.success_count, 99);
        }
        other => panic!("expected Aborted, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn throttled_batch_is_requeued_and_eventually_succeeds() {
    let factory = Arc::new(MockFactory::new().dop_hint(4).latency(Duration::from_millis(5)));
    factory.push_step(ScriptStep::Throttle {
        retry_after: Duration::from_secs(2),
    });
    let executor = executor_over(factory.clone(), Some(4), AdaptiveRateConfig::default());

    let result = executor
        .execute(
            "account",
            Operation::Update,
            records(10),
            &BulkOperationOptions::default().batch_size(5),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(result.success_count, 10);
    assert_eq!(result.failure_count, 0);

    let stats = executor.stats();
    assert_eq!(stats.throttle_events, 1);
    assert_eq!(stats.batches_retried, 1);
    assert_eq!(stats.batches_dispatched, 2);

    let snapshot = &executor.rate_snapshots()[0];
    assert_eq!(snapshot.total_throttle_events, 1);
    // The throttle window outlives the run and shows up in pool stats.
    assert_eq!(
        executor.pool().stats().throttled_identities,
        vec!["primary".to_string()]
    );
}

#[tokio::test(start_paused = true)]
async fn exhausted_attempts_surface_throttled_record_errors() {
    let factory = Arc::new(MockFactory::new());
    factory.extend_script([
        ScriptStep::Throttle {
            retry_after: Duration::from_millis(100),
        },
        ScriptStep::Throttle {
            retry_after: Duration::from_millis(100),
        },
    ]);
    let executor = executor_over(factory, None, AdaptiveRateConfig::default());

    let result = executor
        .execute(
            "account",
            Operation::Update,
            records(5),
            &BulkOperationOptions::default().max_batch_attempts(2),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(result.success_count, 0);
    assert_eq!(result.failure_count, 5);
    assert!(result
        .errors
        .iter()
        .all(|error| error.kind == ErrorKind::Throttled));
}

#[tokio::test(start_paused = true)]
async fn fatal_batch_counts_as_failures_when_continuing() {
    let factory = Arc::new(MockFactory::new());
    factory.push_step(ScriptStep::Fatal {
        message: "payload rejected".to_string(),
    });
    let executor = executor_over(factory, None, AdaptiveRateConfig::default());

    let result = executor
        .execute(
            "account",
            Operation::Update,
            records(10),
            &BulkOperationOptions::default().batch_size(5),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(result.success_count, 5);
    assert_eq!(result.failure_count, 5);
    assert!(result
        .errors
        .iter()
        .all(|error| error.kind == ErrorKind::BatchFatal));
    assert_eq!(executor.stats().unclassified_errors, 0);
}

#[tokio::test(start_paused = true)]
async fn cancellation_returns_a_partial_result() {
    let factory = Arc::new(MockFactory::new().dop_hint(2).latency(Duration::from_secs(1)));
    let executor = executor_over(factory, Some(2), AdaptiveRateConfig::default());
    let cancel = CancellationToken::new();

    let canceller = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            cancel.cancel();
        })
    };

    let result = executor
        .execute(
            "account",
            Operation::Update,
            records(400),
            &BulkOperationOptions::default(),
            &cancel,
        )
        .await
        .unwrap();
    canceller.await.unwrap();

    assert!(result.cancelled);
    assert_eq!(result.success_count, 0);
    assert_eq!(result.failure_count, 0);
}

#[tokio::test(start_paused = true)]
async fn max_parallel_batches_caps_the_chunk_width() {
    let factory = Arc::new(MockFactory::new().dop_hint(8).latency(Duration::from_millis(5)));
    let executor = executor_over(factory.clone(), Some(8), fast_increase());

    let result = executor
        .execute(
            "account",
            Operation::Update,
            records(600),
            &BulkOperationOptions::default().max_parallel_batches(2),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(result.success_count, 600);
    assert_eq!(factory.executed(), 6);
    assert!(factory.peak_in_flight() <= 2);
}

#[tokio::test(start_paused = true)]
async fn rejects_invalid_options() {
    let factory = Arc::new(MockFactory::new());
    let executor = executor_over(factory, None, AdaptiveRateConfig::default());

    let err = executor
        .execute(
            "account",
            Operation::Update,
            records(10),
            &BulkOperationOptions::default().batch_size(0),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Configuration(_)));
}
