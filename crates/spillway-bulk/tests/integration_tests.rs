//! Full-stack scenarios: pool, tracker, rate controller, and executor
//! working together.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use url::Url;

use spillway_bulk::{AdaptiveRateController, BulkExecutor};
use spillway_core::{
    BulkOperationOptions, EnvironmentConfig, Error, IdentitySeed, Operation, PoolConfig,
};
use spillway_pool::testing::MockFactory;
use spillway_pool::{ConnectionPool, ThrottleTracker};

fn records(n: usize) -> Vec<serde_json::Value> {
    (0..n).map(|i| serde_json::json!({ "seq": i })).collect()
}

fn two_identity_executor(factory: Arc<MockFactory>) -> BulkExecutor {
    let environment = EnvironmentConfig {
        url: Url::parse("https://bulk.example.com/api").unwrap(),
        tenant_id: Some("tenant-1".to_string()),
        identities: vec![
            IdentitySeed {
                name: "app-east".to_string(),
                url: None,
                max_concurrent: Some(4),
                credential: serde_json::json!({ "client_id": "east" }),
            },
            IdentitySeed {
                name: "app-west".to_string(),
                url: None,
                max_concurrent: Some(4),
                credential: serde_json::json!({ "client_id": "west" }),
            },
        ],
    };
    let pool = ConnectionPool::new(
        environment.expand(),
        factory,
        PoolConfig::default(),
        Arc::new(ThrottleTracker::new()),
    )
    .unwrap();
    BulkExecutor::new(pool, Arc::new(AdaptiveRateController::default()))
}

#[tokio::test(start_paused = true)]
async fn work_flows_to_the_unthrottled_identity() {
    let factory = Arc::new(MockFactory::new().dop_hint(4));
    let executor = two_identity_executor(factory.clone());
    executor
        .pool()
        .throttle_tracker()
        .mark_throttled("app-east", Duration::from_secs(300));

    let result = executor
        .execute(
            "account",
            Operation::Update,
            records(300),
            &BulkOperationOptions::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(result.success_count, 300);
    assert_eq!(factory.creates_for("app-east"), 0);
    assert!(factory.creates_for("app-west") >= 1);
    assert_eq!(
        executor.pool().stats().throttled_identities,
        vec!["app-east".to_string()]
    );
}

#[tokio::test(start_paused = true)]
async fn snapshots_serialize_for_exposition() {
    let factory = Arc::new(MockFactory::new().dop_hint(4).latency(Duration::from_millis(10)));
    let executor = two_identity_executor(factory);

    executor
        .execute(
            "account",
            Operation::Update,
            records(200),
            &BulkOperationOptions::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    let pool_stats = serde_json::to_value(executor.pool().stats()).unwrap();
    assert_eq!(pool_stats["active"], 0);

    let rate = serde_json::to_value(executor.rate_snapshots()).unwrap();
    assert!(rate.as_array().is_some_and(|snapshots| !snapshots.is_empty()));

    let stats = serde_json::to_value(executor.stats()).unwrap();
    assert_eq!(stats["batches_dispatched"], 2);

    let latency = executor.latency_snapshot();
    assert_eq!(latency.samples, 2);
    assert!(latency.mean_ms >= 10);
    serde_json::to_value(latency).unwrap();
}

#[tokio::test(start_paused = true)]
async fn execute_after_drain_is_fatal() {
    let factory = Arc::new(MockFactory::new());
    let executor = two_identity_executor(factory);

    executor.pool().drain(Duration::from_secs(1)).await;
    let err = executor
        .execute(
            "account",
            Operation::Update,
            records(10),
            &BulkOperationOptions::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PoolDrained));
}

#[tokio::test(start_paused = true)]
async fn repeated_operations_share_adaptive_state() {
    let factory = Arc::new(MockFactory::new().dop_hint(8));
    let executor = two_identity_executor(factory);
    let options = BulkOperationOptions::default();
    let cancel = CancellationToken::new();

    for _ in 0..3 {
        let result = executor
            .execute("account", Operation::Update, records(100), &options, &cancel)
            .await
            .unwrap();
        assert_eq!(result.success_count, 100);
    }

    // One controller entry per identity that actually served traffic,
    // carried across operations.
    let snapshots = executor.rate_snapshots();
    assert!(!snapshots.is_empty());
    assert!(snapshots.iter().all(|snapshot| snapshot.max <= 8));
    assert_eq!(executor.stats().batches_dispatched, 3);
}
