//! Spillway demo
//!
//! Drives a bulk upsert through the full stack (pool, throttle tracker,
//! adaptive rate controller, executor) against the scripted mock factory,
//! with a couple of throttles injected so the AIMD behavior is visible in
//! the logs and final statistics.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use url::Url;

use spillway_bulk::{AdaptiveRateController, BulkExecutor};
use spillway_core::{
    AdaptiveRateConfig, BulkOperationOptions, ConnectionConfig, Operation, PoolConfig,
};
use spillway_pool::testing::{MockFactory, ScriptStep};
use spillway_pool::{ConnectionPool, ThrottleTracker};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,spillway_pool=debug,spillway_bulk=debug".into()),
        )
        .init();

    // A simulated server: DOP recommendation of 8 per identity, a little
    // latency per batch, and two throttles early in the run.
    let factory = Arc::new(
        MockFactory::new()
            .dop_hint(8)
            .latency(Duration::from_millis(25)),
    );
    factory.extend_script([
        ScriptStep::Success,
        ScriptStep::Throttle {
            retry_after: Duration::from_secs(2),
        },
        ScriptStep::Success,
        ScriptStep::Success,
        ScriptStep::Throttle {
            retry_after: Duration::from_secs(1),
        },
    ]);

    let identities = vec![
        ConnectionConfig::new("app-east", Url::parse("https://bulk.example.com/api")?),
        ConnectionConfig::new("app-west", Url::parse("https://bulk.example.com/api")?),
    ];
    let pool = ConnectionPool::new(
        identities,
        factory.clone(),
        PoolConfig::default(),
        Arc::new(ThrottleTracker::new()),
    )?;

    let rate = Arc::new(AdaptiveRateController::new(AdaptiveRateConfig::default()));
    let executor = BulkExecutor::new(pool, rate);

    let records: Vec<serde_json::Value> = (0..2_000)
        .map(|i| serde_json::json!({ "accountnumber": format!("ACCT-{i:05}"), "revenue": i * 100 }))
        .collect();

    let options = BulkOperationOptions::default()
        .batch_size(100)
        .tag("spillway-demo");
    let result = executor
        .execute(
            "account",
            Operation::Upsert,
            records,
            &options,
            &CancellationToken::new(),
        )
        .await?;

    tracing::info!(
        success = result.success_count,
        failed = result.failure_count,
        created = ?result.created_count,
        updated = ?result.updated_count,
        duration_ms = result.duration.as_millis() as u64,
        "bulk upsert finished"
    );

    println!("pool stats: {}", serde_json::to_string_pretty(&executor.pool().stats())?);
    println!(
        "adaptive state: {}",
        serde_json::to_string_pretty(&executor.rate_snapshots())?
    );
    println!(
        "executor stats: {}",
        serde_json::to_string_pretty(&executor.stats())?
    );

    executor.pool().drain(Duration::from_secs(5)).await;
    println!("batches executed by the simulated server: {}", factory.executed());

    Ok(())
}
