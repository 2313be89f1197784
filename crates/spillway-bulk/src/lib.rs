//! # Spillway Bulk
//!
//! Parallel bulk-operation execution for rate-limited, multi-tenant HTTP
//! services: a per-identity AIMD parallelism governor, a dynamic-capacity
//! dispatch coordinator, and a chunked batch executor over the spillway
//! connection pool.
//!
//! ## Architecture
//!
//! ```text
//! BulkExecutor ── chunks ──▶ BatchCoordinator ── slots
//!      │                          │
//!      │ get_parallelism          │ capacity
//!      ▼                          ▼
//! AdaptiveRateController ◀── ConnectionPool (spillway-pool)
//!      ▲                          │
//!      └── success / throttle ◀───┘ per-batch outcomes
//! ```
//!
//! The executor asks the rate controller for each chunk's width, dispatches
//! the chunk's batches in parallel through pool-checked-out channels, and
//! feeds every outcome back: successes stabilize and then probe upward,
//! throttles cut multiplicatively and re-enqueue the batch.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//! use spillway_bulk::{AdaptiveRateController, BulkExecutor};
//! use spillway_core::{AdaptiveRateConfig, BulkOperationOptions, Operation};
//! use spillway_pool::ConnectionPool;
//!
//! # async fn example(pool: ConnectionPool) -> spillway_core::Result<()> {
//! let rate = Arc::new(AdaptiveRateController::new(AdaptiveRateConfig::default()));
//! let executor = BulkExecutor::new(pool, rate);
//!
//! let records = vec![serde_json::json!({ "name": "contoso" }); 1_000];
//! let result = executor
//!     .execute(
//!         "account",
//!         Operation::Create,
//!         records,
//!         &BulkOperationOptions::default(),
//!         &CancellationToken::new(),
//!     )
//!     .await?;
//! println!("created {} records", result.success_count);
//! # Ok(())
//! # }
//! ```

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    clippy::all
)]
#![deny(unsafe_code)]

pub mod coordinator;
pub mod executor;
pub mod metrics;
pub mod rate;
pub mod stats;

pub use coordinator::{BatchCoordinator, CapacitySource, CoordinatorPermit};
pub use executor::BulkExecutor;
pub use metrics::{LatencyHistogram, LatencySnapshot};
pub use rate::{AdaptiveRateController, RateSnapshot};
pub use stats::ExecutorStats;

// Re-export the lower layers so one import serves most callers.
pub use spillway_core::{
    AdaptiveRateConfig, BulkOperationOptions, BulkOperationResult, BypassCustomLogic,
    ConnectionConfig, Error, ErrorKind, Operation, PoolConfig, Result,
};
pub use spillway_pool::{ConnectionPool, PoolStats, ThrottleTracker};
