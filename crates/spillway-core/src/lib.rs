//! # Spillway Core
//!
//! Shared abstractions for the spillway bulk-operation client: structured
//! errors, batch and result types, and the configuration records consumed
//! by the pool and executor crates.
//!
//! ## Architecture
//!
//! ```text
//! spillway-bulk       # rate controller, coordinator, bulk executor
//!        ↓
//! spillway-pool       # throttle tracker, selection, connection pool
//!        ↓
//! spillway-core       # errors, types, configuration (this crate)
//! ```

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    clippy::all
)]
#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod types;

pub use config::{
    AdaptiveRateConfig, BulkOperationOptions, BypassCustomLogic, ConnectionConfig,
    EnvironmentConfig, IdentitySeed, PoolConfig, PoolConfigBuilder, SelectionStrategyKind,
};
pub use error::{Error, ErrorKind, Result};
pub use types::{
    BatchRequest, BatchResponse, BatchResult, BulkOperationResult, IdentityName, Operation,
    RecordError, RecordOutcome, RequestFlags,
};
