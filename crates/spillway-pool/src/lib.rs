//! # Spillway Pool
//!
//! Multi-identity connection pooling for the spillway bulk client, with
//! per-identity throttle tracking and pluggable checkout selection.
//!
//! ## Features
//!
//! - **Identity sub-pools**: each credential has its own idle set, active
//!   count, and capacity; quotas never bleed across identities
//! - **Throttle tracking**: lock-free per-identity throttle windows shared
//!   with selection and rate control
//! - **Pluggable selection**: round-robin, least-connections, and
//!   throttle-aware strategies
//! - **Lifetime management**: idle and lifetime eviction on release plus a
//!   background pulse, graceful drain on shutdown
//! - **DOP plumbing**: server parallelism recommendations recorded at
//!   channel creation and on response headers, forwarded to an observer
//!
//! ## Module Organization
//!
//! ```text
//! spillway-pool/
//! ├── throttle/   # Per-identity throttle windows
//! ├── strategy/   # Checkout selection strategies
//! ├── factory/    # ChannelFactory / BulkChannel seam
//! ├── channel/    # Checked-out channel handles
//! ├── pool/       # The pool itself
//! └── testing/    # Scripted mock factory (feature `test-utils`)
//! ```

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    clippy::all
)]
#![deny(unsafe_code)]

pub mod channel;
pub mod factory;
pub mod pool;
pub mod strategy;
pub mod throttle;

#[cfg(feature = "test-utils")]
pub mod testing;

pub use channel::PooledChannel;
pub use factory::{BulkChannel, ChannelFactory, ChannelOptions};
pub use pool::{ConnectionPool, DopObserver, PoolStats};
pub use strategy::{
    IdentityCandidate, LeastConnections, RoundRobin, SelectionStrategy, ThrottleAware,
};
pub use throttle::ThrottleTracker;
