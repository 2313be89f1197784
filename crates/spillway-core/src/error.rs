//! Structured error types shared across the spillway crates.

use std::time::Duration;

use thiserror::Error;

use crate::types::{BulkOperationResult, IdentityName};

/// Result type for spillway operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the pool, coordinator, and bulk executor
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// The pool could not produce a channel within the acquire timeout
    #[error("timed out acquiring a channel for identity {identity} after {timeout:?}")]
    AcquireTimeout {
        /// Identity the acquire was waiting on
        identity: IdentityName,
        /// Configured acquire timeout
        timeout: Duration,
    },

    /// No dispatch slot became available within the coordinator timeout
    #[error("no dispatch slot available: {available} of {capacity} free after {timeout:?}")]
    CoordinatorExhausted {
        /// Slots free at the moment the wait gave up
        available: usize,
        /// Coordinator capacity at the moment the wait gave up
        capacity: usize,
        /// How long the caller waited
        timeout: Duration,
    },

    /// The server signalled a request-protection throttle
    #[error("identity {identity} throttled by server, retry after {retry_after:?}")]
    Throttled {
        /// Identity the server throttled
        identity: IdentityName,
        /// Server-advertised retry-after window
        retry_after: Duration,
    },

    /// Whole-batch failure that was not a throttle
    #[error("batch failed: {0}")]
    BatchFatal(String),

    /// Cancellation was signalled
    #[error("operation cancelled")]
    Cancelled,

    /// Channel creation failed; the identity itself remains usable
    #[error("channel creation failed for identity {identity}: {message}")]
    FactoryFailure {
        /// Identity the factory was creating a channel for
        identity: IdentityName,
        /// Factory-reported failure description
        message: String,
    },

    /// Acquire attempted after the pool was drained
    #[error("pool is drained")]
    PoolDrained,

    /// The bulk operation halted early with `continue_on_error` disabled
    #[error("bulk operation aborted with {} failures", result.failure_count)]
    Aborted {
        /// Results accumulated up to the abort
        result: Box<BulkOperationResult>,
    },

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Configuration(String),
}

/// Error classification for programmatic handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Pool acquire timed out
    AcquireTimeout,
    /// Coordinator had no free slot
    CoordinatorExhausted,
    /// Server-signalled throttle
    Throttled,
    /// Per-record failure reported by the server
    RecordFailure,
    /// Whole-batch non-throttle failure
    BatchFatal,
    /// Operation was cancelled
    Cancelled,
    /// Channel creation failed
    FactoryFailure,
    /// Pool was already drained
    PoolDrained,
    /// Operation aborted early
    Aborted,
    /// Invalid configuration
    Configuration,
}

impl Error {
    /// Classify this error for statistics and per-record reporting
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AcquireTimeout { .. } => ErrorKind::AcquireTimeout,
            Self::CoordinatorExhausted { .. } => ErrorKind::CoordinatorExhausted,
            Self::Throttled { .. } => ErrorKind::Throttled,
            Self::BatchFatal(_) => ErrorKind::BatchFatal,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::FactoryFailure { .. } => ErrorKind::FactoryFailure,
            Self::PoolDrained => ErrorKind::PoolDrained,
            Self::Aborted { .. } => ErrorKind::Aborted,
            Self::Configuration(_) => ErrorKind::Configuration,
        }
    }

    /// Whether the failed work can be re-attempted later without change
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::AcquireTimeout { .. } | Self::CoordinatorExhausted { .. } | Self::Throttled { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_matches_variant() {
        let err = Error::AcquireTimeout {
            identity: "primary".to_string(),
            timeout: Duration::from_secs(30),
        };
        assert_eq!(err.kind(), ErrorKind::AcquireTimeout);
        assert!(err.is_transient());

        assert_eq!(Error::PoolDrained.kind(), ErrorKind::PoolDrained);
        assert!(!Error::PoolDrained.is_transient());
    }

    #[test]
    fn coordinator_exhausted_names_diagnostics() {
        let err = Error::CoordinatorExhausted {
            available: 0,
            capacity: 8,
            timeout: Duration::from_secs(5),
        };
        let text = err.to_string();
        assert!(text.contains("0 of 8"));
        assert!(text.contains("5s"));
    }
}
