//! The factory seam: authenticated channels and their producer.
//!
//! The pool never speaks the server's wire protocol. It consumes a
//! [`ChannelFactory`] that yields authenticated [`BulkChannel`]s together
//! with the server-recommended degree of parallelism for the identity.

use std::fmt;

use async_trait::async_trait;

use spillway_core::{BatchRequest, BatchResponse, ConnectionConfig, Result};

/// Options applied when the factory creates a new channel
#[derive(Debug, Clone, Default)]
pub struct ChannelOptions {
    /// Suppress server affinity cookies so consecutive channels land on
    /// different back-end nodes
    pub disable_affinity_cookie: bool,
}

/// An authenticated request channel for one identity.
///
/// Implementations populate `throttled`, `retry_after`, `dop_hint`, and the
/// per-record outcome list on every response.
#[async_trait]
pub trait BulkChannel: Send + Sync + fmt::Debug {
    /// Execute one batch against the server
    async fn execute(&self, request: &BatchRequest) -> Result<BatchResponse>;

    /// Close the underlying transport. Idempotent and infallible.
    fn close(&self);
}

/// Produces authenticated channels plus the server-recommended DOP.
#[async_trait]
pub trait ChannelFactory: Send + Sync + fmt::Debug {
    /// Create a channel for `config`. The returned integer is the degree of
    /// parallelism the server recommended in its first response.
    async fn create(
        &self,
        config: &ConnectionConfig,
        options: &ChannelOptions,
    ) -> Result<(std::sync::Arc<dyn BulkChannel>, u32)>;
}
