//! Checked-out channel handles.

use std::sync::Arc;

use tokio::time::Instant;
use uuid::Uuid;

use spillway_core::{BatchRequest, BatchResponse, Result};

use crate::factory::BulkChannel;
use crate::pool::PoolShared;

/// A channel checked out of the pool by exactly one caller.
///
/// Dropping the handle returns the channel to its identity's sub-pool (or
/// closes it when the pool is draining or the channel outlived its
/// lifetime). Release happens on every path, including panics and
/// cancellation, and is idempotent.
#[derive(Debug)]
pub struct PooledChannel {
    identity_idx: usize,
    channel_id: Uuid,
    created_at: Instant,
    last_used_at: Instant,
    inner: Option<Arc<dyn BulkChannel>>,
    shared: Arc<PoolShared>,
}

impl PooledChannel {
    pub(crate) fn new(
        identity_idx: usize,
        channel_id: Uuid,
        created_at: Instant,
        inner: Arc<dyn BulkChannel>,
        shared: Arc<PoolShared>,
    ) -> Self {
        Self {
            identity_idx,
            channel_id,
            created_at,
            last_used_at: Instant::now(),
            inner: Some(inner),
            shared,
        }
    }

    /// Name of the identity this channel authenticates as
    pub fn identity(&self) -> &str {
        self.shared.identity_name(self.identity_idx)
    }

    /// Stable id of the underlying transport
    pub fn channel_id(&self) -> Uuid {
        self.channel_id
    }

    /// When the underlying transport was created
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// When this channel was last handed to a caller
    pub fn last_used_at(&self) -> Instant {
        self.last_used_at
    }

    /// Execute one batch on this channel.
    ///
    /// A `dop_hint` carried on the response is recorded with the pool (and
    /// forwarded to the rate controller) before the response is returned.
    pub async fn execute(&self, request: &BatchRequest) -> Result<BatchResponse> {
        let inner = self
            .inner
            .as_ref()
            .expect("inner channel present until release");
        let response = inner.execute(request).await?;
        if let Some(hint) = response.dop_hint {
            self.shared.note_dop_hint_idx(self.identity_idx, hint);
        }
        Ok(response)
    }

    /// Return the channel to the pool. Equivalent to dropping the handle.
    pub fn release(self) {}
}

impl Drop for PooledChannel {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            self.shared
                .release_channel(self.identity_idx, inner, self.channel_id, self.created_at);
        }
    }
}
