//! Batch latency tracking.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Latency buckets for the batch round-trip histogram
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LatencyBucket {
    /// 0-50ms
    Fast,
    /// 50-200ms
    Normal,
    /// 200ms-1s
    Slow,
    /// 1s-5s
    VerySlow,
    /// 5s+
    Glacial,
}

impl LatencyBucket {
    fn for_duration(latency: Duration) -> Self {
        let ms = latency.as_millis();
        match ms {
            0..=49 => Self::Fast,
            50..=199 => Self::Normal,
            200..=999 => Self::Slow,
            1_000..=4_999 => Self::VerySlow,
            _ => Self::Glacial,
        }
    }
}

#[derive(Debug, Default)]
struct HistogramState {
    buckets: HashMap<LatencyBucket, u64>,
    samples: Vec<u64>,
    total_ms: u64,
    min_ms: Option<u64>,
    max_ms: u64,
}

/// Batch latency percentiles, in milliseconds
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LatencyPercentiles {
    /// 50th percentile (median)
    pub p50: u64,
    /// 90th percentile
    pub p90: u64,
    /// 99th percentile
    pub p99: u64,
}

/// Snapshot of the batch latency distribution
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LatencySnapshot {
    /// Samples recorded
    pub samples: u64,

    /// Distribution over the fixed buckets
    pub distribution: HashMap<LatencyBucket, u64>,

    /// Mean latency in milliseconds
    pub mean_ms: u64,

    /// Fastest observed batch in milliseconds
    pub min_ms: u64,

    /// Slowest observed batch in milliseconds
    pub max_ms: u64,

    /// Percentile latencies
    pub percentiles: LatencyPercentiles,
}

/// Collects batch round-trip latencies into a bucketed histogram.
///
/// Shared by clone; recording takes a short write lock per sample.
#[derive(Debug, Clone, Default)]
pub struct LatencyHistogram {
    state: Arc<RwLock<HistogramState>>,
}

impl LatencyHistogram {
    /// Create an empty histogram
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one batch round trip
    pub fn record(&self, latency: Duration) {
        let ms = latency.as_millis() as u64;
        let mut state = self.state.write();
        *state
            .buckets
            .entry(LatencyBucket::for_duration(latency))
            .or_insert(0) += 1;
        state.samples.push(ms);
        state.total_ms += ms;
        state.min_ms = Some(state.min_ms.map_or(ms, |min| min.min(ms)));
        state.max_ms = state.max_ms.max(ms);
    }

    /// Snapshot the distribution and percentiles
    pub fn snapshot(&self) -> LatencySnapshot {
        let state = self.state.read();
        if state.samples.is_empty() {
            return LatencySnapshot::default();
        }

        let mut sorted = state.samples.clone();
        sorted.sort_unstable();
        let percentile = |p: f64| {
            let rank = ((sorted.len() as f64) * p).ceil() as usize;
            sorted[rank.clamp(1, sorted.len()) - 1]
        };

        LatencySnapshot {
            samples: sorted.len() as u64,
            distribution: state.buckets.clone(),
            mean_ms: state.total_ms / sorted.len() as u64,
            min_ms: state.min_ms.unwrap_or(0),
            max_ms: state.max_ms,
            percentiles: LatencyPercentiles {
                p50: percentile(0.50),
                p90: percentile(0.90),
                p99: percentile(0.99),
            },
        }
    }
}
