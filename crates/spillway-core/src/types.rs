//! Batch, record, and result types exchanged between the executor and the
//! channel factory seam.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::BypassCustomLogic;
use crate::error::ErrorKind;

/// Name of an identity (a distinct credential/quota pair)
pub type IdentityName = String;

/// Bulk operation tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// Create new records
    Create,
    /// Update existing records
    Update,
    /// Create-or-update records
    Upsert,
    /// Delete records
    Delete,
}

/// Per-request flags forwarded opaquely to the underlying channel
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestFlags {
    /// Which classes of server-side custom logic to bypass
    pub bypass_custom_logic: BypassCustomLogic,

    /// Skip Power-Automate-style flow triggers
    pub bypass_power_automate_flows: bool,

    /// Skip server duplicate detection
    pub suppress_duplicate_detection: bool,

    /// Free-form correlation tag attached to every request
    pub tag: Option<String>,
}

/// One batch of records handed to a channel for execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRequest {
    /// Logical entity type the records belong to
    pub entity: String,

    /// Operation applied to every record in the batch
    pub operation: Operation,

    /// Ordered record payloads (opaque to the core)
    pub records: Vec<serde_json::Value>,

    /// Opaque per-request flags
    pub flags: RequestFlags,
}

/// Per-record outcome reported by the server, aligned with the request order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum RecordOutcome {
    /// Record was created
    Created {
        /// Server-assigned id of the new record
        id: Uuid,
    },
    /// Record was updated in place
    Updated,
    /// Record was deleted
    Deleted,
    /// Record failed
    Failed {
        /// Server-reported failure description
        message: String,
    },
}

/// Response produced by executing one batch
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchResponse {
    /// Per-record outcomes, aligned with the request's record order.
    /// Empty when the whole batch was rejected by a throttle.
    pub outcomes: Vec<RecordOutcome>,

    /// Whether the server signalled a request-protection throttle
    pub throttled: bool,

    /// Server-advertised retry-after window, present on throttle
    pub retry_after: Option<Duration>,

    /// Updated degree-of-parallelism recommendation, when a response
    /// header carried one
    pub dop_hint: Option<u32>,
}

/// A failed record, addressed by its index in the caller's input sequence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordError {
    /// Index into the original input sequence
    pub index: usize,

    /// Failure classification
    pub kind: ErrorKind,

    /// Human-readable failure description
    pub message: String,
}

/// Outcome of one dispatched batch, after classification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResult {
    /// Identity whose channel served the batch
    pub identity: IdentityName,

    /// Records that succeeded
    pub success_count: usize,

    /// Records that failed
    pub failure_count: usize,

    /// Per-record failures, indices relative to the caller's input
    pub errors: Vec<RecordError>,

    /// Whether the server throttled the batch
    pub throttled: bool,

    /// Retry-after window advertised with the throttle
    pub retry_after: Option<Duration>,

    /// `(input index, id)` pairs for created records
    pub created_ids: Vec<(usize, Uuid)>,

    /// Records the server reports as created (upserts)
    pub created_count: Option<usize>,

    /// Records the server reports as updated (upserts)
    pub updated_count: Option<usize>,
}

/// Aggregate result of a bulk operation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BulkOperationResult {
    /// Records that succeeded
    pub success_count: usize,

    /// Records that failed
    pub failure_count: usize,

    /// Per-record failures, indices relative to the caller's input
    pub errors: Vec<RecordError>,

    /// Wall-clock duration of the operation
    pub duration: Duration,

    /// Ids of created records in input order (creates only)
    pub created_ids: Option<Vec<Uuid>>,

    /// Total records created (upserts only)
    pub created_count: Option<usize>,

    /// Total records updated (upserts only)
    pub updated_count: Option<usize>,

    /// Whether the operation was cut short by cancellation
    pub cancelled: bool,
}

impl BulkOperationResult {
    /// Total records accounted for, successful or failed
    pub fn total_processed(&self) -> usize {
        self.success_count + self.failure_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Operation::Upsert).unwrap(), "\"upsert\"");
        let op: Operation = serde_json::from_str("\"delete\"").unwrap();
        assert_eq!(op, Operation::Delete);
    }

    #[test]
    fn record_outcome_tagged_encoding() {
        let outcome = RecordOutcome::Created { id: Uuid::nil() };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["outcome"], "created");
    }

    #[test]
    fn result_totals() {
        let result = BulkOperationResult {
            success_count: 98,
            failure_count: 2,
            ..Default::default()
        };
        assert_eq!(result.total_processed(), 100);
    }
}
