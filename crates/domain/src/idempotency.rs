//! Idempotency records and the payment event ledger.

use chrono::{DateTime, Utc};
use common::OrderId;
use serde::{Deserialize, Serialize};

/// Execution state of an idempotent request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyStatus {
    /// The first request with this key is still executing.
    InProgress,

    /// The handler finished; the stored response is replayed to retries.
    Completed,
}

impl IdempotencyStatus {
    /// Returns the status name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            IdempotencyStatus::InProgress => "in_progress",
            IdempotencyStatus::Completed => "completed",
        }
    }
}

impl std::fmt::Display for IdempotencyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One claimed (route, key) pair and, once completed, the response to replay.
///
/// Keys are scoped per route so the same client key cannot collide across
/// endpoints. Records are purged after a retention window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    /// The route the key is scoped to (e.g. `"checkout"`).
    pub route: String,

    /// The client-supplied idempotency key.
    pub key: String,

    /// Execution state.
    pub status: IdempotencyStatus,

    /// Snapshot of the response, present once completed.
    pub response: Option<serde_json::Value>,

    /// When the key was first claimed.
    pub created_at: DateTime<Utc>,

    /// When the handler finished.
    pub completed_at: Option<DateTime<Utc>>,
}

impl IdempotencyRecord {
    /// Creates a fresh in-progress claim.
    pub fn in_progress(route: impl Into<String>, key: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            route: route.into(),
            key: key.into(),
            status: IdempotencyStatus::InProgress,
            response: None,
            created_at: now,
            completed_at: None,
        }
    }
}

/// One processed payment-provider event.
///
/// The ledger is insert-once on `event_id`; a second delivery of the same
/// event is detected here and applied as a no-op.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentEventRecord {
    /// Provider-assigned event identifier.
    pub event_id: String,

    /// The order the event settled.
    pub order_id: OrderId,

    /// When the event was first processed.
    pub received_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_progress_claim_has_no_response() {
        let record = IdempotencyRecord::in_progress("checkout", "key-1", Utc::now());
        assert_eq!(record.status, IdempotencyStatus::InProgress);
        assert!(record.response.is_none());
        assert!(record.completed_at.is_none());
    }

    #[test]
    fn test_status_display() {
        assert_eq!(IdempotencyStatus::InProgress.to_string(), "in_progress");
        assert_eq!(IdempotencyStatus::Completed.to_string(), "completed");
    }
}
