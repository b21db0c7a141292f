use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::action::Action;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

impl ApprovalStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// A human-approval escalation. Immutable once decided; at most one pending
/// approval may exist per `ctx_hash`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Approval {
    pub id: String,
    pub algo_key: String,
    pub run_id: String,
    pub reason: String,
    pub risk_cost: Decimal,
    /// Snapshot of the escalated actions at request time.
    pub actions: Vec<Action>,
    /// Deterministic fingerprint of algo_key + canonicalized actions, used
    /// for idempotent dedup of duplicate requests.
    pub ctx_hash: String,
    pub status: ApprovalStatus,
    pub requested_by: String,
    pub decided_by: Option<String>,
    pub decided_at: Option<DateTime<Utc>>,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::ApprovalStatus;

    #[test]
    fn only_pending_is_not_terminal() {
        assert!(!ApprovalStatus::Pending.is_terminal());
        assert!(ApprovalStatus::Approved.is_terminal());
        assert!(ApprovalStatus::Rejected.is_terminal());
    }
}
