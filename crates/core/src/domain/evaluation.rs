use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::action::Action;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModifiedAction {
    pub before: Action,
    pub after: Action,
    pub policy_id: Option<String>,
    pub reasons: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BlockedAction {
    pub action: Action,
    pub policy_id: Option<String>,
    pub reason: String,
    /// Set when the block came from an internal fault (fail-closed path)
    /// rather than an explicit guard or gate decision.
    pub error: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PendingAction {
    pub action: Action,
    pub policy_id: Option<String>,
    pub reasons: Vec<String>,
    pub risk_cost: Decimal,
}

/// Partitioned outcome of one evaluation call. Every input action lands in
/// exactly one partition.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub allowed: Vec<Action>,
    pub modified: Vec<ModifiedAction>,
    pub blocked: Vec<BlockedAction>,
    pub pending: Vec<PendingAction>,
    /// Sum of all soft-guard contributions across the batch.
    pub risk_cost: Decimal,
    /// Hard-guard findings recorded under monitor mode; advisory only.
    pub monitor_findings: Vec<String>,
}

impl EvaluationResult {
    pub fn total(&self) -> usize {
        self.allowed.len() + self.modified.len() + self.blocked.len() + self.pending.len()
    }

    pub fn verdict(&self) -> RunVerdict {
        let buckets = [
            (!self.allowed.is_empty(), RunVerdict::Allowed),
            (!self.modified.is_empty(), RunVerdict::Modified),
            (!self.blocked.is_empty(), RunVerdict::Blocked),
            (!self.pending.is_empty(), RunVerdict::Mixed),
        ];
        let mut populated = buckets.iter().filter(|(present, _)| *present);
        match (populated.next(), populated.next()) {
            (Some((_, single)), None) => *single,
            (None, _) => RunVerdict::Allowed,
            _ => RunVerdict::Mixed,
        }
    }

    pub fn stats(&self) -> EvaluationStats {
        EvaluationStats {
            allowed: self.allowed.len() as u32,
            modified: self.modified.len() as u32,
            blocked: self.blocked.len() as u32,
            pending: self.pending.len() as u32,
        }
    }
}

/// Aggregate verdict stored on the audit record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunVerdict {
    Allowed,
    Modified,
    Blocked,
    Mixed,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationStats {
    pub allowed: u32,
    pub modified: u32,
    pub blocked: u32,
    pub pending: u32,
}

/// Append-only audit record summarizing one evaluation run. Never updated
/// or deleted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub id: String,
    /// Most specific policy that acted on any action in the batch; `None`
    /// when no policy matched.
    pub policy_id: Option<String>,
    pub algo_key: String,
    pub run_id: String,
    pub result: RunVerdict,
    pub stats: EvaluationStats,
    /// Risk accrued by soft guards across the batch.
    pub risk_cost: Decimal,
    /// Before/after pairs for modified actions, JSON-shaped for storage.
    pub diff: Vec<ModifiedAction>,
    pub created_at: DateTime<Utc>,
    pub tenant_id: Option<String>,
}
