use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutState {
    Pending,
    Active,
    Completed,
    RolledBack,
}

impl RolloutState {
    /// Legal transitions: pending→active, active→completed,
    /// active→rolled_back. Everything else is rejected.
    pub fn can_transition_to(self, next: RolloutState) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Active)
                | (Self::Active, Self::Completed)
                | (Self::Active, Self::RolledBack)
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparator {
    Gt,
    Ge,
    Lt,
    Le,
}

impl Comparator {
    pub fn breached(self, observed: Decimal, threshold: Decimal) -> bool {
        match self {
            Self::Gt => observed > threshold,
            Self::Ge => observed >= threshold,
            Self::Lt => observed < threshold,
            Self::Le => observed <= threshold,
        }
    }
}

/// Breach condition evaluated by the rollout monitor against the external
/// metrics feed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AutoRollbackRule {
    pub metric: String,
    pub comparator: Comparator,
    pub threshold: Decimal,
    pub window: Duration,
}

/// A staged activation of a policy's rollout percentage, monitored for
/// automatic rollback. Exactly one rollout may be active per policy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Rollout {
    pub id: String,
    pub policy_id: String,
    pub from_percent: u8,
    pub to_percent: u8,
    pub state: RolloutState,
    pub reason: String,
    pub auto_rollback_rule: AutoRollbackRule,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}
