use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Pending,
    Applied,
    Failed,
}

/// Policy ids partitioned by the change each will receive on apply.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanDiff {
    pub create: Vec<String>,
    pub update: Vec<String>,
    pub delete: Vec<String>,
}

impl PlanDiff {
    pub fn is_empty(&self) -> bool {
        self.create.is_empty() && self.update.is_empty() && self.delete.is_empty()
    }
}

/// A policy-as-code change plan. Created by the differ, consumed exactly
/// once by apply; immutable afterwards except for the status transition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PacPlan {
    pub id: String,
    pub author: String,
    pub diff: PlanDiff,
    /// Versions of the updated/deleted policies at plan time; apply fails
    /// with a conflict if any drifted (optimistic concurrency).
    pub snapshot_versions: BTreeMap<String, i64>,
    pub dry_run: bool,
    pub status: PlanStatus,
    pub created_at: DateTime<Utc>,
    pub applied_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}
