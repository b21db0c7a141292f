use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::approval::{Approval, ApprovalStatus};
use crate::domain::evaluation::Evaluation;
use crate::domain::plan::{PacPlan, PlanStatus};
use crate::domain::policy::Policy;
use crate::domain::rollout::{Rollout, RolloutState};
use crate::errors::GovernanceError;

/// A consistent read of the policy set. Every evaluation call works from a
/// single snapshot so a concurrent PaC apply can never partially affect an
/// in-flight batch.
#[derive(Clone, Debug, PartialEq)]
pub struct PolicySnapshot {
    pub policies: Vec<Policy>,
    pub taken_at: DateTime<Utc>,
}

#[async_trait]
pub trait PolicyStore: Send + Sync {
    async fn snapshot(&self) -> Result<PolicySnapshot, GovernanceError>;
    async fn get(&self, id: &str) -> Result<Option<Policy>, GovernanceError>;
    /// Direct administrative write; the caller is responsible for the
    /// version it supplies.
    async fn upsert(&self, policy: Policy) -> Result<(), GovernanceError>;
    /// Rollout-percent write used by the rollout controller. Bumps the
    /// policy version and returns the updated record.
    async fn set_rollout_percent(
        &self,
        policy_id: &str,
        percent: u8,
        updated_by: &str,
    ) -> Result<Policy, GovernanceError>;
    /// Executes a whole plan atomically: creates, updates (version-checked
    /// against `plan.snapshot_versions`), deletes. Any version drift fails
    /// the entire operation with `Conflict` and leaves the store untouched.
    async fn apply_plan(
        &self,
        plan: &PacPlan,
        creates: &[Policy],
        updates: &[Policy],
    ) -> Result<(), GovernanceError>;
}

/// Outcome of the atomic pending-approval insert.
#[derive(Clone, Debug, PartialEq)]
pub enum PendingInsert {
    Created(Approval),
    /// A pending approval with the same ctx_hash already existed; the
    /// original is returned unchanged.
    Existing(Approval),
}

impl PendingInsert {
    pub fn into_approval(self) -> Approval {
        match self {
            Self::Created(approval) | Self::Existing(approval) => approval,
        }
    }
}

#[async_trait]
pub trait ApprovalStore: Send + Sync {
    /// Linearizable "insert if no pending row with this ctx_hash". Never
    /// implemented as a read followed by a write.
    async fn insert_pending(&self, approval: Approval) -> Result<PendingInsert, GovernanceError>;
    async fn get(&self, id: &str) -> Result<Option<Approval>, GovernanceError>;
    async fn latest_by_ctx_hash(&self, ctx_hash: &str)
        -> Result<Option<Approval>, GovernanceError>;
    /// Atomic pending→decided transition. `NotFound` for unknown ids,
    /// `InvalidState` when the approval already left pending.
    async fn decide(
        &self,
        id: &str,
        status: ApprovalStatus,
        decided_by: &str,
        note: Option<String>,
        decided_at: DateTime<Utc>,
    ) -> Result<Approval, GovernanceError>;
    async fn list_pending(&self, limit: u32) -> Result<Vec<Approval>, GovernanceError>;
}

#[async_trait]
pub trait RolloutStore: Send + Sync {
    /// Fails with `Conflict` if the policy already has an active rollout.
    async fn insert(&self, rollout: &Rollout) -> Result<(), GovernanceError>;
    async fn get(&self, id: &str) -> Result<Option<Rollout>, GovernanceError>;
    async fn active_for_policy(&self, policy_id: &str)
        -> Result<Option<Rollout>, GovernanceError>;
    /// Compare-and-swap on rollout state. Returns `false` (without error)
    /// when the rollout is no longer in `from`, so racing monitors and
    /// manual rollbacks cannot double-apply. Activating fails with
    /// `Conflict` while another rollout for the same policy is active.
    async fn transition(
        &self,
        id: &str,
        from: RolloutState,
        to: RolloutState,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<bool, GovernanceError>;
}

#[async_trait]
pub trait EvaluationStore: Send + Sync {
    /// Append-only; evaluations are never updated or deleted.
    async fn append(&self, evaluation: &Evaluation) -> Result<(), GovernanceError>;
    async fn for_run(&self, run_id: &str) -> Result<Vec<Evaluation>, GovernanceError>;
}

#[async_trait]
pub trait PlanStore: Send + Sync {
    async fn insert(&self, plan: &PacPlan) -> Result<(), GovernanceError>;
    async fn get(&self, id: &str) -> Result<Option<PacPlan>, GovernanceError>;
    /// Atomic pending→{applied,failed} transition; a plan is consumed
    /// exactly once.
    async fn mark(
        &self,
        id: &str,
        status: PlanStatus,
        applied_at: Option<DateTime<Utc>>,
        error_message: Option<String>,
    ) -> Result<(), GovernanceError>;
}

#[derive(Default)]
struct MemoryInner {
    policies: BTreeMap<String, Policy>,
    approvals: BTreeMap<String, Approval>,
    rollouts: BTreeMap<String, Rollout>,
    evaluations: Vec<Evaluation>,
    plans: BTreeMap<String, PacPlan>,
}

/// In-memory store implementing every governance store trait behind one
/// mutex, which makes the dedup/CAS operations trivially linearizable.
/// Used by core unit tests and by embedders that do not need persistence.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl PolicyStore for MemoryStore {
    async fn snapshot(&self) -> Result<PolicySnapshot, GovernanceError> {
        let inner = self.lock();
        Ok(PolicySnapshot { policies: inner.policies.values().cloned().collect(), taken_at: Utc::now() })
    }

    async fn get(&self, id: &str) -> Result<Option<Policy>, GovernanceError> {
        Ok(self.lock().policies.get(id).cloned())
    }

    async fn upsert(&self, policy: Policy) -> Result<(), GovernanceError> {
        self.lock().policies.insert(policy.id.clone(), policy);
        Ok(())
    }

    async fn set_rollout_percent(
        &self,
        policy_id: &str,
        percent: u8,
        updated_by: &str,
    ) -> Result<Policy, GovernanceError> {
        let mut inner = self.lock();
        let policy = inner
            .policies
            .get_mut(policy_id)
            .ok_or_else(|| GovernanceError::not_found("policy", policy_id))?;
        policy.rollout_percent = percent;
        policy.version += 1;
        policy.updated_by = updated_by.to_string();
        policy.updated_at = Utc::now();
        Ok(policy.clone())
    }

    async fn apply_plan(
        &self,
        plan: &PacPlan,
        creates: &[Policy],
        updates: &[Policy],
    ) -> Result<(), GovernanceError> {
        let mut inner = self.lock();

        // Validate every version expectation before touching anything so the
        // apply is all-or-nothing.
        for id in plan.diff.update.iter().chain(plan.diff.delete.iter()) {
            let expected = plan.snapshot_versions.get(id).copied().ok_or_else(|| {
                GovernanceError::conflict(format!("policy {id}"), "missing snapshot version")
            })?;
            let current = inner
                .policies
                .get(id)
                .map(|policy| policy.version)
                .ok_or_else(|| GovernanceError::not_found("policy", id.clone()))?;
            if current != expected {
                return Err(GovernanceError::conflict(
                    format!("policy {id}"),
                    format!("version {expected} expected, found {current}"),
                ));
            }
        }
        for policy in creates {
            if inner.policies.contains_key(&policy.id) {
                return Err(GovernanceError::conflict(
                    format!("policy {}", policy.id),
                    "already exists",
                ));
            }
        }

        let now = Utc::now();
        for policy in creates {
            let mut created = policy.clone();
            created.version = 1;
            created.created_at = now;
            created.updated_at = now;
            inner.policies.insert(created.id.clone(), created);
        }
        for policy in updates {
            let expected = plan.snapshot_versions.get(&policy.id).copied().unwrap_or(0);
            let mut updated = policy.clone();
            updated.version = expected + 1;
            updated.updated_at = now;
            inner.policies.insert(updated.id.clone(), updated);
        }
        for id in &plan.diff.delete {
            inner.policies.remove(id);
        }
        Ok(())
    }
}

#[async_trait]
impl ApprovalStore for MemoryStore {
    async fn insert_pending(&self, approval: Approval) -> Result<PendingInsert, GovernanceError> {
        let mut inner = self.lock();
        let existing = inner
            .approvals
            .values()
            .find(|row| row.ctx_hash == approval.ctx_hash && row.status == ApprovalStatus::Pending)
            .cloned();
        if let Some(existing) = existing {
            return Ok(PendingInsert::Existing(existing));
        }
        inner.approvals.insert(approval.id.clone(), approval.clone());
        Ok(PendingInsert::Created(approval))
    }

    async fn get(&self, id: &str) -> Result<Option<Approval>, GovernanceError> {
        Ok(self.lock().approvals.get(id).cloned())
    }

    async fn latest_by_ctx_hash(
        &self,
        ctx_hash: &str,
    ) -> Result<Option<Approval>, GovernanceError> {
        Ok(self
            .lock()
            .approvals
            .values()
            .filter(|row| row.ctx_hash == ctx_hash)
            .max_by_key(|row| row.created_at)
            .cloned())
    }

    async fn decide(
        &self,
        id: &str,
        status: ApprovalStatus,
        decided_by: &str,
        note: Option<String>,
        decided_at: DateTime<Utc>,
    ) -> Result<Approval, GovernanceError> {
        let mut inner = self.lock();
        let approval = inner
            .approvals
            .get_mut(id)
            .ok_or_else(|| GovernanceError::not_found("approval", id))?;
        if approval.status.is_terminal() {
            return Err(GovernanceError::invalid_state(
                "approval",
                id,
                format!("{:?}", approval.status),
            ));
        }
        approval.status = status;
        approval.decided_by = Some(decided_by.to_string());
        approval.decided_at = Some(decided_at);
        approval.note = note;
        Ok(approval.clone())
    }

    async fn list_pending(&self, limit: u32) -> Result<Vec<Approval>, GovernanceError> {
        let inner = self.lock();
        let mut pending: Vec<Approval> = inner
            .approvals
            .values()
            .filter(|row| row.status == ApprovalStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by(|left, right| left.created_at.cmp(&right.created_at));
        pending.truncate(limit as usize);
        Ok(pending)
    }
}

#[async_trait]
impl RolloutStore for MemoryStore {
    async fn insert(&self, rollout: &Rollout) -> Result<(), GovernanceError> {
        let mut inner = self.lock();
        let active_exists = inner
            .rollouts
            .values()
            .any(|row| row.policy_id == rollout.policy_id && row.state == RolloutState::Active);
        if active_exists && rollout.state == RolloutState::Active {
            return Err(GovernanceError::conflict(
                format!("rollout for policy {}", rollout.policy_id),
                "an active rollout already exists",
            ));
        }
        inner.rollouts.insert(rollout.id.clone(), rollout.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Rollout>, GovernanceError> {
        Ok(self.lock().rollouts.get(id).cloned())
    }

    async fn active_for_policy(
        &self,
        policy_id: &str,
    ) -> Result<Option<Rollout>, GovernanceError> {
        Ok(self
            .lock()
            .rollouts
            .values()
            .find(|row| row.policy_id == policy_id && row.state == RolloutState::Active)
            .cloned())
    }

    async fn transition(
        &self,
        id: &str,
        from: RolloutState,
        to: RolloutState,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<bool, GovernanceError> {
        let mut inner = self.lock();
        let policy_id = {
            let rollout = inner
                .rollouts
                .get(id)
                .ok_or_else(|| GovernanceError::not_found("rollout", id))?;
            if rollout.state != from {
                return Ok(false);
            }
            rollout.policy_id.clone()
        };
        if to == RolloutState::Active {
            let other_active = inner.rollouts.values().any(|row| {
                row.id != id && row.policy_id == policy_id && row.state == RolloutState::Active
            });
            if other_active {
                return Err(GovernanceError::conflict(
                    format!("rollout for policy {policy_id}"),
                    "an active rollout already exists",
                ));
            }
        }
        if let Some(rollout) = inner.rollouts.get_mut(id) {
            rollout.state = to;
            rollout.completed_at = completed_at;
        }
        Ok(true)
    }
}

#[async_trait]
impl EvaluationStore for MemoryStore {
    async fn append(&self, evaluation: &Evaluation) -> Result<(), GovernanceError> {
        self.lock().evaluations.push(evaluation.clone());
        Ok(())
    }

    async fn for_run(&self, run_id: &str) -> Result<Vec<Evaluation>, GovernanceError> {
        Ok(self
            .lock()
            .evaluations
            .iter()
            .filter(|row| row.run_id == run_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl PlanStore for MemoryStore {
    async fn insert(&self, plan: &PacPlan) -> Result<(), GovernanceError> {
        self.lock().plans.insert(plan.id.clone(), plan.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<PacPlan>, GovernanceError> {
        Ok(self.lock().plans.get(id).cloned())
    }

    async fn mark(
        &self,
        id: &str,
        status: PlanStatus,
        applied_at: Option<DateTime<Utc>>,
        error_message: Option<String>,
    ) -> Result<(), GovernanceError> {
        let mut inner = self.lock();
        let plan =
            inner.plans.get_mut(id).ok_or_else(|| GovernanceError::not_found("plan", id))?;
        if plan.status != PlanStatus::Pending {
            return Err(GovernanceError::invalid_state("plan", id, format!("{:?}", plan.status)));
        }
        plan.status = status;
        plan.applied_at = applied_at;
        plan.error_message = error_message;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use rust_decimal::Decimal;

    use super::{MemoryStore, RolloutStore};
    use crate::domain::rollout::{AutoRollbackRule, Comparator, Rollout, RolloutState};
    use crate::errors::GovernanceError;

    fn staged_rollout(id: &str, policy_id: &str) -> Rollout {
        Rollout {
            id: id.to_string(),
            policy_id: policy_id.to_string(),
            from_percent: 10,
            to_percent: 50,
            state: RolloutState::Pending,
            reason: "widen canary".to_string(),
            auto_rollback_rule: AutoRollbackRule {
                metric: "error_rate".to_string(),
                comparator: Comparator::Gt,
                threshold: Decimal::new(5, 2),
                window: std::time::Duration::from_secs(300),
            },
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    #[tokio::test]
    async fn second_staged_rollout_cannot_activate_alongside_the_first() {
        let store = MemoryStore::new();
        store.insert(&staged_rollout("ro-1", "p-1")).await.expect("insert first");
        store.insert(&staged_rollout("ro-2", "p-1")).await.expect("insert second");

        let activated = store
            .transition("ro-1", RolloutState::Pending, RolloutState::Active, None)
            .await
            .expect("first activation");
        assert!(activated);

        let err = store
            .transition("ro-2", RolloutState::Pending, RolloutState::Active, None)
            .await
            .expect_err("second activation must conflict");
        assert!(matches!(err, GovernanceError::Conflict { .. }));

        // The losing rollout is untouched and can activate once the winner
        // leaves active.
        let second = store.get("ro-2").await.expect("get").expect("ro-2");
        assert_eq!(second.state, RolloutState::Pending);
        let completed = store
            .transition("ro-1", RolloutState::Active, RolloutState::Completed, Some(Utc::now()))
            .await
            .expect("complete");
        assert!(completed);
        let activated = store
            .transition("ro-2", RolloutState::Pending, RolloutState::Active, None)
            .await
            .expect("second activation after completion");
        assert!(activated);
    }

    #[tokio::test]
    async fn activation_on_another_policy_is_unaffected() {
        let store = MemoryStore::new();
        store.insert(&staged_rollout("ro-1", "p-1")).await.expect("insert");
        store.insert(&staged_rollout("ro-2", "p-2")).await.expect("insert");

        assert!(store
            .transition("ro-1", RolloutState::Pending, RolloutState::Active, None)
            .await
            .expect("activate p-1"));
        assert!(store
            .transition("ro-2", RolloutState::Pending, RolloutState::Active, None)
            .await
            .expect("activate p-2"));
    }

    #[tokio::test]
    async fn lost_state_race_returns_false_without_error() {
        let store = MemoryStore::new();
        store.insert(&staged_rollout("ro-1", "p-1")).await.expect("insert");
        assert!(store
            .transition("ro-1", RolloutState::Pending, RolloutState::Active, None)
            .await
            .expect("activate"));

        let stale = store
            .transition("ro-1", RolloutState::Pending, RolloutState::Active, None)
            .await
            .expect("stale CAS");
        assert!(!stale);
    }
}
