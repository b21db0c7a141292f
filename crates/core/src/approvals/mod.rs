use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::domain::action::Action;
use crate::domain::approval::{Approval, ApprovalStatus};
use crate::errors::GovernanceError;
use crate::notify::{EventKind, EventSeverity, GovernanceEvent, NotificationSink};
use crate::store::{ApprovalStore, PendingInsert};

/// Canonical fingerprint of an escalated batch: algo_key plus the escalated
/// actions in (action_type, target_id) order. Action parameters live in
/// ordered maps, so serialization is already canonical.
pub fn ctx_hash(algo_key: &str, actions: &[Action]) -> Result<String, GovernanceError> {
    let mut sorted: Vec<&Action> = actions.iter().collect();
    sorted.sort_by(|left, right| {
        (&left.action_type, &left.target_id).cmp(&(&right.action_type, &right.target_id))
    });
    let bytes = serde_json::to_vec(&sorted).map_err(|err| {
        GovernanceError::Validation(format!("action batch is not serializable: {err}"))
    })?;

    let mut hasher = blake3::Hasher::new();
    hasher.update(algo_key.as_bytes());
    hasher.update(&[0]);
    hasher.update(&bytes);
    Ok(hasher.finalize().to_hex().to_string())
}

#[derive(Clone, Debug)]
pub struct ApprovalRequestInput {
    pub algo_key: String,
    pub run_id: String,
    pub actions: Vec<Action>,
    pub risk_cost: Decimal,
    pub reason: String,
    pub requested_by: String,
}

/// Human-in-the-loop workflow over escalated actions. Creation dedupes on
/// ctx_hash so a retried run cannot fan out duplicate requests; decisions
/// are single-shot pending-to-terminal transitions enforced by the store.
pub struct ApprovalWorkflow {
    store: Arc<dyn ApprovalStore>,
    sink: Arc<dyn NotificationSink>,
}

impl ApprovalWorkflow {
    pub fn new(store: Arc<dyn ApprovalStore>, sink: Arc<dyn NotificationSink>) -> Self {
        Self { store, sink }
    }

    /// Opens an approval for an escalated batch, or surfaces the prior one
    /// when an identical context was already pending or already rejected.
    /// Only an approved prior decision allows a fresh request through.
    pub async fn request(
        &self,
        input: ApprovalRequestInput,
    ) -> Result<Approval, GovernanceError> {
        let hash = ctx_hash(&input.algo_key, &input.actions)?;

        if let Some(previous) = self.store.latest_by_ctx_hash(&hash).await? {
            if previous.status == ApprovalStatus::Rejected {
                info!(
                    event_name = "approvals.request_deduped",
                    approval_id = %previous.id,
                    ctx_hash = %hash,
                    "identical context was already rejected; surfacing prior decision"
                );
                return Ok(previous);
            }
        }

        let approval = Approval {
            id: Uuid::new_v4().to_string(),
            algo_key: input.algo_key,
            run_id: input.run_id,
            reason: input.reason,
            risk_cost: input.risk_cost,
            actions: input.actions,
            ctx_hash: hash,
            status: ApprovalStatus::Pending,
            requested_by: input.requested_by,
            decided_by: None,
            decided_at: None,
            note: None,
            created_at: Utc::now(),
        };

        match self.store.insert_pending(approval).await? {
            PendingInsert::Created(created) => {
                self.sink.emit(GovernanceEvent::new(
                    EventKind::ApprovalRequired,
                    EventSeverity::Warning,
                    json!({
                        "approval_id": created.id,
                        "algo_key": created.algo_key,
                        "run_id": created.run_id,
                        "risk_cost": created.risk_cost.to_string(),
                        "reason": created.reason,
                        "actions": created.actions.len(),
                    }),
                ));
                info!(
                    event_name = "approvals.requested",
                    approval_id = %created.id,
                    algo_key = %created.algo_key,
                    risk_cost = %created.risk_cost,
                    "opened approval request"
                );
                Ok(created)
            }
            PendingInsert::Existing(existing) => {
                info!(
                    event_name = "approvals.request_deduped",
                    approval_id = %existing.id,
                    ctx_hash = %existing.ctx_hash,
                    "identical context already pending; no new request opened"
                );
                Ok(existing)
            }
        }
    }

    pub async fn approve(
        &self,
        id: &str,
        decided_by: &str,
        note: Option<String>,
    ) -> Result<Approval, GovernanceError> {
        self.decide(id, ApprovalStatus::Approved, decided_by, note).await
    }

    pub async fn reject(
        &self,
        id: &str,
        decided_by: &str,
        note: Option<String>,
    ) -> Result<Approval, GovernanceError> {
        self.decide(id, ApprovalStatus::Rejected, decided_by, note).await
    }

    async fn decide(
        &self,
        id: &str,
        status: ApprovalStatus,
        decided_by: &str,
        note: Option<String>,
    ) -> Result<Approval, GovernanceError> {
        let decided = self.store.decide(id, status, decided_by, note, Utc::now()).await?;
        info!(
            event_name = "approvals.decided",
            approval_id = %decided.id,
            status = ?decided.status,
            decided_by = %decided_by,
            "recorded approval decision"
        );
        Ok(decided)
    }

    pub async fn get(&self, id: &str) -> Result<Option<Approval>, GovernanceError> {
        self.store.get(id).await
    }

    pub async fn list_pending(&self, limit: u32) -> Result<Vec<Approval>, GovernanceError> {
        self.store.list_pending(limit).await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use rust_decimal::Decimal;

    use super::{ctx_hash, ApprovalRequestInput, ApprovalWorkflow};
    use crate::domain::action::{Action, ParamValue};
    use crate::domain::approval::ApprovalStatus;
    use crate::errors::GovernanceError;
    use crate::notify::{EventKind, InMemoryNotificationSink, NotificationSink};
    use crate::store::MemoryStore;

    fn action(target: &str, weight: Decimal) -> Action {
        Action {
            action_type: "set_weight".to_string(),
            target_id: target.to_string(),
            algorithm_id: "bandit-a".to_string(),
            segment_id: None,
            parameters: BTreeMap::from([("weight".to_string(), ParamValue::Number(weight))]),
        }
    }

    fn input(run_id: &str) -> ApprovalRequestInput {
        ApprovalRequestInput {
            algo_key: "bandit-a".to_string(),
            run_id: run_id.to_string(),
            actions: vec![action("t1", Decimal::new(90, 2)), action("t2", Decimal::new(95, 2))],
            risk_cost: Decimal::new(6, 0),
            reason: "risk budget exceeded".to_string(),
            requested_by: "bandit-a".to_string(),
        }
    }

    fn workflow() -> (ApprovalWorkflow, InMemoryNotificationSink) {
        let sink = InMemoryNotificationSink::default();
        let sink_arc: Arc<dyn NotificationSink> = Arc::new(sink.clone());
        (ApprovalWorkflow::new(Arc::new(MemoryStore::new()), sink_arc), sink)
    }

    #[test]
    fn ctx_hash_ignores_action_order() {
        let forward = vec![action("t1", Decimal::ONE), action("t2", Decimal::TWO)];
        let backward = vec![action("t2", Decimal::TWO), action("t1", Decimal::ONE)];
        assert_eq!(
            ctx_hash("bandit-a", &forward).expect("hashes"),
            ctx_hash("bandit-a", &backward).expect("hashes"),
        );
        assert_ne!(
            ctx_hash("bandit-a", &forward).expect("hashes"),
            ctx_hash("bandit-b", &forward).expect("hashes"),
        );
    }

    #[tokio::test]
    async fn request_opens_pending_approval_and_emits_event() {
        let (workflow, sink) = workflow();

        let approval = workflow.request(input("run-1")).await.expect("request");
        assert_eq!(approval.status, ApprovalStatus::Pending);
        assert_eq!(approval.risk_cost, Decimal::new(6, 0));

        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::ApprovalRequired);
        assert_eq!(events[0].payload["approval_id"], approval.id.as_str());
    }

    #[tokio::test]
    async fn identical_pending_context_dedupes_without_second_event() {
        let (workflow, sink) = workflow();

        let first = workflow.request(input("run-1")).await.expect("first");
        let second = workflow.request(input("run-2")).await.expect("second");
        assert_eq!(first.id, second.id);
        assert_eq!(sink.events().len(), 1);
    }

    #[tokio::test]
    async fn approved_context_allows_a_fresh_request() {
        let (workflow, _sink) = workflow();

        let first = workflow.request(input("run-1")).await.expect("first");
        workflow.approve(&first.id, "reviewer", None).await.expect("approve");

        let second = workflow.request(input("run-2")).await.expect("second");
        assert_ne!(first.id, second.id);
        assert_eq!(second.status, ApprovalStatus::Pending);
    }

    #[tokio::test]
    async fn rejected_context_surfaces_prior_rejection() {
        let (workflow, sink) = workflow();

        let first = workflow.request(input("run-1")).await.expect("first");
        workflow.reject(&first.id, "reviewer", Some("too risky".to_string())).await.expect("reject");

        let second = workflow.request(input("run-2")).await.expect("second");
        assert_eq!(first.id, second.id);
        assert_eq!(second.status, ApprovalStatus::Rejected);
        assert_eq!(second.note.as_deref(), Some("too risky"));
        // Only the original request emitted an event.
        assert_eq!(sink.events().len(), 1);
    }

    #[tokio::test]
    async fn deciding_twice_is_an_invalid_state() {
        let (workflow, _sink) = workflow();

        let approval = workflow.request(input("run-1")).await.expect("request");
        workflow.approve(&approval.id, "reviewer", None).await.expect("first decision");

        let err = workflow
            .reject(&approval.id, "reviewer", None)
            .await
            .expect_err("second decision must fail");
        assert!(matches!(err, GovernanceError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn unknown_approval_is_not_found() {
        let (workflow, _sink) = workflow();
        let err = workflow.approve("missing", "reviewer", None).await.expect_err("must fail");
        assert!(matches!(err, GovernanceError::NotFound { .. }));
    }
}
