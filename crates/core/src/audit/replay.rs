use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::info;

use crate::domain::action::{Action, Context};
use crate::errors::GovernanceError;
use crate::evaluator::{evaluate_batch, BatchEvaluation};
use crate::store::PolicySnapshot;

/// Everything needed to re-execute a historical run exactly as it was
/// evaluated: the call context (including its clock), the submitted
/// actions, and the policy snapshot in force at the time.
#[derive(Clone, Debug)]
pub struct HistoricalRun {
    pub context: Context,
    pub actions: Vec<Action>,
    pub snapshot: PolicySnapshot,
}

/// Source of recorded run inputs. Implementations typically sit on the
/// same database as the evaluation log.
#[async_trait]
pub trait ContextStore: Send + Sync {
    async fn historical_run(&self, run_id: &str)
        -> Result<Option<HistoricalRun>, GovernanceError>;
}

/// In-memory context store for tests and embedders that record runs
/// themselves.
#[derive(Default)]
pub struct MemoryContextStore {
    runs: Mutex<BTreeMap<String, HistoricalRun>>,
}

impl MemoryContextStore {
    pub fn record(&self, run: HistoricalRun) {
        let run_id = run.context.run_id.clone();
        match self.runs.lock() {
            Ok(mut runs) => {
                runs.insert(run_id, run);
            }
            Err(poisoned) => {
                poisoned.into_inner().insert(run_id, run);
            }
        }
    }
}

#[async_trait]
impl ContextStore for MemoryContextStore {
    async fn historical_run(
        &self,
        run_id: &str,
    ) -> Result<Option<HistoricalRun>, GovernanceError> {
        let runs = match self.runs.lock() {
            Ok(runs) => runs,
            Err(poisoned) => poisoned.into_inner(),
        };
        Ok(runs.get(run_id).cloned())
    }
}

/// Re-executes a recorded run through the live pipeline code without
/// touching live stores. Because evaluation is pure and the context
/// carries its own clock, the replay reproduces the original decision
/// byte for byte.
pub struct ReplayEngine {
    contexts: Arc<dyn ContextStore>,
}

impl ReplayEngine {
    pub fn new(contexts: Arc<dyn ContextStore>) -> Self {
        Self { contexts }
    }

    pub async fn replay(&self, run_id: &str) -> Result<BatchEvaluation, GovernanceError> {
        let run = self
            .contexts
            .historical_run(run_id)
            .await?
            .ok_or_else(|| GovernanceError::not_found("run", run_id))?;

        let batch = evaluate_batch(&run.snapshot, &run.actions, &run.context);
        info!(
            event_name = "audit.replayed",
            run_id = %run_id,
            actions = run.actions.len(),
            policies = run.snapshot.policies.len(),
            "replayed historical run"
        );
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use chrono::{TimeZone, Utc};
    use rust_decimal::Decimal;

    use super::{HistoricalRun, MemoryContextStore, ReplayEngine};
    use crate::domain::action::{Action, Context, Identity, ParamValue};
    use crate::domain::policy::{Authority, HardGuard, Mode, Mutation, Policy, Scope};
    use crate::errors::GovernanceError;
    use crate::evaluator::evaluate_batch;
    use crate::store::PolicySnapshot;

    fn historical_run() -> HistoricalRun {
        let now = Utc.with_ymd_and_hms(2026, 3, 14, 10, 0, 0).single().expect("valid time");
        let policy = Policy {
            id: "p-weight".to_string(),
            name: "weight ceiling".to_string(),
            scope: Scope::Algorithm,
            algo_key: Some("bandit-a".to_string()),
            selector: None,
            mode: Mode::Enforce,
            authority_required: Authority::Operator,
            hard_guards: vec![HardGuard::MaxDelta {
                param: "weight".to_string(),
                baseline: "weight_old".to_string(),
                max_delta: Decimal::new(15, 2),
            }],
            soft_guards: Vec::new(),
            limits: Vec::new(),
            gates: Vec::new(),
            mutations: vec![Mutation::Clamp {
                param: "weight".to_string(),
                min: Decimal::new(1, 2),
                max: Decimal::new(80, 2),
            }],
            schedule: None,
            rollout_percent: 100,
            expires_at: None,
            enabled: true,
            version: 3,
            updated_by: "pac".to_string(),
            updated_at: now,
            created_at: now,
            tenant_id: None,
        };
        let action = Action {
            action_type: "set_weight".to_string(),
            target_id: "campaign-1".to_string(),
            algorithm_id: "bandit-a".to_string(),
            segment_id: None,
            parameters: BTreeMap::from([
                ("weight".to_string(), ParamValue::Number(Decimal::new(90, 2))),
                ("weight_old".to_string(), ParamValue::Number(Decimal::new(85, 2))),
            ]),
        };
        let context = Context {
            run_id: "run-1".to_string(),
            algo_key: "bandit-a".to_string(),
            entity_id: "campaign-1".to_string(),
            tenant_id: None,
            identity: Identity { actor: "bandit-a".to_string(), authority: None },
            attributes: BTreeMap::new(),
            flags: BTreeMap::new(),
            now,
        };
        HistoricalRun {
            context,
            actions: vec![action],
            snapshot: PolicySnapshot { policies: vec![policy], taken_at: now },
        }
    }

    #[tokio::test]
    async fn replay_reproduces_the_original_decision() {
        let run = historical_run();
        let original = evaluate_batch(&run.snapshot, &run.actions, &run.context);

        let contexts = MemoryContextStore::default();
        contexts.record(run);
        let engine = ReplayEngine::new(Arc::new(contexts));

        let replayed = engine.replay("run-1").await.expect("replay");
        assert_eq!(replayed.result, original.result);
        assert_eq!(replayed.graph, original.graph);
        assert_eq!(replayed.dominant_policy, original.dominant_policy);
        assert_eq!(replayed.result.modified.len(), 1);
    }

    #[tokio::test]
    async fn replay_of_unknown_run_is_not_found() {
        let engine = ReplayEngine::new(Arc::new(MemoryContextStore::default()));
        let err = engine.replay("run-404").await.expect_err("must fail");
        assert!(matches!(err, GovernanceError::NotFound { .. }));
    }
}
