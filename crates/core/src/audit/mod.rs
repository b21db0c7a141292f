pub mod replay;

use std::sync::Arc;

use rust_decimal::Decimal;

use crate::domain::evaluation::{Evaluation, EvaluationStats, RunVerdict};
use crate::errors::GovernanceError;
use crate::store::EvaluationStore;

/// Aggregate view over every evaluation record a run produced. A run that
/// was evaluated more than once (retries, replays persisted by the caller)
/// rolls up into one summary.
#[derive(Clone, Debug, PartialEq)]
pub struct RunAuditSummary {
    pub run_id: String,
    pub records: usize,
    pub verdict: RunVerdict,
    pub stats: EvaluationStats,
    pub risk_cost: Decimal,
    pub policies_involved: Vec<String>,
}

/// Read-side audit surface over the append-only evaluation log.
pub struct AuditTrail {
    evaluations: Arc<dyn EvaluationStore>,
}

impl AuditTrail {
    pub fn new(evaluations: Arc<dyn EvaluationStore>) -> Self {
        Self { evaluations }
    }

    pub async fn run_history(&self, run_id: &str) -> Result<Vec<Evaluation>, GovernanceError> {
        self.evaluations.for_run(run_id).await
    }

    pub async fn summarize(
        &self,
        run_id: &str,
    ) -> Result<Option<RunAuditSummary>, GovernanceError> {
        let records = self.run_history(run_id).await?;
        if records.is_empty() {
            return Ok(None);
        }

        let mut stats = EvaluationStats::default();
        let mut risk_cost = Decimal::ZERO;
        let mut policies = Vec::new();
        for record in &records {
            stats.allowed += record.stats.allowed;
            stats.modified += record.stats.modified;
            stats.blocked += record.stats.blocked;
            stats.pending += record.stats.pending;
            risk_cost += record.risk_cost;
            if let Some(policy_id) = &record.policy_id {
                if !policies.contains(policy_id) {
                    policies.push(policy_id.clone());
                }
            }
        }

        let verdict = if records.len() == 1 {
            records[0].result
        } else if records.iter().all(|record| record.result == records[0].result) {
            records[0].result
        } else {
            RunVerdict::Mixed
        };

        Ok(Some(RunAuditSummary {
            run_id: run_id.to_string(),
            records: records.len(),
            verdict,
            stats,
            risk_cost,
            policies_involved: policies,
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;

    use super::AuditTrail;
    use crate::domain::evaluation::{Evaluation, EvaluationStats, RunVerdict};
    use crate::store::{EvaluationStore, MemoryStore};

    fn record(run_id: &str, policy_id: Option<&str>, result: RunVerdict) -> Evaluation {
        Evaluation {
            id: uuid::Uuid::new_v4().to_string(),
            policy_id: policy_id.map(str::to_string),
            algo_key: "bandit-a".to_string(),
            run_id: run_id.to_string(),
            result,
            stats: EvaluationStats { allowed: 1, modified: 0, blocked: 1, pending: 0 },
            risk_cost: rust_decimal::Decimal::ONE,
            diff: Vec::new(),
            created_at: Utc::now(),
            tenant_id: None,
        }
    }

    #[tokio::test]
    async fn summary_rolls_up_stats_and_policies() {
        let store = Arc::new(MemoryStore::new());
        store.append(&record("run-1", Some("p-1"), RunVerdict::Blocked)).await.expect("append");
        store.append(&record("run-1", Some("p-1"), RunVerdict::Mixed)).await.expect("append");
        store.append(&record("run-2", None, RunVerdict::Allowed)).await.expect("append");

        let trail = AuditTrail::new(store);
        let summary = trail.summarize("run-1").await.expect("summarize").expect("present");
        assert_eq!(summary.records, 2);
        assert_eq!(summary.verdict, RunVerdict::Mixed);
        assert_eq!(summary.stats.allowed, 2);
        assert_eq!(summary.stats.blocked, 2);
        assert_eq!(summary.risk_cost, rust_decimal::Decimal::TWO);
        assert_eq!(summary.policies_involved, vec!["p-1"]);
    }

    #[tokio::test]
    async fn unknown_run_summarizes_to_none() {
        let trail = AuditTrail::new(Arc::new(MemoryStore::new()));
        assert_eq!(trail.summarize("run-404").await.expect("summarize"), None);
    }
}
