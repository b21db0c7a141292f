use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::Row;

use rcp_core::domain::evaluation::{Evaluation, EvaluationStats, RunVerdict};
use rcp_core::store::EvaluationStore;
use rcp_core::GovernanceError;

use super::{db_err, decode_err, from_json, parse_datetime, to_json};
use crate::DbPool;

pub struct SqlEvaluationStore {
    pool: DbPool,
}

impl SqlEvaluationStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn verdict_as_str(verdict: RunVerdict) -> &'static str {
    match verdict {
        RunVerdict::Allowed => "allowed",
        RunVerdict::Modified => "modified",
        RunVerdict::Blocked => "blocked",
        RunVerdict::Mixed => "mixed",
    }
}

fn parse_verdict(raw: &str) -> Result<RunVerdict, GovernanceError> {
    match raw {
        "allowed" => Ok(RunVerdict::Allowed),
        "modified" => Ok(RunVerdict::Modified),
        "blocked" => Ok(RunVerdict::Blocked),
        "mixed" => Ok(RunVerdict::Mixed),
        other => Err(decode_err(format!("unknown run verdict '{other}'"))),
    }
}

fn row_to_evaluation(row: &sqlx::sqlite::SqliteRow) -> Result<Evaluation, GovernanceError> {
    let result_str: String = row.try_get("result").map_err(decode_err)?;
    let allowed: i64 = row.try_get("allowed").map_err(decode_err)?;
    let modified: i64 = row.try_get("modified").map_err(decode_err)?;
    let blocked: i64 = row.try_get("blocked").map_err(decode_err)?;
    let pending: i64 = row.try_get("pending").map_err(decode_err)?;
    let risk_cost: String = row.try_get("risk_cost").map_err(decode_err)?;
    let diff_json: String = row.try_get("diff").map_err(decode_err)?;
    let created_at: String = row.try_get("created_at").map_err(decode_err)?;

    Ok(Evaluation {
        id: row.try_get("id").map_err(decode_err)?,
        policy_id: row.try_get("policy_id").map_err(decode_err)?,
        algo_key: row.try_get("algo_key").map_err(decode_err)?,
        run_id: row.try_get("run_id").map_err(decode_err)?,
        result: parse_verdict(&result_str)?,
        stats: EvaluationStats {
            allowed: u32::try_from(allowed).map_err(decode_err)?,
            modified: u32::try_from(modified).map_err(decode_err)?,
            blocked: u32::try_from(blocked).map_err(decode_err)?,
            pending: u32::try_from(pending).map_err(decode_err)?,
        },
        risk_cost: risk_cost.parse::<Decimal>().map_err(decode_err)?,
        diff: from_json(&diff_json)?,
        created_at: parse_datetime(&created_at)?,
        tenant_id: row.try_get("tenant_id").map_err(decode_err)?,
    })
}

#[async_trait]
impl EvaluationStore for SqlEvaluationStore {
    async fn append(&self, evaluation: &Evaluation) -> Result<(), GovernanceError> {
        sqlx::query(
            "INSERT INTO evaluation (id, policy_id, algo_key, run_id, result, allowed, modified,
                                     blocked, pending, risk_cost, diff, created_at, tenant_id)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&evaluation.id)
        .bind(&evaluation.policy_id)
        .bind(&evaluation.algo_key)
        .bind(&evaluation.run_id)
        .bind(verdict_as_str(evaluation.result))
        .bind(i64::from(evaluation.stats.allowed))
        .bind(i64::from(evaluation.stats.modified))
        .bind(i64::from(evaluation.stats.blocked))
        .bind(i64::from(evaluation.stats.pending))
        .bind(evaluation.risk_cost.to_string())
        .bind(to_json(&evaluation.diff)?)
        .bind(evaluation.created_at.to_rfc3339())
        .bind(&evaluation.tenant_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn for_run(&self, run_id: &str) -> Result<Vec<Evaluation>, GovernanceError> {
        let rows = sqlx::query(
            "SELECT id, policy_id, algo_key, run_id, result, allowed, modified, blocked,
                    pending, risk_cost, diff, created_at, tenant_id
             FROM evaluation WHERE run_id = ? ORDER BY created_at ASC",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(row_to_evaluation).collect()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::Utc;
    use rust_decimal::Decimal;

    use rcp_core::domain::action::Action;
    use rcp_core::domain::evaluation::{
        Evaluation, EvaluationStats, ModifiedAction, RunVerdict,
    };
    use rcp_core::store::EvaluationStore;

    use super::SqlEvaluationStore;
    use crate::{connect_with_settings, migrations};

    async fn setup() -> SqlEvaluationStore {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        SqlEvaluationStore::new(pool)
    }

    fn action(target: &str) -> Action {
        Action {
            action_type: "set_weight".to_string(),
            target_id: target.to_string(),
            algorithm_id: "bandit-a".to_string(),
            segment_id: None,
            parameters: BTreeMap::new(),
        }
    }

    fn sample_evaluation(id: &str, run_id: &str) -> Evaluation {
        Evaluation {
            id: id.to_string(),
            policy_id: Some("p-1".to_string()),
            algo_key: "bandit-a".to_string(),
            run_id: run_id.to_string(),
            result: RunVerdict::Modified,
            stats: EvaluationStats { allowed: 0, modified: 1, blocked: 0, pending: 0 },
            risk_cost: Decimal::new(15, 1),
            diff: vec![ModifiedAction {
                before: action("campaign-1"),
                after: action("campaign-1"),
                policy_id: Some("p-1".to_string()),
                reasons: vec!["clamp[weight into 0.01..0.80]".to_string()],
            }],
            created_at: Utc::now(),
            tenant_id: None,
        }
    }

    #[tokio::test]
    async fn append_and_read_back_a_run() {
        let store = setup().await;
        let record = sample_evaluation("ev-1", "run-1");
        store.append(&record).await.expect("append");

        let history = store.for_run("run-1").await.expect("for_run");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].result, RunVerdict::Modified);
        assert_eq!(history[0].risk_cost, Decimal::new(15, 1));
        assert_eq!(history[0].diff, record.diff);
    }

    #[tokio::test]
    async fn for_run_orders_records_and_scopes_by_run() {
        let store = setup().await;
        let mut older = sample_evaluation("ev-1", "run-1");
        older.created_at = Utc::now() - chrono::Duration::minutes(5);
        store.append(&older).await.expect("append");
        store.append(&sample_evaluation("ev-2", "run-1")).await.expect("append");
        store.append(&sample_evaluation("ev-3", "run-2")).await.expect("append");

        let history = store.for_run("run-1").await.expect("for_run");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].id, "ev-1");

        assert!(store.for_run("run-404").await.expect("for_run").is_empty());
    }
}
