use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;

use rcp_core::domain::plan::{PacPlan, PlanStatus};
use rcp_core::store::PlanStore;
use rcp_core::GovernanceError;

use super::{db_err, decode_err, from_json, parse_datetime, parse_optional_datetime, to_json};
use crate::DbPool;

const PLAN_COLUMNS: &str =
    "id, author, diff, snapshot_versions, dry_run, status, created_at, applied_at, error_message";

pub struct SqlPlanStore {
    pool: DbPool,
}

impl SqlPlanStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn status_as_str(status: PlanStatus) -> &'static str {
    match status {
        PlanStatus::Pending => "pending",
        PlanStatus::Applied => "applied",
        PlanStatus::Failed => "failed",
    }
}

fn parse_status(raw: &str) -> Result<PlanStatus, GovernanceError> {
    match raw {
        "pending" => Ok(PlanStatus::Pending),
        "applied" => Ok(PlanStatus::Applied),
        "failed" => Ok(PlanStatus::Failed),
        other => Err(decode_err(format!("unknown plan status '{other}'"))),
    }
}

fn row_to_plan(row: &sqlx::sqlite::SqliteRow) -> Result<PacPlan, GovernanceError> {
    let diff_json: String = row.try_get("diff").map_err(decode_err)?;
    let versions_json: String = row.try_get("snapshot_versions").map_err(decode_err)?;
    let status_str: String = row.try_get("status").map_err(decode_err)?;
    let created_at: String = row.try_get("created_at").map_err(decode_err)?;
    let applied_at: Option<String> = row.try_get("applied_at").map_err(decode_err)?;

    Ok(PacPlan {
        id: row.try_get("id").map_err(decode_err)?,
        author: row.try_get("author").map_err(decode_err)?,
        diff: from_json(&diff_json)?,
        snapshot_versions: from_json(&versions_json)?,
        dry_run: row.try_get("dry_run").map_err(decode_err)?,
        status: parse_status(&status_str)?,
        created_at: parse_datetime(&created_at)?,
        applied_at: parse_optional_datetime(applied_at)?,
        error_message: row.try_get("error_message").map_err(decode_err)?,
    })
}

#[async_trait]
impl PlanStore for SqlPlanStore {
    async fn insert(&self, plan: &PacPlan) -> Result<(), GovernanceError> {
        sqlx::query(
            "INSERT INTO pac_plan (id, author, diff, snapshot_versions, dry_run, status,
                                   created_at, applied_at, error_message)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&plan.id)
        .bind(&plan.author)
        .bind(to_json(&plan.diff)?)
        .bind(to_json(&plan.snapshot_versions)?)
        .bind(plan.dry_run)
        .bind(status_as_str(plan.status))
        .bind(plan.created_at.to_rfc3339())
        .bind(plan.applied_at.map(|dt| dt.to_rfc3339()))
        .bind(&plan.error_message)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<PacPlan>, GovernanceError> {
        let row = sqlx::query(&format!("SELECT {PLAN_COLUMNS} FROM pac_plan WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        match row {
            Some(ref r) => Ok(Some(row_to_plan(r)?)),
            None => Ok(None),
        }
    }

    async fn mark(
        &self,
        id: &str,
        status: PlanStatus,
        applied_at: Option<DateTime<Utc>>,
        error_message: Option<String>,
    ) -> Result<(), GovernanceError> {
        let result = sqlx::query(
            "UPDATE pac_plan SET status = ?, applied_at = ?, error_message = ?
             WHERE id = ? AND status = 'pending'",
        )
        .bind(status_as_str(status))
        .bind(applied_at.map(|dt| dt.to_rfc3339()))
        .bind(&error_message)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() > 0 {
            return Ok(());
        }
        match self.get(id).await? {
            Some(current) => {
                Err(GovernanceError::invalid_state("plan", id, format!("{:?}", current.status)))
            }
            None => Err(GovernanceError::not_found("plan", id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::Utc;

    use rcp_core::domain::plan::{PacPlan, PlanDiff, PlanStatus};
    use rcp_core::store::PlanStore;
    use rcp_core::GovernanceError;

    use super::SqlPlanStore;
    use crate::{connect_with_settings, migrations};

    async fn setup() -> SqlPlanStore {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        SqlPlanStore::new(pool)
    }

    fn sample_plan(id: &str) -> PacPlan {
        PacPlan {
            id: id.to_string(),
            author: "ops".to_string(),
            diff: PlanDiff {
                create: vec!["p-new".to_string()],
                update: vec!["p-old".to_string()],
                delete: Vec::new(),
            },
            snapshot_versions: BTreeMap::from([("p-old".to_string(), 3)]),
            dry_run: false,
            status: PlanStatus::Pending,
            created_at: Utc::now(),
            applied_at: None,
            error_message: None,
        }
    }

    #[tokio::test]
    async fn insert_and_get_round_trips_the_diff() {
        let store = setup().await;
        let plan = sample_plan("plan-1");
        store.insert(&plan).await.expect("insert");

        let found = store.get("plan-1").await.expect("get").expect("present");
        assert_eq!(found.diff, plan.diff);
        assert_eq!(found.snapshot_versions, plan.snapshot_versions);
        assert_eq!(found.status, PlanStatus::Pending);
    }

    #[tokio::test]
    async fn mark_consumes_a_plan_exactly_once() {
        let store = setup().await;
        store.insert(&sample_plan("plan-1")).await.expect("insert");

        store.mark("plan-1", PlanStatus::Applied, Some(Utc::now()), None).await.expect("mark");
        let applied = store.get("plan-1").await.expect("get").expect("present");
        assert_eq!(applied.status, PlanStatus::Applied);
        assert!(applied.applied_at.is_some());

        let err = store
            .mark("plan-1", PlanStatus::Failed, None, Some("late".to_string()))
            .await
            .expect_err("second mark must fail");
        assert!(matches!(err, GovernanceError::InvalidState { .. }));

        let err = store
            .mark("plan-404", PlanStatus::Applied, None, None)
            .await
            .expect_err("unknown plan");
        assert!(matches!(err, GovernanceError::NotFound { .. }));
    }
}
