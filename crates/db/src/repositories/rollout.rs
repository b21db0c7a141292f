use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;

use rcp_core::domain::rollout::{Rollout, RolloutState};
use rcp_core::store::RolloutStore;
use rcp_core::GovernanceError;

use super::{db_err, decode_err, from_json, parse_datetime, parse_optional_datetime, to_json};
use crate::DbPool;

const ROLLOUT_COLUMNS: &str = "id, policy_id, from_percent, to_percent, state, reason,
     auto_rollback_rule, created_at, completed_at";

pub struct SqlRolloutStore {
    pool: DbPool,
}

impl SqlRolloutStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn state_as_str(state: RolloutState) -> &'static str {
    match state {
        RolloutState::Pending => "pending",
        RolloutState::Active => "active",
        RolloutState::Completed => "completed",
        RolloutState::RolledBack => "rolled_back",
    }
}

fn parse_state(raw: &str) -> Result<RolloutState, GovernanceError> {
    match raw {
        "pending" => Ok(RolloutState::Pending),
        "active" => Ok(RolloutState::Active),
        "completed" => Ok(RolloutState::Completed),
        "rolled_back" => Ok(RolloutState::RolledBack),
        other => Err(decode_err(format!("unknown rollout state '{other}'"))),
    }
}

fn row_to_rollout(row: &sqlx::sqlite::SqliteRow) -> Result<Rollout, GovernanceError> {
    let from_percent: i64 = row.try_get("from_percent").map_err(decode_err)?;
    let to_percent: i64 = row.try_get("to_percent").map_err(decode_err)?;
    let state_str: String = row.try_get("state").map_err(decode_err)?;
    let rule_json: String = row.try_get("auto_rollback_rule").map_err(decode_err)?;
    let created_at: String = row.try_get("created_at").map_err(decode_err)?;
    let completed_at: Option<String> = row.try_get("completed_at").map_err(decode_err)?;

    Ok(Rollout {
        id: row.try_get("id").map_err(decode_err)?,
        policy_id: row.try_get("policy_id").map_err(decode_err)?,
        from_percent: u8::try_from(from_percent).map_err(decode_err)?,
        to_percent: u8::try_from(to_percent).map_err(decode_err)?,
        state: parse_state(&state_str)?,
        reason: row.try_get("reason").map_err(decode_err)?,
        auto_rollback_rule: from_json(&rule_json)?,
        created_at: parse_datetime(&created_at)?,
        completed_at: parse_optional_datetime(completed_at)?,
    })
}

#[async_trait]
impl RolloutStore for SqlRolloutStore {
    async fn insert(&self, rollout: &Rollout) -> Result<(), GovernanceError> {
        // The partial unique index on (policy_id) WHERE state = 'active'
        // rejects a second active rollout at the database level.
        let result = sqlx::query(
            "INSERT INTO rollout (id, policy_id, from_percent, to_percent, state, reason,
                                  auto_rollback_rule, created_at, completed_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&rollout.id)
        .bind(&rollout.policy_id)
        .bind(i64::from(rollout.from_percent))
        .bind(i64::from(rollout.to_percent))
        .bind(state_as_str(rollout.state))
        .bind(&rollout.reason)
        .bind(to_json(&rollout.auto_rollback_rule)?)
        .bind(rollout.created_at.to_rfc3339())
        .bind(rollout.completed_at.map(|dt| dt.to_rfc3339()))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(GovernanceError::conflict(
                    format!("rollout for policy {}", rollout.policy_id),
                    "an active rollout already exists",
                ))
            }
            Err(other) => Err(db_err(other)),
        }
    }

    async fn get(&self, id: &str) -> Result<Option<Rollout>, GovernanceError> {
        let row = sqlx::query(&format!("SELECT {ROLLOUT_COLUMNS} FROM rollout WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        match row {
            Some(ref r) => Ok(Some(row_to_rollout(r)?)),
            None => Ok(None),
        }
    }

    async fn active_for_policy(
        &self,
        policy_id: &str,
    ) -> Result<Option<Rollout>, GovernanceError> {
        let row = sqlx::query(&format!(
            "SELECT {ROLLOUT_COLUMNS} FROM rollout WHERE policy_id = ? AND state = 'active'"
        ))
        .bind(policy_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        match row {
            Some(ref r) => Ok(Some(row_to_rollout(r)?)),
            None => Ok(None),
        }
    }

    async fn transition(
        &self,
        id: &str,
        from: RolloutState,
        to: RolloutState,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<bool, GovernanceError> {
        let result = sqlx::query("UPDATE rollout SET state = ?, completed_at = ? WHERE id = ? AND state = ?")
            .bind(state_as_str(to))
            .bind(completed_at.map(|dt| dt.to_rfc3339()))
            .bind(id)
            .bind(state_as_str(from))
            .execute(&self.pool)
            .await;

        let result = match result {
            Ok(result) => result,
            // Activating while another rollout of the same policy holds the
            // active slot trips the partial unique index.
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                return Err(GovernanceError::conflict(
                    format!("rollout {id}"),
                    "an active rollout already exists",
                ));
            }
            Err(other) => return Err(db_err(other)),
        };

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        // Distinguish a lost CAS race from an unknown rollout.
        match self.get(id).await? {
            Some(_) => Ok(false),
            None => Err(GovernanceError::not_found("rollout", id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;
    use rust_decimal::Decimal;

    use rcp_core::domain::rollout::{AutoRollbackRule, Comparator, Rollout, RolloutState};
    use rcp_core::store::RolloutStore;
    use rcp_core::GovernanceError;

    use super::SqlRolloutStore;
    use crate::{connect_with_settings, migrations};

    async fn setup() -> SqlRolloutStore {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        SqlRolloutStore::new(pool)
    }

    fn sample_rollout(id: &str, policy_id: &str, state: RolloutState) -> Rollout {
        Rollout {
            id: id.to_string(),
            policy_id: policy_id.to_string(),
            from_percent: 10,
            to_percent: 50,
            state,
            reason: "staged increase".to_string(),
            auto_rollback_rule: AutoRollbackRule {
                metric: "error_rate".to_string(),
                comparator: Comparator::Gt,
                threshold: Decimal::new(5, 2),
                window: Duration::from_secs(300),
            },
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    #[tokio::test]
    async fn insert_and_get_round_trips_the_rollback_rule() {
        let store = setup().await;
        let rollout = sample_rollout("ro-1", "p-1", RolloutState::Pending);

        store.insert(&rollout).await.expect("insert");
        let found = store.get("ro-1").await.expect("get").expect("present");

        assert_eq!(found.auto_rollback_rule, rollout.auto_rollback_rule);
        assert_eq!(found.from_percent, 10);
        assert_eq!(found.state, RolloutState::Pending);
    }

    #[tokio::test]
    async fn second_active_rollout_for_a_policy_conflicts() {
        let store = setup().await;
        store.insert(&sample_rollout("ro-1", "p-1", RolloutState::Active)).await.expect("insert");

        let err = store
            .insert(&sample_rollout("ro-2", "p-1", RolloutState::Active))
            .await
            .expect_err("second active must conflict");
        assert!(matches!(err, GovernanceError::Conflict { .. }));

        // A different policy is unaffected.
        store.insert(&sample_rollout("ro-3", "p-2", RolloutState::Active)).await.expect("insert");
    }

    #[tokio::test]
    async fn active_for_policy_ignores_terminal_rollouts() {
        let store = setup().await;
        store
            .insert(&sample_rollout("ro-1", "p-1", RolloutState::Completed))
            .await
            .expect("insert");
        assert_eq!(store.active_for_policy("p-1").await.expect("query"), None);

        store.insert(&sample_rollout("ro-2", "p-1", RolloutState::Active)).await.expect("insert");
        let active = store.active_for_policy("p-1").await.expect("query").expect("present");
        assert_eq!(active.id, "ro-2");
    }

    #[tokio::test]
    async fn staged_rollout_cannot_activate_past_an_active_one() {
        let store = setup().await;
        store.insert(&sample_rollout("ro-1", "p-1", RolloutState::Pending)).await.expect("insert");
        store.insert(&sample_rollout("ro-2", "p-1", RolloutState::Pending)).await.expect("insert");

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
        let second = store.get("ro-2").await.expect("get").expect("present");
        assert_eq!(second.state, RolloutState::Pending);
    }

    #[tokio::test]
    async fn transition_is_a_compare_and_swap() {
        let store = setup().await;
        store.insert(&sample_rollout("ro-1", "p-1", RolloutState::Active)).await.expect("insert");

        let done = Utc::now();
        let swapped = store
            .transition("ro-1", RolloutState::Active, RolloutState::Completed, Some(done))
            .await
            .expect("transition");
        assert!(swapped);

        // The state already moved; a racing writer loses without an error.
        let lost = store
            .transition("ro-1", RolloutState::Active, RolloutState::RolledBack, None)
            .await
            .expect("transition");
        assert!(!lost);

        let found = store.get("ro-1").await.expect("get").expect("present");
        assert_eq!(found.state, RolloutState::Completed);
        assert!(found.completed_at.is_some());

        let err = store
            .transition("ro-404", RolloutState::Active, RolloutState::Completed, None)
            .await
            .expect_err("unknown rollout");
        assert!(matches!(err, GovernanceError::NotFound { .. }));
    }
}
