use async_trait::async_trait;
use chrono::Utc;
use sqlx::Row;

use rcp_core::domain::plan::PacPlan;
use rcp_core::domain::policy::{Authority, Mode, Policy, Scope};
use rcp_core::store::{PolicySnapshot, PolicyStore};
use rcp_core::GovernanceError;

use super::{db_err, decode_err, from_json, parse_datetime, parse_optional_datetime, to_json};
use crate::DbPool;

const POLICY_COLUMNS: &str = "id, name, scope, algo_key, selector, mode, authority_required,
     hard_guards, soft_guards, limits, gates, mutations, schedule, rollout_percent,
     expires_at, enabled, version, updated_by, updated_at, created_at, tenant_id";

pub struct SqlPolicyStore {
    pool: DbPool,
}

impl SqlPolicyStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn scope_as_str(scope: Scope) -> &'static str {
    match scope {
        Scope::Global => "global",
        Scope::Algorithm => "algorithm",
        Scope::Segment => "segment",
    }
}

fn parse_scope(raw: &str) -> Result<Scope, GovernanceError> {
    match raw {
        "global" => Ok(Scope::Global),
        "algorithm" => Ok(Scope::Algorithm),
        "segment" => Ok(Scope::Segment),
        other => Err(decode_err(format!("unknown policy scope '{other}'"))),
    }
}

fn mode_as_str(mode: Mode) -> &'static str {
    match mode {
        Mode::Monitor => "monitor",
        Mode::Enforce => "enforce",
    }
}

fn parse_mode(raw: &str) -> Result<Mode, GovernanceError> {
    match raw {
        "monitor" => Ok(Mode::Monitor),
        "enforce" => Ok(Mode::Enforce),
        other => Err(decode_err(format!("unknown policy mode '{other}'"))),
    }
}

fn authority_as_str(authority: Authority) -> &'static str {
    match authority {
        Authority::Operator => "operator",
        Authority::Admin => "admin",
        Authority::DgAi => "dg_ai",
    }
}

fn parse_authority(raw: &str) -> Result<Authority, GovernanceError> {
    match raw {
        "operator" => Ok(Authority::Operator),
        "admin" => Ok(Authority::Admin),
        "dg_ai" => Ok(Authority::DgAi),
        other => Err(decode_err(format!("unknown authority '{other}'"))),
    }
}

fn row_to_policy(row: &sqlx::sqlite::SqliteRow) -> Result<Policy, GovernanceError> {
    let scope_str: String = row.try_get("scope").map_err(decode_err)?;
    let mode_str: String = row.try_get("mode").map_err(decode_err)?;
    let authority_str: String = row.try_get("authority_required").map_err(decode_err)?;
    let selector_json: Option<String> = row.try_get("selector").map_err(decode_err)?;
    let hard_guards_json: String = row.try_get("hard_guards").map_err(decode_err)?;
    let soft_guards_json: String = row.try_get("soft_guards").map_err(decode_err)?;
    let limits_json: String = row.try_get("limits").map_err(decode_err)?;
    let gates_json: String = row.try_get("gates").map_err(decode_err)?;
    let mutations_json: String = row.try_get("mutations").map_err(decode_err)?;
    let rollout_percent: i64 = row.try_get("rollout_percent").map_err(decode_err)?;
    let expires_at: Option<String> = row.try_get("expires_at").map_err(decode_err)?;
    let updated_at: String = row.try_get("updated_at").map_err(decode_err)?;
    let created_at: String = row.try_get("created_at").map_err(decode_err)?;

    Ok(Policy {
        id: row.try_get("id").map_err(decode_err)?,
        name: row.try_get("name").map_err(decode_err)?,
        scope: parse_scope(&scope_str)?,
        algo_key: row.try_get("algo_key").map_err(decode_err)?,
        selector: selector_json.as_deref().map(from_json).transpose()?,
        mode: parse_mode(&mode_str)?,
        authority_required: parse_authority(&authority_str)?,
        hard_guards: from_json(&hard_guards_json)?,
        soft_guards: from_json(&soft_guards_json)?,
        limits: from_json(&limits_json)?,
        gates: from_json(&gates_json)?,
        mutations: from_json(&mutations_json)?,
        schedule: row.try_get("schedule").map_err(decode_err)?,
        rollout_percent: u8::try_from(rollout_percent).map_err(decode_err)?,
        expires_at: parse_optional_datetime(expires_at)?,
        enabled: row.try_get("enabled").map_err(decode_err)?,
        version: row.try_get("version").map_err(decode_err)?,
        updated_by: row.try_get("updated_by").map_err(decode_err)?,
        updated_at: parse_datetime(&updated_at)?,
        created_at: parse_datetime(&created_at)?,
        tenant_id: row.try_get("tenant_id").map_err(decode_err)?,
    })
}

fn bind_policy<'q>(
    query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    policy: &Policy,
) -> Result<sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>, GovernanceError>
{
    let selector_json = policy.selector.as_ref().map(to_json).transpose()?;
    Ok(query
        .bind(policy.id.clone())
        .bind(policy.name.clone())
        .bind(scope_as_str(policy.scope))
        .bind(policy.algo_key.clone())
        .bind(selector_json)
        .bind(mode_as_str(policy.mode))
        .bind(authority_as_str(policy.authority_required))
        .bind(to_json(&policy.hard_guards)?)
        .bind(to_json(&policy.soft_guards)?)
        .bind(to_json(&policy.limits)?)
        .bind(to_json(&policy.gates)?)
        .bind(to_json(&policy.mutations)?)
        .bind(policy.schedule.clone())
        .bind(i64::from(policy.rollout_percent))
        .bind(policy.expires_at.map(|dt| dt.to_rfc3339()))
        .bind(policy.enabled)
        .bind(policy.version)
        .bind(policy.updated_by.clone())
        .bind(policy.updated_at.to_rfc3339())
        .bind(policy.created_at.to_rfc3339())
        .bind(policy.tenant_id.clone()))
}

const INSERT_POLICY: &str = "INSERT INTO policy (id, name, scope, algo_key, selector, mode,
         authority_required, hard_guards, soft_guards, limits, gates, mutations, schedule,
         rollout_percent, expires_at, enabled, version, updated_by, updated_at, created_at,
         tenant_id)
     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)";

#[async_trait]
impl PolicyStore for SqlPolicyStore {
    async fn snapshot(&self) -> Result<PolicySnapshot, GovernanceError> {
        let rows = sqlx::query(&format!("SELECT {POLICY_COLUMNS} FROM policy ORDER BY id"))
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        let policies =
            rows.iter().map(row_to_policy).collect::<Result<Vec<_>, GovernanceError>>()?;
        Ok(PolicySnapshot { policies, taken_at: Utc::now() })
    }

    async fn get(&self, id: &str) -> Result<Option<Policy>, GovernanceError> {
        let row = sqlx::query(&format!("SELECT {POLICY_COLUMNS} FROM policy WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        match row {
            Some(ref r) => Ok(Some(row_to_policy(r)?)),
            None => Ok(None),
        }
    }

    async fn upsert(&self, policy: Policy) -> Result<(), GovernanceError> {
        let sql = format!(
            "{INSERT_POLICY}
             ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 scope = excluded.scope,
                 algo_key = excluded.algo_key,
                 selector = excluded.selector,
                 mode = excluded.mode,
                 authority_required = excluded.authority_required,
                 hard_guards = excluded.hard_guards,
                 soft_guards = excluded.soft_guards,
                 limits = excluded.limits,
                 gates = excluded.gates,
                 mutations = excluded.mutations,
                 schedule = excluded.schedule,
                 rollout_percent = excluded.rollout_percent,
                 expires_at = excluded.expires_at,
                 enabled = excluded.enabled,
                 version = excluded.version,
                 updated_by = excluded.updated_by,
                 updated_at = excluded.updated_at,
                 tenant_id = excluded.tenant_id"
        );
        bind_policy(sqlx::query(&sql), &policy)?.execute(&self.pool).await.map_err(db_err)?;
        Ok(())
    }

    async fn set_rollout_percent(
        &self,
        policy_id: &str,
        percent: u8,
        updated_by: &str,
    ) -> Result<Policy, GovernanceError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let result = sqlx::query(
            "UPDATE policy
             SET rollout_percent = ?, version = version + 1, updated_by = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(i64::from(percent))
        .bind(updated_by)
        .bind(Utc::now().to_rfc3339())
        .bind(policy_id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(GovernanceError::not_found("policy", policy_id));
        }

        let row = sqlx::query(&format!("SELECT {POLICY_COLUMNS} FROM policy WHERE id = ?"))
            .bind(policy_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;

        row_to_policy(&row)
    }

    async fn apply_plan(
        &self,
        plan: &PacPlan,
        creates: &[Policy],
        updates: &[Policy],
    ) -> Result<(), GovernanceError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        // Re-check every version expectation inside the transaction so the
        // apply is all-or-nothing under concurrent writers.
        for id in plan.diff.update.iter().chain(plan.diff.delete.iter()) {
            let expected = plan.snapshot_versions.get(id).copied().ok_or_else(|| {
                GovernanceError::conflict(format!("policy {id}"), "missing snapshot version")
            })?;
            let row = sqlx::query("SELECT version FROM policy WHERE id = ?")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(db_err)?
                .ok_or_else(|| GovernanceError::not_found("policy", id.clone()))?;
            let current: i64 = row.try_get("version").map_err(decode_err)?;
            if current != expected {
                return Err(GovernanceError::conflict(
                    format!("policy {id}"),
                    format!("version {expected} expected, found {current}"),
                ));
            }
        }
        for policy in creates {
            let exists = sqlx::query("SELECT id FROM policy WHERE id = ?")
                .bind(&policy.id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(db_err)?;
            if exists.is_some() {
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
            bind_policy(sqlx::query(INSERT_POLICY), &created)?
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }
        for policy in updates {
            let expected = plan.snapshot_versions.get(&policy.id).copied().unwrap_or(0);
            let selector_json = policy.selector.as_ref().map(to_json).transpose()?;
            let result = sqlx::query(
                "UPDATE policy SET
                     name = ?, scope = ?, algo_key = ?, selector = ?, mode = ?,
                     authority_required = ?, hard_guards = ?, soft_guards = ?, limits = ?,
                     gates = ?, mutations = ?, schedule = ?, rollout_percent = ?,
                     expires_at = ?, enabled = ?, version = ?, updated_by = ?, updated_at = ?,
                     tenant_id = ?
                 WHERE id = ? AND version = ?",
            )
            .bind(policy.name.clone())
            .bind(scope_as_str(policy.scope))
            .bind(policy.algo_key.clone())
            .bind(selector_json)
            .bind(mode_as_str(policy.mode))
            .bind(authority_as_str(policy.authority_required))
            .bind(to_json(&policy.hard_guards)?)
            .bind(to_json(&policy.soft_guards)?)
            .bind(to_json(&policy.limits)?)
            .bind(to_json(&policy.gates)?)
            .bind(to_json(&policy.mutations)?)
            .bind(policy.schedule.clone())
            .bind(i64::from(policy.rollout_percent))
            .bind(policy.expires_at.map(|dt| dt.to_rfc3339()))
            .bind(policy.enabled)
            .bind(expected + 1)
            .bind(policy.updated_by.clone())
            .bind(now.to_rfc3339())
            .bind(policy.tenant_id.clone())
            .bind(policy.id.clone())
            .bind(expected)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
            if result.rows_affected() == 0 {
                return Err(GovernanceError::conflict(
                    format!("policy {}", policy.id),
                    format!("version {expected} drifted during apply"),
                ));
            }
        }
        for id in &plan.diff.delete {
            sqlx::query("DELETE FROM policy WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }
}
