use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::Row;

use rcp_core::domain::approval::{Approval, ApprovalStatus};
use rcp_core::store::{ApprovalStore, PendingInsert};
use rcp_core::GovernanceError;

use super::{db_err, decode_err, from_json, parse_datetime, parse_optional_datetime, to_json};
use crate::DbPool;

const APPROVAL_COLUMNS: &str = "id, algo_key, run_id, reason, risk_cost, actions, ctx_hash,
     status, requested_by, decided_by, decided_at, note, created_at";

pub struct SqlApprovalStore {
    pool: DbPool,
}

impl SqlApprovalStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn fetch_pending_by_ctx_hash(
        &self,
        ctx_hash: &str,
    ) -> Result<Option<Approval>, GovernanceError> {
        let row = sqlx::query(&format!(
            "SELECT {APPROVAL_COLUMNS} FROM approval WHERE ctx_hash = ? AND status = 'pending'"
        ))
        .bind(ctx_hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        match row {
            Some(ref r) => Ok(Some(row_to_approval(r)?)),
            None => Ok(None),
        }
    }
}

fn status_as_str(status: ApprovalStatus) -> &'static str {
    match status {
        ApprovalStatus::Pending => "pending",
        ApprovalStatus::Approved => "approved",
        ApprovalStatus::Rejected => "rejected",
    }
}

fn parse_status(raw: &str) -> Result<ApprovalStatus, GovernanceError> {
    match raw {
        "pending" => Ok(ApprovalStatus::Pending),
        "approved" => Ok(ApprovalStatus::Approved),
        "rejected" => Ok(ApprovalStatus::Rejected),
        other => Err(decode_err(format!("unknown approval status '{other}'"))),
    }
}

fn row_to_approval(row: &sqlx::sqlite::SqliteRow) -> Result<Approval, GovernanceError> {
    let risk_cost: String = row.try_get("risk_cost").map_err(decode_err)?;
    let actions_json: String = row.try_get("actions").map_err(decode_err)?;
    let status_str: String = row.try_get("status").map_err(decode_err)?;
    let decided_at: Option<String> = row.try_get("decided_at").map_err(decode_err)?;
    let created_at: String = row.try_get("created_at").map_err(decode_err)?;

    Ok(Approval {
        id: row.try_get("id").map_err(decode_err)?,
        algo_key: row.try_get("algo_key").map_err(decode_err)?,
        run_id: row.try_get("run_id").map_err(decode_err)?,
        reason: row.try_get("reason").map_err(decode_err)?,
        risk_cost: risk_cost.parse::<Decimal>().map_err(decode_err)?,
        actions: from_json(&actions_json)?,
        ctx_hash: row.try_get("ctx_hash").map_err(decode_err)?,
        status: parse_status(&status_str)?,
        requested_by: row.try_get("requested_by").map_err(decode_err)?,
        decided_by: row.try_get("decided_by").map_err(decode_err)?,
        decided_at: parse_optional_datetime(decided_at)?,
        note: row.try_get("note").map_err(decode_err)?,
        created_at: parse_datetime(&created_at)?,
    })
}

#[async_trait]
impl ApprovalStore for SqlApprovalStore {
    async fn insert_pending(&self, approval: Approval) -> Result<PendingInsert, GovernanceError> {
        // The partial unique index on (ctx_hash) WHERE status = 'pending'
        // makes this a single atomic insert-if-absent.
        let result = sqlx::query(
            "INSERT INTO approval (id, algo_key, run_id, reason, risk_cost, actions, ctx_hash,
                                   status, requested_by, decided_by, decided_at, note, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT DO NOTHING",
        )
        .bind(&approval.id)
        .bind(&approval.algo_key)
        .bind(&approval.run_id)
        .bind(&approval.reason)
        .bind(approval.risk_cost.to_string())
        .bind(to_json(&approval.actions)?)
        .bind(&approval.ctx_hash)
        .bind(status_as_str(approval.status))
        .bind(&approval.requested_by)
        .bind(&approval.decided_by)
        .bind(approval.decided_at.map(|dt| dt.to_rfc3339()))
        .bind(&approval.note)
        .bind(approval.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() > 0 {
            return Ok(PendingInsert::Created(approval));
        }

        let existing =
            self.fetch_pending_by_ctx_hash(&approval.ctx_hash).await?.ok_or_else(|| {
                GovernanceError::conflict(
                    format!("approval for ctx {}", approval.ctx_hash),
                    "pending row decided during insert",
                )
            })?;
        Ok(PendingInsert::Existing(existing))
    }

    async fn get(&self, id: &str) -> Result<Option<Approval>, GovernanceError> {
        let row = sqlx::query(&format!("SELECT {APPROVAL_COLUMNS} FROM approval WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        match row {
            Some(ref r) => Ok(Some(row_to_approval(r)?)),
            None => Ok(None),
        }
    }

    async fn latest_by_ctx_hash(
        &self,
        ctx_hash: &str,
    ) -> Result<Option<Approval>, GovernanceError> {
        let row = sqlx::query(&format!(
            "SELECT {APPROVAL_COLUMNS} FROM approval
             WHERE ctx_hash = ?
             ORDER BY created_at DESC
             LIMIT 1"
        ))
        .bind(ctx_hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        match row {
            Some(ref r) => Ok(Some(row_to_approval(r)?)),
            None => Ok(None),
        }
    }

    async fn decide(
        &self,
        id: &str,
        status: ApprovalStatus,
        decided_by: &str,
        note: Option<String>,
        decided_at: DateTime<Utc>,
    ) -> Result<Approval, GovernanceError> {
        let result = sqlx::query(
            "UPDATE approval
             SET status = ?, decided_by = ?, decided_at = ?, note = ?
             WHERE id = ? AND status = 'pending'",
        )
        .bind(status_as_str(status))
        .bind(decided_by)
        .bind(decided_at.to_rfc3339())
        .bind(&note)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return match self.get(id).await? {
                Some(current) => Err(GovernanceError::invalid_state(
                    "approval",
                    id,
                    format!("{:?}", current.status),
                )),
                None => Err(GovernanceError::not_found("approval", id)),
            };
        }

        self.get(id).await?.ok_or_else(|| GovernanceError::not_found("approval", id))
    }

    async fn list_pending(&self, limit: u32) -> Result<Vec<Approval>, GovernanceError> {
        let rows = sqlx::query(&format!(
            "SELECT {APPROVAL_COLUMNS} FROM approval
             WHERE status = 'pending'
             ORDER BY created_at ASC
             LIMIT ?"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(row_to_approval).collect()
    }
}
