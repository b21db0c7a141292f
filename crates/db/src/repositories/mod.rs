use chrono::{DateTime, Utc};
use thiserror::Error;

use rcp_core::GovernanceError;

pub mod approval;
pub mod evaluation;
pub mod plan;
pub mod policy;
pub mod rollout;

pub use approval::SqlApprovalStore;
pub use evaluation::SqlEvaluationStore;
pub use plan::SqlPlanStore;
pub use policy::SqlPolicyStore;
pub use rollout::SqlRolloutStore;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
}

impl From<RepositoryError> for GovernanceError {
    fn from(err: RepositoryError) -> Self {
        GovernanceError::Store(err.to_string())
    }
}

pub(crate) fn db_err(err: sqlx::Error) -> GovernanceError {
    RepositoryError::Database(err).into()
}

pub(crate) fn decode_err(err: impl std::fmt::Display) -> GovernanceError {
    RepositoryError::Decode(err.to_string()).into()
}

pub(crate) fn to_json<T: serde::Serialize>(value: &T) -> Result<String, GovernanceError> {
    serde_json::to_string(value).map_err(decode_err)
}

pub(crate) fn from_json<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T, GovernanceError> {
    serde_json::from_str(raw).map_err(decode_err)
}

/// Timestamps are stored as RFC 3339 text; anything else in the column is
/// corruption and surfaces as a store error rather than a guessed value.
pub(crate) fn parse_datetime(raw: &str) -> Result<DateTime<Utc>, GovernanceError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| decode_err(format!("timestamp '{raw}': {err}")))
}

pub(crate) fn parse_optional_datetime(
    raw: Option<String>,
) -> Result<Option<DateTime<Utc>>, GovernanceError> {
    raw.as_deref().map(parse_datetime).transpose()
}
