use thiserror::Error;

use crate::domain::rollout::RolloutState;

/// Core error taxonomy for the governance surface.
///
/// `Validation` is always recoverable by fixing input. `Conflict` means an
/// optimistic-concurrency loss or a duplicate rollout start and the caller
/// should re-plan and retry. `InvalidState`/`InvalidTransition` are caller
/// logic errors and are surfaced verbatim with the current state so the
/// caller can correct itself. Per-action evaluation faults never surface
/// here; they degrade to a fail-closed block inside the result.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum GovernanceError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("conflict on {resource}: {detail}")]
    Conflict { resource: String, detail: String },
    #[error("{entity} {id} is in state {current} and cannot accept this operation")]
    InvalidState { entity: String, id: String, current: String },
    #[error("invalid rollout transition from {from:?} to {to:?}")]
    InvalidTransition { from: RolloutState, to: RolloutState },
    #[error("{kind} not found: {id}")]
    NotFound { kind: String, id: String },
    #[error("evaluation fault: {0}")]
    Evaluation(String),
    #[error("store failure: {0}")]
    Store(String),
}

impl GovernanceError {
    pub fn not_found(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound { kind: kind.into(), id: id.into() }
    }

    pub fn conflict(resource: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Conflict { resource: resource.into(), detail: detail.into() }
    }

    pub fn invalid_state(
        entity: impl Into<String>,
        id: impl Into<String>,
        current: impl Into<String>,
    ) -> Self {
        Self::InvalidState { entity: entity.into(), id: id.into(), current: current.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::GovernanceError;
    use crate::domain::rollout::RolloutState;

    #[test]
    fn display_carries_retry_context() {
        let conflict = GovernanceError::conflict("policy p-1", "version 3 expected, found 5");
        assert_eq!(conflict.to_string(), "conflict on policy p-1: version 3 expected, found 5");

        let transition = GovernanceError::InvalidTransition {
            from: RolloutState::Completed,
            to: RolloutState::Active,
        };
        assert!(transition.to_string().contains("Completed"));
        assert!(transition.to_string().contains("Active"));
    }
}
