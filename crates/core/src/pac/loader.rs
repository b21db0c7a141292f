use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::policy::{
    Authority, Gate, HardGuard, Mode, Mutation, Policy, RiskLimit, Scope, Selector, SoftGuard,
};
use crate::errors::GovernanceError;

/// Declarative policy-as-code document: a TOML file of `[[policies]]`
/// tables. Server-owned bookkeeping (version, timestamps, author) is not
/// part of the format.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyDocument {
    #[serde(default)]
    pub policies: Vec<PolicyDoc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PolicyDoc {
    pub id: String,
    pub name: String,
    pub scope: Scope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub algo_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<Selector>,
    pub mode: Mode,
    #[serde(default = "default_authority")]
    pub authority_required: Authority,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hard_guards: Vec<HardGuard>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub soft_guards: Vec<SoftGuard>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub limits: Vec<RiskLimit>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gates: Vec<Gate>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mutations: Vec<Mutation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
    #[serde(default = "default_rollout_percent")]
    pub rollout_percent: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
}

fn default_authority() -> Authority {
    Authority::Operator
}

fn default_rollout_percent() -> u8 {
    100
}

fn default_enabled() -> bool {
    true
}

impl PolicyDoc {
    /// Materializes the declarative entry into a policy record. The store
    /// assigns the real version on create/update.
    pub fn into_policy(self, author: &str, now: DateTime<Utc>) -> Policy {
        Policy {
            id: self.id,
            name: self.name,
            scope: self.scope,
            algo_key: self.algo_key,
            selector: self.selector,
            mode: self.mode,
            authority_required: self.authority_required,
            hard_guards: self.hard_guards,
            soft_guards: self.soft_guards,
            limits: self.limits,
            gates: self.gates,
            mutations: self.mutations,
            schedule: self.schedule,
            rollout_percent: self.rollout_percent,
            expires_at: self.expires_at,
            enabled: self.enabled,
            version: 0,
            updated_by: author.to_string(),
            updated_at: now,
            created_at: now,
            tenant_id: self.tenant_id,
        }
    }

    pub fn from_policy(policy: &Policy) -> Self {
        Self {
            id: policy.id.clone(),
            name: policy.name.clone(),
            scope: policy.scope,
            algo_key: policy.algo_key.clone(),
            selector: policy.selector.clone(),
            mode: policy.mode,
            authority_required: policy.authority_required,
            hard_guards: policy.hard_guards.clone(),
            soft_guards: policy.soft_guards.clone(),
            limits: policy.limits.clone(),
            gates: policy.gates.clone(),
            mutations: policy.mutations.clone(),
            schedule: policy.schedule.clone(),
            rollout_percent: policy.rollout_percent,
            expires_at: policy.expires_at,
            enabled: policy.enabled,
            tenant_id: policy.tenant_id.clone(),
        }
    }
}

pub fn parse_document(text: &str) -> Result<PolicyDocument, GovernanceError> {
    toml::from_str(text)
        .map_err(|err| GovernanceError::Validation(format!("malformed policy document: {err}")))
}

pub fn render_document(document: &PolicyDocument) -> Result<String, GovernanceError> {
    toml::to_string_pretty(document)
        .map_err(|err| GovernanceError::Validation(format!("unrenderable policy document: {err}")))
}
