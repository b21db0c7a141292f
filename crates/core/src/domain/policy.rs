use std::collections::BTreeMap;

use chrono::{DateTime, Timelike, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::action::{Action, Context, ParamValue};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Global,
    Algorithm,
    Segment,
}

impl Scope {
    /// Resolution specificity: segment > algorithm > global.
    pub fn specificity(self) -> u8 {
        match self {
            Self::Segment => 2,
            Self::Algorithm => 1,
            Self::Global => 0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Monitor,
    Enforce,
}

/// Privilege ladder for approving escalations. Variant order is the
/// privilege order: `Operator < Admin < DgAi`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Authority {
    Operator,
    Admin,
    DgAi,
}

/// Structured match predicate for segment-scoped policies: every entry must
/// equal the corresponding context attribute.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selector {
    pub attributes: BTreeMap<String, String>,
}

impl Selector {
    pub fn matches(&self, attributes: &BTreeMap<String, String>) -> bool {
        self.attributes
            .iter()
            .all(|(key, want)| attributes.get(key).is_some_and(|have| have == want))
    }
}

/// Raised when a guard or mutation references a parameter it cannot read.
/// The evaluator treats this as an internal fault and fails closed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParamFault {
    pub param: String,
    pub detail: String,
}

impl ParamFault {
    fn missing(param: &str) -> Self {
        Self { param: param.to_string(), detail: "parameter is missing".to_string() }
    }

    fn non_numeric(param: &str) -> Self {
        Self { param: param.to_string(), detail: "parameter is not numeric".to_string() }
    }
}

fn numeric_param(action: &Action, param: &str) -> Result<Decimal, ParamFault> {
    let value = action.parameter(param).ok_or_else(|| ParamFault::missing(param))?;
    value.as_number().ok_or_else(|| ParamFault::non_numeric(param))
}

/// Content-independent admission check. A failing `fail_closed` gate blocks
/// the action outright; a failing open gate merely deactivates the policy
/// for that action.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Gate {
    TimeWindow { start_hour: u8, end_hour: u8, fail_closed: bool },
    KillSwitch { flag: String, fail_closed: bool },
}

impl Gate {
    pub fn fail_closed(&self) -> bool {
        match self {
            Self::TimeWindow { fail_closed, .. } | Self::KillSwitch { fail_closed, .. } => {
                *fail_closed
            }
        }
    }

    pub fn passes(&self, context: &Context) -> bool {
        match self {
            Self::TimeWindow { start_hour, end_hour, .. } => {
                let hour = context.now.hour() as u8;
                if start_hour <= end_hour {
                    (*start_hour..*end_hour).contains(&hour)
                } else {
                    // Overnight window, e.g. 22..6.
                    hour >= *start_hour || hour < *end_hour
                }
            }
            Self::KillSwitch { flag, .. } => !context.flag(flag),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Self::TimeWindow { start_hour, end_hour, .. } => {
                format!("time_window[{start_hour}..{end_hour})")
            }
            Self::KillSwitch { flag, .. } => format!("kill_switch[{flag}]"),
        }
    }
}

/// Hard predicate over action parameters. A failure blocks under
/// `Mode::Enforce` and is recorded without blocking under `Mode::Monitor`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HardGuard {
    MaxDelta { param: String, baseline: String, max_delta: Decimal },
    Bounds { param: String, min: Decimal, max: Decimal },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardViolation {
    pub reason: String,
}

impl HardGuard {
    pub fn check(&self, action: &Action) -> Result<Option<GuardViolation>, ParamFault> {
        match self {
            Self::MaxDelta { param, baseline, max_delta } => {
                let proposed = numeric_param(action, param)?;
                let previous = numeric_param(action, baseline)?;
                let delta = (proposed - previous).abs();
                Ok((delta > *max_delta).then(|| GuardViolation {
                    reason: format!(
                        "|{param} - {baseline}| = {delta} exceeds max_delta {max_delta}"
                    ),
                }))
            }
            Self::Bounds { param, min, max } => {
                if min > max {
                    return Err(ParamFault {
                        param: param.clone(),
                        detail: format!("inverted bounds [{min}, {max}]"),
                    });
                }
                let value = numeric_param(action, param)?;
                Ok((value < *min || value > *max).then(|| GuardViolation {
                    reason: format!("{param} = {value} outside bounds [{min}, {max}]"),
                }))
            }
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Self::MaxDelta { param, max_delta, .. } => format!("max_delta[{param}<={max_delta}]"),
            Self::Bounds { param, min, max } => format!("bounds[{param} in {min}..{max}]"),
        }
    }
}

/// Soft predicate: a failure never blocks by itself but contributes its
/// weight to the accumulated risk cost.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SoftGuard {
    MaxDelta { param: String, baseline: String, max_delta: Decimal, weight: Decimal },
    MaxValue { param: String, max: Decimal, weight: Decimal },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SoftViolation {
    pub reason: String,
    pub weight: Decimal,
}

impl SoftGuard {
    pub fn weight(&self) -> Decimal {
        match self {
            Self::MaxDelta { weight, .. } | Self::MaxValue { weight, .. } => *weight,
        }
    }

    pub fn check(&self, action: &Action) -> Result<Option<SoftViolation>, ParamFault> {
        match self {
            Self::MaxDelta { param, baseline, max_delta, weight } => {
                let proposed = numeric_param(action, param)?;
                let previous = numeric_param(action, baseline)?;
                let delta = (proposed - previous).abs();
                Ok((delta > *max_delta).then(|| SoftViolation {
                    reason: format!(
                        "|{param} - {baseline}| = {delta} exceeds soft max_delta {max_delta}"
                    ),
                    weight: *weight,
                }))
            }
            Self::MaxValue { param, max, weight } => {
                let value = numeric_param(action, param)?;
                Ok((value > *max).then(|| SoftViolation {
                    reason: format!("{param} = {value} exceeds soft max {max}"),
                    weight: *weight,
                }))
            }
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Self::MaxDelta { param, max_delta, .. } => {
                format!("soft_max_delta[{param}<={max_delta}]")
            }
            Self::MaxValue { param, max, .. } => format!("soft_max[{param}<={max}]"),
        }
    }
}

/// Deterministic correction applied to actions that were neither blocked
/// nor escalated.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Mutation {
    Clamp { param: String, min: Decimal, max: Decimal },
    Quantize { param: String, scale: u32 },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationChange {
    pub param: String,
    pub before: Decimal,
    pub after: Decimal,
}

impl Mutation {
    pub fn apply(
        &self,
        parameters: &mut BTreeMap<String, ParamValue>,
    ) -> Result<Option<MutationChange>, ParamFault> {
        match self {
            Self::Clamp { param, min, max } => {
                if min > max {
                    return Err(ParamFault {
                        param: param.clone(),
                        detail: format!("inverted clamp range [{min}, {max}]"),
                    });
                }
                let value = parameters.get(param).ok_or_else(|| ParamFault::missing(param))?;
                let before = value.as_number().ok_or_else(|| ParamFault::non_numeric(param))?;
                let after = before.clamp(*min, *max);
                if after == before {
                    return Ok(None);
                }
                parameters.insert(param.clone(), ParamValue::Number(after));
                Ok(Some(MutationChange { param: param.clone(), before, after }))
            }
            Self::Quantize { param, scale } => {
                let value = parameters.get(param).ok_or_else(|| ParamFault::missing(param))?;
                let before = value.as_number().ok_or_else(|| ParamFault::non_numeric(param))?;
                let after = before.round_dp(*scale);
                if after == before {
                    return Ok(None);
                }
                parameters.insert(param.clone(), ParamValue::Number(after));
                Ok(Some(MutationChange { param: param.clone(), before, after }))
            }
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Clamp { param, min, max } => format!("clamp[{param} into {min}..{max}]"),
            Self::Quantize { param, scale } => format!("quantize[{param}@{scale}dp]"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitScope {
    Action,
    Run,
}

/// Risk budget: when accumulated soft-guard weight crosses the budget the
/// action escalates instead of proceeding to mutation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RiskLimit {
    pub scope: LimitScope,
    pub budget: Decimal,
}

/// A Runtime Control Policy. Owned by the policy store; every mutation
/// increments `version`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub id: String,
    pub name: String,
    pub scope: Scope,
    pub algo_key: Option<String>,
    pub selector: Option<Selector>,
    pub mode: Mode,
    pub authority_required: Authority,
    pub hard_guards: Vec<HardGuard>,
    pub soft_guards: Vec<SoftGuard>,
    pub limits: Vec<RiskLimit>,
    pub gates: Vec<Gate>,
    pub mutations: Vec<Mutation>,
    pub schedule: Option<String>,
    pub rollout_percent: u8,
    pub expires_at: Option<DateTime<Utc>>,
    pub enabled: bool,
    pub version: i64,
    pub updated_by: String,
    pub updated_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub tenant_id: Option<String>,
}

impl Policy {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.expires_at.map_or(true, |expiry| expiry > now)
    }

    /// Scope matching per resolution rules. A selector on a global policy is
    /// ignored rather than rejected.
    pub fn matches_scope(&self, context: &Context) -> bool {
        match self.scope {
            Scope::Global => true,
            Scope::Algorithm => self.algo_key.as_deref() == Some(context.algo_key.as_str()),
            Scope::Segment => self
                .selector
                .as_ref()
                .is_some_and(|selector| selector.matches(&context.attributes)),
        }
    }

    pub fn action_budget(&self) -> Option<Decimal> {
        self.limits
            .iter()
            .filter(|limit| limit.scope == LimitScope::Action)
            .map(|limit| limit.budget)
            .min()
    }

    pub fn run_budget(&self) -> Option<Decimal> {
        self.limits
            .iter()
            .filter(|limit| limit.scope == LimitScope::Run)
            .map(|limit| limit.budget)
            .min()
    }
}
