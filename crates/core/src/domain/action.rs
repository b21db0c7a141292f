use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::policy::Authority;

/// A single parameter value carried by a proposed action. Numeric values use
/// `Decimal` so guard arithmetic is exact for money-adjacent quantities.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Number(Decimal),
    Flag(bool),
    Text(String),
}

impl ParamValue {
    pub fn as_number(&self) -> Option<Decimal> {
        match self {
            Self::Number(value) => Some(*value),
            _ => None,
        }
    }
}

impl From<Decimal> for ParamValue {
    fn from(value: Decimal) -> Self {
        Self::Number(value)
    }
}

/// A proposed action produced by an external algorithm. Transient: consumed
/// once per evaluation call and never persisted verbatim outside an
/// evaluation diff or an approval snapshot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub action_type: String,
    pub target_id: String,
    pub algorithm_id: String,
    pub segment_id: Option<String>,
    pub parameters: BTreeMap<String, ParamValue>,
}

impl Action {
    pub fn parameter(&self, name: &str) -> Option<&ParamValue> {
        self.parameters.get(name)
    }
}

/// The acting identity submitting a batch. A missing authority is treated as
/// the lowest privilege level; the evaluator never guesses upward.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub actor: String,
    pub authority: Option<Authority>,
}

impl Identity {
    pub fn effective_authority(&self) -> Authority {
        self.authority.unwrap_or(Authority::Operator)
    }
}

/// Call-scoped evaluation context. The clock is carried here rather than
/// read ambiently so identical inputs always evaluate identically.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Context {
    pub run_id: String,
    pub algo_key: String,
    /// Bucketing key for rollout admission: the same entity id always lands
    /// in the same percent bucket.
    pub entity_id: String,
    pub tenant_id: Option<String>,
    pub identity: Identity,
    /// Segment-matching fields (region, campaign, tier, ...).
    pub attributes: BTreeMap<String, String>,
    /// Kill-switch flags consulted by gates.
    pub flags: BTreeMap<String, bool>,
    pub now: DateTime<Utc>,
}

impl Context {
    pub fn flag(&self, name: &str) -> bool {
        self.flags.get(name).copied().unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;

    use super::{Identity, ParamValue};
    use crate::domain::policy::Authority;

    #[test]
    fn missing_authority_degrades_to_lowest_privilege() {
        let identity = Identity { actor: "bidder-7".to_string(), authority: None };
        assert_eq!(identity.effective_authority(), Authority::Operator);
    }

    #[test]
    fn only_numbers_expose_a_numeric_view() {
        assert_eq!(ParamValue::Number(Decimal::new(15, 2)).as_number(), Some(Decimal::new(15, 2)));
        assert_eq!(ParamValue::Text("0.15".to_string()).as_number(), None);
        assert_eq!(ParamValue::Flag(true).as_number(), None);
    }
}
