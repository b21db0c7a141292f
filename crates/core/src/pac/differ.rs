use std::collections::BTreeMap;

use crate::domain::plan::PlanDiff;
use crate::domain::policy::Policy;

/// Semantic equality for plan purposes: everything the document declares,
/// nothing the store bookkeeps (version, author, timestamps).
pub fn semantically_equal(left: &Policy, right: &Policy) -> bool {
    left.id == right.id
        && left.name == right.name
        && left.scope == right.scope
        && left.algo_key == right.algo_key
        && left.selector == right.selector
        && left.mode == right.mode
        && left.authority_required == right.authority_required
        && left.hard_guards == right.hard_guards
        && left.soft_guards == right.soft_guards
        && left.limits == right.limits
        && left.gates == right.gates
        && left.mutations == right.mutations
        && left.schedule == right.schedule
        && left.rollout_percent == right.rollout_percent
        && left.expires_at == right.expires_at
        && left.enabled == right.enabled
        && left.tenant_id == right.tenant_id
}

/// Computes the create/update/delete sets that turn `current` into
/// `desired`. Output ids are sorted for stable plans.
pub fn diff(desired: &[Policy], current: &[Policy]) -> PlanDiff {
    let current_by_id: BTreeMap<&str, &Policy> =
        current.iter().map(|policy| (policy.id.as_str(), policy)).collect();
    let desired_by_id: BTreeMap<&str, &Policy> =
        desired.iter().map(|policy| (policy.id.as_str(), policy)).collect();

    let mut plan = PlanDiff::default();
    for (id, wanted) in &desired_by_id {
        match current_by_id.get(id) {
            None => plan.create.push((*id).to_string()),
            Some(existing) if !semantically_equal(wanted, existing) => {
                plan.update.push((*id).to_string());
            }
            Some(_) => {}
        }
    }
    for id in current_by_id.keys() {
        if !desired_by_id.contains_key(id) {
            plan.delete.push((*id).to_string());
        }
    }
    plan
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use rust_decimal::Decimal;

    use super::{diff, semantically_equal};
    use crate::domain::policy::{Authority, Mode, Mutation, Policy, Scope};

    fn policy(id: &str) -> Policy {
        let now = Utc::now();
        Policy {
            id: id.to_string(),
            name: id.to_string(),
            scope: Scope::Global,
            algo_key: None,
            selector: None,
            mode: Mode::Enforce,
            authority_required: Authority::Operator,
            hard_guards: Vec::new(),
            soft_guards: Vec::new(),
            limits: Vec::new(),
            gates: Vec::new(),
            mutations: Vec::new(),
            schedule: None,
            rollout_percent: 100,
            expires_at: None,
            enabled: true,
            version: 1,
            updated_by: "pac".to_string(),
            updated_at: now,
            created_at: now,
            tenant_id: None,
        }
    }

    #[test]
    fn version_and_timestamps_do_not_count_as_drift() {
        let mut newer = policy("p-1");
        newer.version = 9;
        newer.updated_by = "someone-else".to_string();
        assert!(semantically_equal(&policy("p-1"), &newer));

        let mut changed = policy("p-1");
        changed.mutations.push(Mutation::Clamp {
            param: "weight".to_string(),
            min: Decimal::ZERO,
            max: Decimal::ONE,
        });
        assert!(!semantically_equal(&policy("p-1"), &changed));
    }

    #[test]
    fn diff_partitions_into_create_update_delete() {
        let mut updated = policy("p-update");
        updated.rollout_percent = 25;

        let desired = vec![policy("p-keep"), policy("p-create"), updated];
        let current = vec![policy("p-keep"), policy("p-update"), policy("p-delete")];

        let plan = diff(&desired, &current);
        assert_eq!(plan.create, vec!["p-create"]);
        assert_eq!(plan.update, vec!["p-update"]);
        assert_eq!(plan.delete, vec!["p-delete"]);
        assert!(!plan.is_empty());
    }

    #[test]
    fn identical_sets_produce_an_empty_diff() {
        let desired = vec![policy("p-1"), policy("p-2")];
        let current = vec![policy("p-2"), policy("p-1")];
        assert!(diff(&desired, &current).is_empty());
    }
}
