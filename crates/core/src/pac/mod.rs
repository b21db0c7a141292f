pub mod differ;
pub mod loader;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use crate::domain::plan::{PacPlan, PlanStatus};
use crate::domain::policy::{HardGuard, Policy, Scope, SoftGuard};
use crate::errors::GovernanceError;
use crate::pac::loader::{PolicyDoc, PolicyDocument};
use crate::store::{PlanStore, PolicyStore};

/// Outcome of validating a policy document. `normalized` is only usable
/// when `valid` is true; warnings never fail validation.
#[derive(Clone, Debug)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub normalized: Vec<Policy>,
}

/// Structural and semantic validation of a policy document. Structural
/// failures (unknown guard kinds, type errors) already failed at parse
/// time; this layer checks cross-field rules.
pub fn validate(document: &PolicyDocument, author: &str) -> ValidationResult {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();
    let now = Utc::now();

    let mut seen = BTreeSet::new();
    for doc in &document.policies {
        if !seen.insert(doc.id.clone()) {
            errors.push(format!("policy {}: duplicate id", doc.id));
        }
        validate_policy(doc, &mut errors, &mut warnings);
    }

    let valid = errors.is_empty();
    let normalized = if valid {
        document.policies.iter().map(|doc| doc.clone().into_policy(author, now)).collect()
    } else {
        Vec::new()
    };
    ValidationResult { valid, errors, warnings, normalized }
}

fn validate_policy(doc: &PolicyDoc, errors: &mut Vec<String>, warnings: &mut Vec<String>) {
    let id = &doc.id;
    if doc.rollout_percent > 100 {
        errors.push(format!("policy {id}: rollout_percent {} out of range 0..=100", doc.rollout_percent));
    }
    match doc.scope {
        Scope::Algorithm => {
            if doc.algo_key.as_deref().map_or(true, str::is_empty) {
                errors.push(format!("policy {id}: algorithm scope requires algo_key"));
            }
        }
        Scope::Segment => {
            if doc.selector.as_ref().map_or(true, |selector| selector.attributes.is_empty()) {
                errors.push(format!("policy {id}: segment scope requires a non-empty selector"));
            }
        }
        Scope::Global => {
            if doc.selector.is_some() {
                warnings.push(format!("policy {id}: selector on a global policy is ignored"));
            }
        }
    }

    for guard in &doc.hard_guards {
        if let HardGuard::Bounds { param, min, max } = guard {
            if min > max {
                errors.push(format!("policy {id}: inverted bounds [{min}, {max}] on {param}"));
            }
        }
    }
    for mutation in &doc.mutations {
        if let crate::domain::policy::Mutation::Clamp { param, min, max } = mutation {
            if min > max {
                errors.push(format!("policy {id}: inverted clamp range [{min}, {max}] on {param}"));
            }
        }
    }
    for gate in &doc.gates {
        if let crate::domain::policy::Gate::TimeWindow { start_hour, end_hour, .. } = gate {
            if *start_hour > 23 || *end_hour > 24 {
                errors.push(format!(
                    "policy {id}: time window {start_hour}..{end_hour} outside 0..=24"
                ));
            }
        }
    }

    // A soft guard at least as loose as a hard guard on the same parameter
    // can never fire: the hard guard blocks first.
    for soft in &doc.soft_guards {
        for hard in &doc.hard_guards {
            match (soft, hard) {
                (
                    SoftGuard::MaxDelta { param, baseline, max_delta: soft_delta, .. },
                    HardGuard::MaxDelta {
                        param: hard_param,
                        baseline: hard_baseline,
                        max_delta: hard_delta,
                    },
                ) if param == hard_param && baseline == hard_baseline => {
                    if soft_delta >= hard_delta {
                        warnings.push(format!(
                            "policy {id}: soft max_delta {soft_delta} on {param} is shadowed by hard max_delta {hard_delta}"
                        ));
                    }
                }
                (
                    SoftGuard::MaxValue { param, max: soft_max, .. },
                    HardGuard::Bounds { param: hard_param, max: hard_max, .. },
                ) if param == hard_param => {
                    if soft_max >= hard_max {
                        warnings.push(format!(
                            "policy {id}: soft max {soft_max} on {param} is shadowed by hard bound {hard_max}"
                        ));
                    }
                }
                _ => {}
            }
        }
    }
}

/// GitOps surface over the policy store: validate a document, plan the
/// change set against the live snapshot, apply exactly once with optimistic
/// version checks, export the live set back into the document format.
pub struct PacService {
    policies: Arc<dyn PolicyStore>,
    plans: Arc<dyn PlanStore>,
}

impl PacService {
    pub fn new(policies: Arc<dyn PolicyStore>, plans: Arc<dyn PlanStore>) -> Self {
        Self { policies, plans }
    }

    /// Validates and diffs the document against the current snapshot,
    /// persisting the resulting plan in `Pending`.
    pub async fn plan(
        &self,
        document: &PolicyDocument,
        author: &str,
        dry_run: bool,
    ) -> Result<PacPlan, GovernanceError> {
        let validation = validate(document, author);
        if !validation.valid {
            return Err(GovernanceError::Validation(validation.errors.join("; ")));
        }

        let snapshot = self.policies.snapshot().await?;
        let diff = differ::diff(&validation.normalized, &snapshot.policies);

        let current_versions: BTreeMap<&str, i64> =
            snapshot.policies.iter().map(|policy| (policy.id.as_str(), policy.version)).collect();
        let snapshot_versions = diff
            .update
            .iter()
            .chain(diff.delete.iter())
            .filter_map(|id| current_versions.get(id.as_str()).map(|version| (id.clone(), *version)))
            .collect();

        let plan = PacPlan {
            id: Uuid::new_v4().to_string(),
            author: author.to_string(),
            diff,
            snapshot_versions,
            dry_run,
            status: PlanStatus::Pending,
            created_at: Utc::now(),
            applied_at: None,
            error_message: None,
        };
        self.plans.insert(&plan).await?;
        info!(
            event_name = "pac.planned",
            plan_id = %plan.id,
            author = %author,
            create = plan.diff.create.len(),
            update = plan.diff.update.len(),
            delete = plan.diff.delete.len(),
            dry_run = dry_run,
            "planned policy change set"
        );
        Ok(plan)
    }

    /// Applies a pending plan using the same document it was planned from.
    /// The diff is recomputed and must match the plan, so a document edited
    /// after planning cannot smuggle changes past review.
    pub async fn apply(
        &self,
        plan_id: &str,
        document: &PolicyDocument,
    ) -> Result<PacPlan, GovernanceError> {
        let plan = self
            .plans
            .get(plan_id)
            .await?
            .ok_or_else(|| GovernanceError::not_found("plan", plan_id))?;
        if plan.status != PlanStatus::Pending {
            return Err(GovernanceError::invalid_state(
                "plan",
                plan_id,
                format!("{:?}", plan.status),
            ));
        }
        if plan.dry_run {
            return Err(GovernanceError::Validation(format!(
                "plan {plan_id} is a dry run and cannot be applied"
            )));
        }

        let validation = validate(document, &plan.author);
        if !validation.valid {
            return Err(GovernanceError::Validation(validation.errors.join("; ")));
        }
        let snapshot = self.policies.snapshot().await?;
        let recomputed = differ::diff(&validation.normalized, &snapshot.policies);
        if recomputed != plan.diff {
            let message = "document or policy set changed since planning".to_string();
            self.plans
                .mark(plan_id, PlanStatus::Failed, None, Some(message.clone()))
                .await?;
            return Err(GovernanceError::conflict(format!("plan {plan_id}"), message));
        }

        let by_id: BTreeMap<&str, &Policy> =
            validation.normalized.iter().map(|policy| (policy.id.as_str(), policy)).collect();
        let creates: Vec<Policy> = plan
            .diff
            .create
            .iter()
            .filter_map(|id| by_id.get(id.as_str()).map(|policy| (*policy).clone()))
            .collect();
        let updates: Vec<Policy> = plan
            .diff
            .update
            .iter()
            .filter_map(|id| by_id.get(id.as_str()).map(|policy| (*policy).clone()))
            .collect();

        match self.policies.apply_plan(&plan, &creates, &updates).await {
            Ok(()) => {
                let applied_at = Utc::now();
                self.plans.mark(plan_id, PlanStatus::Applied, Some(applied_at), None).await?;
                info!(
                    event_name = "pac.applied",
                    plan_id = %plan_id,
                    author = %plan.author,
                    "applied policy change set"
                );
                Ok(PacPlan {
                    status: PlanStatus::Applied,
                    applied_at: Some(applied_at),
                    ..plan
                })
            }
            Err(err) => {
                self.plans
                    .mark(plan_id, PlanStatus::Failed, None, Some(err.to_string()))
                    .await?;
                Err(err)
            }
        }
    }

    /// Renders the live policy set as a document, sorted by id.
    pub async fn export(&self) -> Result<PolicyDocument, GovernanceError> {
        let snapshot = self.policies.snapshot().await?;
        let mut policies: Vec<PolicyDoc> =
            snapshot.policies.iter().map(PolicyDoc::from_policy).collect();
        policies.sort_by(|left, right| left.id.cmp(&right.id));
        Ok(PolicyDocument { policies })
    }
}
