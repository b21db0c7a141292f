pub mod graph;

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::approvals::{ApprovalRequestInput, ApprovalWorkflow};
use crate::domain::action::{Action, Context};
use crate::domain::approval::Approval;
use crate::domain::evaluation::{
    BlockedAction, Evaluation, EvaluationResult, ModifiedAction, PendingAction,
};
use crate::domain::policy::{Mode, Policy};
use crate::errors::GovernanceError;
use crate::evaluator::graph::{DecisionGraph, GraphRecorder, NodeKind};
use crate::notify::{EventKind, EventSeverity, GovernanceEvent, NotificationSink};
use crate::store::{EvaluationStore, PolicySnapshot, PolicyStore};

/// Deterministic rollout bucket for an entity id: first eight bytes of the
/// blake3 hash as a little-endian u64, mod 100. The same entity always
/// lands in the same bucket.
pub fn stable_bucket(entity_id: &str) -> u8 {
    let hash = blake3::hash(entity_id.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&hash.as_bytes()[..8]);
    (u64::from_le_bytes(bytes) % 100) as u8
}

pub fn rollout_admits(policy: &Policy, entity_id: &str) -> bool {
    policy.rollout_percent >= 100 || stable_bucket(entity_id) < policy.rollout_percent
}

/// Selects the policies applicable to this context, ordered
/// most-specific-first (segment > algorithm > global), ties broken by
/// version descending then id ascending.
pub fn resolve_policies<'a>(snapshot: &'a PolicySnapshot, context: &Context) -> Vec<&'a Policy> {
    let mut applicable: Vec<&Policy> = snapshot
        .policies
        .iter()
        .filter(|policy| policy.is_live(context.now))
        .filter(|policy| policy.tenant_id.is_none() || policy.tenant_id == context.tenant_id)
        .filter(|policy| policy.matches_scope(context))
        .collect();
    applicable.sort_by(|left, right| {
        right
            .scope
            .specificity()
            .cmp(&left.scope.specificity())
            .then_with(|| right.version.cmp(&left.version))
            .then_with(|| left.id.cmp(&right.id))
    });
    applicable
}

#[derive(Clone, Debug)]
pub struct BatchEvaluation {
    pub result: EvaluationResult,
    pub graph: DecisionGraph,
    /// Most specific policy that blocked, escalated, mutated, or recorded a
    /// violation for any action in the batch.
    pub dominant_policy: Option<String>,
}

enum Outcome {
    Allowed(Action),
    Modified(ModifiedAction),
    Blocked(BlockedAction),
    Pending(PendingAction),
}

struct Disposition {
    outcome: Outcome,
    risk: Decimal,
    acted: Option<usize>,
    monitor_findings: Vec<String>,
}

fn merge_acted(acted: Option<usize>, index: usize) -> Option<usize> {
    Some(acted.map_or(index, |current| current.min(index)))
}

/// Pure, deterministic evaluation of one batch against one policy
/// snapshot. All I/O lives in [`Evaluator`].
pub fn evaluate_batch(
    snapshot: &PolicySnapshot,
    actions: &[Action],
    context: &Context,
) -> BatchEvaluation {
    let policies = resolve_policies(snapshot, context);
    let mut recorder = GraphRecorder::new(&context.run_id);
    let mut result = EvaluationResult::default();
    let mut run_risk = Decimal::ZERO;
    let mut dominant: Option<usize> = None;

    for action in actions {
        let disposition = evaluate_action(&policies, action, context, run_risk, &mut recorder);
        run_risk += disposition.risk;
        if let Some(index) = disposition.acted {
            dominant = merge_acted(dominant, index);
        }
        result.monitor_findings.extend(disposition.monitor_findings);
        match disposition.outcome {
            Outcome::Allowed(allowed) => result.allowed.push(allowed),
            Outcome::Modified(modified) => result.modified.push(modified),
            Outcome::Blocked(blocked) => result.blocked.push(blocked),
            Outcome::Pending(pending) => result.pending.push(pending),
        }
    }

    result.risk_cost = run_risk;
    BatchEvaluation {
        result,
        graph: recorder.finish(),
        dominant_policy: dominant.map(|index| policies[index].id.clone()),
    }
}

#[allow(clippy::too_many_arguments)]
fn blocked(
    recorder: &mut GraphRecorder,
    from_node: &str,
    action: &Action,
    policy_id: Option<String>,
    reason: String,
    error: bool,
    acted: Option<usize>,
    monitor_findings: Vec<String>,
) -> Disposition {
    let result_node = recorder.node(NodeKind::Result, "blocked");
    recorder.edge(from_node, &result_node, Some(if error { "error" } else { "blocked" }));
    Disposition {
        outcome: Outcome::Blocked(BlockedAction { action: action.clone(), policy_id, reason, error }),
        risk: Decimal::ZERO,
        acted,
        monitor_findings,
    }
}

fn evaluate_action(
    policies: &[&Policy],
    action: &Action,
    context: &Context,
    run_risk: Decimal,
    recorder: &mut GraphRecorder,
) -> Disposition {
    let action_node =
        recorder.node(NodeKind::Action, format!("{}/{}", action.action_type, action.target_id));
    let mut prev = action_node;
    let mut acted: Option<usize> = None;
    let mut monitor_findings = Vec::new();

    // Stage 2+3: rollout admission, then gates. A failing fail-closed gate
    // blocks the action; a failing open gate deactivates the policy.
    let mut active: Vec<(usize, &Policy)> = Vec::new();
    'policies: for (index, policy) in policies.iter().enumerate() {
        if !rollout_admits(policy, &context.entity_id) {
            continue;
        }
        for gate in &policy.gates {
            let node = recorder.node(NodeKind::Gate, format!("{}:{}", policy.id, gate.describe()));
            if gate.passes(context) {
                recorder.edge(&prev, &node, Some("pass"));
                prev = node;
            } else if gate.fail_closed() {
                recorder.edge(&prev, &node, Some("fail"));
                return blocked(
                    recorder,
                    &node,
                    action,
                    Some(policy.id.clone()),
                    format!("fail-closed gate {} failed", gate.describe()),
                    false,
                    merge_acted(acted, index),
                    monitor_findings,
                );
            } else {
                recorder.edge(&prev, &node, Some("policy_deactivated"));
                prev = node;
                continue 'policies;
            }
        }
        active.push((index, policy));
    }

    // Stage 4: hard guards. Enforce blocks immediately; monitor records.
    for (index, policy) in &active {
        for guard in &policy.hard_guards {
            let node = recorder.node(NodeKind::Guard, format!("{}:{}", policy.id, guard.describe()));
            match guard.check(action) {
                Ok(None) => {
                    recorder.edge(&prev, &node, Some("pass"));
                    prev = node;
                }
                Ok(Some(violation)) => match policy.mode {
                    Mode::Enforce => {
                        recorder.edge(&prev, &node, Some("violation"));
                        return blocked(
                            recorder,
                            &node,
                            action,
                            Some(policy.id.clone()),
                            violation.reason,
                            false,
                            merge_acted(acted, *index),
                            monitor_findings,
                        );
                    }
                    Mode::Monitor => {
                        recorder.edge(&prev, &node, Some("violation_monitored"));
                        prev = node;
                        monitor_findings
                            .push(format!("policy {}: {}", policy.id, violation.reason));
                        acted = merge_acted(acted, *index);
                    }
                },
                Err(fault) => {
                    recorder.edge(&prev, &node, Some("error"));
                    return blocked(
                        recorder,
                        &node,
                        action,
                        Some(policy.id.clone()),
                        format!("internal fault on `{}`: {}", fault.param, fault.detail),
                        true,
                        merge_acted(acted, *index),
                        monitor_findings,
                    );
                }
            }
        }
    }

    // Stage 5: soft guards accrue weighted risk; escalate on budget excess
    // or insufficient authority against a violated policy.
    let mut action_risk = Decimal::ZERO;
    let mut reasons = Vec::new();
    let mut violated: BTreeSet<usize> = BTreeSet::new();
    for (index, policy) in &active {
        for guard in &policy.soft_guards {
            let node = recorder.node(NodeKind::Guard, format!("{}:{}", policy.id, guard.describe()));
            match guard.check(action) {
                Ok(None) => {
                    recorder.edge(&prev, &node, Some("pass"));
                    prev = node;
                }
                Ok(Some(violation)) => {
                    recorder.edge(&prev, &node, Some("violation"));
                    action_risk += violation.weight;
                    reasons.push(format!("policy {}: {}", policy.id, violation.reason));
                    violated.insert(*index);
                    acted = merge_acted(acted, *index);
                    let metric =
                        recorder.node(NodeKind::Metric, format!("risk_cost += {}", violation.weight));
                    recorder.edge(&node, &metric, None);
                    prev = metric;
                }
                Err(fault) => {
                    recorder.edge(&prev, &node, Some("error"));
                    return blocked(
                        recorder,
                        &node,
                        action,
                        Some(policy.id.clone()),
                        format!("internal fault on `{}`: {}", fault.param, fault.detail),
                        true,
                        merge_acted(acted, *index),
                        monitor_findings,
                    );
                }
            }
        }
    }

    let mut escalation: Option<(usize, String)> = None;
    for (index, policy) in &active {
        if violated.contains(index)
            && context.identity.effective_authority() < policy.authority_required
        {
            escalation = Some((
                *index,
                format!(
                    "authority {:?} is below {:?} required by policy {}",
                    context.identity.effective_authority(),
                    policy.authority_required,
                    policy.id
                ),
            ));
            break;
        }
        if let Some(budget) = policy.action_budget() {
            if action_risk > budget {
                escalation = Some((
                    *index,
                    format!(
                        "action risk {action_risk} exceeds budget {budget} of policy {}",
                        policy.id
                    ),
                ));
                break;
            }
        }
        if let Some(budget) = policy.run_budget() {
            if run_risk + action_risk > budget {
                escalation = Some((
                    *index,
                    format!(
                        "run risk {} exceeds budget {budget} of policy {}",
                        run_risk + action_risk,
                        policy.id
                    ),
                ));
                break;
            }
        }
    }
    if let Some((index, reason)) = escalation {
        reasons.push(reason);
        let result_node = recorder.node(NodeKind::Result, "pending");
        recorder.edge(&prev, &result_node, Some("escalate"));
        return Disposition {
            outcome: Outcome::Pending(PendingAction {
                action: action.clone(),
                policy_id: Some(policies[index].id.clone()),
                reasons,
                risk_cost: action_risk,
            }),
            risk: action_risk,
            acted: merge_acted(acted, index),
            monitor_findings,
        };
    }

    // Stage 6: mutations, applied most-specific-first over a working copy.
    let mut parameters = action.parameters.clone();
    let mut changes: Vec<(usize, String, String)> = Vec::new();
    for (index, policy) in &active {
        for mutation in &policy.mutations {
            let node =
                recorder.node(NodeKind::Mutation, format!("{}:{}", policy.id, mutation.describe()));
            match mutation.apply(&mut parameters) {
                Ok(None) => {
                    recorder.edge(&prev, &node, Some("unchanged"));
                    prev = node;
                }
                Ok(Some(change)) => {
                    recorder.edge(&prev, &node, Some("changed"));
                    prev = node;
                    acted = merge_acted(acted, *index);
                    changes.push((
                        *index,
                        policy.id.clone(),
                        format!(
                            "policy {}: {} adjusted {} -> {}",
                            policy.id, change.param, change.before, change.after
                        ),
                    ));
                }
                Err(fault) => {
                    recorder.edge(&prev, &node, Some("error"));
                    return blocked(
                        recorder,
                        &node,
                        action,
                        Some(policy.id.clone()),
                        format!("internal fault on `{}`: {}", fault.param, fault.detail),
                        true,
                        merge_acted(acted, *index),
                        monitor_findings,
                    );
                }
            }
        }
    }

    // Stage 7: classification.
    if changes.is_empty() {
        let result_node = recorder.node(NodeKind::Result, "allowed");
        recorder.edge(&prev, &result_node, None);
        return Disposition {
            outcome: Outcome::Allowed(action.clone()),
            risk: action_risk,
            acted,
            monitor_findings,
        };
    }

    let result_node = recorder.node(NodeKind::Result, "modified");
    recorder.edge(&prev, &result_node, None);
    let after = Action { parameters, ..action.clone() };
    let mut modified_reasons = reasons;
    modified_reasons.extend(changes.iter().map(|(_, _, reason)| reason.clone()));
    Disposition {
        outcome: Outcome::Modified(ModifiedAction {
            before: action.clone(),
            after,
            policy_id: changes.first().map(|(_, policy_id, _)| policy_id.clone()),
            reasons: modified_reasons,
        }),
        risk: action_risk,
        acted,
        monitor_findings,
    }
}

/// Outcome of one governed evaluation call, including the audit record and
/// any approval the escalation opened.
#[derive(Clone, Debug)]
pub struct EvaluationRun {
    pub result: EvaluationResult,
    pub graph: DecisionGraph,
    pub record: Evaluation,
    pub approval: Option<Approval>,
}

/// Async orchestration around the pure pipeline: snapshot resolution,
/// audit-record append, escalation, and event push.
pub struct Evaluator {
    policies: Arc<dyn PolicyStore>,
    evaluations: Arc<dyn EvaluationStore>,
    approvals: ApprovalWorkflow,
    sink: Arc<dyn NotificationSink>,
}

impl Evaluator {
    pub fn new(
        policies: Arc<dyn PolicyStore>,
        evaluations: Arc<dyn EvaluationStore>,
        approvals: ApprovalWorkflow,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        Self { policies, evaluations, approvals, sink }
    }

    pub async fn evaluate(
        &self,
        actions: &[Action],
        context: &Context,
    ) -> Result<EvaluationRun, GovernanceError> {
        let snapshot = self.policies.snapshot().await?;
        let batch = evaluate_batch(&snapshot, actions, context);

        let record = Evaluation {
            id: Uuid::new_v4().to_string(),
            policy_id: batch.dominant_policy.clone(),
            algo_key: context.algo_key.clone(),
            run_id: context.run_id.clone(),
            result: batch.result.verdict(),
            stats: batch.result.stats(),
            risk_cost: batch.result.risk_cost,
            diff: batch.result.modified.clone(),
            created_at: Utc::now(),
            tenant_id: context.tenant_id.clone(),
        };
        self.evaluations.append(&record).await?;

        if !batch.result.blocked.is_empty() {
            self.sink.emit(GovernanceEvent::new(
                EventKind::PolicyViolation,
                EventSeverity::Warning,
                json!({
                    "run_id": context.run_id,
                    "algo_key": context.algo_key,
                    "policy_id": batch.dominant_policy,
                    "blocked": batch.result.blocked.len(),
                    "reasons": batch.result.blocked.iter()
                        .map(|blocked| blocked.reason.clone())
                        .collect::<Vec<_>>(),
                }),
            ));
        }

        let approval = if batch.result.pending.is_empty() {
            None
        } else {
            let pending_actions: Vec<Action> =
                batch.result.pending.iter().map(|pending| pending.action.clone()).collect();
            let pending_risk: Decimal =
                batch.result.pending.iter().map(|pending| pending.risk_cost).sum();
            let reason = batch
                .result
                .pending
                .iter()
                .flat_map(|pending| pending.reasons.iter().cloned())
                .collect::<Vec<_>>()
                .join("; ");
            Some(
                self.approvals
                    .request(ApprovalRequestInput {
                        algo_key: context.algo_key.clone(),
                        run_id: context.run_id.clone(),
                        actions: pending_actions,
                        risk_cost: pending_risk,
                        reason,
                        requested_by: context.identity.actor.clone(),
                    })
                    .await?,
            )
        };

        let stats = batch.result.stats();
        info!(
            event_name = "evaluator.batch_evaluated",
            run_id = %context.run_id,
            algo_key = %context.algo_key,
            allowed = stats.allowed,
            modified = stats.modified,
            blocked = stats.blocked,
            pending = stats.pending,
            risk_cost = %batch.result.risk_cost,
            "evaluated action batch"
        );

        Ok(EvaluationRun { result: batch.result, graph: batch.graph, record, approval })
    }
}
