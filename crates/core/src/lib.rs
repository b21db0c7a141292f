pub mod approvals;
pub mod audit;
pub mod config;
pub mod domain;
pub mod errors;
pub mod evaluator;
pub mod logging;
pub mod notify;
pub mod pac;
pub mod rollout;
pub mod store;

pub use approvals::{ctx_hash, ApprovalRequestInput, ApprovalWorkflow};
pub use audit::replay::{ContextStore, HistoricalRun, ReplayEngine};
pub use audit::{AuditTrail, RunAuditSummary};
pub use config::{AppConfig, ConfigError, ConfigOverrides, LoadOptions, LogFormat};
pub use domain::action::{Action, Context, Identity, ParamValue};
pub use domain::approval::{Approval, ApprovalStatus};
pub use domain::evaluation::{
    BlockedAction, Evaluation, EvaluationResult, EvaluationStats, ModifiedAction, PendingAction,
    RunVerdict,
};
pub use domain::plan::{PacPlan, PlanDiff, PlanStatus};
pub use domain::policy::{
    Authority, Gate, HardGuard, LimitScope, Mode, Mutation, Policy, RiskLimit, Scope, Selector,
    SoftGuard,
};
pub use domain::rollout::{AutoRollbackRule, Comparator, Rollout, RolloutState};
pub use errors::GovernanceError;
pub use evaluator::graph::{DecisionGraph, GraphEdge, GraphNode, NodeKind};
pub use evaluator::{evaluate_batch, BatchEvaluation, EvaluationRun, Evaluator};
pub use notify::{
    EventKind, EventSeverity, GovernanceEvent, InMemoryNotificationSink, NotificationSink,
    NullNotificationSink,
};
pub use pac::loader::{parse_document, render_document, PolicyDoc, PolicyDocument};
pub use pac::{validate, PacService, ValidationResult};
pub use rollout::{MetricsFeed, RolloutController, RolloutMonitor, RolloutRequest, TickOutcome};
pub use store::{
    ApprovalStore, EvaluationStore, MemoryStore, PendingInsert, PlanStore, PolicySnapshot,
    PolicyStore, RolloutStore,
};
