use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::json;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::rollout::{AutoRollbackRule, Rollout, RolloutState};
use crate::errors::GovernanceError;
use crate::notify::{EventKind, EventSeverity, GovernanceEvent, NotificationSink};
use crate::store::{PolicyStore, RolloutStore};

/// External metric source the monitor polls for breach detection. `None`
/// means the metric has no data for the window yet.
#[async_trait]
pub trait MetricsFeed: Send + Sync {
    async fn metric_value(
        &self,
        metric: &str,
        window: Duration,
    ) -> Result<Option<Decimal>, GovernanceError>;
}

#[derive(Clone, Debug)]
pub struct RolloutRequest {
    pub policy_id: String,
    pub to_percent: u8,
    pub reason: String,
    pub auto_rollback_rule: AutoRollbackRule,
}

/// Drives the rollout state machine. Every state change goes through the
/// store's compare-and-swap, so a racing monitor and a manual operator can
/// never both land a terminal transition.
pub struct RolloutController {
    policies: Arc<dyn PolicyStore>,
    rollouts: Arc<dyn RolloutStore>,
    sink: Arc<dyn NotificationSink>,
}

impl RolloutController {
    pub fn new(
        policies: Arc<dyn PolicyStore>,
        rollouts: Arc<dyn RolloutStore>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        Self { policies, rollouts, sink }
    }

    /// Stages a new rollout in `Pending`. The policy's current percentage is
    /// captured as the rollback target.
    pub async fn begin(&self, request: RolloutRequest) -> Result<Rollout, GovernanceError> {
        if request.to_percent > 100 {
            return Err(GovernanceError::Validation(format!(
                "to_percent {} is out of range 0..=100",
                request.to_percent
            )));
        }
        let policy = self
            .policies
            .get(&request.policy_id)
            .await?
            .ok_or_else(|| GovernanceError::not_found("policy", &request.policy_id))?;

        let rollout = Rollout {
            id: Uuid::new_v4().to_string(),
            policy_id: request.policy_id,
            from_percent: policy.rollout_percent,
            to_percent: request.to_percent,
            state: RolloutState::Pending,
            reason: request.reason,
            auto_rollback_rule: request.auto_rollback_rule,
            created_at: Utc::now(),
            completed_at: None,
        };
        self.rollouts.insert(&rollout).await?;
        info!(
            event_name = "rollout.staged",
            rollout_id = %rollout.id,
            policy_id = %rollout.policy_id,
            from_percent = rollout.from_percent,
            to_percent = rollout.to_percent,
            "staged rollout"
        );
        Ok(rollout)
    }

    /// Stages and immediately activates a rollout.
    pub async fn start(&self, request: RolloutRequest) -> Result<Rollout, GovernanceError> {
        let rollout = self.begin(request).await?;
        self.activate(&rollout.id).await
    }

    /// Activates a staged rollout and pushes the target percentage onto the
    /// policy. Fails with `Conflict` while another rollout of the same
    /// policy is still active.
    pub async fn activate(&self, rollout_id: &str) -> Result<Rollout, GovernanceError> {
        let rollout = self.require(rollout_id).await?;
        if let Some(active) = self.rollouts.active_for_policy(&rollout.policy_id).await? {
            return Err(GovernanceError::conflict(
                format!("rollout for policy {}", rollout.policy_id),
                format!("rollout {} is already active", active.id),
            ));
        }
        let rollout = self
            .transition(rollout, RolloutState::Pending, RolloutState::Active, None)
            .await?;
        self.policies
            .set_rollout_percent(&rollout.policy_id, rollout.to_percent, "rollout-controller")
            .await?;
        info!(
            event_name = "rollout.activated",
            rollout_id = %rollout.id,
            policy_id = %rollout.policy_id,
            to_percent = rollout.to_percent,
            "activated rollout"
        );
        Ok(rollout)
    }

    /// Marks an active rollout as baked. The policy keeps the target
    /// percentage.
    pub async fn complete(&self, rollout_id: &str) -> Result<Rollout, GovernanceError> {
        let rollout = self.require(rollout_id).await?;
        let rollout = self
            .transition(rollout, RolloutState::Active, RolloutState::Completed, Some(Utc::now()))
            .await?;
        info!(
            event_name = "rollout.completed",
            rollout_id = %rollout.id,
            policy_id = %rollout.policy_id,
            "completed rollout"
        );
        Ok(rollout)
    }

    /// Rolls an active rollout back: the policy returns to the captured
    /// `from_percent` and a critical event is pushed.
    pub async fn rollback(
        &self,
        rollout_id: &str,
        cause: &str,
    ) -> Result<Rollout, GovernanceError> {
        let rollout = self.require(rollout_id).await?;
        let rollout = self
            .transition(rollout, RolloutState::Active, RolloutState::RolledBack, Some(Utc::now()))
            .await?;
        self.policies
            .set_rollout_percent(&rollout.policy_id, rollout.from_percent, "rollout-controller")
            .await?;
        self.sink.emit(GovernanceEvent::new(
            EventKind::RollbackTriggered,
            EventSeverity::Critical,
            json!({
                "rollout_id": rollout.id,
                "policy_id": rollout.policy_id,
                "restored_percent": rollout.from_percent,
                "cause": cause,
            }),
        ));
        warn!(
            event_name = "rollout.rolled_back",
            rollout_id = %rollout.id,
            policy_id = %rollout.policy_id,
            restored_percent = rollout.from_percent,
            cause = %cause,
            "rolled back rollout"
        );
        Ok(rollout)
    }

    pub async fn get(&self, rollout_id: &str) -> Result<Option<Rollout>, GovernanceError> {
        self.rollouts.get(rollout_id).await
    }

    async fn require(&self, rollout_id: &str) -> Result<Rollout, GovernanceError> {
        self.rollouts
            .get(rollout_id)
            .await?
            .ok_or_else(|| GovernanceError::not_found("rollout", rollout_id))
    }

    async fn transition(
        &self,
        rollout: Rollout,
        from: RolloutState,
        to: RolloutState,
        completed_at: Option<chrono::DateTime<Utc>>,
    ) -> Result<Rollout, GovernanceError> {
        if !from.can_transition_to(to) {
            return Err(GovernanceError::InvalidTransition { from, to });
        }
        if !self.rollouts.transition(&rollout.id, from, to, completed_at).await? {
            let current = self
                .rollouts
                .get(&rollout.id)
                .await?
                .map(|row| format!("{:?}", row.state))
                .unwrap_or_else(|| "missing".to_string());
            return Err(GovernanceError::invalid_state("rollout", &rollout.id, current));
        }
        Ok(Rollout { state: to, completed_at, ..rollout })
    }
}

/// What a single monitor pass concluded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TickOutcome {
    KeepWatching,
    Completed,
    RolledBack,
    /// The rollout left `Active` through some other path; stop watching.
    Stopped,
}

/// Polls the metrics feed for an active rollout and either completes it
/// after the bake time or rolls it back on a breached rule. Feed failures
/// are advisory: they are logged and never trigger a rollback.
pub struct RolloutMonitor {
    controller: Arc<RolloutController>,
    feed: Arc<dyn MetricsFeed>,
    poll_interval: Duration,
    bake_time: Duration,
}

impl RolloutMonitor {
    pub fn new(
        controller: Arc<RolloutController>,
        feed: Arc<dyn MetricsFeed>,
        poll_interval: Duration,
        bake_time: Duration,
    ) -> Self {
        Self { controller, feed, poll_interval, bake_time }
    }

    /// Watches one rollout until it leaves `Active` or `cancel` flips to
    /// true.
    pub async fn watch(
        &self,
        rollout_id: &str,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<(), GovernanceError> {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.tick(rollout_id).await? != TickOutcome::KeepWatching {
                        return Ok(());
                    }
                }
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        info!(
                            event_name = "rollout.monitor_cancelled",
                            rollout_id = %rollout_id,
                            "monitor cancelled"
                        );
                        return Ok(());
                    }
                }
            }
        }
    }

    /// One monitor pass, separated from the timer loop so it can be driven
    /// directly.
    pub async fn tick(&self, rollout_id: &str) -> Result<TickOutcome, GovernanceError> {
        let Some(rollout) = self.controller.get(rollout_id).await? else {
            warn!(
                event_name = "rollout.monitor_lost_rollout",
                rollout_id = %rollout_id,
                "monitored rollout disappeared"
            );
            return Ok(TickOutcome::Stopped);
        };
        if rollout.state != RolloutState::Active {
            return Ok(TickOutcome::Stopped);
        }

        let elapsed = (Utc::now() - rollout.created_at).to_std().unwrap_or_default();
        if elapsed >= self.bake_time {
            self.controller.complete(rollout_id).await?;
            return Ok(TickOutcome::Completed);
        }

        let rule = &rollout.auto_rollback_rule;
        match self.feed.metric_value(&rule.metric, rule.window).await {
            Ok(Some(observed)) => {
                if rule.comparator.breached(observed, rule.threshold) {
                    let cause = format!(
                        "metric {} = {observed} breached {:?} {}",
                        rule.metric, rule.comparator, rule.threshold
                    );
                    self.controller.rollback(rollout_id, &cause).await?;
                    return Ok(TickOutcome::RolledBack);
                }
                Ok(TickOutcome::KeepWatching)
            }
            Ok(None) => {
                warn!(
                    event_name = "rollout.metric_missing",
                    rollout_id = %rollout_id,
                    metric = %rule.metric,
                    "metrics feed returned no data; keeping rollout active"
                );
                Ok(TickOutcome::KeepWatching)
            }
            Err(err) => {
                warn!(
                    event_name = "rollout.metric_fetch_failed",
                    rollout_id = %rollout_id,
                    metric = %rule.metric,
                    error = %err,
                    "metrics feed failed; keeping rollout active"
                );
                Ok(TickOutcome::KeepWatching)
            }
        }
    }
}
