use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    PolicyViolation,
    RollbackTriggered,
    ApprovalRequired,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSeverity {
    Info,
    Warning,
    Critical,
}

/// Structured event pushed to the external webhook/notification sink
/// (Slack/Jira/PagerDuty shaped).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GovernanceEvent {
    pub kind: EventKind,
    pub severity: EventSeverity,
    pub occurred_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl GovernanceEvent {
    pub fn new(kind: EventKind, severity: EventSeverity, payload: serde_json::Value) -> Self {
        Self { kind, severity, occurred_at: Utc::now(), payload }
    }
}

pub trait NotificationSink: Send + Sync {
    fn emit(&self, event: GovernanceEvent);
}

/// Sink that drops everything; for callers that opt out of notifications.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullNotificationSink;

impl NotificationSink for NullNotificationSink {
    fn emit(&self, _event: GovernanceEvent) {}
}

#[derive(Clone, Default)]
pub struct InMemoryNotificationSink {
    events: Arc<Mutex<Vec<GovernanceEvent>>>,
}

impl InMemoryNotificationSink {
    pub fn events(&self) -> Vec<GovernanceEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl NotificationSink for InMemoryNotificationSink {
    fn emit(&self, event: GovernanceEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{EventKind, EventSeverity, GovernanceEvent, InMemoryNotificationSink, NotificationSink};

    #[test]
    fn in_memory_sink_records_events_in_order() {
        let sink = InMemoryNotificationSink::default();
        sink.emit(GovernanceEvent::new(
            EventKind::PolicyViolation,
            EventSeverity::Warning,
            json!({ "policy_id": "p-1" }),
        ));
        sink.emit(GovernanceEvent::new(
            EventKind::RollbackTriggered,
            EventSeverity::Critical,
            json!({ "rollout_id": "r-1" }),
        ));

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, EventKind::PolicyViolation);
        assert_eq!(events[1].severity, EventSeverity::Critical);
        assert_eq!(events[1].payload["rollout_id"], "r-1");
    }
}
