//! Webhook delivery for governance events.
//!
//! The evaluator, approval workflow and rollout controller emit events
//! synchronously; delivery must never block or fail an evaluation, so the
//! webhook sink posts fire-and-forget from a spawned task and only logs
//! delivery problems.

use std::time::Duration;

use reqwest::Client;
use serde_json::{json, Value};
use tracing::{debug, warn};

use rcp_core::config::WebhookConfig;
use rcp_core::{EventKind, EventSeverity, GovernanceEvent, NotificationSink};

pub struct WebhookNotifier {
    client: Client,
    url: String,
    timeout: Duration,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self { client: Client::new(), url: url.into(), timeout }
    }

    /// Builds a notifier from config; `None` when the webhook is disabled
    /// or has no URL, in which case callers fall back to a null sink.
    pub fn from_config(config: &WebhookConfig) -> Option<Self> {
        if !config.enabled {
            return None;
        }
        let url = config.url.as_deref()?;
        Some(Self::new(url, Duration::from_secs(config.timeout_secs)))
    }

    /// Posts one event and waits for the endpoint to accept it. The sink
    /// path stays fire-and-forget; this is for callers that need delivery
    /// confirmation (smoke checks, manual re-sends).
    pub async fn deliver(&self, event: &GovernanceEvent) -> Result<(), reqwest::Error> {
        let body = webhook_payload(event);
        self.client
            .post(&self.url)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

fn kind_label(kind: EventKind) -> &'static str {
    match kind {
        EventKind::PolicyViolation => "policy_violation",
        EventKind::RollbackTriggered => "rollback_triggered",
        EventKind::ApprovalRequired => "approval_required",
    }
}

fn severity_label(severity: EventSeverity) -> &'static str {
    match severity {
        EventSeverity::Info => "info",
        EventSeverity::Warning => "warning",
        EventSeverity::Critical => "critical",
    }
}

/// Webhook body: the structured event plus a prebuilt one-line `text`
/// summary so chat-shaped receivers can render it without templating.
pub fn webhook_payload(event: &GovernanceEvent) -> Value {
    json!({
        "kind": kind_label(event.kind),
        "severity": severity_label(event.severity),
        "occurred_at": event.occurred_at.to_rfc3339(),
        "payload": event.payload,
        "text": summary_line(event),
    })
}

fn summary_line(event: &GovernanceEvent) -> String {
    let subject = event
        .payload
        .get("policy_id")
        .or_else(|| event.payload.get("rollout_id"))
        .or_else(|| event.payload.get("approval_id"))
        .and_then(Value::as_str);
    match subject {
        Some(subject) => {
            format!("[{}] {} ({})", severity_label(event.severity), kind_label(event.kind), subject)
        }
        None => format!("[{}] {}", severity_label(event.severity), kind_label(event.kind)),
    }
}

impl NotificationSink for WebhookNotifier {
    fn emit(&self, event: GovernanceEvent) {
        let client = self.client.clone();
        let url = self.url.clone();
        let timeout = self.timeout;
        let body = webhook_payload(&event);

        tokio::spawn(async move {
            let response = client.post(&url).timeout(timeout).json(&body).send().await;
            match response {
                Ok(response) if response.status().is_success() => {
                    debug!(
                        event_name = "notify.webhook_delivered",
                        kind = %body["kind"],
                        "delivered governance event"
                    );
                }
                Ok(response) => {
                    warn!(
                        event_name = "notify.webhook_rejected",
                        kind = %body["kind"],
                        status = %response.status(),
                        "webhook endpoint rejected governance event"
                    );
                }
                Err(error) => {
                    warn!(
                        event_name = "notify.webhook_failed",
                        kind = %body["kind"],
                        error = %error,
                        "failed to deliver governance event"
                    );
                }
            }
        });
    }
}
