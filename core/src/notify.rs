//! Notification sinks — the pluggable transport for alert events.
//!
//! The core only defines the dispatch call shape; transport is a
//! collaborator (section 1, section 4.4). A sink failure must never abort
//! the caller, so `send` swallows its own errors and logs instead of
//! returning one to the evaluator.

use tracing::{error, info};

use crate::model::AlertEvent;

pub trait NotificationSink: Send + Sync {
    fn name(&self) -> &str;
    fn send(&self, event: &AlertEvent);
}

/// Always available, always real: prints the alert to the process log.
pub struct StdoutSink;

impl NotificationSink for StdoutSink {
    fn name(&self) -> &str {
        "stdout"
    }

    fn send(&self, event: &AlertEvent) {
        info!(
            rule = %event.rule_name,
            severity = ?event.severity,
            "ALERT: {} fired at {}",
            event.rule_name,
            event.timestamp
        );
    }
}

/// Posts the event as JSON to a webhook URL (chat or generic). A real HTTP
/// call, not a stub — the teacher's `agent` crate already depends on
/// `reqwest` for outbound HTTP, so this reuses that stack rather than
/// inventing a transport.
pub struct WebhookSink {
    name: String,
    url: String,
    client: reqwest::Client,
}

impl WebhookSink {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            client: reqwest::Client::new(),
        }
    }
}

impl NotificationSink for WebhookSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn send(&self, event: &AlertEvent) {
        let client = self.client.clone();
        let url = self.url.clone();
        let payload = serde_json::json!({
            "rule_name": event.rule_name,
            "severity": event.severity,
            "timestamp": event.timestamp,
            "metric_snapshot": event.metric_snapshot,
        });
        tokio::spawn(async move {
            if let Err(e) = client.post(&url).json(&payload).send().await {
                error!(sink = "webhook", error = %e, "notification sink failed");
            }
        });
    }
}

/// A registry of named sinks the evaluator dispatches alert channels to.
#[derive(Default)]
pub struct SinkRegistry {
    sinks: Vec<Box<dyn NotificationSink>>,
}

impl SinkRegistry {
    pub fn new() -> Self {
        Self { sinks: Vec::new() }
    }

    pub fn register(&mut self, sink: Box<dyn NotificationSink>) {
        self.sinks.push(sink);
    }

    /// Dispatches to every sink named in `channels`. Unknown channel names
    /// and sink failures are logged and skipped, never propagated.
    pub fn dispatch(&self, channels: &[String], event: &AlertEvent) {
        for channel in channels {
            match self.sinks.iter().find(|s| s.name() == channel) {
                Some(sink) => sink.send(event),
                None => error!(channel = %channel, "no notification sink registered for channel"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn unregistered_channel_does_not_panic() {
        let registry = SinkRegistry::new();
        let event = AlertEvent {
            rule_name: "r".to_string(),
            severity: crate::model::Severity::Warning,
            timestamp: chrono::Utc::now(),
            metric_snapshot: HashMap::new(),
        };
        registry.dispatch(&["nonexistent".to_string()], &event);
    }
}
