//! Alert sink boundary. Concrete chat/email/paging integrations are left to
//! callers; this crate only defines the contract and a logging default.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Mutex;
use tracing::{error, warn};

/// Alert severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertLevel {
    /// A rate threshold was crossed; operators should notice but it's not urgent.
    Warning,
    /// An immediate, per-message condition (permanent error, unmapped event, DLQ overflow).
    Critical,
}

/// Sink for operator alerts raised by the consumer loop and DLQ tools.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Send one alert with a free-form message and structured context.
    async fn notify(&self, level: AlertLevel, message: &str, context: Value);
}

/// Default [`Notifier`] that logs structurally via `tracing`.
///
/// Suitable as-is for deployments where log aggregation is the alerting
/// path; paging/chat integrations can wrap or replace this with their own
/// [`Notifier`] implementation.
#[derive(Default)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, level: AlertLevel, message: &str, context: Value) {
        match level {
            AlertLevel::Warning => warn!(%context, "{message}"),
            AlertLevel::Critical => error!(%context, "{message}"),
        }
    }
}

/// In-memory [`Notifier`] double that records every call, for test assertions.
#[derive(Default)]
pub struct RecordingNotifier {
    alerts: Mutex<Vec<(AlertLevel, String, Value)>>,
}

impl RecordingNotifier {
    /// Build an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every alert recorded so far.
    pub fn alerts(&self) -> Vec<(AlertLevel, String, Value)> {
        self.alerts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, level: AlertLevel, message: &str, context: Value) {
        self.alerts.lock().unwrap().push((level, message.to_string(), context));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn recording_notifier_captures_alerts_in_order() {
        let notifier = RecordingNotifier::new();
        notifier.notify(AlertLevel::Warning, "rate exceeded", json!({"queue": "payments"})).await;
        notifier.notify(AlertLevel::Critical, "unmapped event", json!({"event_type": "x"})).await;

        let alerts = notifier.alerts();
        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[0].0, AlertLevel::Warning);
        assert_eq!(alerts[1].0, AlertLevel::Critical);
    }
}
