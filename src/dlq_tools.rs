//! Operator tooling for dead-letter queues: inspect, replay, monitor.

use std::sync::Arc;
use tracing::{info, warn};

use crate::envelope::Envelope;
use crate::metrics::DLQ_DEPTH;
use crate::notifier::{AlertLevel, Notifier};
use crate::publisher::Publisher;
use crate::queue_resolver::QueueResolver;
use crate::transport::QueueTransport;
use crate::Result;

/// One DLQ entry as surfaced by [`inspect_dlq`].
#[derive(Debug, Clone)]
pub struct DlqEntry {
    /// The decoded envelope, if the body was valid JSON.
    pub envelope: Option<Envelope>,
    /// Raw payload when decoding failed.
    pub raw_body: String,
    /// `ApproximateReceiveCount` at time of inspection.
    pub receive_count: u32,
}

/// Outcome of a [`replay_dlq`] call.
#[derive(Debug, Default)]
pub struct ReplayOutcome {
    /// Number of messages successfully republished to the main queue and removed from the DLQ.
    pub replayed: u32,
    /// Number of DLQ messages deleted because their body was not valid JSON.
    pub failed: u32,
}

/// Per-queue DLQ depth, as surfaced by [`monitor_dlq`].
#[derive(Debug, Clone)]
pub struct DlqDepth {
    /// Logical queue name (without the `-dlq` suffix).
    pub logical_queue: String,
    /// Approximate number of messages currently in the DLQ.
    pub depth: u64,
}

/// Outcome of a `monitor-dlq` operator command.
pub struct OperatorOutcome {
    /// `true` maps to exit code 0; `false` to a non-zero exit code.
    pub success: bool,
    /// Human-readable summary, suitable for logging or CLI output.
    pub summary: String,
}

/// Receive up to `limit` messages from `{logicalQueue}-dlq` without deleting
/// them (wait=0; messages remain in the DLQ).
pub async fn inspect_dlq(
    transport: &Arc<dyn QueueTransport>,
    resolver: &QueueResolver,
    logical_queue: &str,
    limit: i32,
) -> Result<Vec<DlqEntry>> {
    let dlq_logical = format!("{logical_queue}-dlq");
    let dlq_url = resolver.resolve(&dlq_logical).await?;
    let messages = transport.receive_message(&dlq_url, limit.min(10), 0, 30).await?;

    Ok(messages
        .into_iter()
        .map(|message| {
            let envelope = serde_json::from_str::<Envelope>(&message.body).ok();
            DlqEntry {
                envelope,
                raw_body: message.body,
                receive_count: message.approximate_receive_count,
            }
        })
        .collect())
}

/// Receive up to `limit` messages from the DLQ, republish each to the main
/// queue via `publisher`, and delete it from the DLQ on success. Messages
/// with invalid JSON bodies are deleted from the DLQ and counted as failed.
pub async fn replay_dlq(
    transport: &Arc<dyn QueueTransport>,
    resolver: &QueueResolver,
    publisher: &Publisher,
    logical_queue: &str,
    limit: i32,
) -> Result<ReplayOutcome> {
    let dlq_logical = format!("{logical_queue}-dlq");
    let dlq_url = resolver.resolve(&dlq_logical).await?;
    let messages = transport.receive_message(&dlq_url, limit.min(10), 0, 30).await?;

    let mut outcome = ReplayOutcome::default();
    for message in messages {
        let Ok(envelope) = serde_json::from_str::<Envelope>(&message.body) else {
            warn!(queue = %logical_queue, "deleting unparseable DLQ message");
            transport.delete_message(&dlq_url, &message.receipt_handle).await?;
            outcome.failed += 1;
            continue;
        };

        publisher
            .publish(
                logical_queue,
                envelope.event_type(),
                envelope.unwrap().clone(),
                Default::default(),
            )
            .await?;
        transport.delete_message(&dlq_url, &message.receipt_handle).await?;
        outcome.replayed += 1;
        info!(queue = %logical_queue, idempotency_key = %envelope.idempotency_key, "replayed DLQ message");
    }

    Ok(outcome)
}

/// Read every configured queue's DLQ depth and alert at `CRITICAL` for any
/// depth exceeding `alert_threshold`.
pub async fn monitor_dlq(
    transport: &Arc<dyn QueueTransport>,
    resolver: &QueueResolver,
    notifier: &Arc<dyn Notifier>,
    logical_queues: &[String],
    alert_threshold: u64,
) -> Result<OperatorOutcome> {
    let mut depths = Vec::with_capacity(logical_queues.len());
    let mut any_alert = false;

    for logical_queue in logical_queues {
        let dlq_logical = format!("{logical_queue}-dlq");
        let dlq_url = resolver.resolve(&dlq_logical).await?;
        let depth = transport.approximate_message_count(&dlq_url).await?;
        DLQ_DEPTH.with_label_values(&[logical_queue]).set(depth as f64);

        if depth > alert_threshold {
            any_alert = true;
            notifier
                .notify(
                    AlertLevel::Critical,
                    "DLQ depth exceeded threshold",
                    serde_json::json!({
                        "queue": logical_queue,
                        "depth": depth,
                        "threshold": alert_threshold,
                    }),
                )
                .await;
        }
        depths.push(DlqDepth {
            logical_queue: logical_queue.clone(),
            depth,
        });
    }

    Ok(OperatorOutcome {
        success: !any_alert,
        summary: depths
            .iter()
            .map(|d| format!("{}={}", d.logical_queue, d.depth))
            .collect::<Vec<_>>()
            .join(", "),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::RecordingNotifier;
    use crate::testing::FakeQueueTransport;
    use serde_json::json;

    #[tokio::test]
    async fn replay_moves_a_dlq_message_to_the_main_queue() {
        let transport: Arc<dyn QueueTransport> = Arc::new(FakeQueueTransport::new());
        let resolver = QueueResolver::new(transport.clone(), "dev");
        let publisher = Publisher::new(transport.clone(), Arc::new(QueueResolver::new(transport.clone(), "dev")), "payment");

        resolver.resolve("payments").await.unwrap();
        let dlq_url = resolver.resolve("payments-dlq").await.unwrap();
        let envelope = Envelope::wrap("payment.paid", json!({"amount": 1}), "payment");
        transport
            .send_message(&dlq_url, String::from_utf8(envelope.to_bytes().unwrap()).unwrap(), Default::default())
            .await
            .unwrap();

        let outcome = replay_dlq(&transport, &resolver, &publisher, "payments", 10).await.unwrap();
        assert_eq!(outcome.replayed, 1);
        assert_eq!(outcome.failed, 0);

        let remaining = inspect_dlq(&transport, &resolver, "payments", 10).await.unwrap();
        assert!(remaining.is_empty());
    }

    #[tokio::test]
    async fn replay_deletes_unparseable_messages_and_counts_them_as_failed() {
        let transport: Arc<dyn QueueTransport> = Arc::new(FakeQueueTransport::new());
        let resolver = QueueResolver::new(transport.clone(), "dev");
        let publisher = Publisher::new(transport.clone(), Arc::new(QueueResolver::new(transport.clone(), "dev")), "payment");

        resolver.resolve("payments").await.unwrap();
        let dlq_url = resolver.resolve("payments-dlq").await.unwrap();
        transport
            .send_message(&dlq_url, "not json".to_string(), Default::default())
            .await
            .unwrap();

        let outcome = replay_dlq(&transport, &resolver, &publisher, "payments", 10).await.unwrap();
        assert_eq!(outcome.replayed, 0);
        assert_eq!(outcome.failed, 1);
    }

    #[tokio::test]
    async fn monitor_alerts_when_depth_exceeds_threshold() {
        let transport: Arc<dyn QueueTransport> = Arc::new(FakeQueueTransport::new());
        let resolver = QueueResolver::new(transport.clone(), "dev");
        resolver.resolve("payments").await.unwrap();
        let dlq_url = resolver.resolve("payments-dlq").await.unwrap();
        for i in 0..3 {
            transport
                .send_message(&dlq_url, json!({"i": i}).to_string(), Default::default())
                .await
                .unwrap();
        }

        let notifier: Arc<dyn Notifier> = Arc::new(RecordingNotifier::new());
        let outcome = monitor_dlq(&transport, &resolver, &notifier, &["payments".to_string()], 2)
            .await
            .unwrap();
        assert!(!outcome.success);
    }

    #[tokio::test]
    async fn monitor_does_not_alert_below_threshold() {
        let transport: Arc<dyn QueueTransport> = Arc::new(FakeQueueTransport::new());
        let resolver = QueueResolver::new(transport.clone(), "dev");
        resolver.resolve("payments").await.unwrap();

        let notifier: Arc<dyn Notifier> = Arc::new(RecordingNotifier::new());
        let outcome = monitor_dlq(&transport, &resolver, &notifier, &["payments".to_string()], 10)
            .await
            .unwrap();
        assert!(outcome.success);
    }
}
