//! Wraps payloads into envelopes, resolves their queue, and sends them
//! for delivery.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};

use crate::envelope::Envelope;
use crate::metrics::{PUBLISH_DURATION_SECONDS, PUBLISH_TOTAL};
use crate::queue_resolver::QueueResolver;
use crate::transport::{QueueTransport, SendMessageEntry};
use crate::{Error, Result};

const BATCH_CHUNK_SIZE: usize = 10;

/// One event to publish, as accepted by [`Publisher::publish_batch`].
#[derive(Debug, Clone)]
pub struct OutgoingEvent {
    /// Routing key and listener lookup key.
    pub event_type: String,
    /// Arbitrary structured payload.
    pub payload: serde_json::Value,
    /// Caller-supplied string attributes, passed through alongside `EventType`.
    pub attrs: HashMap<String, String>,
}

/// Outcome of [`Publisher::publish_batch`].
#[derive(Debug, Default)]
pub struct BatchOutcome {
    /// Transport-assigned message ids for events that were sent successfully.
    pub successful: Vec<String>,
    /// Events that failed, with the transport's error message.
    pub failed: Vec<(OutgoingEvent, String)>,
}

/// Publishes envelopes onto the reference cloud queue.
pub struct Publisher {
    transport: Arc<dyn QueueTransport>,
    resolver: Arc<QueueResolver>,
    service: String,
}

impl Publisher {
    /// Build a publisher over a resolver (which owns the transport) and the
    /// publishing service's identifier (stamped onto every envelope).
    pub fn new(transport: Arc<dyn QueueTransport>, resolver: Arc<QueueResolver>, service: impl Into<String>) -> Self {
        Self {
            transport,
            resolver,
            service: service.into(),
        }
    }

    /// Wrap `payload` into an envelope, resolve `logical_queue`, and send it.
    pub async fn publish(
        &self,
        logical_queue: &str,
        event_type: &str,
        payload: serde_json::Value,
        attrs: HashMap<String, String>,
    ) -> Result<String> {
        let start = Instant::now();
        let envelope = Envelope::wrap(event_type, payload, self.service.clone());
        let body = envelope.to_bytes()?;

        let result = async {
            let queue_url = self.resolver.resolve(logical_queue).await?;
            let mut attributes = attrs;
            attributes.insert("EventType".to_string(), event_type.to_string());
            self.transport
                .send_message(&queue_url, String::from_utf8_lossy(&body).into_owned(), attributes)
                .await
        }
        .await;

        PUBLISH_DURATION_SECONDS
            .with_label_values(&[event_type])
            .observe(start.elapsed().as_secs_f64());
        PUBLISH_TOTAL
            .with_label_values(&[event_type, if result.is_ok() { "success" } else { "error" }])
            .inc();

        if let Err(ref e) = result {
            error!(event_type = %event_type, queue = %logical_queue, error = %e, "publish failed");
        } else {
            info!(event_type = %event_type, queue = %logical_queue, trace_id = %envelope.trace_id(), "published");
        }
        result
    }

    /// Publish a batch of events to the same logical queue, chunked into
    /// groups of 10 (the reference transport's per-request limit).
    pub async fn publish_batch(&self, logical_queue: &str, events: Vec<OutgoingEvent>) -> Result<BatchOutcome> {
        let queue_url = self.resolver.resolve(logical_queue).await?;
        let mut outcome = BatchOutcome::default();

        for chunk in events.chunks(BATCH_CHUNK_SIZE) {
            let mut by_id = HashMap::new();
            let mut entries = Vec::with_capacity(chunk.len());
            for event in chunk {
                let envelope = Envelope::wrap(event.event_type.clone(), event.payload.clone(), self.service.clone());
                let body = envelope.to_bytes()?;
                let mut attributes = event.attrs.clone();
                attributes.insert("EventType".to_string(), event.event_type.clone());
                let id = envelope.trace_id().to_string();
                by_id.insert(id.clone(), event.clone());
                entries.push(SendMessageEntry {
                    id,
                    body: String::from_utf8_lossy(&body).into_owned(),
                    message_attributes: attributes,
                });
            }

            let batch_result = self.transport.send_message_batch(&queue_url, entries).await?;
            outcome.successful.extend(batch_result.successful);
            for (id, message) in batch_result.failed {
                if let Some(event) = by_id.remove(&id) {
                    outcome.failed.push((event, message));
                }
            }
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeQueueTransport;
    use serde_json::json;

    fn publisher() -> (Publisher, Arc<FakeQueueTransport>) {
        let transport = Arc::new(FakeQueueTransport::new());
        let resolver = Arc::new(QueueResolver::new(transport.clone(), "dev"));
        (Publisher::new(transport.clone(), resolver, "payment"), transport)
    }

    #[tokio::test]
    async fn publish_resolves_the_queue_and_sends_the_envelope() {
        let (publisher, transport) = publisher();
        publisher
            .publish("payments", "payment.paid", json!({"amount": 500}), HashMap::new())
            .await
            .unwrap();
        assert_eq!(transport.depth("dev-payments"), 1);
    }

    #[tokio::test]
    async fn publish_batch_chunks_into_groups_of_ten() {
        let (publisher, transport) = publisher();
        let events: Vec<OutgoingEvent> = (0..25)
            .map(|i| OutgoingEvent {
                event_type: "payment.paid".to_string(),
                payload: json!({"i": i}),
                attrs: HashMap::new(),
            })
            .collect();

        let outcome = publisher.publish_batch("payments", events).await.unwrap();
        assert_eq!(outcome.successful.len(), 25);
        assert!(outcome.failed.is_empty());
        assert_eq!(transport.depth("dev-payments"), 25);
    }
}
