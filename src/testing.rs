//! In-memory test doubles for the queue transport.
//!
//! Exercises the same [`QueueTransport`] trait the `aws-sdk-sqs`-backed
//! client implements, so the consumer state machine can be covered without
//! a live queue service.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use uuid::Uuid;

use crate::transport::{QueueAttributes, QueueTransport, ReceivedMessage, SendMessageBatchOutcome, SendMessageEntry};
use crate::{Error, Result};

struct StoredMessage {
    receipt_handle: String,
    body: String,
    attributes: HashMap<String, String>,
    receive_count: u32,
}

struct QueueState {
    url: String,
    arn: String,
    redrive: Option<(String, u32)>,
    messages: Mutex<VecDeque<StoredMessage>>,
}

/// In-memory [`QueueTransport`] double.
///
/// Simulates the transport's redrive behavior: a message that would exceed
/// its queue's configured `maxReceiveCount` on the next receive is instead
/// moved straight to the DLQ, matching what SQS does on visibility-timeout
/// expiry in production.
#[derive(Default)]
pub struct FakeQueueTransport {
    queues: Mutex<HashMap<String, QueueState>>,
    create_queue_calls: AtomicU64,
}

impl FakeQueueTransport {
    /// Build an empty transport with no queues.
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of every queue created so far (main queues and DLQs).
    pub fn queue_names(&self) -> Vec<String> {
        self.queues.lock().unwrap().keys().cloned().collect()
    }

    /// Total number of `create_queue` calls observed.
    pub fn create_queue_calls(&self) -> u64 {
        self.create_queue_calls.load(Ordering::SeqCst)
    }

    /// Number of messages currently sitting in `name` (not counting in-flight receives).
    pub fn depth(&self, name: &str) -> usize {
        self.queues
            .lock()
            .unwrap()
            .get(name)
            .map(|queue| queue.messages.lock().unwrap().len())
            .unwrap_or(0)
    }

    fn name_for_url<'a>(queues: &'a HashMap<String, QueueState>, url: &str) -> Option<&'a str> {
        queues
            .iter()
            .find(|(_, state)| state.url == url)
            .map(|(name, _)| name.as_str())
    }
}

#[async_trait]
impl QueueTransport for FakeQueueTransport {
    async fn create_queue(&self, name: &str, attributes: QueueAttributes) -> Result<String> {
        self.create_queue_calls.fetch_add(1, Ordering::SeqCst);
        let mut queues = self.queues.lock().unwrap();
        let state = queues.entry(name.to_string()).or_insert_with(|| QueueState {
            url: format!("fake://{name}"),
            arn: format!("arn:fake:queue:{name}"),
            redrive: None,
            messages: Mutex::new(VecDeque::new()),
        });
        state.redrive = attributes.redrive_policy;
        Ok(state.url.clone())
    }

    async fn get_queue_url(&self, name: &str) -> Result<Option<String>> {
        Ok(self.queues.lock().unwrap().get(name).map(|state| state.url.clone()))
    }

    async fn get_queue_arn(&self, queue_url: &str) -> Result<String> {
        let queues = self.queues.lock().unwrap();
        let name = Self::name_for_url(&queues, queue_url)
            .ok_or_else(|| Error::QueueNotFound(queue_url.to_string()))?;
        Ok(queues[name].arn.clone())
    }

    async fn send_message(
        &self,
        queue_url: &str,
        body: String,
        message_attributes: HashMap<String, String>,
    ) -> Result<String> {
        let queues = self.queues.lock().unwrap();
        let name = Self::name_for_url(&queues, queue_url)
            .ok_or_else(|| Error::QueueNotFound(queue_url.to_string()))?;
        let id = Uuid::new_v4().to_string();
        queues[name].messages.lock().unwrap().push_back(StoredMessage {
            receipt_handle: Uuid::new_v4().to_string(),
            body,
            attributes: message_attributes,
            receive_count: 0,
        });
        Ok(id)
    }

    async fn send_message_batch(
        &self,
        queue_url: &str,
        entries: Vec<SendMessageEntry>,
    ) -> Result<SendMessageBatchOutcome> {
        let mut outcome = SendMessageBatchOutcome::default();
        for entry in entries {
            match self.send_message(queue_url, entry.body, entry.message_attributes).await {
                Ok(_) => outcome.successful.push(entry.id),
                Err(e) => outcome.failed.push((entry.id, e.to_string())),
            }
        }
        Ok(outcome)
    }

    async fn receive_message(
        &self,
        queue_url: &str,
        max_messages: i32,
        _wait_time_seconds: i32,
        _visibility_timeout: i32,
    ) -> Result<Vec<ReceivedMessage>> {
        let queues = self.queues.lock().unwrap();
        let name = Self::name_for_url(&queues, queue_url)
            .ok_or_else(|| Error::QueueNotFound(queue_url.to_string()))?
            .to_string();
        let redrive = queues[&name].redrive.clone();
        let mut source = queues[&name].messages.lock().unwrap();

        let mut received = Vec::new();
        let mut requeue = Vec::new();
        while received.len() < max_messages as usize {
            let Some(mut message) = source.pop_front() else {
                break;
            };
            message.receive_count += 1;

            if let Some((dlq_arn, max_receive_count)) = &redrive {
                if message.receive_count > *max_receive_count {
                    if let Some((dlq_name, _)) =
                        queues.iter().find(|(_, state)| &state.arn == dlq_arn)
                    {
                        queues[dlq_name].messages.lock().unwrap().push_back(StoredMessage {
                            receipt_handle: Uuid::new_v4().to_string(),
                            body: message.body,
                            attributes: message.attributes,
                            receive_count: 0,
                        });
                    }
                    continue;
                }
            }

            received.push(ReceivedMessage {
                receipt_handle: message.receipt_handle.clone(),
                body: message.body.clone(),
                attributes: message.attributes.clone(),
                approximate_receive_count: message.receive_count,
            });
            requeue.push(message);
        }
        // Messages stay "in flight" (not visible) until deleted; since this
        // fake has no visibility-timeout clock, a message only becomes
        // receivable again once the caller's next receive_message call
        // pulls from the front again after everyone ahead of it cycles out.
        for message in requeue {
            source.push_back(message);
        }
        Ok(received)
    }

    async fn delete_message(&self, queue_url: &str, receipt_handle: &str) -> Result<()> {
        let queues = self.queues.lock().unwrap();
        let name = Self::name_for_url(&queues, queue_url)
            .ok_or_else(|| Error::QueueNotFound(queue_url.to_string()))?;
        let mut messages = queues[name].messages.lock().unwrap();
        messages.retain(|message| message.receipt_handle != receipt_handle);
        Ok(())
    }

    async fn change_message_visibility(
        &self,
        _queue_url: &str,
        _receipt_handle: &str,
        _visibility_timeout: i32,
    ) -> Result<()> {
        Ok(())
    }

    async fn approximate_message_count(&self, queue_url: &str) -> Result<u64> {
        let queues = self.queues.lock().unwrap();
        let name = Self::name_for_url(&queues, queue_url)
            .ok_or_else(|| Error::QueueNotFound(queue_url.to_string()))?;
        Ok(queues[name].messages.lock().unwrap().len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_then_receive_round_trips_the_body() {
        let transport = FakeQueueTransport::new();
        let url = transport.create_queue("dev-payments", QueueAttributes::default()).await.unwrap();
        transport
            .send_message(&url, "hello".to_string(), HashMap::new())
            .await
            .unwrap();
        let received = transport.receive_message(&url, 10, 0, 30).await.unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].body, "hello");
    }

    #[tokio::test]
    async fn delete_removes_the_message() {
        let transport = FakeQueueTransport::new();
        let url = transport.create_queue("dev-payments", QueueAttributes::default()).await.unwrap();
        transport
            .send_message(&url, "hello".to_string(), HashMap::new())
            .await
            .unwrap();
        let received = transport.receive_message(&url, 10, 0, 30).await.unwrap();
        transport.delete_message(&url, &received[0].receipt_handle).await.unwrap();
        assert_eq!(transport.depth("dev-payments"), 0);
    }

    #[tokio::test]
    async fn exceeding_max_receive_count_moves_the_message_to_the_dlq() {
        let transport = FakeQueueTransport::new();
        let dlq_url = transport.create_queue("dev-payments-dlq", QueueAttributes::default()).await.unwrap();
        let dlq_arn = transport.get_queue_arn(&dlq_url).await.unwrap();
        let url = transport
            .create_queue(
                "dev-payments",
                QueueAttributes {
                    redrive_policy: Some((dlq_arn, 5)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        transport
            .send_message(&url, "hello".to_string(), HashMap::new())
            .await
            .unwrap();

        for _ in 0..5 {
            let received = transport.receive_message(&url, 10, 0, 30).await.unwrap();
            assert_eq!(received.len(), 1);
        }
        let received = transport.receive_message(&url, 10, 0, 30).await.unwrap();
        assert!(received.is_empty());
        assert_eq!(transport.depth("dev-payments"), 0);
        assert_eq!(transport.depth("dev-payments-dlq"), 1);
    }
}
