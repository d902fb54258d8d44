//! Queue transport abstraction over the reference cloud queue service.
//!
//! [`QueueTransport`] captures exactly the wire operations the rest of the
//! crate needs; [`SqsTransport`] is the `aws-sdk-sqs`
//! backed implementation used in production, grounded on the reference
//! deployment's existing SNS/SQS event bus.

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_sqs::types::QueueAttributeName;
use aws_sdk_sqs::Client as SqsClient;
use std::collections::HashMap;
use std::str::FromStr;
use tracing::{debug, info};

use crate::{Error, Result};

/// A message pulled off the queue, not yet acked.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    /// Opaque handle required to delete or extend the visibility of this message.
    pub receipt_handle: String,
    /// Raw UTF-8 message body.
    pub body: String,
    /// Transport-native message attributes (includes `EventType` plus caller-supplied ones).
    pub attributes: HashMap<String, String>,
    /// `ApproximateReceiveCount`, used to reason about redelivery counts.
    pub approximate_receive_count: u32,
}

/// One entry of a batched send.
#[derive(Debug, Clone)]
pub struct SendMessageEntry {
    /// Caller-assigned id, unique within the batch, used to correlate results.
    pub id: String,
    /// Raw UTF-8 message body.
    pub body: String,
    /// String message attributes to attach.
    pub message_attributes: HashMap<String, String>,
}

/// Result of a single `send_message_batch` call.
#[derive(Debug, Default)]
pub struct SendMessageBatchOutcome {
    /// Ids (from [`SendMessageEntry::id`]) that were sent successfully.
    pub successful: Vec<String>,
    /// Ids paired with the transport's failure message.
    pub failed: Vec<(String, String)>,
}

/// Queue creation attributes.
#[derive(Debug, Clone, Default)]
pub struct QueueAttributes {
    /// Seconds a received message stays invisible to other receivers.
    pub visibility_timeout_secs: Option<i32>,
    /// Long-poll wait time for `receive_message`.
    pub receive_wait_time_secs: Option<i32>,
    /// Seconds messages are retained before automatic deletion.
    pub message_retention_secs: Option<i32>,
    /// `(dead_letter_target_arn, max_receive_count)`, when this queue redrives to a DLQ.
    pub redrive_policy: Option<(String, u32)>,
}

/// Transport-level operations this crate needs from the queue service.
///
/// Implemented by [`SqsTransport`] in production and by `FakeQueueTransport`
/// (see the `testing` module) in tests, so the rest of the crate never
/// depends on `aws-sdk-sqs` directly.
#[async_trait]
pub trait QueueTransport: Send + Sync {
    /// Create a queue, returning its transport URL. Idempotent by name.
    async fn create_queue(&self, name: &str, attributes: QueueAttributes) -> Result<String>;

    /// Look up a queue's URL by name. `Ok(None)` means the queue does not exist.
    async fn get_queue_url(&self, name: &str) -> Result<Option<String>>;

    /// Fetch the transport-native identifier (ARN) for a queue, used to build redrive policies.
    async fn get_queue_arn(&self, queue_url: &str) -> Result<String>;

    /// Send a single message, returning the transport-assigned message id.
    async fn send_message(
        &self,
        queue_url: &str,
        body: String,
        message_attributes: HashMap<String, String>,
    ) -> Result<String>;

    /// Send up to 10 messages in one call.
    async fn send_message_batch(
        &self,
        queue_url: &str,
        entries: Vec<SendMessageEntry>,
    ) -> Result<SendMessageBatchOutcome>;

    /// Long-poll receive.
    async fn receive_message(
        &self,
        queue_url: &str,
        max_messages: i32,
        wait_time_seconds: i32,
        visibility_timeout: i32,
    ) -> Result<Vec<ReceivedMessage>>;

    /// Permanently remove a message (the ACK of this crate's vocabulary).
    async fn delete_message(&self, queue_url: &str, receipt_handle: &str) -> Result<()>;

    /// Extend (or shorten) how long a received message stays invisible.
    async fn change_message_visibility(
        &self,
        queue_url: &str,
        receipt_handle: &str,
        visibility_timeout: i32,
    ) -> Result<()>;

    /// Approximate number of messages currently in the queue (used by DLQ monitoring).
    async fn approximate_message_count(&self, queue_url: &str) -> Result<u64>;
}

/// `aws-sdk-sqs` backed [`QueueTransport`].
pub struct SqsTransport {
    client: SqsClient,
}

impl SqsTransport {
    /// Build a transport from an optional region and endpoint override
    /// (`aws.region` / `aws.endpoint_url` config keys).
    pub async fn connect(region: Option<&str>, endpoint_url: Option<&str>) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = region {
            loader = loader.region(aws_config::Region::new(region.to_string()));
        }
        if let Some(endpoint) = endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }
        let config = loader.load().await;
        info!(region = ?region, endpoint = ?endpoint_url, "connected to SQS");
        Self {
            client: SqsClient::new(&config),
        }
    }

    /// Wrap an already-constructed client (used when the caller shares a client across services).
    pub fn from_client(client: SqsClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl QueueTransport for SqsTransport {
    async fn create_queue(&self, name: &str, attributes: QueueAttributes) -> Result<String> {
        let mut request = self.client.create_queue().queue_name(name);

        if let Some(visibility) = attributes.visibility_timeout_secs {
            request = request.attributes(QueueAttributeName::VisibilityTimeout, visibility.to_string());
        }
        if let Some(wait) = attributes.receive_wait_time_secs {
            request = request.attributes(
                QueueAttributeName::ReceiveMessageWaitTimeSeconds,
                wait.to_string(),
            );
        }
        if let Some(retention) = attributes.message_retention_secs {
            request =
                request.attributes(QueueAttributeName::MessageRetentionPeriod, retention.to_string());
        }
        if let Some((dlq_arn, max_receive_count)) = attributes.redrive_policy {
            let policy = serde_json::json!({
                "deadLetterTargetArn": dlq_arn,
                "maxReceiveCount": max_receive_count,
            })
            .to_string();
            request = request.attributes(QueueAttributeName::RedrivePolicy, policy);
        }

        let output = request
            .send()
            .await
            .map_err(|e| Error::QueueCreation(e.to_string()))?;

        let url = output
            .queue_url()
            .ok_or_else(|| Error::QueueCreation("create_queue returned no url".to_string()))?
            .to_string();
        debug!(queue = %name, url = %url, "created queue");
        Ok(url)
    }

    async fn get_queue_url(&self, name: &str) -> Result<Option<String>> {
        match self.client.get_queue_url().queue_name(name).send().await {
            Ok(output) => Ok(output.queue_url().map(str::to_string)),
            Err(err) => {
                let service_err = err.into_service_error();
                if service_err.is_queue_does_not_exist() {
                    Ok(None)
                } else {
                    Err(Error::Connection(service_err.to_string()))
                }
            }
        }
    }

    async fn get_queue_arn(&self, queue_url: &str) -> Result<String> {
        let output = self
            .client
            .get_queue_attributes()
            .queue_url(queue_url)
            .attribute_names(QueueAttributeName::QueueArn)
            .send()
            .await
            .map_err(|e| Error::Connection(e.to_string()))?;

        output
            .attributes()
            .and_then(|attrs| attrs.get(&QueueAttributeName::QueueArn))
            .cloned()
            .ok_or_else(|| Error::Connection("queue has no QueueArn attribute".to_string()))
    }

    async fn send_message(
        &self,
        queue_url: &str,
        body: String,
        message_attributes: HashMap<String, String>,
    ) -> Result<String> {
        let mut request = self.client.send_message().queue_url(queue_url).message_body(body);
        for (name, value) in message_attributes {
            request = request.message_attributes(
                name,
                aws_sdk_sqs::types::MessageAttributeValue::builder()
                    .data_type("String")
                    .string_value(value)
                    .build()
                    .map_err(|e| Error::Publish(e.to_string()))?,
            );
        }

        let output = request.send().await.map_err(|e| Error::Publish(e.to_string()))?;
        output
            .message_id()
            .map(str::to_string)
            .ok_or_else(|| Error::Publish("send_message returned no message id".to_string()))
    }

    async fn send_message_batch(
        &self,
        queue_url: &str,
        entries: Vec<SendMessageEntry>,
    ) -> Result<SendMessageBatchOutcome> {
        use aws_sdk_sqs::types::{MessageAttributeValue, SendMessageBatchRequestEntry};

        let mut batch_entries = Vec::with_capacity(entries.len());
        for entry in &entries {
            let mut builder = SendMessageBatchRequestEntry::builder()
                .id(&entry.id)
                .message_body(&entry.body);
            for (name, value) in &entry.message_attributes {
                builder = builder.message_attributes(
                    name,
                    MessageAttributeValue::builder()
                        .data_type("String")
                        .string_value(value)
                        .build()
                        .map_err(|e| Error::Publish(e.to_string()))?,
                );
            }
            batch_entries.push(builder.build().map_err(|e| Error::Publish(e.to_string()))?);
        }

        let output = self
            .client
            .send_message_batch()
            .queue_url(queue_url)
            .set_entries(Some(batch_entries))
            .send()
            .await
            .map_err(|e| Error::Publish(e.to_string()))?;

        let successful = output
            .successful()
            .iter()
            .map(|entry| entry.id().to_string())
            .collect();
        let failed = output
            .failed()
            .iter()
            .map(|entry| (entry.id().to_string(), entry.message().unwrap_or_default().to_string()))
            .collect();

        Ok(SendMessageBatchOutcome { successful, failed })
    }

    async fn receive_message(
        &self,
        queue_url: &str,
        max_messages: i32,
        wait_time_seconds: i32,
        visibility_timeout: i32,
    ) -> Result<Vec<ReceivedMessage>> {
        let output = self
            .client
            .receive_message()
            .queue_url(queue_url)
            .max_number_of_messages(max_messages)
            .wait_time_seconds(wait_time_seconds)
            .visibility_timeout(visibility_timeout)
            .message_attribute_names("All")
            .attribute_names(aws_sdk_sqs::types::QueueAttributeName::ApproximateReceiveCount)
            .send()
            .await
            .map_err(|e| Error::Subscribe(e.to_string()))?;

        let mut received = Vec::new();
        for message in output.messages() {
            let Some(body) = message.body() else {
                continue;
            };
            let Some(receipt_handle) = message.receipt_handle() else {
                continue;
            };

            let mut attributes = HashMap::new();
            if let Some(message_attributes) = message.message_attributes() {
                for (name, value) in message_attributes {
                    if let Some(string_value) = value.string_value() {
                        attributes.insert(name.clone(), string_value.to_string());
                    }
                }
            }

            let approximate_receive_count = message
                .attributes()
                .and_then(|attrs| attrs.get(&aws_sdk_sqs::types::MessageSystemAttributeName::ApproximateReceiveCount))
                .and_then(|value| u32::from_str(value).ok())
                .unwrap_or(1);

            received.push(ReceivedMessage {
                receipt_handle: receipt_handle.to_string(),
                body: body.to_string(),
                attributes,
                approximate_receive_count,
            });
        }
        Ok(received)
    }

    async fn delete_message(&self, queue_url: &str, receipt_handle: &str) -> Result<()> {
        self.client
            .delete_message()
            .queue_url(queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(|e| Error::Subscribe(e.to_string()))?;
        Ok(())
    }

    async fn change_message_visibility(
        &self,
        queue_url: &str,
        receipt_handle: &str,
        visibility_timeout: i32,
    ) -> Result<()> {
        self.client
            .change_message_visibility()
            .queue_url(queue_url)
            .receipt_handle(receipt_handle)
            .visibility_timeout(visibility_timeout)
            .send()
            .await
            .map_err(|e| Error::Subscribe(e.to_string()))?;
        Ok(())
    }

    async fn approximate_message_count(&self, queue_url: &str) -> Result<u64> {
        let output = self
            .client
            .get_queue_attributes()
            .queue_url(queue_url)
            .attribute_names(QueueAttributeName::ApproximateNumberOfMessages)
            .send()
            .await
            .map_err(|e| Error::Connection(e.to_string()))?;

        let count = output
            .attributes()
            .and_then(|attrs| attrs.get(&QueueAttributeName::ApproximateNumberOfMessages))
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(0);
        Ok(count)
    }
}
