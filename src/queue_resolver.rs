//! Resolves logical queue names to transport URLs, creating the queue and
//! its DLQ on first use.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

use crate::transport::{QueueAttributes, QueueTransport};
use crate::Result;

const QUEUE_URL_CACHE_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);
const VISIBILITY_TIMEOUT_SECS: i32 = 30;
const RECEIVE_WAIT_TIME_SECS: i32 = 20;
const MESSAGE_RETENTION_SECS: i32 = 14 * 24 * 60 * 60;
const MAX_RECEIVE_COUNT: u32 = 5;

/// Resolves a logical queue name (e.g. `admission-service-queue`) to the
/// transport's effective URL, creating the queue and its sibling DLQ on
/// first use.
pub struct QueueResolver {
    transport: Arc<dyn QueueTransport>,
    prefix: String,
    url_cache: DashMap<String, (String, Instant)>,
}

impl QueueResolver {
    /// Build a resolver over a transport, using `prefix` as the environment
    /// queue prefix.
    pub fn new(transport: Arc<dyn QueueTransport>, prefix: impl Into<String>) -> Self {
        Self {
            transport,
            prefix: prefix.into(),
            url_cache: DashMap::new(),
        }
    }

    /// Effective remote name: `{prefix}-{logicalName}`.
    pub fn effective_name(&self, logical_name: &str) -> String {
        format!("{}-{}", self.prefix, logical_name)
    }

    /// Effective DLQ name: `{prefix}-{logicalName}-dlq`.
    pub fn effective_dlq_name(&self, logical_name: &str) -> String {
        format!("{}-{}-dlq", self.prefix, logical_name)
    }

    /// Resolve a logical queue name to its URL, cache-through with a 30-day TTL.
    /// Creates the queue (and its DLQ) on first resolve.
    pub async fn resolve(&self, logical_name: &str) -> Result<String> {
        if let Some(entry) = self.url_cache.get(logical_name) {
            let (url, cached_at) = entry.value();
            if cached_at.elapsed() < QUEUE_URL_CACHE_TTL {
                return Ok(url.clone());
            }
        }

        let effective_name = self.effective_name(logical_name);
        let url = match self.transport.get_queue_url(&effective_name).await? {
            Some(url) => url,
            None => self.create_queue(logical_name).await?,
        };

        self.url_cache
            .insert(logical_name.to_string(), (url.clone(), Instant::now()));
        Ok(url)
    }

    /// Pure existence check; never creates a queue.
    pub async fn queue_exists(&self, logical_name: &str) -> bool {
        let effective_name = self.effective_name(logical_name);
        matches!(self.transport.get_queue_url(&effective_name).await, Ok(Some(_)))
    }

    /// Create the DLQ, then the main queue wired to redrive into it.
    pub async fn create_queue(&self, logical_name: &str) -> Result<String> {
        let dlq_name = self.effective_dlq_name(logical_name);
        let dlq_url = self
            .transport
            .create_queue(
                &dlq_name,
                QueueAttributes {
                    message_retention_secs: Some(MESSAGE_RETENTION_SECS),
                    ..Default::default()
                },
            )
            .await?;
        let dlq_arn = self.transport.get_queue_arn(&dlq_url).await?;

        let main_name = self.effective_name(logical_name);
        let main_url = self
            .transport
            .create_queue(
                &main_name,
                QueueAttributes {
                    visibility_timeout_secs: Some(VISIBILITY_TIMEOUT_SECS),
                    receive_wait_time_secs: Some(RECEIVE_WAIT_TIME_SECS),
                    message_retention_secs: Some(MESSAGE_RETENTION_SECS),
                    redrive_policy: Some((dlq_arn, MAX_RECEIVE_COUNT)),
                },
            )
            .await?;

        info!(queue = %main_name, dlq = %dlq_name, "ensured queue and dlq");
        Ok(main_url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeQueueTransport;

    #[tokio::test]
    async fn resolve_creates_the_queue_and_its_dlq_on_first_use() {
        let transport = Arc::new(FakeQueueTransport::new());
        let resolver = QueueResolver::new(transport.clone(), "dev");

        let url = resolver.resolve("payments").await.unwrap();
        assert!(transport.queue_names().contains(&"dev-payments".to_string()));
        assert!(transport.queue_names().contains(&"dev-payments-dlq".to_string()));
        assert!(!url.is_empty());
    }

    #[tokio::test]
    async fn resolve_is_idempotent_and_does_not_recreate() {
        let transport = Arc::new(FakeQueueTransport::new());
        let resolver = QueueResolver::new(transport.clone(), "dev");

        let first = resolver.resolve("payments").await.unwrap();
        let second = resolver.resolve("payments").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(transport.create_queue_calls(), 2); // main + dlq, exactly once
    }

    #[tokio::test]
    async fn queue_exists_is_false_before_resolve_and_true_after() {
        let transport = Arc::new(FakeQueueTransport::new());
        let resolver = QueueResolver::new(transport, "dev");

        assert!(!resolver.queue_exists("payments").await);
        resolver.resolve("payments").await.unwrap();
        assert!(resolver.queue_exists("payments").await);
    }

    #[tokio::test]
    async fn effective_names_apply_prefix_and_dlq_suffix() {
        let transport = Arc::new(FakeQueueTransport::new());
        let resolver = QueueResolver::new(transport, "staging");
        assert_eq!(resolver.effective_name("orders"), "staging-orders");
        assert_eq!(resolver.effective_dlq_name("orders"), "staging-orders-dlq");
    }
}
