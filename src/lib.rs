//! Durable message bus abstraction over a managed, SQS-compatible queue
//! service: envelope wrapping, queue resolution with DLQ/redrive wiring, a
//! two-tier idempotency store, and a consumer loop with rate-based alerting.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod consumer;
pub mod dlq_tools;
pub mod driver_router;
pub mod envelope;
pub mod error;
pub mod idempotency;
pub mod legacy_driver;
pub mod metrics;
pub mod notifier;
pub mod publisher;
pub mod queue_resolver;
pub mod transport;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use config::{Driver, MessageBusConfig};
pub use consumer::{ConsumerLoop, CycleOutcome, CycleStats, Listener, ListenerError};
pub use dlq_tools::{DlqDepth, DlqEntry, OperatorOutcome, ReplayOutcome};
pub use driver_router::DriverRouter;
pub use envelope::Envelope;
pub use error::{Error, ErrorClass, Result};
pub use idempotency::{
    CacheBackend, IdempotencyStore, InMemoryCache, InMemoryProcessedEventsStore, ProcessedEventsBackend, RedisCache,
};
pub use legacy_driver::LegacyDriver;
pub use notifier::{AlertLevel, Notifier, TracingNotifier};
pub use publisher::Publisher;
pub use queue_resolver::QueueResolver;
pub use transport::{QueueTransport, SqsTransport};

use idempotency::PgProcessedEventsStore;
use std::collections::HashMap;
use std::sync::Arc;

/// Wires together the queue resolver, publisher, idempotency store, and
/// driver router from a loaded [`MessageBusConfig`].
///
/// This is the facade most callers construct once at process start; the
/// individual components remain independently usable (and independently
/// testable against the in-memory doubles in [`testing`]) for callers that
/// want finer-grained control.
pub struct MessageBus {
    config: MessageBusConfig,
    transport: Arc<dyn QueueTransport>,
    resolver: Arc<QueueResolver>,
    router: Arc<DriverRouter>,
    idempotency: Arc<IdempotencyStore>,
    notifier: Arc<dyn Notifier>,
}

impl MessageBus {
    /// Connect to the configured transport, cache, and durable store, and
    /// assemble the driver router. `legacy`, if present, is registered as
    /// the router's secondary driver.
    pub async fn connect(config: MessageBusConfig, legacy: Option<Arc<dyn LegacyDriver>>) -> Result<Self> {
        config.validate().map_err(Error::Validation)?;

        let transport: Arc<dyn QueueTransport> = Arc::new(
            SqsTransport::connect(config.aws.region.as_deref(), config.aws.endpoint_url.as_deref()).await,
        );
        let resolver = Arc::new(QueueResolver::new(transport.clone(), config.prefix.clone()));

        let cache: Arc<dyn CacheBackend> = Arc::new(RedisCache::connect(&config.redis.url).await?);
        let durable = Arc::new(PgProcessedEventsStore::connect(&config.database.url, config.database.max_connections).await?);
        let idempotency = Arc::new(IdempotencyStore::new(
            cache,
            durable,
            config.idempotency.processing_ttl_sec,
            config.idempotency.processed_ttl_sec,
        ));

        let notifier: Arc<dyn Notifier> = Arc::new(TracingNotifier);
        let managed = Arc::new(Publisher::new(transport.clone(), resolver.clone(), service_name(&config)));
        let router = Arc::new(DriverRouter::new(
            config.driver,
            config.dual_write,
            config.fallback_to_legacy,
            managed,
            resolver.clone(),
            legacy,
            config.target_queues.clone(),
            config.default_target_queue.clone(),
        ));

        if config.auto_ensure {
            for logical_queue in all_configured_queues(&config) {
                resolver.resolve(&logical_queue).await?;
            }
        }

        Ok(Self {
            config,
            transport,
            resolver,
            router,
            idempotency,
            notifier,
        })
    }

    /// Resolve (and thereby create) every configured queue. Operator command `ensure-queues`.
    pub async fn ensure_queues(&self) -> Result<OperatorOutcome> {
        let mut created = Vec::new();
        for logical_queue in all_configured_queues(&self.config) {
            self.resolver.resolve(&logical_queue).await?;
            created.push(logical_queue);
        }
        Ok(OperatorOutcome {
            success: true,
            summary: format!("ensured {} queue(s): {}", created.len(), created.join(", ")),
        })
    }

    /// Publish an event through the driver router.
    pub async fn publish(
        &self,
        event_type: &str,
        payload: serde_json::Value,
        attrs: HashMap<String, String>,
    ) -> Result<String> {
        self.router.publish(event_type, payload, attrs).await
    }

    /// Build a [`ConsumerLoop`] for `logical_queue` with the given listener
    /// registry, and run one cycle. Operator command `consume <queue>`.
    pub async fn run_consumer_cycle(
        &self,
        logical_queue: &str,
        listeners: HashMap<String, Arc<dyn Listener>>,
    ) -> Result<CycleOutcome> {
        let consumer = ConsumerLoop::new(
            self.transport.clone(),
            self.resolver.clone(),
            self.idempotency.clone(),
            self.notifier.clone(),
            listeners,
            self.config.long_running_events.clone(),
            self.config.validation_error_rate_threshold,
            self.config.transient_error_rate_threshold,
            logical_queue,
            service_name(&self.config),
        );
        consumer.run_one_cycle().await
    }

    /// Inspect up to `limit` messages currently sitting in `logical_queue`'s DLQ.
    pub async fn inspect_dlq(&self, logical_queue: &str, limit: i32) -> Result<Vec<DlqEntry>> {
        dlq_tools::inspect_dlq(&self.transport, &self.resolver, logical_queue, limit).await
    }

    /// Republish up to `limit` messages from `logical_queue`'s DLQ back onto the main queue.
    pub async fn replay_dlq(&self, logical_queue: &str, limit: i32) -> Result<ReplayOutcome> {
        let publisher = Publisher::new(self.transport.clone(), self.resolver.clone(), service_name(&self.config));
        dlq_tools::replay_dlq(&self.transport, &self.resolver, &publisher, logical_queue, limit).await
    }

    /// Check every configured queue's DLQ depth and alert on any that exceed `dlq.alert_threshold`.
    pub async fn monitor_dlq(&self) -> Result<OperatorOutcome> {
        let queues = all_configured_queues(&self.config);
        dlq_tools::monitor_dlq(&self.transport, &self.resolver, &self.notifier, &queues, self.config.dlq.alert_threshold).await
    }

    /// Purge durable idempotency rows older than `cleanup.retention_days`.
    pub async fn cleanup_processed_events(&self) -> Result<OperatorOutcome> {
        let deleted = self.idempotency.cleanup(self.config.cleanup.retention_days).await?;
        Ok(OperatorOutcome {
            success: true,
            summary: format!("deleted {deleted} expired processed-event row(s)"),
        })
    }
}

fn service_name(config: &MessageBusConfig) -> String {
    config
        .queues
        .keys()
        .next()
        .cloned()
        .unwrap_or_else(|| "message-bus".to_string())
}

fn all_configured_queues(config: &MessageBusConfig) -> Vec<String> {
    let mut queues = Vec::new();
    for service_queues in config.queues.values() {
        if !service_queues.default.is_empty() {
            queues.push(service_queues.default.clone());
        }
        queues.extend(service_queues.specific.iter().cloned());
    }
    queues.sort();
    queues.dedup();
    queues
}
