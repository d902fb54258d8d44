//! The orchestration core: one long-poll receive plus a per-message state
//! machine, run to completion by `run_one_cycle`.

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{info, warn};

use crate::envelope::Envelope;
use crate::error::ErrorClass;
use crate::idempotency::IdempotencyStore;
use crate::metrics::{CONSUME_OUTCOME_TOTAL, DISPATCH_DURATION_SECONDS};
use crate::notifier::{AlertLevel, Notifier};
use crate::queue_resolver::QueueResolver;
use crate::transport::QueueTransport;
use crate::{Error, Result};

const MAX_MESSAGES_PER_RECEIVE: i32 = 10;
const RECEIVE_WAIT_TIME_SECS: i32 = 20;
const RECEIVE_VISIBILITY_TIMEOUT_SECS: i32 = 30;
const LONG_RUNNING_VISIBILITY_TIMEOUT_SECS: i32 = 120;

/// The outcome a listener reports by returning `Err`.
#[derive(Debug, Error)]
pub enum ListenerError {
    /// A known-recoverable failure; the message should be left for redelivery.
    #[error("transient failure: {0}")]
    Transient(String),
    /// A declared business-rule / not-found / invalid-state failure.
    #[error("permanent failure: {0}")]
    Permanent(String),
    /// Alias of [`ListenerError::Permanent`], kept distinct for alert-message clarity.
    #[error("business rule violation: {0}")]
    BusinessRule(String),
}

impl ListenerError {
    fn classify(&self) -> ErrorClass {
        match self {
            ListenerError::Transient(_) => ErrorClass::Transient,
            ListenerError::Permanent(_) | ListenerError::BusinessRule(_) => ErrorClass::Permanent,
        }
    }
}

/// Any object able to handle a decoded event payload.
#[async_trait]
pub trait Listener: Send + Sync {
    /// Handle the decoded payload. Failure is reported via [`ListenerError`].
    async fn handle(&self, payload: &Value) -> std::result::Result<(), ListenerError>;
}

/// Atomic per-cycle counters, safe to update from concurrently dispatched tasks.
#[derive(Default)]
pub struct CycleStats {
    /// Messages that completed successfully (including duplicates).
    pub success: AtomicU32,
    /// Messages discarded for malformed JSON or envelope validation failure.
    pub validation_error: AtomicU32,
    /// Messages left for redelivery due to a transient or unknown failure.
    pub transient_error: AtomicU32,
    /// Messages discarded due to a declared permanent failure or unmapped event type.
    pub permanent_error: AtomicU32,
}

impl CycleStats {
    fn total(&self) -> u32 {
        self.success.load(Ordering::Relaxed)
            + self.validation_error.load(Ordering::Relaxed)
            + self.transient_error.load(Ordering::Relaxed)
            + self.permanent_error.load(Ordering::Relaxed)
    }
}

/// Result of one call to [`ConsumerLoop::run_one_cycle`].
pub enum CycleOutcome {
    /// The receive call returned no messages.
    NoMessages,
    /// At least one message was processed; carries the per-outcome counters.
    Processed(CycleStats),
}

/// One instance per logical queue; designed to run under an external
/// supervisor (`run_one_cycle` once and exit) or inside a persistent loop
/// that calls `run_one_cycle` repeatedly.
pub struct ConsumerLoop {
    transport: Arc<dyn QueueTransport>,
    resolver: Arc<QueueResolver>,
    idempotency: Arc<IdempotencyStore>,
    notifier: Arc<dyn Notifier>,
    listeners: HashMap<String, Arc<dyn Listener>>,
    long_running_events: Vec<String>,
    validation_error_rate_threshold: f64,
    transient_error_rate_threshold: f64,
    logical_queue: String,
    service: String,
}

impl ConsumerLoop {
    /// Build a consumer loop for one logical queue.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transport: Arc<dyn QueueTransport>,
        resolver: Arc<QueueResolver>,
        idempotency: Arc<IdempotencyStore>,
        notifier: Arc<dyn Notifier>,
        listeners: HashMap<String, Arc<dyn Listener>>,
        long_running_events: Vec<String>,
        validation_error_rate_threshold: f64,
        transient_error_rate_threshold: f64,
        logical_queue: impl Into<String>,
        service: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            resolver,
            idempotency,
            notifier,
            listeners,
            long_running_events,
            validation_error_rate_threshold,
            transient_error_rate_threshold,
            logical_queue: logical_queue.into(),
            service: service.into(),
        }
    }

    /// Resolve the queue, perform one long-poll receive, process the batch
    /// concurrently, then run rate alerting. This is the unit the supervised
    /// process calls once and the persistent-loop deployment calls in a
    /// `loop {}`.
    pub async fn run_one_cycle(&self) -> Result<CycleOutcome> {
        let queue_url = self.resolver.resolve(&self.logical_queue).await?;

        let messages = self
            .transport
            .receive_message(
                &queue_url,
                MAX_MESSAGES_PER_RECEIVE,
                RECEIVE_WAIT_TIME_SECS,
                RECEIVE_VISIBILITY_TIMEOUT_SECS,
            )
            .await?;

        if messages.is_empty() {
            return Ok(CycleOutcome::NoMessages);
        }

        let stats = CycleStats::default();
        let mut in_flight = FuturesUnordered::new();
        for message in messages {
            in_flight.push(self.process_message(queue_url.clone(), message, &stats));
        }
        while in_flight.next().await.is_some() {}

        self.alert_on_rate_thresholds(&stats).await;
        Ok(CycleOutcome::Processed(stats))
    }

    async fn process_message(
        &self,
        queue_url: String,
        message: crate::transport::ReceivedMessage,
        stats: &CycleStats,
    ) {
        // DECODE
        let envelope: Envelope = match serde_json::from_str(&message.body) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(error = %err, "failed to decode message body");
                self.ack_discard(&queue_url, &message.receipt_handle, "unknown", "validation_error").await;
                stats.validation_error.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        // VALIDATE
        if !envelope.validate() {
            self.ack_discard(&queue_url, &message.receipt_handle, envelope.event_type(), "validation_error").await;
            stats.validation_error.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let key = envelope.idempotency_key.clone();

        // DEDUP
        match self.idempotency.is_processed(&key).await {
            Ok(true) => {
                self.ack_discard(&queue_url, &message.receipt_handle, envelope.event_type(), "success").await;
                stats.success.fetch_add(1, Ordering::Relaxed);
                return;
            }
            Ok(false) => {}
            Err(err) => {
                warn!(error = %err, "idempotency dedup check failed, leaving for redelivery");
                stats.transient_error.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }

        // CLAIM
        if let Err(err) = self.idempotency.claim(&key).await {
            warn!(error = %err, "idempotency claim failed, leaving for redelivery");
            stats.transient_error.fetch_add(1, Ordering::Relaxed);
            return;
        }

        // EXTEND_VIS
        if self.long_running_events.iter().any(|e| e == envelope.event_type()) {
            if let Err(err) = self
                .transport
                .change_message_visibility(
                    &queue_url,
                    &message.receipt_handle,
                    LONG_RUNNING_VISIBILITY_TIMEOUT_SECS,
                )
                .await
            {
                warn!(error = %err, "failed to extend visibility for long-running event");
            }
        }

        // DISPATCH
        let Some(listener) = self.listeners.get(envelope.event_type()) else {
            warn!(event_type = %envelope.event_type(), "unmapped event type");
            let _ = self.idempotency.release(&key).await;
            self.notifier
                .notify(
                    AlertLevel::Critical,
                    "unmapped event type",
                    serde_json::json!({"event_type": envelope.event_type(), "queue": self.logical_queue}),
                )
                .await;
            self.ack_discard(&queue_url, &message.receipt_handle, envelope.event_type(), "permanent_error").await;
            stats.permanent_error.fetch_add(1, Ordering::Relaxed);
            return;
        };

        let dispatch_start = Instant::now();
        let dispatch_result = listener.handle(envelope.unwrap()).await;
        DISPATCH_DURATION_SECONDS
            .with_label_values(&[envelope.event_type()])
            .observe(dispatch_start.elapsed().as_secs_f64());

        match dispatch_result {
            Ok(()) => {
                if let Err(err) = self.idempotency.commit(&key, envelope.event_type(), &self.service).await {
                    warn!(error = %err, "commit failed after successful handle, leaving for redelivery");
                    let _ = self.idempotency.release(&key).await;
                    stats.transient_error.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                self.ack_discard(&queue_url, &message.receipt_handle, envelope.event_type(), "success").await;
                stats.success.fetch_add(1, Ordering::Relaxed);
                info!(event_type = %envelope.event_type(), idempotency_key = %key, "handled event");
            }
            Err(listener_error) => {
                let _ = self.idempotency.release(&key).await;
                match listener_error.classify() {
                    ErrorClass::Permanent => {
                        self.notifier
                            .notify(
                                AlertLevel::Critical,
                                &listener_error.to_string(),
                                serde_json::json!({"event_type": envelope.event_type(), "queue": self.logical_queue}),
                            )
                            .await;
                        self.ack_discard(&queue_url, &message.receipt_handle, envelope.event_type(), "permanent_error").await;
                        stats.permanent_error.fetch_add(1, Ordering::Relaxed);
                    }
                    ErrorClass::Transient | ErrorClass::Unknown => {
                        warn!(error = %listener_error, event_type = %envelope.event_type(), "transient listener failure, leaving for redelivery");
                        stats.transient_error.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }
    }

    async fn ack_discard(&self, queue_url: &str, receipt_handle: &str, event_type: &str, outcome: &str) {
        if let Err(err) = self.transport.delete_message(queue_url, receipt_handle).await {
            warn!(error = %err, "failed to delete acked message");
        }
        CONSUME_OUTCOME_TOTAL.with_label_values(&[event_type, outcome]).inc();
    }

    async fn alert_on_rate_thresholds(&self, stats: &CycleStats) {
        let total = stats.total();
        if total == 0 {
            return;
        }

        let validation_rate = stats.validation_error.load(Ordering::Relaxed) as f64 / total as f64;
        if validation_rate > self.validation_error_rate_threshold {
            self.notifier
                .notify(
                    AlertLevel::Warning,
                    "validation error rate threshold exceeded",
                    serde_json::json!({
                        "queue": self.logical_queue,
                        "rate": validation_rate,
                        "threshold": self.validation_error_rate_threshold,
                        "total": total,
                    }),
                )
                .await;
        }

        let transient_rate = stats.transient_error.load(Ordering::Relaxed) as f64 / total as f64;
        if transient_rate > self.transient_error_rate_threshold {
            self.notifier
                .notify(
                    AlertLevel::Warning,
                    "transient error rate threshold exceeded",
                    serde_json::json!({
                        "queue": self.logical_queue,
                        "rate": transient_rate,
                        "threshold": self.transient_error_rate_threshold,
                        "total": total,
                    }),
                )
                .await;
        }
    }
}
