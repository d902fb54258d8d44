//! Configuration surface for the message bus.
//!
//! Loaded in layers: built-in defaults, an optional environment-specific
//! file, then `MESSAGE_BUS__`-prefixed environment variable overrides (the
//! same layering shape the reference deployment's other services use).

use ::config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;

/// Primary transport driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum Driver {
    /// The managed cloud queue (aws-sdk-sqs backed).
    Managed,
    /// The opaque legacy transport.
    Legacy,
}

/// Per-service queue mapping (`queues.{service}` in the config surface).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceQueues {
    /// Logical queue name used when no more specific mapping applies.
    pub default: String,
    /// Additional logical queue names this service publishes or consumes.
    #[serde(default)]
    pub specific: Vec<String>,
}

/// DLQ tooling thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqConfig {
    /// Depth above which `monitor_dlq` alerts (default 10).
    pub alert_threshold: u64,
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self { alert_threshold: 10 }
    }
}

/// Idempotency store TTLs, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyConfig {
    /// `processing:{key}` TTL (default 300s / 5 min).
    pub processing_ttl_sec: u64,
    /// `processed:{key}` TTL (default 604800s / 7 days).
    pub processed_ttl_sec: u64,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            processing_ttl_sec: 300,
            processed_ttl_sec: 604_800,
        }
    }
}

/// Durable processed-events cleanup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupConfig {
    /// Rows older than this many days are purged (default 7).
    pub retention_days: i64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self { retention_days: 7 }
    }
}

/// Metrics sink toggles (`cloudwatch.{enabled,namespace}` config keys,
/// exported here via the `prometheus` crate rather than CloudWatch).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Whether to register/export metrics at all.
    pub enabled: bool,
    /// Namespace prefix for exported metric names.
    pub namespace: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            namespace: "message_bus".to_string(),
        }
    }
}

/// Durable idempotency store connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Postgres connection URL.
    pub url: String,
    /// Max pool connections.
    pub max_connections: u32,
}

/// Fast-tier idempotency cache connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL.
    pub url: String,
    /// Connection pool size.
    pub pool_size: u32,
}

/// Queue transport connection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AwsConfig {
    /// AWS region; uses the default provider chain if unset.
    pub region: Option<String>,
    /// Custom endpoint URL, for LocalStack or integration tests.
    pub endpoint_url: Option<String>,
}

/// The full message bus configuration bundle.
///
/// Treated as an immutable value passed explicitly to each component's
/// constructor, never a hidden singleton.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageBusConfig {
    /// Primary transport driver.
    pub driver: Driver,
    /// Publish to both drivers on every call.
    pub dual_write: bool,
    /// Fall back to the legacy driver on primary failure or queue-absence.
    pub fallback_to_legacy: bool,
    /// Deployment environment queue prefix (`local`, `dev`, `staging`, `production`, ...).
    pub prefix: String,
    /// Resolve (and thereby create) all configured queues at process start.
    pub auto_ensure: bool,
    /// Event types eligible for the one-shot visibility extension to 120s.
    pub long_running_events: Vec<String>,
    /// Per-service logical queue mappings.
    pub queues: HashMap<String, ServiceQueues>,
    /// `event_type -> logical queue name` routing table, with a `default` fallback.
    pub target_queues: HashMap<String, String>,
    /// Fallback logical queue name when `target_queues` has no entry for an event type.
    pub default_target_queue: String,
    /// DLQ tooling thresholds.
    pub dlq: DlqConfig,
    /// Rate-alert threshold for validation errors (default 0.01).
    pub validation_error_rate_threshold: f64,
    /// Rate-alert threshold for transient errors (default 0.10).
    pub transient_error_rate_threshold: f64,
    /// Idempotency store TTLs.
    pub idempotency: IdempotencyConfig,
    /// Durable processed-events cleanup.
    pub cleanup: CleanupConfig,
    /// Metrics sink toggles.
    pub cloudwatch: MetricsConfig,
    /// Durable idempotency store connection.
    pub database: DatabaseConfig,
    /// Fast-tier idempotency cache connection.
    pub redis: RedisConfig,
    /// Queue transport connection.
    pub aws: AwsConfig,
}

impl MessageBusConfig {
    /// Load configuration from defaults, an optional file, then environment
    /// variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let environment = env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string());

        let mut builder = ConfigBuilder::builder()
            .set_default("driver", "Managed")?
            .set_default("dual_write", false)?
            .set_default("fallback_to_legacy", false)?
            .set_default("prefix", environment.clone())?
            .set_default("auto_ensure", false)?
            .set_default("long_running_events", Vec::<String>::new())?
            .set_default("default_target_queue", "default-queue")?
            .set_default("dlq.alert_threshold", 10)?
            .set_default("validation_error_rate_threshold", 0.01)?
            .set_default("transient_error_rate_threshold", 0.10)?
            .set_default("idempotency.processing_ttl_sec", 300)?
            .set_default("idempotency.processed_ttl_sec", 604_800)?
            .set_default("cleanup.retention_days", 7)?
            .set_default("cloudwatch.enabled", true)?
            .set_default("cloudwatch.namespace", "message_bus")?
            .set_default("database.max_connections", 10)?
            .set_default("redis.pool_size", 10)?;

        if let Ok(config_file) = env::var("CONFIG_FILE") {
            builder = builder.add_source(File::with_name(&config_file).required(false));
        } else {
            builder =
                builder.add_source(File::with_name(&format!("config/{environment}")).required(false));
        }

        builder = builder.add_source(
            Environment::with_prefix("MESSAGE_BUS")
                .separator("__")
                .list_separator(","),
        );

        if let Ok(database_url) = env::var("DATABASE_URL") {
            builder = builder.set_override("database.url", database_url)?;
        }
        if let Ok(redis_url) = env::var("REDIS_URL") {
            builder = builder.set_override("redis.url", redis_url)?;
        }

        builder.build()?.try_deserialize()
    }

    /// Validate cross-field invariants that plain deserialization can't express.
    pub fn validate(&self) -> Result<(), String> {
        if self.database.url.is_empty() {
            return Err("database.url is required".to_string());
        }
        if self.redis.url.is_empty() {
            return Err("redis.url is required".to_string());
        }
        if self.prefix.trim().is_empty() {
            return Err("prefix is required".to_string());
        }
        if !(0.0..=1.0).contains(&self.validation_error_rate_threshold) {
            return Err("validation_error_rate_threshold must be between 0 and 1".to_string());
        }
        if !(0.0..=1.0).contains(&self.transient_error_rate_threshold) {
            return Err("transient_error_rate_threshold must be between 0 and 1".to_string());
        }
        Ok(())
    }

    /// Resolve the logical queue name to publish `event_type` on.
    pub fn target_queue_for(&self, event_type: &str) -> &str {
        self.target_queues
            .get(event_type)
            .map(String::as_str)
            .unwrap_or(&self.default_target_queue)
    }

    /// Effective remote queue name for a logical name: `{prefix}-{logicalName}`.
    pub fn effective_queue_name(&self, logical_name: &str) -> String {
        format!("{}-{}", self.prefix, logical_name)
    }

    /// Effective remote DLQ name for a logical name: `{prefix}-{logicalName}-dlq`.
    pub fn effective_dlq_name(&self, logical_name: &str) -> String {
        format!("{}-{}-dlq", self.prefix, logical_name)
    }
}
