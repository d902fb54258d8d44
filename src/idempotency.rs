//! Two-tier idempotency store: a fast TTL-keyed cache backed by a durable
//! row store.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::{Error, Result};

fn processing_key(idempotency_key: &str) -> String {
    format!("processing:{idempotency_key}")
}

fn processed_key(idempotency_key: &str) -> String {
    format!("processed:{idempotency_key}")
}

/// Fast-tier cache abstraction. A performance optimization only; the
/// durable tier is the source of truth.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Set `key` with a TTL, in seconds.
    async fn set_ex(&self, key: &str, ttl_secs: u64) -> Result<()>;
    /// Whether `key` is currently set (and unexpired).
    async fn exists(&self, key: &str) -> Result<bool>;
    /// Delete `key`, if present.
    async fn delete(&self, key: &str) -> Result<()>;
}

/// `redis`-backed [`CacheBackend`], matching the reference deployment's
/// `redis.{url,pool_size}` connection shape.
pub struct RedisCache {
    manager: redis::aio::ConnectionManager,
}

impl RedisCache {
    /// Connect using a `redis://` URL.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(Error::Cache)?;
        let manager = client.get_connection_manager().await.map_err(Error::Cache)?;
        Ok(Self { manager })
    }
}

#[async_trait]
impl CacheBackend for RedisCache {
    async fn set_ex(&self, key: &str, ttl_secs: u64) -> Result<()> {
        use redis::AsyncCommands;
        let mut connection = self.manager.clone();
        let _: () = connection.set_ex(key, true, ttl_secs).await.map_err(Error::Cache)?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        use redis::AsyncCommands;
        let mut connection = self.manager.clone();
        let exists: bool = connection.exists(key).await.map_err(Error::Cache)?;
        Ok(exists)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        use redis::AsyncCommands;
        let mut connection = self.manager.clone();
        let _: () = connection.del(key).await.map_err(Error::Cache)?;
        Ok(())
    }
}

/// `DashMap`-backed [`CacheBackend`], for tests and single-process
/// deployments where a Redis dependency isn't warranted.
#[derive(Default)]
pub struct InMemoryCache {
    entries: DashMap<String, Instant>,
}

impl InMemoryCache {
    /// Build an empty cache.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheBackend for InMemoryCache {
    async fn set_ex(&self, key: &str, ttl_secs: u64) -> Result<()> {
        self.entries
            .insert(key.to_string(), Instant::now() + Duration::from_secs(ttl_secs));
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        match self.entries.get(key) {
            Some(expires_at) if *expires_at > Instant::now() => Ok(true),
            Some(_) => {
                self.entries.remove(key);
                Ok(false)
            }
            None => Ok(false),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }
}

/// A row of the durable `processed_events` table.
#[derive(Debug, Clone)]
pub struct ProcessedEventRecord {
    /// The 64-hex-char idempotency key, primary key of the table.
    pub idempotency_key: String,
    /// The event type that was processed.
    pub event_type: String,
    /// The originating service.
    pub service: String,
    /// When the row was committed.
    pub processed_at: DateTime<Utc>,
}

/// Durable tier abstraction over the `processed_events` table.
#[async_trait]
pub trait ProcessedEventsBackend: Send + Sync {
    /// Insert a row, ignoring a duplicate primary key (insert-or-ignore).
    async fn insert_or_ignore(&self, key: &str, event_type: &str, service: &str) -> Result<()>;
    /// Whether a row with this key exists.
    async fn exists(&self, key: &str) -> Result<bool>;
    /// Delete rows older than `retention_days`, returning the count deleted.
    async fn cleanup(&self, retention_days: i64) -> Result<u64>;
}

/// `sqlx::PgPool`-backed [`ProcessedEventsBackend`].
pub struct PgProcessedEventsStore {
    pool: PgPool,
}

impl PgProcessedEventsStore {
    /// Wrap an existing connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect with `database.url` / `database.max_connections`.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    /// Run the crate's bundled migrations against this pool.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(sqlx::Error::Migrate(Box::new(e))))
    }
}

#[async_trait]
impl ProcessedEventsBackend for PgProcessedEventsStore {
    async fn insert_or_ignore(&self, key: &str, event_type: &str, service: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO processed_events (idempotency_key, event_type, service, processed_at) \
             VALUES ($1, $2, $3, now()) ON CONFLICT (idempotency_key) DO NOTHING",
        )
        .bind(key)
        .bind(event_type)
        .bind(service)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let (exists,): (bool,) = sqlx::query_as(
            "SELECT EXISTS(SELECT 1 FROM processed_events WHERE idempotency_key = $1)",
        )
        .bind(key)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn cleanup(&self, retention_days: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM processed_events WHERE processed_at < now() - ($1 || ' days')::interval")
            .bind(retention_days.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

/// In-memory [`ProcessedEventsBackend`] double for tests.
#[derive(Default)]
pub struct InMemoryProcessedEventsStore {
    rows: DashMap<String, ProcessedEventRecord>,
}

impl InMemoryProcessedEventsStore {
    /// Build an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all rows currently stored, for assertions in tests.
    pub fn rows(&self) -> Vec<ProcessedEventRecord> {
        self.rows.iter().map(|entry| entry.value().clone()).collect()
    }
}

#[async_trait]
impl ProcessedEventsBackend for InMemoryProcessedEventsStore {
    async fn insert_or_ignore(&self, key: &str, event_type: &str, service: &str) -> Result<()> {
        self.rows.entry(key.to_string()).or_insert_with(|| ProcessedEventRecord {
            idempotency_key: key.to_string(),
            event_type: event_type.to_string(),
            service: service.to_string(),
            processed_at: Utc::now(),
        });
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.rows.contains_key(key))
    }

    async fn cleanup(&self, retention_days: i64) -> Result<u64> {
        let cutoff = Utc::now() - ChronoDuration::days(retention_days);
        let stale: Vec<String> = self
            .rows
            .iter()
            .filter(|entry| entry.value().processed_at < cutoff)
            .map(|entry| entry.key().clone())
            .collect();
        for key in &stale {
            self.rows.remove(key);
        }
        Ok(stale.len() as u64)
    }
}

/// The two-tier idempotency store the consumer loop claims and commits against.
pub struct IdempotencyStore {
    cache: Arc<dyn CacheBackend>,
    durable: Arc<dyn ProcessedEventsBackend>,
    processing_ttl_secs: u64,
    processed_ttl_secs: u64,
}

impl IdempotencyStore {
    /// Build a store from its two backends and the configured TTLs.
    pub fn new(
        cache: Arc<dyn CacheBackend>,
        durable: Arc<dyn ProcessedEventsBackend>,
        processing_ttl_secs: u64,
        processed_ttl_secs: u64,
    ) -> Self {
        Self {
            cache,
            durable,
            processing_ttl_secs,
            processed_ttl_secs,
        }
    }

    /// `true` if the cache marks this key processed, else if the durable row exists.
    pub async fn is_processed(&self, key: &str) -> Result<bool> {
        if self.cache.exists(&processed_key(key)).await? {
            return Ok(true);
        }
        self.durable.exists(key).await
    }

    /// Set the advisory `processing` lock with a 5-minute TTL.
    pub async fn claim(&self, key: &str) -> Result<()> {
        self.cache.set_ex(&processing_key(key), self.processing_ttl_secs).await
    }

    /// Clear the `processing` lock and mark the key processed in both tiers.
    pub async fn commit(&self, key: &str, event_type: &str, service: &str) -> Result<()> {
        self.cache.delete(&processing_key(key)).await?;
        self.cache.set_ex(&processed_key(key), self.processed_ttl_secs).await?;
        self.durable.insert_or_ignore(key, event_type, service).await?;
        debug!(idempotency_key = %key, event_type = %event_type, "committed processed event");
        Ok(())
    }

    /// Release the advisory lock without committing (called after an exception post-CLAIM).
    pub async fn release(&self, key: &str) -> Result<()> {
        self.cache.delete(&processing_key(key)).await
    }

    /// Purge durable rows older than `retention_days`.
    pub async fn cleanup(&self, retention_days: i64) -> Result<u64> {
        self.durable.cleanup(retention_days).await
    }
}
