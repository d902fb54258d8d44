//! Error types for the message bus

use thiserror::Error;

/// Message bus error
#[derive(Debug, Error)]
pub enum Error {
    /// Failed to reach or authenticate against the queue transport
    #[error("connection error: {0}")]
    Connection(String),

    /// A publish attempt failed
    #[error("publish error: {0}")]
    Publish(String),

    /// A receive/subscribe attempt failed
    #[error("subscribe error: {0}")]
    Subscribe(String),

    /// Queue creation (main or DLQ) failed
    #[error("queue creation error: {0}")]
    QueueCreation(String),

    /// The requested queue does not exist and was not created
    #[error("queue not found: {0}")]
    QueueNotFound(String),

    /// Envelope JSON (de)serialization failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Envelope failed structural validation, or a loaded configuration failed its cross-field checks
    #[error("validation error: {0}")]
    Validation(String),

    /// Durable idempotency store error
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Fast-tier idempotency cache error
    #[error("cache error: {0}")]
    Cache(#[from] redis::RedisError),

    /// Configuration failed to load or was invalid
    #[error("configuration error: {0}")]
    Config(#[from] ::config::ConfigError),

    /// A listener raised a declared transient failure (safe to redeliver)
    #[error("transient error: {0}")]
    Transient(String),

    /// A listener raised a declared permanent failure (business rule, not-found, invalid state)
    #[error("permanent error: {0}")]
    Permanent(String),

    /// `event_type` has no registered listener
    #[error("unmapped event type: {0}")]
    UnmappedEvent(String),

    /// Opaque failure from the legacy driver contract (no declared kind)
    #[error("legacy driver error: {0}")]
    Legacy(String),
}

impl Error {
    /// Best-effort classification of an opaque error for which no declared kind is available.
    ///
    /// Used only for errors crossing the [`crate::driver_router::LegacyDriver`] boundary, which
    /// returns a boxed error rather than this crate's own declared `Error` kinds.
    pub fn classify_opaque(message: &str) -> ErrorClass {
        const TRANSIENT_SUBSTRINGS: [&str; 4] =
            ["connection", "timeout", "temporarily unavailable", "throttl"];

        let lower = message.to_lowercase();
        if TRANSIENT_SUBSTRINGS.iter().any(|needle| lower.contains(needle)) {
            ErrorClass::Transient
        } else {
            ErrorClass::Unknown
        }
    }
}

/// The three-way classification used by the consumer loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Leave the message for redelivery.
    Transient,
    /// Ack-discard and alert immediately.
    Permanent,
    /// Unknown: treated as Transient (prefer redelivery to silent loss).
    Unknown,
}

impl ErrorClass {
    /// Whether this class should be acked (removed from the queue) rather than left for redelivery.
    pub fn should_ack(self) -> bool {
        matches!(self, ErrorClass::Permanent)
    }
}

/// Result type
pub type Result<T> = std::result::Result<T, Error>;
