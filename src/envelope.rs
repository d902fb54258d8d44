//! Message envelope: the canonical wrapper carrying a published event plus
//! routing and idempotency metadata.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Current envelope schema version.
pub const ENVELOPE_VERSION: &str = "1.0";

/// Payload keys stripped from every nesting depth before hashing.
const CANONICAL_STRIP_KEYS: [&str; 5] =
    ["timestamp", "created_at", "updated_at", "deleted_at", "trace_id"];

/// The canonical message envelope.
///
/// All seven fields are mandatory; a message body missing any of them fails
/// to deserialize (or fails [`Envelope::validate`] for the semantic checks
/// deserialization can't express, such as an empty `event_type`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Envelope {
    /// Non-empty string; routing key and listener lookup key.
    pub event_type: String,

    /// Origin service identifier (non-empty string).
    pub service: String,

    /// Arbitrary structured payload.
    pub payload: Value,

    /// 64-hex-char SHA-256 over `event_type + "|" + canonical(payload)`.
    pub idempotency_key: String,

    /// UUID v4 generated per publish.
    pub trace_id: Uuid,

    /// ISO-8601 instant of publish.
    pub timestamp: DateTime<Utc>,

    /// Envelope schema version.
    pub version: String,
}

impl Envelope {
    /// Wrap a payload into a new envelope, deriving the idempotency key from
    /// `event_type` and the canonicalized payload.
    pub fn wrap(event_type: impl Into<String>, payload: Value, service: impl Into<String>) -> Self {
        let event_type = event_type.into();
        let idempotency_key = compute_idempotency_key(&event_type, &payload);

        Self {
            event_type,
            service: service.into(),
            payload,
            idempotency_key,
            trace_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            version: ENVELOPE_VERSION.to_string(),
        }
    }

    /// Recover the original payload.
    pub fn unwrap(&self) -> &Value {
        &self.payload
    }

    /// Structural validation: all seven fields present and non-empty where
    /// that's meaningful. Logs which field failed and returns `false` rather
    /// than an error.
    pub fn validate(&self) -> bool {
        if self.event_type.trim().is_empty() {
            tracing::warn!("envelope validation failed: event_type is empty");
            return false;
        }
        if self.service.trim().is_empty() {
            tracing::warn!("envelope validation failed: service is empty");
            return false;
        }
        if self.idempotency_key.len() != 64
            || !self.idempotency_key.chars().all(|c| c.is_ascii_hexdigit())
        {
            tracing::warn!(
                idempotency_key = %self.idempotency_key,
                "envelope validation failed: idempotency_key is not 64 hex chars"
            );
            return false;
        }
        if self.version.trim().is_empty() {
            tracing::warn!("envelope validation failed: version is empty");
            return false;
        }
        true
    }

    /// The routing event type.
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// The per-publish trace id.
    pub fn trace_id(&self) -> Uuid {
        self.trace_id
    }

    /// Serialize to the wire format (UTF-8 JSON).
    pub fn to_bytes(&self) -> crate::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserialize from the wire format.
    pub fn from_bytes(bytes: &[u8]) -> crate::Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Compute the deterministic idempotency key for a (event_type, payload) pair.
pub fn compute_idempotency_key(event_type: &str, payload: &Value) -> String {
    let canonical = canonicalize_payload(payload);
    let mut hasher = Sha256::new();
    hasher.update(event_type.as_bytes());
    hasher.update(b"|");
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

/// Canonicalize a payload: strip volatile keys at every depth,
/// sort object keys lexicographically at every depth, preserve array order.
pub fn canonicalize_payload(payload: &Value) -> String {
    let stripped = strip_and_sort(payload);
    serde_json::to_string(&stripped).expect("canonicalized value always serializes")
}

fn strip_and_sort(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut sorted = Map::new();
            let mut keys: Vec<&String> = map
                .keys()
                .filter(|k| !CANONICAL_STRIP_KEYS.contains(&k.as_str()))
                .collect();
            keys.sort();
            for key in keys {
                sorted.insert(key.clone(), strip_and_sort(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(strip_and_sort).collect()),
        other => other.clone(),
    }
}
