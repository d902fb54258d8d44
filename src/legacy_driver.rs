//! The secondary "legacy" transport, modeled as an opaque contract.
//!
//! The legacy driver's own wire protocol is irrelevant here; this crate
//! only needs the two operations the router calls through.

use async_trait::async_trait;
use serde_json::Value;
use std::error::Error as StdError;

/// Fulfilled by the reference deployment's pre-existing transport. Errors
/// are returned boxed because the legacy side has no declared error kind of
/// its own; the router classifies them with [`crate::Error::classify_opaque`].
#[async_trait]
pub trait LegacyDriver: Send + Sync {
    /// Publish an already-wrapped event. Returns an opaque identifier on success.
    async fn publish(&self, event_type: &str, payload: &Value) -> Result<String, Box<dyn StdError + Send + Sync>>;

    /// Cheap liveness probe, consulted before a fallback pre-check.
    async fn is_available(&self) -> bool;
}
