//! # Event Envelope
//!
//! Wire envelope for every event the gateway publishes.
//!
//! ## Envelope Fields
//!
//! - `event_type`: Name of the business event (e.g. "OrderCreated")
//! - `schema_version`: Version of the `data` schema, for safe evolution
//! - `data`: Event-specific payload (generic type parameter)
//! - `timestamp`: RFC 3339 UTC capture from the injected clock
//! - `partition_key`: Key that pins the event to an ordered partition
//!
//! Envelopes are built once, never mutated, and serialized whole before they
//! reach a publisher, so a partial envelope can never be published.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{BusError, BusResult};

/// Source of envelope timestamps
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock frozen at one instant (tests, replays)
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Standard event envelope
///
/// # Type Parameter
///
/// * `T` - The event-specific payload type
///
/// # Examples
///
/// ```rust
/// use event_bus::{EventEnvelope, SystemClock};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Serialize, Deserialize)]
/// struct OrderShipped {
///     order_id: u64,
///     carrier: String,
/// }
///
/// let envelope = EventEnvelope::new(
///     "OrderShipped",
///     "1001".to_string(),
///     OrderShipped { order_id: 1001, carrier: "ups".to_string() },
///     &SystemClock,
/// )
/// .with_schema_version(2);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope<T> {
    /// Business event name
    pub event_type: String,

    /// Version of the `data` schema
    pub schema_version: u32,

    /// Event-specific payload
    pub data: T,

    /// When the envelope was built
    pub timestamp: DateTime<Utc>,

    /// Ordering key; events sharing it keep their relative order
    pub partition_key: String,
}

impl<T> EventEnvelope<T> {
    /// Create a new envelope at schema version 1, stamped by `clock`
    pub fn new(
        event_type: impl Into<String>,
        partition_key: String,
        data: T,
        clock: &dyn Clock,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            schema_version: 1,
            data,
            timestamp: clock.now(),
            partition_key,
        }
    }

    /// Set the schema version
    pub fn with_schema_version(mut self, version: u32) -> Self {
        self.schema_version = version;
        self
    }
}

impl<T: Serialize> EventEnvelope<T> {
    /// Serialize to the UTF-8 JSON wire form
    pub fn to_bytes(&self) -> BusResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| BusError::SerializationError(e.to_string()))
    }
}

/// Validate the envelope fields of a decoded event (generic payload)
///
/// # Validation Rules
///
/// - `event_type`: Must be a non-empty string
/// - `schema_version`: Must be a positive integer
/// - `timestamp`: Must be an RFC 3339 string
/// - `partition_key`: Must be a non-empty string
/// - `data`: Must be present
pub fn validate_envelope_fields(envelope: &serde_json::Value) -> Result<(), String> {
    let event_type = envelope
        .get("event_type")
        .and_then(|v| v.as_str())
        .ok_or("Missing or invalid event_type")?;

    if event_type.is_empty() {
        return Err("event_type cannot be empty".to_string());
    }

    let schema_version = envelope
        .get("schema_version")
        .and_then(|v| v.as_u64())
        .ok_or("Missing or invalid schema_version")?;

    if schema_version == 0 {
        return Err("schema_version must be positive".to_string());
    }

    let timestamp = envelope
        .get("timestamp")
        .and_then(|v| v.as_str())
        .ok_or("Missing or invalid timestamp")?;

    DateTime::parse_from_rfc3339(timestamp)
        .map_err(|e| format!("timestamp is not RFC 3339: {}", e))?;

    let partition_key = envelope
        .get("partition_key")
        .and_then(|v| v.as_str())
        .ok_or("Missing or invalid partition_key")?;

    if partition_key.is_empty() {
        return Err("partition_key cannot be empty".to_string());
    }

    match envelope.get("data") {
        Some(v) if !v.is_null() => Ok(()),
        _ => Err("Missing data".to_string()),
    }
}
