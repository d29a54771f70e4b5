//! # EventBus Abstraction
//!
//! Broker plumbing for the order gateway: a transport trait with a NATS
//! JetStream implementation and an in-memory one, the event envelope, a
//! batching publisher client, and a delivery tracker that turns publisher
//! futures into bounded, retried deliveries.
//!
//! ## Layers
//!
//! - **EventBus**: one broker session (`NatsBus` in production, `InMemoryBus` for dev/test)
//! - **ConnectionPool**: process-wide set of sessions with scoped acquisition
//! - **PublisherClient**: per-key lanes with bounded queues, linger batching, ack modes and in-lane retries
//! - **DeliveryTracker**: retry/backoff state machine, bounded for the caller by a hard deadline
//!
//! ## Usage
//!
//! ```rust,no_run
//! use event_bus::{
//!     AckMode, ConnectionPool, DeliveryConfig, DeliveryTracker, EventBus, InMemoryBus,
//!     PublisherClient, PublisherConfig,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let bus: Arc<dyn EventBus> = Arc::new(InMemoryBus::new());
//! let pool = ConnectionPool::new(vec![bus])?;
//! let publisher = PublisherClient::start(pool, PublisherConfig::default())?;
//! let tracker = DeliveryTracker::new(publisher.clone(), DeliveryConfig::default());
//!
//! let delivered = tracker
//!     .deliver("orders_processing", "1001", b"{}".to_vec(), AckMode::All)
//!     .await?;
//! println!("acknowledged at offset {:?}", delivered.offset);
//!
//! publisher.close().await;
//! # Ok(())
//! # }
//! ```

mod batch;
pub mod delivery;
mod envelope;
mod inmemory_bus;
mod nats_bus;
mod pool;
pub mod publisher;

pub use delivery::{
    AttemptOutcome, Delivered, DeliveryConfig, DeliveryFailure, DeliveryRecord, DeliveryState, DeliveryTracker,
    RetryConfig,
};
pub use envelope::{validate_envelope_fields, Clock, EventEnvelope, FixedClock, SystemClock};
pub use inmemory_bus::{InMemoryBus, DEFAULT_RETAINED_PER_TOPIC};
pub use nats_bus::{NatsBus, ReconnectPolicy};
pub use pool::{ConnectionPool, PooledConnection};
pub use publisher::{
    DeliveryHandle, OverflowPolicy, PublishError, PublishResult, PublisherClient,
    PublisherConfig,
};

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

/// A record as the broker stored it
#[derive(Debug, Clone)]
pub struct BusMessage {
    /// The subject/topic this message was published to
    pub subject: String,
    /// The message payload (raw bytes)
    pub payload: Vec<u8>,
    /// Optional headers (partition key, dedup id)
    pub headers: Option<HashMap<String, String>>,
    /// Broker-assigned position in the topic log, when known
    pub offset: Option<u64>,
}

impl BusMessage {
    /// Create a new bus message
    pub fn new(subject: String, payload: Vec<u8>) -> Self {
        Self {
            subject,
            payload,
            headers: None,
            offset: None,
        }
    }

    /// Add headers to the message
    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = Some(headers);
        self
    }

    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Partition key carried in the headers
    pub fn key(&self) -> Option<&str> {
        self.headers
            .as_ref()
            .and_then(|h| h.get(PARTITION_KEY_HEADER))
            .map(String::as_str)
    }

    pub fn dedup_id(&self) -> Option<&str> {
        self.headers
            .as_ref()
            .and_then(|h| h.get(DEDUP_ID_HEADER))
            .map(String::as_str)
    }
}

/// Header carrying the partition key of a record
pub const PARTITION_KEY_HEADER: &str = "Partition-Key";

/// Header JetStream uses to discard duplicates inside the stream's window
pub const DEDUP_ID_HEADER: &str = "Nats-Msg-Id";

/// An outbound record: topic, partition key and serialized value
#[derive(Debug, Clone, PartialEq)]
pub struct BusRecord {
    pub topic: String,
    pub key: String,
    pub payload: Vec<u8>,
    /// Broker-side deduplication id; byte-identical resubmissions share it
    pub dedup_id: Option<String>,
}

impl BusRecord {
    pub fn new(topic: impl Into<String>, key: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            key: key.into(),
            payload,
            dedup_id: None,
        }
    }

    pub fn with_dedup_id(mut self, dedup_id: String) -> Self {
        self.dedup_id = Some(dedup_id);
        self
    }

    /// Headers every transport attaches to the record
    pub fn headers(&self) -> HashMap<String, String> {
        let mut headers = HashMap::new();
        headers.insert(PARTITION_KEY_HEADER.to_string(), self.key.clone());
        if let Some(dedup_id) = &self.dedup_id {
            headers.insert(DEDUP_ID_HEADER.to_string(), dedup_id.clone());
        }
        headers
    }
}

/// How much broker acknowledgment a publish waits for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AckMode {
    /// Fire-and-forget: success once the record is handed to the connection
    None,
    /// Wait for the partition/stream leader to persist the record
    Leader,
    /// Wait for the full replica quorum
    All,
}

impl AckMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AckMode::None => "none",
            AckMode::Leader => "leader",
            AckMode::All => "all",
        }
    }

    pub fn waits_for_ack(&self) -> bool {
        !matches!(self, AckMode::None)
    }
}

impl fmt::Display for AckMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AckMode {
    type Err = BusError;

    /// Accepts the names plus the Kafka-style `0`, `1`, `-1` spellings
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "none" | "0" => Ok(AckMode::None),
            "leader" | "1" => Ok(AckMode::Leader),
            "all" | "-1" => Ok(AckMode::All),
            other => Err(BusError::InvalidConfig(format!(
                "unknown ack mode '{}', expected none|leader|all",
                other
            ))),
        }
    }
}

/// Errors that can occur when using the event bus
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BusError {
    #[error("failed to publish message: {0}")]
    PublishError(String),

    #[error("connection error: {0}")]
    ConnectionError(String),

    #[error("broker acknowledgment timed out")]
    Timeout,

    #[error("broker rejected message: {0}")]
    Rejected(String),

    #[error("serialization error: {0}")]
    SerializationError(String),

    #[error("invalid subject pattern: {0}")]
    InvalidSubject(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("internal error: {0}")]
    InternalError(String),

    /// Left unsent because an earlier record with the same key failed
    #[error("held behind a failed record with the same key")]
    Held,
}

impl BusError {
    /// Errors the broker raised about the record itself; resending cannot help
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            BusError::Rejected(_) | BusError::InvalidSubject(_) | BusError::SerializationError(_)
        )
    }
}

/// Result type for event bus operations
pub type BusResult<T> = Result<T, BusError>;

/// One broker session
///
/// Implementations must deliver records sharing a key to the broker in slice
/// order within a single `publish_batch` call. Once a record fails with a
/// retryable error, later records with its key are not sent and come back as
/// `BusError::Held`; the publisher relies on both for per-key ordering.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish one record, returning the broker offset when the ack mode yields one
    async fn publish(&self, record: BusRecord, ack: AckMode) -> BusResult<Option<u64>>;

    /// Publish records in order, one result per record
    ///
    /// The default sends records one at a time; transports that can pipeline
    /// acknowledgments override it.
    async fn publish_batch(
        &self,
        records: Vec<BusRecord>,
        ack: AckMode,
    ) -> Vec<BusResult<Option<u64>>> {
        let mut failed: HashSet<String> = HashSet::new();
        let mut results = Vec::with_capacity(records.len());
        for record in records {
            if failed.contains(&record.key) {
                results.push(Err(BusError::Held));
                continue;
            }
            let key = record.key.clone();
            let result = self.publish(record, ack).await;
            if matches!(&result, Err(e) if !e.is_rejection()) {
                failed.insert(key);
            }
            results.push(result);
        }
        results
    }

    /// Whether the session currently has a live broker connection
    fn is_connected(&self) -> bool {
        true
    }
}

impl fmt::Debug for dyn EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventBus")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ack_mode_parsing() {
        assert_eq!("none".parse::<AckMode>().unwrap(), AckMode::None);
        assert_eq!("0".parse::<AckMode>().unwrap(), AckMode::None);
        assert_eq!("Leader".parse::<AckMode>().unwrap(), AckMode::Leader);
        assert_eq!("1".parse::<AckMode>().unwrap(), AckMode::Leader);
        assert_eq!(" all ".parse::<AckMode>().unwrap(), AckMode::All);
        assert_eq!("-1".parse::<AckMode>().unwrap(), AckMode::All);
        assert!("quorum".parse::<AckMode>().is_err());
    }

    #[test]
    fn test_ack_mode_display_round_trips() {
        for mode in [AckMode::None, AckMode::Leader, AckMode::All] {
            assert_eq!(mode.to_string().parse::<AckMode>().unwrap(), mode);
        }
        assert!(!AckMode::None.waits_for_ack());
        assert!(AckMode::All.waits_for_ack());
    }

    #[test]
    fn test_rejection_classification() {
        assert!(BusError::Rejected("too big".into()).is_rejection());
        assert!(BusError::InvalidSubject("a..b".into()).is_rejection());
        assert!(!BusError::Timeout.is_rejection());
        assert!(!BusError::ConnectionError("refused".into()).is_rejection());
        assert!(!BusError::PublishError("broken pipe".into()).is_rejection());
    }

    #[test]
    fn test_record_headers_carry_partition_key() {
        let record = BusRecord::new("orders_processing", "1001", b"{}".to_vec());
        let headers = record.headers();
        assert_eq!(headers.get(PARTITION_KEY_HEADER).map(String::as_str), Some("1001"));

        let msg = BusMessage::new("orders_processing".into(), vec![]).with_headers(headers);
        assert_eq!(msg.key(), Some("1001"));
        assert_eq!(msg.dedup_id(), None);
    }

    #[test]
    fn test_record_headers_carry_dedup_id() {
        let record = BusRecord::new("orders_processing", "1001", b"{}".to_vec())
            .with_dedup_id("1001-00112233aabbccdd".to_string());

        let msg = BusMessage::new("orders_processing".into(), vec![]).with_headers(record.headers());
        assert_eq!(msg.dedup_id(), Some("1001-00112233aabbccdd"));
    }

    struct FailsKey(&'static str);

    #[async_trait]
    impl EventBus for FailsKey {
        async fn publish(&self, record: BusRecord, _ack: AckMode) -> BusResult<Option<u64>> {
            if record.key == self.0 {
                Err(BusError::ConnectionError("reset".to_string()))
            } else {
                Ok(Some(0))
            }
        }
    }

    #[tokio::test]
    async fn test_default_batch_holds_key_after_failure() {
        let records = vec![
            BusRecord::new("orders", "1001", vec![1]),
            BusRecord::new("orders", "1002", vec![2]),
            BusRecord::new("orders", "1001", vec![3]),
        ];

        let results = FailsKey("1001").publish_batch(records, AckMode::All).await;

        assert!(matches!(results[0], Err(BusError::ConnectionError(_))));
        assert_eq!(results[1], Ok(Some(0)));
        assert_eq!(results[2], Err(BusError::Held));
    }
}
