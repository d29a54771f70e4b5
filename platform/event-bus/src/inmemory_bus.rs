//! In-memory implementation of the EventBus trait for testing and development

use crate::{AckMode, BusError, BusMessage, BusRecord, BusResult, EventBus};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

/// Records kept per topic by [`InMemoryBus::new`]
pub const DEFAULT_RETAINED_PER_TOPIC: usize = 10_000;

/// EventBus implementation backed by an in-process log
///
/// This implementation is suitable for:
/// - Unit tests (no external dependencies)
/// - Local development without Docker
/// - Integration tests that need to inspect exactly what reached the "broker"
///
/// Every published record is appended to a per-topic log; its position in
/// the topic is its offset. Each topic retains only its most recent records,
/// so offsets keep growing while the oldest entries are dropped.
///
/// # Example
/// ```rust
/// use event_bus::{AckMode, BusRecord, EventBus, InMemoryBus};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let bus = InMemoryBus::new();
///
/// let offset = bus
///     .publish(BusRecord::new("orders.created", "1001", b"hello".to_vec()), AckMode::All)
///     .await?;
/// assert_eq!(offset, Some(0));
///
/// let log = bus.records("orders.created");
/// assert_eq!(log[0].key(), Some("1001"));
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct InMemoryBus {
    log: Arc<Mutex<HashMap<String, TopicLog>>>,
    retain: usize,
}

#[derive(Default)]
struct TopicLog {
    next_offset: u64,
    entries: VecDeque<BusMessage>,
}

impl InMemoryBus {
    /// Create a new in-memory event bus retaining
    /// [`DEFAULT_RETAINED_PER_TOPIC`] records per topic
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_RETAINED_PER_TOPIC)
    }

    /// Create a new in-memory event bus keeping at most `retain` records per topic
    pub fn with_retention(retain: usize) -> Self {
        Self {
            log: Arc::new(Mutex::new(HashMap::new())),
            retain: retain.max(1),
        }
    }

    /// Retained records of `topic`, in broker order
    pub fn records(&self, topic: &str) -> Vec<BusMessage> {
        self.log
            .lock()
            .map(|log| {
                log.get(topic)
                    .map(|topic| topic.entries.iter().cloned().collect())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBus for InMemoryBus {
    async fn publish(&self, record: BusRecord, ack: AckMode) -> BusResult<Option<u64>> {
        if record.topic.is_empty() || record.topic.split('.').any(str::is_empty) {
            return Err(BusError::InvalidSubject(record.topic));
        }

        let headers = record.headers();
        let mut log = self
            .log
            .lock()
            .map_err(|_| BusError::InternalError("in-memory log poisoned".to_string()))?;
        let topic = log.entry(record.topic.clone()).or_default();

        let offset = topic.next_offset;
        topic.next_offset += 1;
        topic.entries.push_back(
            BusMessage::new(record.topic, record.payload)
                .with_headers(headers)
                .with_offset(offset),
        );
        while topic.entries.len() > self.retain {
            topic.entries.pop_front();
        }

        Ok(ack.waits_for_ack().then_some(offset))
    }
}
