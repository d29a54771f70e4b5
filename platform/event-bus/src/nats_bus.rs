//! NATS-based implementation of the EventBus trait

use crate::{AckMode, BusError, BusRecord, BusResult, EventBus};
use async_nats::jetstream::{self, context::PublishErrorKind};
use async_nats::{Client, HeaderMap};
use async_trait::async_trait;
use futures::future::join_all;
use std::collections::HashMap;
use std::future::IntoFuture;
use std::time::Duration;

/// Exponential reconnect delay: `base * 2^attempts`, capped at `max`
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            max: Duration::from_secs(10),
        }
    }
}

impl ReconnectPolicy {
    pub fn delay(&self, attempts: usize) -> Duration {
        let exp = attempts.min(16) as u32;
        self.base.saturating_mul(1u32 << exp).min(self.max)
    }
}

/// EventBus implementation using NATS JetStream
///
/// `AckMode::None` goes through core NATS publish. `Leader` and `All` go
/// through JetStream and wait for the `PublishAck`; JetStream acknowledges a
/// write only once the stream's replica quorum has it, so both modes get the
/// quorum guarantee.
///
/// # Example
/// ```rust,no_run
/// use event_bus::{AckMode, BusRecord, EventBus, NatsBus, ReconnectPolicy};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let bus = NatsBus::connect("nats://localhost:4222", "order-gateway", ReconnectPolicy::default()).await?;
/// bus.publish(BusRecord::new("orders_processing", "1001", b"hello".to_vec()), AckMode::All).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct NatsBus {
    client: Client,
    jetstream: jetstream::Context,
}

impl NatsBus {
    /// Create a new NatsBus from an existing NATS client
    pub fn new(client: Client) -> Self {
        let jetstream = jetstream::new(client.clone());
        Self { client, jetstream }
    }

    /// Connect with exponential reconnect backoff
    ///
    /// The initial connect is retried under the same policy, so the gateway
    /// can start before the broker is reachable.
    pub async fn connect(url: &str, name: &str, policy: ReconnectPolicy) -> BusResult<Self> {
        let client = async_nats::ConnectOptions::new()
            .name(name)
            .retry_on_initial_connect()
            .reconnect_delay_callback(move |attempts| policy.delay(attempts))
            .connect(url)
            .await
            .map_err(|e| BusError::ConnectionError(e.to_string()))?;

        tracing::info!(url = %url, "Connected to NATS");
        Ok(Self::new(client))
    }

    /// Get a reference to the underlying NATS client
    pub fn client(&self) -> &Client {
        &self.client
    }

    fn headers(record: &BusRecord) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in record.headers() {
            headers.insert(name.as_str(), value.as_str());
        }
        headers
    }

    fn ensure_connected(&self) -> BusResult<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(BusError::ConnectionError(
                "NATS connection is not established".to_string(),
            ))
        }
    }
}

fn map_jetstream_error(err: jetstream::context::PublishError) -> BusError {
    match err.kind() {
        PublishErrorKind::StreamNotFound => {
            BusError::Rejected(format!("no stream for subject: {}", err))
        }
        PublishErrorKind::WrongLastMessageId | PublishErrorKind::WrongLastSequence => {
            BusError::Rejected(err.to_string())
        }
        PublishErrorKind::TimedOut => BusError::Timeout,
        PublishErrorKind::BrokenPipe => BusError::ConnectionError(err.to_string()),
        _ => BusError::PublishError(err.to_string()),
    }
}

impl NatsBus {
    /// Send one record and, for acked modes, wait for the `PublishAck`
    async fn send(&self, record: BusRecord, ack: AckMode) -> BusResult<Option<u64>> {
        let headers = Self::headers(&record);

        if !ack.waits_for_ack() {
            return self
                .client
                .publish_with_headers(record.topic, headers, record.payload.into())
                .await
                .map(|_| None)
                .map_err(|e| BusError::PublishError(e.to_string()));
        }

        let ack = self
            .jetstream
            .publish_with_headers(record.topic, headers, record.payload.into())
            .await
            .map_err(map_jetstream_error)?
            .into_future()
            .await
            .map_err(map_jetstream_error)?;
        if ack.duplicate {
            tracing::debug!(
                stream = %ack.stream,
                sequence = ack.sequence,
                "Broker discarded duplicate publish"
            );
        }
        Ok(Some(ack.sequence))
    }
}

#[async_trait]
impl EventBus for NatsBus {
    async fn publish(&self, record: BusRecord, ack: AckMode) -> BusResult<Option<u64>> {
        self.ensure_connected()?;
        self.send(record, ack).await
    }

    /// Pipelines across keys: each key's records go out one after another,
    /// while different keys are in flight together. A key stops at its first
    /// retryable failure and its remaining records come back `Held`.
    async fn publish_batch(
        &self,
        records: Vec<BusRecord>,
        ack: AckMode,
    ) -> Vec<BusResult<Option<u64>>> {
        if let Err(e) = self.ensure_connected() {
            return records.iter().map(|_| Err(e.clone())).collect();
        }

        let total = records.len();
        let mut chains: HashMap<String, Vec<(usize, BusRecord)>> = HashMap::new();
        for (i, record) in records.into_iter().enumerate() {
            chains.entry(record.key.clone()).or_default().push((i, record));
        }

        let sends = chains.into_values().map(|chain| async move {
            let mut out = Vec::with_capacity(chain.len());
            let mut failed = false;
            for (i, record) in chain {
                if failed {
                    out.push((i, Err(BusError::Held)));
                    continue;
                }
                let result = self.send(record, ack).await;
                failed = matches!(&result, Err(e) if !e.is_rejection());
                out.push((i, result));
            }
            out
        });

        let mut results: Vec<BusResult<Option<u64>>> = (0..total)
            .map(|_| Err(BusError::InternalError("no result for record".to_string())))
            .collect();
        for (i, result) in join_all(sends).await.into_iter().flatten() {
            results[i] = result;
        }
        results
    }

    fn is_connected(&self) -> bool {
        self.client.connection_state() == async_nats::connection::State::Connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconnect_delay_grows_and_caps() {
        let policy = ReconnectPolicy {
            base: Duration::from_millis(100),
            max: Duration::from_secs(2),
        };

        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(800));
        assert_eq!(policy.delay(5), Duration::from_secs(2));
        assert_eq!(policy.delay(usize::MAX), Duration::from_secs(2));
    }

    // These tests require a running NATS server with JetStream enabled:
    // docker run -p 4222:4222 nats:2.10-alpine -js

    #[tokio::test]
    #[ignore] // Requires NATS server
    async fn test_nats_bus_core_publish_has_no_offset() {
        let bus = NatsBus::connect("nats://localhost:4222", "event-bus-test", ReconnectPolicy::default())
            .await
            .expect("NATS server must be running on localhost:4222");

        let offset = bus
            .publish(BusRecord::new("test.nats.hello", "7", b"test".to_vec()), AckMode::None)
            .await
            .unwrap();

        assert_eq!(offset, None);
        assert!(bus.is_connected());
    }

    #[tokio::test]
    #[ignore] // Requires NATS server with JetStream
    async fn test_jetstream_publish_without_stream_is_rejected() {
        let bus = NatsBus::connect("nats://localhost:4222", "event-bus-test", ReconnectPolicy::default())
            .await
            .expect("NATS server must be running on localhost:4222");

        let err = bus
            .publish(BusRecord::new("no.stream.here", "1", b"x".to_vec()), AckMode::All)
            .await
            .unwrap_err();

        assert!(err.is_rejection(), "unexpected error: {err}");
    }
}
