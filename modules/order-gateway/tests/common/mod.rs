#![allow(dead_code)]

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, Response};
use axum::Router;
use chrono::{TimeZone, Utc};
use event_bus::{
    AckMode, BusError, BusRecord, BusResult, ConnectionPool, DeliveryConfig,
    DeliveryTracker, EventBus, FixedClock, PublisherClient, PublisherConfig, RetryConfig,
};
use http_body_util::BodyExt;
use order_gateway::gateway::OrderGateway;
use order_gateway::metrics::Metrics;
use order_gateway::routes::{router, AppState};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const TOPIC: &str = "orders_processing";

pub fn fixed_clock() -> FixedClock {
    FixedClock(Utc.with_ymd_and_hms(2025, 3, 14, 9, 26, 53).unwrap())
}

pub fn publisher_config() -> PublisherConfig {
    PublisherConfig {
        linger: Duration::from_millis(1),
        ..Default::default()
    }
}

pub fn delivery_config() -> DeliveryConfig {
    DeliveryConfig {
        retry: RetryConfig {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
        },
        deadline: Duration::from_secs(5),
    }
}

/// Build the gateway router over `bus`
pub fn app_with(
    bus: Arc<dyn EventBus>,
    publisher: PublisherConfig,
    delivery: DeliveryConfig,
) -> (Router, PublisherClient) {
    let pool = ConnectionPool::new(vec![bus]).unwrap();
    let client = PublisherClient::start(pool, publisher).unwrap();
    let metrics = Metrics::new().unwrap();
    let tracker = DeliveryTracker::new(client.clone(), delivery);
    let gateway = OrderGateway::new(
        tracker,
        Arc::new(fixed_clock()),
        TOPIC,
        AckMode::All,
        metrics.clone(),
    );

    let state = Arc::new(AppState {
        gateway,
        publisher: client.clone(),
        metrics,
    });
    (router(state), client)
}

pub fn app(bus: Arc<dyn EventBus>) -> Router {
    app_with(bus, publisher_config(), delivery_config()).0
}

pub fn post_order(body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/v1/orders")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

/// Read response body as JSON.
pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

pub async fn body_text(response: Response<Body>) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

pub const SAMPLE_ORDER: &str = r#"{
    "order_id": 1001,
    "customer_id": 42,
    "total_amount": 99.99,
    "items": [
        {"sku": "TSHIRT-BLK", "quantity": 1},
        {"sku": "MUG-COF", "quantity": 1}
    ]
}"#;

/// Broker that refuses every connection
#[derive(Default)]
pub struct UnreachableBus {
    pub calls: AtomicU32,
}

impl UnreachableBus {
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventBus for UnreachableBus {
    async fn publish(&self, _record: BusRecord, _ack: AckMode) -> BusResult<Option<u64>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(BusError::ConnectionError("connection refused".to_string()))
    }

    fn is_connected(&self) -> bool {
        false
    }
}

/// Broker that accepts records and never acknowledges them
pub struct SilentBus;

#[async_trait]
impl EventBus for SilentBus {
    async fn publish(&self, _record: BusRecord, _ack: AckMode) -> BusResult<Option<u64>> {
        futures::future::pending().await
    }
}
