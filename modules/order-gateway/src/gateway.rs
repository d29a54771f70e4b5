//! Order gateway: validate, wrap, publish, wait for a bounded answer

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use event_bus::{AckMode, Clock, DeliveryFailure, DeliveryTracker};
use std::sync::Arc;
use std::time::Instant;

use crate::envelope::build_order_created;
use crate::metrics::Metrics;
use crate::models::{ErrorResponse, ValidationErrorResponse};
use crate::validation::{validate_order, ValidationError};

pub const ACCEPTED_MESSAGE: &str = "Order processed and event published";

/// An order the broker has acknowledged
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Accepted {
    pub event_id: String,
    pub offset: Option<u64>,
    pub attempts: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("malformed JSON body: {0}")]
    MalformedBody(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("failed to serialize event: {0}")]
    Serialization(String),

    #[error("event {event_id} not delivered: {cause}")]
    Delivery {
        event_id: String,
        cause: DeliveryFailure,
    },
}

impl GatewayError {
    /// Label for the `gateway_orders_total` counter
    pub fn metric_label(&self) -> &'static str {
        match self {
            GatewayError::MalformedBody(_) => "malformed",
            GatewayError::Validation(_) => "invalid",
            GatewayError::Serialization(_) => "error",
            GatewayError::Delivery { cause, .. } => match cause {
                DeliveryFailure::Overloaded => "overloaded",
                DeliveryFailure::Closed => "closed",
                DeliveryFailure::DeadlineExceeded(_) => "deadline_exceeded",
                _ => "failed",
            },
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        match self {
            GatewayError::MalformedBody(e) => (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse {
                    message: "Malformed JSON body".to_string(),
                    error: e,
                    event_id: None,
                }),
            )
                .into_response(),
            GatewayError::Validation(e) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(ValidationErrorResponse {
                    message: e.summary(),
                    errors: e.to_map(),
                }),
            )
                .into_response(),
            GatewayError::Serialization(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    message: "Failed to build event".to_string(),
                    error: e,
                    event_id: None,
                }),
            )
                .into_response(),
            GatewayError::Delivery { event_id, cause } => {
                let (status, message) = match &cause {
                    DeliveryFailure::Overloaded | DeliveryFailure::Closed => (
                        StatusCode::SERVICE_UNAVAILABLE,
                        "Gateway is not accepting events right now",
                    ),
                    DeliveryFailure::DeadlineExceeded(_) => (
                        StatusCode::GATEWAY_TIMEOUT,
                        "Timed out waiting for broker acknowledgment",
                    ),
                    _ => (StatusCode::BAD_GATEWAY, "Failed to publish event"),
                };
                let body = Json(ErrorResponse {
                    message: message.to_string(),
                    error: cause.to_string(),
                    event_id: Some(event_id),
                });

                if status == StatusCode::SERVICE_UNAVAILABLE {
                    (status, [(header::RETRY_AFTER, "1")], body).into_response()
                } else {
                    (status, body).into_response()
                }
            }
        }
    }
}

/// One request's path from raw body to broker acknowledgment
pub struct OrderGateway {
    tracker: DeliveryTracker,
    clock: Arc<dyn Clock>,
    topic: String,
    ack_mode: AckMode,
    metrics: Metrics,
}

impl OrderGateway {
    pub fn new(
        tracker: DeliveryTracker,
        clock: Arc<dyn Clock>,
        topic: impl Into<String>,
        ack_mode: AckMode,
        metrics: Metrics,
    ) -> Self {
        Self {
            tracker,
            clock,
            topic: topic.into(),
            ack_mode,
            metrics,
        }
    }

    /// Parse, validate and publish one order body
    pub async fn submit(&self, body: &[u8]) -> Result<Accepted, GatewayError> {
        let result = self.process(body).await;

        let label = match &result {
            Ok(_) => "accepted",
            Err(e) => e.metric_label(),
        };
        self.metrics.orders_total.with_label_values(&[label]).inc();
        result
    }

    async fn process(&self, body: &[u8]) -> Result<Accepted, GatewayError> {
        let value: serde_json::Value =
            serde_json::from_slice(body).map_err(|e| GatewayError::MalformedBody(e.to_string()))?;

        let order = validate_order(&value)?;
        let envelope = build_order_created(order, self.clock.as_ref());
        let event_id = envelope.partition_key.clone();
        let payload = envelope
            .to_bytes()
            .map_err(|e| GatewayError::Serialization(e.to_string()))?;

        let started = Instant::now();
        let outcome = self
            .tracker
            .deliver(&self.topic, &event_id, payload, self.ack_mode)
            .await;
        let elapsed = started.elapsed().as_secs_f64();

        match outcome {
            Ok(delivered) => {
                self.metrics
                    .delivery_duration_seconds
                    .with_label_values(&["acknowledged"])
                    .observe(elapsed);
                self.metrics
                    .delivery_attempts
                    .observe(f64::from(delivered.attempts));

                tracing::info!(
                    event_id = %event_id,
                    offset = ?delivered.offset,
                    attempts = delivered.attempts,
                    "Order event published"
                );
                Ok(Accepted {
                    event_id,
                    offset: delivered.offset,
                    attempts: delivered.attempts,
                })
            }
            Err(cause) => {
                self.metrics
                    .delivery_duration_seconds
                    .with_label_values(&["failed"])
                    .observe(elapsed);
                if let DeliveryFailure::Exhausted { attempts, .. } = &cause {
                    self.metrics.delivery_attempts.observe(f64::from(*attempts));
                }

                tracing::error!(event_id = %event_id, error = %cause, "Order event not published");
                Err(GatewayError::Delivery { event_id, cause })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn delivery(cause: DeliveryFailure) -> GatewayError {
        GatewayError::Delivery {
            event_id: "1001".to_string(),
            cause,
        }
    }

    #[test]
    fn test_shutdown_and_backpressure_counted_apart() {
        assert_eq!(delivery(DeliveryFailure::Overloaded).metric_label(), "overloaded");
        assert_eq!(delivery(DeliveryFailure::Closed).metric_label(), "closed");
        assert_eq!(
            delivery(DeliveryFailure::DeadlineExceeded(Duration::from_secs(5))).metric_label(),
            "deadline_exceeded"
        );
        assert_eq!(delivery(DeliveryFailure::Rejected("too large".into())).metric_label(), "failed");
    }

    #[test]
    fn test_shutdown_still_answers_503() {
        let response = delivery(DeliveryFailure::Closed).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "1");
    }
}
