use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use event_bus::PublisherClient;
use std::sync::Arc;

use crate::gateway::{GatewayError, OrderGateway, ACCEPTED_MESSAGE};
use crate::health::{healthcheck, ready};
use crate::metrics::Metrics;
use crate::models::AcceptedResponse;

pub struct AppState {
    pub gateway: OrderGateway,
    pub publisher: PublisherClient,
    pub metrics: Metrics,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/orders", post(create_order))
        .route("/healthcheck", get(healthcheck))
        .route("/ready", get(ready))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// POST /v1/orders
pub async fn create_order(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<(StatusCode, Json<AcceptedResponse>), GatewayError> {
    let accepted = state.gateway.submit(&body).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(AcceptedResponse {
            message: ACCEPTED_MESSAGE.to_string(),
            event_id: accepted.event_id,
        }),
    ))
}

/// GET /metrics
pub async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.metrics.render() {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, format!("metrics error: {e}")),
    }
}
