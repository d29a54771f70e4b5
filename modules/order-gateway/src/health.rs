use axum::{extract::State, http::StatusCode, Json};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::routes::AppState;

/// Liveness: the process is up and serving
pub async fn healthcheck() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Readiness: every pooled broker session is connected
pub async fn ready(State(state): State<Arc<AppState>>) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let broker_ok = state.publisher.is_connected();

    state
        .metrics
        .dep_up
        .with_label_values(&["broker"])
        .set(i64::from(broker_ok));
    state
        .metrics
        .dep_up
        .with_label_values(&["ready"])
        .set(i64::from(broker_ok));

    if !broker_ok {
        tracing::warn!("Readiness check failed: broker not connected");
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "unavailable", "broker": "disconnected" })),
        ));
    }

    Ok(Json(json!({
        "status": "ready",
        "broker": "connected",
        "version": env!("CARGO_PKG_VERSION")
    })))
}
