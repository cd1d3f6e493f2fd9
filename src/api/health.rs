//! Liveness, readiness, and server info endpoints.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};

use super::iso_timestamp;
use crate::state::AppState;

/// GET /health - liveness probe.
pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": iso_timestamp(),
    }))
}

/// GET /ready - readiness probe: 200 once at least one model is loaded.
pub async fn ready(State(state): State<Arc<AppState>>) -> (StatusCode, Json<Value>) {
    let models_ready = state.registry.has_models().await;
    let body = json!({
        "status": if models_ready { "ready" } else { "not_ready" },
        "models_loaded": state.registry.count().await,
        "timestamp": iso_timestamp(),
    });

    let status = if models_ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

/// GET / - server info.
pub async fn info(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "name": "onnx-serve",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "models_loaded": state.registry.count().await,
        "batching_enabled": state.config.batching.enabled,
        "providers": state.config.inference.providers,
    }))
}
