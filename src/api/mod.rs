//! HTTP API surface.

pub mod health;
pub mod infer;
pub mod metrics;
pub mod models;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::{middleware, Router};
use chrono::Utc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::logging::track_requests;
use crate::state::AppState;

/// Build the full application router.
pub fn router(state: Arc<AppState>) -> Router {
    let mut router = Router::new()
        .route("/health", get(health::health))
        .route("/ready", get(health::ready))
        .route("/", get(health::info))
        .route("/v1/models", get(models::list_models))
        .route("/v1/models/:name", get(models::get_model))
        .route("/v1/models/:name/reload", post(models::reload_model))
        .route("/v1/models/:name/infer", post(infer::infer));

    if state.config.metrics.enabled {
        router = router.route(&state.config.metrics.path, get(metrics::export));
    }

    router
        .layer(middleware::from_fn_with_state(state.clone(), track_requests))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub(crate) fn iso_timestamp() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}
