//! Model listing, details, and hot-reload endpoints.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use serde_json::{json, Value};

use super::iso_timestamp;
use crate::error::{Error, Result};
use crate::state::AppState;

/// GET /v1/models - list all loaded models.
pub async fn list_models(State(state): State<Arc<AppState>>) -> Json<Value> {
    let models: Vec<Value> = state
        .registry
        .list()
        .await
        .into_iter()
        .map(|model| {
            json!({
                "name": model.name,
                "version": model.version,
                "path": model.path,
                "loaded_at": model.loaded_at,
                "input_names": model.input_names,
                "output_names": model.output_names,
            })
        })
        .collect();

    Json(json!({ "models": models }))
}

/// GET /v1/models/:name - model details including tensor interfaces.
pub async fn get_model(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<Value>> {
    let model = state
        .registry
        .get(&name)
        .await
        .ok_or_else(|| Error::ModelNotFound(name.clone()))?;

    let inputs: Vec<Value> = model
        .input_names
        .iter()
        .zip(&model.input_shapes)
        .zip(&model.input_types)
        .map(|((name, shape), dtype)| {
            json!({ "name": name, "shape": shape, "dtype": dtype.as_str() })
        })
        .collect();

    let outputs: Vec<Value> = model
        .output_names
        .iter()
        .zip(&model.output_shapes)
        .zip(&model.output_types)
        .map(|((name, shape), dtype)| {
            json!({ "name": name, "shape": shape, "dtype": dtype.as_str() })
        })
        .collect();

    Ok(Json(json!({
        "name": model.name,
        "version": model.version,
        "path": model.path,
        "loaded_at": model.loaded_at,
        "inputs": inputs,
        "outputs": outputs,
    })))
}

/// POST /v1/models/:name/reload - hot-reload a model from its file.
pub async fn reload_model(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<Value>> {
    tracing::info!("Reloading model: {}", name);

    match state.registry.reload(&name).await {
        Ok(true) => Ok(Json(json!({
            "status": "reloaded",
            "model": name,
            "timestamp": iso_timestamp(),
        }))),
        Ok(false) => Err(Error::ModelNotFound(name)),
        Err(e) => {
            tracing::error!("Failed to reload model {}: {}", name, e);
            Err(e)
        }
    }
}
