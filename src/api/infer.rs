//! Inference endpoint.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::Json;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::session::{validate_inputs, InferenceRequest};
use crate::state::AppState;
use crate::tensor::Tensor;

/// POST /v1/models/:name/infer - run one inference.
///
/// The body is parsed by hand so malformed JSON produces the structured
/// error shape rather than the extractor's default.
pub async fn infer(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    body: Bytes,
) -> Result<Json<Value>> {
    let body: Value = serde_json::from_slice(&body)
        .map_err(|e| Error::InvalidRequest(format!("invalid JSON body: {}", e)))?;

    let inputs_obj = body
        .get("inputs")
        .and_then(Value::as_object)
        .ok_or_else(|| Error::InvalidRequest("missing 'inputs' field".to_string()))?;

    let info = state
        .registry
        .get(&name)
        .await
        .ok_or_else(|| Error::ModelNotFound(name.clone()))?;

    let mut inputs = Vec::with_capacity(inputs_obj.len());
    for (tensor_name, value) in inputs_obj {
        inputs.push(Tensor::from_request(tensor_name, value)?);
    }
    validate_inputs(&inputs, &info)?;

    let request = InferenceRequest {
        model_name: name.clone(),
        request_id: Uuid::new_v4().to_string(),
        inputs,
    };

    let receiver = state.executor.submit(request).await;
    let response = receiver
        .await
        .map_err(|_| Error::Inference("response channel closed".to_string()))?;

    if !response.success {
        let message = response
            .error
            .unwrap_or_else(|| "unknown inference error".to_string());
        // The model can disappear between the lookup above and dispatch.
        if message.starts_with("Model not found") {
            return Err(Error::ModelNotFound(name));
        }
        if message.contains("executor stopped") {
            return Err(Error::ExecutorStopped);
        }
        return Err(Error::Inference(message));
    }

    let mut outputs = Map::new();
    for tensor in &response.outputs {
        outputs.insert(tensor.name.clone(), tensor.to_json());
    }

    Ok(Json(json!({
        "model_name": name,
        "outputs": outputs,
        "timing": {
            "inference_ms": response.inference_time_ms,
            "queue_ms": response.queue_time_ms,
        },
    })))
}
