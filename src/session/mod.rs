//! Inference runtime abstraction.
//!
//! The server talks to model backends through the `InferenceRuntime` and
//! `ModelSession` traits; `OrtRuntime` is the ONNX Runtime implementation.
//! Tests substitute a mock runtime (see `crate::test_util`).

mod ort;

pub use self::ort::OrtRuntime;

use crate::error::{Error, Result};
use crate::tensor::{shape_matches, Dtype, Tensor};

/// Immutable snapshot of a loaded model's interface.
#[derive(Debug, Clone)]
pub struct ModelInfo {
    pub name: String,
    pub version: String,
    pub path: String,
    /// ISO-8601 UTC instant of the load.
    pub loaded_at: String,
    pub input_names: Vec<String>,
    pub output_names: Vec<String>,
    /// Parallel to `input_names`; non-positive dims mark dynamic axes.
    pub input_shapes: Vec<Vec<i64>>,
    pub output_shapes: Vec<Vec<i64>>,
    pub input_types: Vec<Dtype>,
    pub output_types: Vec<Dtype>,
}

/// One inference call, as accepted at ingress.
#[derive(Debug, Clone)]
pub struct InferenceRequest {
    pub model_name: String,
    pub request_id: String,
    pub inputs: Vec<Tensor>,
}

/// Result of one inference call. On failure `outputs` is empty and `error`
/// carries the message; errors never propagate past this struct.
#[derive(Debug, Clone)]
pub struct InferenceResponse {
    pub outputs: Vec<Tensor>,
    pub inference_time_ms: f64,
    pub queue_time_ms: f64,
    pub success: bool,
    pub error: Option<String>,
}

impl InferenceResponse {
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            outputs: vec![],
            inference_time_ms: 0.0,
            queue_time_ms: 0.0,
            success: false,
            error: Some(message.into()),
        }
    }
}

/// An executable in-memory model produced by a runtime.
pub trait ModelSession: Send + Sync {
    /// Run one inference. Implementations return outputs in the declared
    /// output order and must not panic on malformed input.
    fn run(&self, request: &InferenceRequest, info: &ModelInfo) -> Result<Vec<Tensor>>;
}

/// A session plus the metadata introspected at load time.
pub struct LoadedModel {
    pub session: Box<dyn ModelSession>,
    pub info: ModelInfo,
}

/// A backend that can turn a model file into an executable session.
pub trait InferenceRuntime: Send + Sync {
    fn load_model(&self, path: &str, name: &str) -> Result<LoadedModel>;
}

/// Check request tensors against a model's declared inputs: names must match
/// set-wise, dtypes must be equal, shapes must satisfy the declared shape
/// with dynamic axes as wildcards.
pub fn validate_inputs(inputs: &[Tensor], info: &ModelInfo) -> Result<()> {
    for tensor in inputs {
        let idx = info
            .input_names
            .iter()
            .position(|n| n == &tensor.name)
            .ok_or_else(|| {
                Error::InvalidRequest(format!(
                    "model '{}' has no input named '{}'",
                    info.name, tensor.name
                ))
            })?;

        let declared_type = info.input_types[idx];
        if tensor.dtype() != declared_type {
            return Err(Error::InvalidRequest(format!(
                "input '{}' has dtype {} but model expects {}",
                tensor.name,
                tensor.dtype(),
                declared_type
            )));
        }

        let declared_shape = &info.input_shapes[idx];
        if !shape_matches(declared_shape, &tensor.shape) {
            return Err(Error::InvalidRequest(format!(
                "input '{}' has shape {:?} but model expects {:?}",
                tensor.name, tensor.shape, declared_shape
            )));
        }
    }

    for name in &info.input_names {
        if !inputs.iter().any(|t| &t.name == name) {
            return Err(Error::InvalidRequest(format!(
                "missing input tensor '{}'",
                name
            )));
        }
    }

    Ok(())
}
