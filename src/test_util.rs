//! Mock inference runtime used by unit and integration tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;

use crate::error::{Error, Result};
use crate::session::{
    InferenceRequest, InferenceRuntime, LoadedModel, ModelInfo, ModelSession,
};
use crate::tensor::{Dtype, Tensor, TensorPayload};

/// What a mock session does when asked to run.
#[derive(Debug, Clone)]
pub enum SessionBehavior {
    /// Return the first input's payload under the declared output name.
    Echo,
    /// Fail every call with the given message.
    Fail(String),
    /// Panic inside the runtime call.
    Panic,
    /// Sleep, then echo.
    Delay(Duration),
}

/// In-memory runtime that "loads" any file and records activity for
/// assertions. Sessions expose one dynamic float32 input and output.
pub struct MockRuntime {
    behavior: SessionBehavior,
    model_behaviors: Mutex<HashMap<String, SessionBehavior>>,
    fail_loads: AtomicBool,
    load_count: AtomicUsize,
    calls: Arc<Mutex<Vec<String>>>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::with_behavior(SessionBehavior::Echo)
    }

    pub fn with_behavior(behavior: SessionBehavior) -> Self {
        Self {
            behavior,
            model_behaviors: Mutex::new(HashMap::new()),
            fail_loads: AtomicBool::new(false),
            load_count: AtomicUsize::new(0),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Override the behavior of sessions loaded for one model name.
    pub fn set_model_behavior(&self, name: &str, behavior: SessionBehavior) {
        if let Ok(mut behaviors) = self.model_behaviors.lock() {
            behaviors.insert(name.to_string(), behavior);
        }
    }

    /// Make subsequent `load_model` calls fail.
    pub fn set_fail_loads(&self, fail: bool) {
        self.fail_loads.store(fail, Ordering::SeqCst);
    }

    pub fn load_count(&self) -> usize {
        self.load_count.load(Ordering::SeqCst)
    }

    /// Request ids in the order sessions executed them.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl InferenceRuntime for MockRuntime {
    fn load_model(&self, path: &str, name: &str) -> Result<LoadedModel> {
        if self.fail_loads.load(Ordering::SeqCst) {
            return Err(Error::LoadFailed(format!("mock load failure for '{}'", name)));
        }
        self.load_count.fetch_add(1, Ordering::SeqCst);

        let info = ModelInfo {
            name: name.to_string(),
            version: "1".to_string(),
            path: path.to_string(),
            loaded_at: Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
            input_names: vec!["input".to_string()],
            output_names: vec!["output".to_string()],
            input_shapes: vec![vec![-1]],
            output_shapes: vec![vec![-1]],
            input_types: vec![Dtype::Float32],
            output_types: vec![Dtype::Float32],
        };

        let behavior = self
            .model_behaviors
            .lock()
            .ok()
            .and_then(|behaviors| behaviors.get(name).cloned())
            .unwrap_or_else(|| self.behavior.clone());

        Ok(LoadedModel {
            session: Box::new(MockSession {
                behavior,
                calls: self.calls.clone(),
            }),
            info,
        })
    }
}

struct MockSession {
    behavior: SessionBehavior,
    calls: Arc<Mutex<Vec<String>>>,
}

impl MockSession {
    fn echo(&self, request: &InferenceRequest, info: &ModelInfo) -> Vec<Tensor> {
        let (shape, payload) = match request.inputs.first() {
            Some(input) => (input.shape.clone(), input.payload.clone()),
            None => (vec![1], TensorPayload::F32(vec![0.0])),
        };
        let name = info
            .output_names
            .first()
            .cloned()
            .unwrap_or_else(|| "output".to_string());
        vec![Tensor {
            name,
            shape,
            payload,
        }]
    }
}

impl ModelSession for MockSession {
    fn run(&self, request: &InferenceRequest, info: &ModelInfo) -> Result<Vec<Tensor>> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(request.request_id.clone());
        }
        match &self.behavior {
            SessionBehavior::Echo => Ok(self.echo(request, info)),
            SessionBehavior::Fail(message) => Err(Error::Inference(message.clone())),
            SessionBehavior::Panic => panic!("mock session panic"),
            SessionBehavior::Delay(duration) => {
                std::thread::sleep(*duration);
                Ok(self.echo(request, info))
            }
        }
    }
}

/// A single-input float32 request against the mock session interface.
pub fn float_request(model: &str, request_id: &str, data: Vec<f32>) -> InferenceRequest {
    let len = data.len() as i64;
    InferenceRequest {
        model_name: model.to_string(),
        request_id: request_id.to_string(),
        inputs: vec![Tensor {
            name: "input".to_string(),
            shape: vec![len],
            payload: TensorPayload::F32(data),
        }],
    }
}
