//! ONNX Runtime backed sessions.

use std::time::Instant;

use chrono::Utc;
use ort::execution_providers::{
    CUDAExecutionProvider, ExecutionProviderDispatch, TensorRTExecutionProvider,
};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::tensor::TensorElementType;
use ort::value::{DynValue, Tensor as OrtTensor, ValueType};
use parking_lot::Mutex;

use super::{validate_inputs, InferenceRequest, InferenceRuntime, LoadedModel, ModelInfo, ModelSession};
use crate::config::InferenceConfig;
use crate::error::{Error, Result};
use crate::tensor::{Dtype, Tensor, TensorPayload};

/// ONNX Runtime session factory. Session options are derived from the
/// `inference` configuration section.
pub struct OrtRuntime {
    config: InferenceConfig,
}

impl OrtRuntime {
    pub fn new(config: InferenceConfig) -> Self {
        Self { config }
    }

    fn optimization_level(&self) -> GraphOptimizationLevel {
        match self.config.graph_optimization.as_str() {
            "disable" => GraphOptimizationLevel::Disable,
            "basic" => GraphOptimizationLevel::Level1,
            "extended" => GraphOptimizationLevel::Level2,
            _ => GraphOptimizationLevel::Level3,
        }
    }

    /// Execution providers in configured priority order. CPU is ONNX
    /// Runtime's implicit fallback and needs no explicit registration; a
    /// provider that is unavailable at runtime is logged and skipped by the
    /// runtime rather than failing the session.
    fn execution_providers(&self) -> Vec<ExecutionProviderDispatch> {
        let mut providers = Vec::new();
        for name in &self.config.providers {
            match name.as_str() {
                "tensorrt" => {
                    providers.push(
                        TensorRTExecutionProvider::default()
                            .with_device_id(self.config.gpu_device_id)
                            .build(),
                    );
                    tracing::debug!("requested TensorRT execution provider");
                }
                "cuda" => {
                    let mut provider =
                        CUDAExecutionProvider::default().with_device_id(self.config.gpu_device_id);
                    if self.config.memory_limit_mb > 0 {
                        provider = provider
                            .with_memory_limit((self.config.memory_limit_mb * 1024 * 1024) as usize);
                    }
                    providers.push(provider.build());
                    tracing::debug!("requested CUDA execution provider");
                }
                "cpu" => {
                    tracing::debug!("using CPU execution provider");
                }
                other => {
                    tracing::warn!("unknown execution provider '{}', skipping", other);
                }
            }
        }
        providers
    }
}

impl InferenceRuntime for OrtRuntime {
    fn load_model(&self, path: &str, name: &str) -> Result<LoadedModel> {
        tracing::info!("Loading model: {} from {}", name, path);
        let start = Instant::now();

        let mut builder = Session::builder()
            .map_err(|e| Error::LoadFailed(e.to_string()))?
            .with_optimization_level(self.optimization_level())
            .map_err(|e| Error::LoadFailed(e.to_string()))?;

        if self.config.intra_op_threads > 0 {
            builder = builder
                .with_intra_threads(self.config.intra_op_threads)
                .map_err(|e| Error::LoadFailed(e.to_string()))?;
        }
        if self.config.inter_op_threads > 0 {
            builder = builder
                .with_inter_threads(self.config.inter_op_threads)
                .map_err(|e| Error::LoadFailed(e.to_string()))?;
        }

        let providers = self.execution_providers();
        if !providers.is_empty() {
            builder = builder
                .with_execution_providers(providers)
                .map_err(|e| Error::LoadFailed(e.to_string()))?;
        }

        let session = builder
            .commit_from_file(path)
            .map_err(|e| Error::LoadFailed(format!("failed to load '{}': {}", path, e)))?;

        let mut info = ModelInfo {
            name: name.to_string(),
            version: "1".to_string(),
            path: path.to_string(),
            loaded_at: Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
            input_names: vec![],
            output_names: vec![],
            input_shapes: vec![],
            output_shapes: vec![],
            input_types: vec![],
            output_types: vec![],
        };

        for input in &session.inputs {
            let (shape, dtype) = tensor_interface(name, &input.name, &input.input_type)?;
            info.input_names.push(input.name.clone());
            info.input_shapes.push(shape);
            info.input_types.push(dtype);
        }
        for output in &session.outputs {
            let (shape, dtype) = tensor_interface(name, &output.name, &output.output_type)?;
            info.output_names.push(output.name.clone());
            info.output_shapes.push(shape);
            info.output_types.push(dtype);
        }

        tracing::info!(
            "Model {} loaded in {:.2}ms with {} inputs and {} outputs",
            name,
            start.elapsed().as_secs_f64() * 1000.0,
            info.input_names.len(),
            info.output_names.len()
        );

        Ok(LoadedModel {
            session: Box::new(OrtSession {
                session: Mutex::new(session),
            }),
            info,
        })
    }
}

/// One loaded ONNX Runtime session. `Session::run` needs exclusive access,
/// so the handle sits behind a mutex; the batch executor serializes calls in
/// practice and the lock is uncontended.
struct OrtSession {
    session: Mutex<Session>,
}

impl ModelSession for OrtSession {
    fn run(&self, request: &InferenceRequest, info: &ModelInfo) -> Result<Vec<Tensor>> {
        validate_inputs(&request.inputs, info)?;

        let mut bound: Vec<(String, DynValue)> = Vec::with_capacity(request.inputs.len());
        for tensor in &request.inputs {
            bound.push((tensor.name.clone(), to_ort_value(tensor)?));
        }

        let mut session = self.session.lock();
        let outputs = session.run(bound)?;

        let mut result = Vec::with_capacity(info.output_names.len());
        for name in &info.output_names {
            let value = outputs.get(name).ok_or_else(|| {
                Error::Inference(format!("runtime returned no output named '{}'", name))
            })?;
            result.push(from_ort_value(name, value)?);
        }
        Ok(result)
    }
}

fn tensor_interface(
    model: &str,
    tensor: &str,
    value_type: &ValueType,
) -> Result<(Vec<i64>, Dtype)> {
    match value_type {
        ValueType::Tensor { ty, shape, .. } => {
            let dtype = element_type_to_dtype(*ty).ok_or_else(|| {
                Error::LoadFailed(format!(
                    "model '{}' tensor '{}' has unsupported element type {:?}",
                    model, tensor, ty
                ))
            })?;
            Ok((shape.to_vec(), dtype))
        }
        other => Err(Error::LoadFailed(format!(
            "model '{}' tensor '{}' is not a tensor value ({:?})",
            model, tensor, other
        ))),
    }
}

fn element_type_to_dtype(ty: TensorElementType) -> Option<Dtype> {
    match ty {
        TensorElementType::Float32 => Some(Dtype::Float32),
        TensorElementType::Float64 => Some(Dtype::Float64),
        TensorElementType::Int8 => Some(Dtype::Int8),
        TensorElementType::Uint8 => Some(Dtype::Uint8),
        TensorElementType::Int16 => Some(Dtype::Int16),
        TensorElementType::Uint16 => Some(Dtype::Uint16),
        TensorElementType::Int32 => Some(Dtype::Int32),
        TensorElementType::Int64 => Some(Dtype::Int64),
        TensorElementType::Bool => Some(Dtype::Bool),
        TensorElementType::String => Some(Dtype::String),
        _ => None,
    }
}

fn to_ort_value(tensor: &Tensor) -> Result<DynValue> {
    let shape = tensor.shape.clone();
    let value = match &tensor.payload {
        TensorPayload::F32(data) => OrtTensor::from_array((shape, data.clone()))?.into_dyn(),
        TensorPayload::F64(data) => OrtTensor::from_array((shape, data.clone()))?.into_dyn(),
        TensorPayload::I8(data) => OrtTensor::from_array((shape, data.clone()))?.into_dyn(),
        TensorPayload::U8(data) => OrtTensor::from_array((shape, data.clone()))?.into_dyn(),
        TensorPayload::I16(data) => OrtTensor::from_array((shape, data.clone()))?.into_dyn(),
        TensorPayload::U16(data) => OrtTensor::from_array((shape, data.clone()))?.into_dyn(),
        TensorPayload::I32(data) => OrtTensor::from_array((shape, data.clone()))?.into_dyn(),
        TensorPayload::I64(data) => OrtTensor::from_array((shape, data.clone()))?.into_dyn(),
        TensorPayload::Bool(data) => OrtTensor::from_array((shape, data.clone()))?.into_dyn(),
        TensorPayload::Str(_) => {
            return Err(Error::InvalidRequest(format!(
                "input '{}': string tensors are not supported",
                tensor.name
            )));
        }
    };
    Ok(value)
}

fn from_ort_value(name: &str, value: &DynValue) -> Result<Tensor> {
    let ty = match value.dtype() {
        ValueType::Tensor { ty, .. } => *ty,
        other => {
            return Err(Error::Inference(format!(
                "output '{}' is not a tensor value ({:?})",
                name, other
            )));
        }
    };

    fn extract<T: Clone + ort::tensor::PrimitiveTensorElementType>(
        name: &str,
        value: &DynValue,
    ) -> Result<(Vec<i64>, Vec<T>)> {
        let (shape, data) = value
            .try_extract_tensor::<T>()
            .map_err(|e| Error::Inference(format!("failed to extract output '{}': {}", name, e)))?;
        Ok((shape.to_vec(), data.to_vec()))
    }

    let (shape, payload) = match ty {
        TensorElementType::Float32 => {
            let (shape, data) = extract::<f32>(name, value)?;
            (shape, TensorPayload::F32(data))
        }
        TensorElementType::Float64 => {
            let (shape, data) = extract::<f64>(name, value)?;
            (shape, TensorPayload::F64(data))
        }
        TensorElementType::Int8 => {
            let (shape, data) = extract::<i8>(name, value)?;
            (shape, TensorPayload::I8(data))
        }
        TensorElementType::Uint8 => {
            let (shape, data) = extract::<u8>(name, value)?;
            (shape, TensorPayload::U8(data))
        }
        TensorElementType::Int16 => {
            let (shape, data) = extract::<i16>(name, value)?;
            (shape, TensorPayload::I16(data))
        }
        TensorElementType::Uint16 => {
            let (shape, data) = extract::<u16>(name, value)?;
            (shape, TensorPayload::U16(data))
        }
        TensorElementType::Int32 => {
            let (shape, data) = extract::<i32>(name, value)?;
            (shape, TensorPayload::I32(data))
        }
        TensorElementType::Int64 => {
            let (shape, data) = extract::<i64>(name, value)?;
            (shape, TensorPayload::I64(data))
        }
        TensorElementType::Bool => {
            let (shape, data) = extract::<bool>(name, value)?;
            (shape, TensorPayload::Bool(data))
        }
        other => {
            return Err(Error::Inference(format!(
                "output '{}' has unsupported element type {:?}",
                name, other
            )));
        }
    };

    Ok(Tensor {
        name: name.to_string(),
        shape,
        payload,
    })
}
