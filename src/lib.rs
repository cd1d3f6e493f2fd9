pub mod api;
pub mod config;
pub mod error;
pub mod executor;
pub mod logging;
pub mod metrics;
pub mod registry;
pub mod session;
pub mod state;
pub mod tensor;
pub mod test_util;

pub use config::Config;
pub use error::{Error, Result};
pub use executor::BatchExecutor;
pub use metrics::MetricsCollector;
pub use registry::ModelRegistry;
pub use session::{InferenceRequest, InferenceResponse, InferenceRuntime, ModelInfo, ModelSession};
pub use state::AppState;
pub use tensor::{Dtype, Tensor, TensorPayload};
