//! Server configuration.
//!
//! Configuration sources, in order of precedence: CLI flags (applied in
//! `main`), environment variables (`ONNX__SECTION__KEY` format), a config
//! file (JSON or TOML), built-in defaults.

use config::{Config as ConfigLoader, ConfigError as ConfigCrateError, Environment, File};
use serde::Deserialize;

/// Complete server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub inference: InferenceConfig,
    #[serde(default)]
    pub batching: BatchingConfig,
    #[serde(default)]
    pub models: ModelsConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Tokio worker thread count.
    #[serde(default = "default_threads")]
    pub threads: usize,
}

/// ONNX Runtime session settings.
#[derive(Debug, Clone, Deserialize)]
pub struct InferenceConfig {
    /// Execution providers in priority order; CPU is the implicit fallback.
    #[serde(default = "default_providers")]
    pub providers: Vec<String>,
    #[serde(default)]
    pub gpu_device_id: i32,
    #[serde(default = "default_memory_limit_mb")]
    pub memory_limit_mb: u64,
    #[serde(default)]
    pub intra_op_threads: usize,
    #[serde(default)]
    pub inter_op_threads: usize,
    /// One of "disable", "basic", "extended", "all".
    #[serde(default = "default_graph_optimization")]
    pub graph_optimization: String,
}

/// Dynamic request batching settings.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default = "default_min_batch_size")]
    pub min_batch_size: usize,
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,
}

/// Model discovery settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelsConfig {
    #[serde(default = "default_models_directory")]
    pub directory: String,
    #[serde(default = "default_true")]
    pub hot_reload: bool,
    #[serde(default = "default_watch_interval_ms")]
    pub watch_interval_ms: u64,
    /// Model names that must be present after the startup scan.
    #[serde(default)]
    pub preload: Vec<String>,
}

/// Prometheus exposition settings.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_metrics_path")]
    pub path: String,
    #[serde(default = "default_latency_buckets")]
    pub latency_buckets: Vec<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Defaults
fn default_true() -> bool {
    true
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_threads() -> usize {
    4
}
fn default_providers() -> Vec<String> {
    vec!["cuda".to_string(), "cpu".to_string()]
}
fn default_memory_limit_mb() -> u64 {
    4096
}
fn default_graph_optimization() -> String {
    "all".to_string()
}
fn default_max_batch_size() -> usize {
    32
}
fn default_min_batch_size() -> usize {
    1
}
fn default_max_wait_ms() -> u64 {
    10
}
fn default_models_directory() -> String {
    "./models".to_string()
}
fn default_watch_interval_ms() -> u64 {
    5000
}
fn default_metrics_path() -> String {
    "/metrics".to_string()
}
fn default_latency_buckets() -> Vec<f64> {
    vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            threads: default_threads(),
        }
    }
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            providers: default_providers(),
            gpu_device_id: 0,
            memory_limit_mb: default_memory_limit_mb(),
            intra_op_threads: 0,
            inter_op_threads: 0,
            graph_optimization: default_graph_optimization(),
        }
    }
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_batch_size: default_max_batch_size(),
            min_batch_size: default_min_batch_size(),
            max_wait_ms: default_max_wait_ms(),
        }
    }
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            directory: default_models_directory(),
            hot_reload: true,
            watch_interval_ms: default_watch_interval_ms(),
            preload: vec![],
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: default_metrics_path(),
            latency_buckets: default_latency_buckets(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Load(String),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl From<ConfigCrateError> for ConfigError {
    fn from(err: ConfigCrateError) -> Self {
        ConfigError::Load(err.to_string())
    }
}

impl Config {
    /// Load configuration from the given file (if it exists) and environment
    /// variables. Environment variables override file settings.
    /// Env var format: ONNX__SECTION__KEY (e.g. ONNX__SERVER__PORT).
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let loader = ConfigLoader::builder()
            .add_source(File::with_name(path).required(false))
            .add_source(
                Environment::with_prefix("ONNX")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = loader.try_deserialize().map_err(ConfigError::from)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the server cannot run with. Fatal at startup only.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batching.min_batch_size < 1 {
            return Err(ConfigError::Invalid(
                "batching.min_batch_size must be at least 1".to_string(),
            ));
        }
        if self.batching.max_batch_size < self.batching.min_batch_size {
            return Err(ConfigError::Invalid(format!(
                "batching.max_batch_size ({}) must be >= min_batch_size ({})",
                self.batching.max_batch_size, self.batching.min_batch_size
            )));
        }
        if self.inference.gpu_device_id < 0 {
            return Err(ConfigError::Invalid(
                "inference.gpu_device_id must be non-negative".to_string(),
            ));
        }
        match self.inference.graph_optimization.as_str() {
            "disable" | "basic" | "extended" | "all" => {}
            other => {
                return Err(ConfigError::Invalid(format!(
                    "inference.graph_optimization must be one of disable/basic/extended/all, got '{}'",
                    other
                )));
            }
        }
        if self.server.threads == 0 {
            return Err(ConfigError::Invalid(
                "server.threads must be at least 1".to_string(),
            ));
        }
        if !self.metrics.path.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "metrics.path must start with '/', got '{}'",
                self.metrics.path
            )));
        }
        Ok(())
    }
}
