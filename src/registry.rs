//! Model registry: the live set of loaded models, kept consistent with a
//! directory of `.onnx` files.
//!
//! The map sits behind a readers/writer lock. Lookups and inference hold a
//! read lock; installing or removing an entry takes the write lock for a
//! single map operation, so readers see either the prior entry or the new
//! one, never a torn state. All load+install sequences (startup scan,
//! explicit reload, watcher) are serialized by one registry-level mutex.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::config::ModelsConfig;
use crate::error::{Error, Result};
use crate::metrics::MetricsCollector;
use crate::session::{
    InferenceRequest, InferenceResponse, InferenceRuntime, ModelInfo, ModelSession,
};

struct ModelEntry {
    session: Box<dyn ModelSession>,
    info: ModelInfo,
    last_modified: Option<SystemTime>,
}

struct RegistryInner {
    runtime: Arc<dyn InferenceRuntime>,
    config: ModelsConfig,
    metrics: Arc<MetricsCollector>,
    models: RwLock<HashMap<String, ModelEntry>>,
    /// Serializes load+install sequences; the map lock is never held while
    /// a model file is being read.
    reload_lock: Mutex<()>,
    watcher: Mutex<Option<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

/// Cheaply cloneable handle to the shared registry state.
#[derive(Clone)]
pub struct ModelRegistry {
    inner: Arc<RegistryInner>,
}

impl ModelRegistry {
    pub fn new(
        runtime: Arc<dyn InferenceRuntime>,
        config: ModelsConfig,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(RegistryInner {
                runtime,
                config,
                metrics,
                models: RwLock::new(HashMap::new()),
                reload_lock: Mutex::new(()),
                watcher: Mutex::new(None),
                shutdown,
            }),
        }
    }

    /// Scan the model directory, load everything found, and start the file
    /// watcher when hot-reload is enabled. A missing directory is created
    /// and logged, not an error.
    pub async fn initialize(&self) {
        let directory = self.inner.config.directory.clone();
        tracing::info!("Initializing model registry from: {}", directory);

        if !Path::new(&directory).exists() {
            tracing::warn!("Models directory does not exist: {}, creating it", directory);
            if let Err(e) = std::fs::create_dir_all(&directory) {
                tracing::error!("Failed to create models directory {}: {}", directory, e);
            }
            return self.finish_initialize().await;
        }

        for (name, path) in model_files(Path::new(&directory)) {
            if let Err(e) = self.load_model(&path, &name).await {
                tracing::error!("Failed to load model '{}': {}", name, e);
            }
        }

        self.finish_initialize().await
    }

    async fn finish_initialize(&self) {
        for name in &self.inner.config.preload {
            if !self.has(name).await {
                tracing::error!("Preload model '{}' was not found in the models directory", name);
            }
        }

        if self.inner.config.hot_reload {
            self.start_watcher().await;
        }
    }

    pub async fn has(&self, name: &str) -> bool {
        self.inner.models.read().await.contains_key(name)
    }

    pub async fn has_models(&self) -> bool {
        !self.inner.models.read().await.is_empty()
    }

    pub async fn count(&self) -> usize {
        self.inner.models.read().await.len()
    }

    pub async fn get(&self, name: &str) -> Option<ModelInfo> {
        self.inner
            .models
            .read()
            .await
            .get(name)
            .map(|entry| entry.info.clone())
    }

    /// All loaded models, ordered by name.
    pub async fn list(&self) -> Vec<ModelInfo> {
        let models = self.inner.models.read().await;
        let mut result: Vec<ModelInfo> = models.values().map(|e| e.info.clone()).collect();
        result.sort_by(|a, b| a.name.cmp(&b.name));
        result
    }

    /// Reload a model from its recorded path. Returns Ok(false) when the
    /// name is not currently loaded; a failed load leaves the prior entry
    /// intact and is returned as an error.
    pub async fn reload(&self, name: &str) -> Result<bool> {
        let path = {
            let models = self.inner.models.read().await;
            match models.get(name) {
                Some(entry) => PathBuf::from(&entry.info.path),
                None => return Ok(false),
            }
        };

        self.load_model(&path, name).await?;
        Ok(true)
    }

    /// Run one inference against the named model. The read lock is held for
    /// the duration of the call so the session cannot be replaced or
    /// dropped mid-inference. Failures, including panics inside the
    /// runtime, are converted into an error response.
    pub async fn run_inference(&self, request: &InferenceRequest) -> InferenceResponse {
        let models = self.inner.models.read().await;

        let entry = match models.get(&request.model_name) {
            Some(entry) => entry,
            None => {
                return InferenceResponse::failure(format!(
                    "Model not found: {}",
                    request.model_name
                ));
            }
        };

        // The runtime call is blocking and CPU-bound; hand the worker off so
        // it does not stall the shared pool. The entry borrow from the read
        // guard is not 'static, so this stays block_in_place rather than
        // spawn_blocking.
        let start = Instant::now();
        let outcome = tokio::task::block_in_place(|| {
            catch_unwind(AssertUnwindSafe(|| entry.session.run(request, &entry.info)))
        });
        let elapsed = start.elapsed();

        self.inner
            .metrics
            .record_inference(&request.model_name, elapsed.as_secs_f64());

        let mut response = match outcome {
            Ok(Ok(outputs)) => InferenceResponse {
                outputs,
                inference_time_ms: 0.0,
                queue_time_ms: 0.0,
                success: true,
                error: None,
            },
            Ok(Err(e)) => {
                tracing::error!("Inference error for model {}: {}", request.model_name, e);
                InferenceResponse::failure(e.to_string())
            }
            Err(panic) => {
                let message = panic_message(panic);
                tracing::error!(
                    "Inference panicked for model {}: {}",
                    request.model_name,
                    message
                );
                InferenceResponse::failure(format!("inference panicked: {}", message))
            }
        };
        response.inference_time_ms = elapsed.as_secs_f64() * 1000.0;
        response
    }

    /// Stop the file watcher and wait for it to exit. Idempotent.
    pub async fn stop_watcher(&self) {
        self.inner.shutdown.send_replace(true);
        if let Some(handle) = self.inner.watcher.lock().await.take() {
            let _ = handle.await;
        }
    }

    /// Load a model file and atomically install the entry.
    async fn load_model(&self, path: &Path, name: &str) -> Result<()> {
        let _guard = self.inner.reload_lock.lock().await;

        let runtime = self.inner.runtime.clone();
        let load_path = path.to_string_lossy().to_string();
        let load_name = name.to_string();

        let start = Instant::now();
        let loaded = tokio::task::spawn_blocking(move || runtime.load_model(&load_path, &load_name))
            .await
            .map_err(|e| Error::LoadFailed(format!("load task failed: {}", e)))??;
        let load_time = start.elapsed();

        let last_modified = std::fs::metadata(path).and_then(|m| m.modified()).ok();

        let count = {
            let mut models = self.inner.models.write().await;
            models.insert(
                name.to_string(),
                ModelEntry {
                    session: loaded.session,
                    info: loaded.info,
                    last_modified,
                },
            );
            models.len()
        };

        self.inner
            .metrics
            .record_model_load(name, load_time.as_secs_f64());
        self.inner.metrics.set_loaded_models(count);

        tracing::info!("Model '{}' loaded successfully", name);
        Ok(())
    }

    async fn start_watcher(&self) {
        let registry = self.clone();
        let mut shutdown = self.inner.shutdown.subscribe();
        let interval = std::time::Duration::from_millis(self.inner.config.watch_interval_ms);

        let handle = tokio::spawn(async move {
            tracing::info!(
                "Starting model file watcher (interval: {}ms)",
                interval.as_millis()
            );
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown.changed() => {}
                }
                if *shutdown.borrow() {
                    break;
                }
                registry.check_for_changes().await;
            }
        });

        *self.inner.watcher.lock().await = Some(handle);
    }

    /// One watcher tick: load new and modified files, then drop entries
    /// whose file disappeared.
    async fn check_for_changes(&self) {
        let directory = PathBuf::from(&self.inner.config.directory);
        if !directory.exists() {
            return;
        }

        for (name, path) in model_files(&directory) {
            let modified = std::fs::metadata(&path).and_then(|m| m.modified()).ok();

            let action = {
                let models = self.inner.models.read().await;
                match models.get(&name) {
                    None => Some("new"),
                    Some(entry) if entry.last_modified != modified => Some("changed"),
                    Some(_) => None,
                }
            };

            if let Some(kind) = action {
                tracing::info!("Detected {} model: {}", kind, name);
                if let Err(e) = self.load_model(&path, &name).await {
                    tracing::error!("Failed to load model '{}': {}", name, e);
                }
            }
        }

        let to_remove: Vec<String> = {
            let models = self.inner.models.read().await;
            models
                .iter()
                .filter(|(_, entry)| !Path::new(&entry.info.path).exists())
                .map(|(name, _)| name.clone())
                .collect()
        };

        if !to_remove.is_empty() {
            let mut models = self.inner.models.write().await;
            for name in &to_remove {
                tracing::info!("Removing unloaded model: {}", name);
                models.remove(name);
            }
            self.inner.metrics.set_loaded_models(models.len());
        }
    }
}

/// `.onnx` regular files in a directory as (stem, path) pairs.
fn model_files(directory: &Path) -> Vec<(String, PathBuf)> {
    let mut files = Vec::new();
    let entries = match std::fs::read_dir(directory) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::error!("Failed to read models directory {:?}: {}", directory, e);
            return files;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some("onnx") {
            continue;
        }
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            files.push((stem.to_string(), path));
        }
    }
    files
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
