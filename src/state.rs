//! Shared application state.

use std::sync::Arc;
use std::time::Instant;

use crate::config::Config;
use crate::executor::BatchExecutor;
use crate::metrics::MetricsCollector;
use crate::registry::ModelRegistry;

/// Shared application state passed to all handlers.
pub struct AppState {
    pub config: Config,
    pub registry: ModelRegistry,
    pub executor: BatchExecutor,
    pub metrics: Arc<MetricsCollector>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(
        config: Config,
        registry: ModelRegistry,
        executor: BatchExecutor,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            config,
            registry,
            executor,
            metrics,
            started_at: Instant::now(),
        }
    }
}
