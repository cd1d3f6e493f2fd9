//! ONNX inference server: serves `.onnx` models over a REST API with
//! dynamic request batching and hot-reload of model files.

use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use onnx_serve::session::OrtRuntime;
use onnx_serve::{
    api, AppState, BatchExecutor, Config, InferenceRuntime, MetricsCollector, ModelRegistry,
};

#[derive(Parser)]
#[command(name = "onnx-serve", version, about = "ONNX inference server")]
struct Cli {
    /// Path to the configuration file (JSON or TOML, extension optional)
    #[arg(short, long, default_value = "config")]
    config: String,

    /// Models directory (overrides config)
    #[arg(short, long)]
    models: Option<String>,

    /// Server port (overrides config)
    #[arg(short, long)]
    port: Option<u16>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = Config::load(&cli.config)?;
    if let Some(models) = cli.models {
        config.models.directory = models;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone())),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.server.threads)
        .enable_all()
        .build()?;

    runtime.block_on(run(config))
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!("Starting onnx-serve v{}", env!("CARGO_PKG_VERSION"));

    let metrics = Arc::new(MetricsCollector::new(&config.metrics));
    let runtime: Arc<dyn InferenceRuntime> = Arc::new(OrtRuntime::new(config.inference.clone()));

    let registry = ModelRegistry::new(runtime, config.models.clone(), metrics.clone());
    registry.initialize().await;

    let executor = BatchExecutor::new(registry.clone(), metrics.clone(), config.batching.clone());
    executor.start().await;

    let state = Arc::new(AppState::new(
        config.clone(),
        registry.clone(),
        executor.clone(),
        metrics,
    ));
    let app = api::router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);
    tracing::info!("Models directory: {}", config.models.directory);
    tracing::info!("Loaded {} model(s)", registry.count().await);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shutting down...");
    executor.stop().await;
    registry.stop_watcher().await;
    tracing::info!("Server stopped successfully");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
}
