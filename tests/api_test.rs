//! Integration tests for the HTTP API, using the mock inference runtime.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use onnx_serve::test_util::{float_request, MockRuntime, SessionBehavior};
use onnx_serve::{api, AppState, BatchExecutor, Config, MetricsCollector, ModelRegistry};

struct TestServer {
    app: Router,
    state: Arc<AppState>,
    runtime: Arc<MockRuntime>,
    dir: tempfile::TempDir,
}

async fn test_server(models: &[&str], configure: impl FnOnce(&mut Config)) -> TestServer {
    test_server_with_runtime(models, configure, Arc::new(MockRuntime::new())).await
}

async fn test_server_with_runtime(
    models: &[&str],
    configure: impl FnOnce(&mut Config),
    runtime: Arc<MockRuntime>,
) -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    for name in models {
        std::fs::write(dir.path().join(format!("{}.onnx", name)), name).unwrap();
    }

    let mut config = Config::default();
    config.models.directory = dir.path().to_string_lossy().to_string();
    config.models.hot_reload = false;
    config.models.watch_interval_ms = 50;
    configure(&mut config);

    let metrics = Arc::new(MetricsCollector::new(&config.metrics));
    let registry = ModelRegistry::new(runtime.clone(), config.models.clone(), metrics.clone());
    registry.initialize().await;

    let executor = BatchExecutor::new(registry.clone(), metrics.clone(), config.batching.clone());
    executor.start().await;

    let state = Arc::new(AppState::new(config, registry, executor, metrics));
    let app = api::router(state.clone());

    TestServer {
        app,
        state,
        runtime,
        dir,
    }
}

async fn send(
    app: &Router,
    method: &str,
    uri: &str,
    body: Option<String>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if body.is_some() {
        builder = builder.header("Content-Type", "application/json");
    }
    let request = builder
        .body(body.map(Body::from).unwrap_or_else(Body::empty))
        .unwrap();

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

#[tokio::test]
async fn test_health() {
    let server = test_server(&[], |_| {}).await;
    let (status, body) = send(&server.app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn test_ready_requires_models() {
    let server = test_server(&[], |_| {}).await;
    let (status, body) = send(&server.app, "GET", "/ready", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "not_ready");

    let server = test_server(&["a"], |_| {}).await;
    let (status, body) = send(&server.app, "GET", "/ready", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ready");
    assert_eq!(body["models_loaded"], 1);
}

#[tokio::test]
async fn test_info() {
    let server = test_server(&["a"], |_| {}).await;
    let (status, body) = send(&server.app, "GET", "/", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["name"], "onnx-serve");
    assert_eq!(body["models_loaded"], 1);
    assert_eq!(body["batching_enabled"], true);
    assert!(body["uptime_seconds"].is_number());
}

#[tokio::test]
async fn test_list_models() {
    let server = test_server(&["a", "b"], |_| {}).await;
    let (status, body) = send(&server.app, "GET", "/v1/models", None).await;
    assert_eq!(status, StatusCode::OK);
    let models = body["models"].as_array().unwrap();
    assert_eq!(models.len(), 2);
    assert_eq!(models[0]["name"], "a");
    assert_eq!(models[1]["name"], "b");
    assert_eq!(models[0]["input_names"], json!(["input"]));
}

#[tokio::test]
async fn test_get_model_details() {
    let server = test_server(&["a"], |_| {}).await;
    let (status, body) = send(&server.app, "GET", "/v1/models/a", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["name"], "a");
    assert_eq!(body["inputs"][0]["name"], "input");
    assert_eq!(body["inputs"][0]["dtype"], "float32");
    assert_eq!(body["outputs"][0]["name"], "output");
}

#[tokio::test]
async fn test_get_unknown_model_404() {
    let server = test_server(&["a"], |_| {}).await;
    let (status, body) = send(&server.app, "GET", "/v1/models/ghost", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], 404);
    assert!(body["error"]["message"]
        .as_str()
        .unwrap()
        .contains("Model not found: ghost"));
}

#[tokio::test]
async fn test_reload_model() {
    let server = test_server(&["a"], |_| {}).await;
    assert_eq!(server.runtime.load_count(), 1);

    let (status, body) = send(&server.app, "POST", "/v1/models/a/reload", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "reloaded");
    assert_eq!(body["model"], "a");
    assert_eq!(server.runtime.load_count(), 2);
}

#[tokio::test]
async fn test_reload_unknown_model_404() {
    let server = test_server(&["a"], |_| {}).await;
    let (status, body) = send(&server.app, "POST", "/v1/models/ghost/reload", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], 404);
}

#[tokio::test]
async fn test_reload_failure_500_keeps_model() {
    let server = test_server(&["a"], |_| {}).await;
    server.runtime.set_fail_loads(true);

    let (status, body) = send(&server.app, "POST", "/v1/models/a/reload", None).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"]["code"], 500);

    // The prior entry is still served.
    let (status, _) = send(&server.app, "GET", "/v1/models/a", None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_infer_success() {
    let server = test_server(&["a"], |_| {}).await;
    let body = json!({"inputs": {"input": {"shape": [2], "data": [1.0, 2.0]}}});

    let (status, body) = send(
        &server.app,
        "POST",
        "/v1/models/a/infer",
        Some(body.to_string()),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["model_name"], "a");
    assert_eq!(body["outputs"]["output"]["shape"], json!([2]));
    assert_eq!(body["outputs"]["output"]["data"], json!([1.0, 2.0]));
    assert!(body["timing"]["inference_ms"].is_number());
    assert!(body["timing"]["queue_ms"].is_number());

    server.state.executor.stop().await;
}

#[tokio::test]
async fn test_infer_unknown_model_404_and_error_counted() {
    let server = test_server(&["a"], |_| {}).await;
    let errors_before = server.state.metrics.request_errors_total();

    let body = json!({"inputs": {"input": {"shape": [1], "data": [1.0]}}});
    let (status, body) = send(
        &server.app,
        "POST",
        "/v1/models/ghost/infer",
        Some(body.to_string()),
    )
    .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], 404);
    assert!(body["error"]["message"]
        .as_str()
        .unwrap()
        .contains("Model not found: ghost"));
    assert_eq!(server.state.metrics.request_errors_total(), errors_before + 1);
}

#[tokio::test]
async fn test_infer_invalid_json_400() {
    let server = test_server(&["a"], |_| {}).await;
    let (status, body) = send(
        &server.app,
        "POST",
        "/v1/models/a/infer",
        Some("{".to_string()),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], 400);
}

#[tokio::test]
async fn test_infer_missing_inputs_400() {
    let server = test_server(&["a"], |_| {}).await;
    let (status, body) = send(
        &server.app,
        "POST",
        "/v1/models/a/infer",
        Some(json!({"data": [1.0]}).to_string()),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"]["message"]
        .as_str()
        .unwrap()
        .contains("inputs"));
}

#[tokio::test]
async fn test_infer_missing_tensor_fields_400() {
    let server = test_server(&["a"], |_| {}).await;
    let (status, _) = send(
        &server.app,
        "POST",
        "/v1/models/a/infer",
        Some(json!({"inputs": {"input": {"shape": [2]}}}).to_string()),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_infer_dtype_mismatch_400() {
    let server = test_server(&["a"], |_| {}).await;
    let body = json!({"inputs": {"input": {"shape": [2], "data": [1, 2], "dtype": "int64"}}});
    let (status, body) = send(
        &server.app,
        "POST",
        "/v1/models/a/infer",
        Some(body.to_string()),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"]["message"].as_str().unwrap().contains("dtype"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_infer_runtime_failure_500() {
    let runtime = Arc::new(MockRuntime::with_behavior(SessionBehavior::Fail(
        "corrupt graph".to_string(),
    )));
    let server = test_server_with_runtime(&["a"], |_| {}, runtime).await;

    let body = json!({"inputs": {"input": {"shape": [1], "data": [1.0]}}});
    let (status, body) = send(
        &server.app,
        "POST",
        "/v1/models/a/infer",
        Some(body.to_string()),
    )
    .await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"]["code"], 500);
    assert!(body["error"]["detail"]
        .as_str()
        .unwrap()
        .contains("corrupt graph"));
}

#[tokio::test]
async fn test_hot_reload_replaces_model() {
    let server = test_server(&["a"], |config| {
        config.models.hot_reload = true;
    })
    .await;
    assert_eq!(server.runtime.load_count(), 1);

    let (_, body) = send(&server.app, "GET", "/v1/models", None).await;
    assert_eq!(body["models"].as_array().unwrap().len(), 1);

    tokio::time::sleep(Duration::from_millis(20)).await;
    std::fs::write(server.dir.path().join("a.onnx"), "a-v2").unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let (_, body) = send(&server.app, "GET", "/v1/models", None).await;
    assert_eq!(body["models"].as_array().unwrap().len(), 1);
    assert_eq!(server.runtime.load_count(), 2);

    server.state.registry.stop_watcher().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_shutdown_drains_pending_requests() {
    let server = test_server(&["a"], |config| {
        config.batching.min_batch_size = 100;
        config.batching.max_wait_ms = 60_000;
    })
    .await;

    let mut receivers = Vec::new();
    for i in 0..5 {
        receivers.push(
            server
                .state
                .executor
                .submit(float_request("a", &format!("r{}", i), vec![1.0]))
                .await,
        );
    }

    server.state.executor.stop().await;

    for rx in receivers {
        assert!(rx.await.unwrap().success);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_metrics_endpoint() {
    let server = test_server(&["a"], |_| {}).await;

    // Generate some traffic first.
    let infer = json!({"inputs": {"input": {"shape": [1], "data": [1.0]}}});
    send(
        &server.app,
        "POST",
        "/v1/models/a/infer",
        Some(infer.to_string()),
    )
    .await;

    let request = Request::builder()
        .method("GET")
        .uri("/metrics")
        .body(Body::empty())
        .unwrap();
    let response = server.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .contains("version=0.0.4"));

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("onnx_requests_total"));
    assert!(text.contains("onnx_inference_total 1"));
    assert!(text.contains("onnx_model_inference_total{model=\"a\"} 1"));
    assert!(text.contains("onnx_loaded_models 1"));
}

// One worker thread: if the executor ran the blocking session call without
// handing its core off, this whole runtime would stall until the slow
// inference finished and /health could not answer in time.
#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn test_slow_inference_does_not_block_health() {
    let runtime = Arc::new(MockRuntime::new());
    runtime.set_model_behavior("slow", SessionBehavior::Delay(Duration::from_millis(500)));
    let server = test_server_with_runtime(&["slow"], |_| {}, runtime).await;

    let app = server.app.clone();
    let infer = tokio::spawn(async move {
        let body = json!({"inputs": {"input": {"shape": [1], "data": [1.0]}}});
        send(&app, "POST", "/v1/models/slow/infer", Some(body.to_string())).await
    });

    // Let the executor pick the request up and enter the slow session.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let start = std::time::Instant::now();
    let (status, body) = send(&server.app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert!(
        start.elapsed() < Duration::from_millis(250),
        "/health took {:?} while an inference was in flight",
        start.elapsed()
    );

    let (status, body) = infer.await.unwrap();
    assert_eq!(status, StatusCode::OK);
    assert!(body["timing"]["inference_ms"].as_f64().unwrap() >= 400.0);

    server.state.executor.stop().await;
}

#[tokio::test]
async fn test_metrics_disabled() {
    let server = test_server(&["a"], |config| {
        config.metrics.enabled = false;
    })
    .await;
    let (status, _) = send(&server.app, "GET", "/metrics", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_metrics_custom_path() {
    let server = test_server(&["a"], |config| {
        config.metrics.path = "/internal/metrics".to_string();
    })
    .await;
    let (status, _) = send(&server.app, "GET", "/internal/metrics", None).await;
    assert_eq!(status, StatusCode::OK);
}
