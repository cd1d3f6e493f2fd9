//! Error types and their HTTP mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Model load failed: {0}")]
    LoadFailed(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("batch executor stopped")]
    ExecutorStopped,

    #[error("ONNX Runtime error: {0}")]
    Ort(#[from] ort::Error),
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, message, detail) = match &self {
            Error::ModelNotFound(_) => (StatusCode::NOT_FOUND, self.to_string(), None),
            Error::LoadFailed(detail) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to load model".to_string(),
                Some(detail.clone()),
            ),
            Error::InvalidRequest(_) => (StatusCode::BAD_REQUEST, self.to_string(), None),
            Error::Inference(detail) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Inference failed".to_string(),
                Some(detail.clone()),
            ),
            Error::ExecutorStopped => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Inference failed".to_string(),
                Some(self.to_string()),
            ),
            Error::Ort(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "ONNX Runtime error".to_string(),
                Some(e.to_string()),
            ),
        };

        let mut error = json!({
            "code": status.as_u16(),
            "message": message,
        });
        if let Some(detail) = detail {
            error["detail"] = json!(detail);
        }

        (status, Json(json!({ "error": error }))).into_response()
    }
}

pub type Result<T> = std::result::Result<T, Error>;
