//! Crate-wide error taxonomy and its mapping onto the OpenAI/Ollama error bodies.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

pub type Result<T> = std::result::Result<T, GatewayError>;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("model not found: {0}")]
    NotFound(String),

    #[error("conflicting registration for {name}: {detail}")]
    Conflict { name: String, detail: String },

    #[error("ambiguous variant for {checkpoint}: {candidates:?}")]
    AmbiguousVariant {
        checkpoint: String,
        candidates: Vec<String>,
    },

    #[error("network error: {0}")]
    NetworkError(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("unsupported platform: {0}")]
    UnsupportedPlatform(String),

    #[error("busy: {0}")]
    Busy(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("engine failed: {0}")]
    EngineFailed(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    fn status(&self) -> StatusCode {
        match self {
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::Conflict { .. } => StatusCode::CONFLICT,
            GatewayError::AmbiguousVariant { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            GatewayError::NetworkError(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Unsupported(_) => StatusCode::NOT_IMPLEMENTED,
            GatewayError::UnsupportedPlatform(_) => StatusCode::NOT_IMPLEMENTED,
            GatewayError::Busy(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Unauthorized => StatusCode::UNAUTHORIZED,
            GatewayError::EngineFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::InvalidRequest(_) => StatusCode::UNPROCESSABLE_ENTITY,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            GatewayError::NotFound(_) => "model_not_found",
            GatewayError::Conflict { .. } => "conflicting_registration",
            GatewayError::AmbiguousVariant { .. } => "ambiguous_variant",
            GatewayError::NetworkError(_) => "network_error",
            GatewayError::Unsupported(_) => "unsupported",
            GatewayError::UnsupportedPlatform(_) => "unsupported_platform_error",
            GatewayError::Busy(_) => "busy",
            GatewayError::Unauthorized => "unauthorized",
            GatewayError::EngineFailed(_) => "engine_failed",
            GatewayError::InvalidRequest(_) => "invalid_request_error",
            GatewayError::Internal(_) | GatewayError::Io(_) => "server_error",
        }
    }

    /// Render this error as the OpenAI-shaped `{error: {message, type, code}}` body.
    pub fn into_openai_response(self) -> Response {
        let status = self.status();
        let code = self.code();
        let body = Json(json!({
            "error": {
                "message": self.to_string(),
                "type": code,
                "code": code,
            }
        }));
        (status, body).into_response()
    }

    /// Render this error as the Ollama-shaped `{error: <string>}` body.
    pub fn into_ollama_response(self) -> Response {
        let status = self.status();
        let body = Json(json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}

/// Default `IntoResponse` renders the OpenAI shape; Ollama handlers convert explicitly
/// via `into_ollama_response` where the dialect is known ahead of time.
impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        self.into_openai_response()
    }
}

/// Wraps [`GatewayError`] so `?` in an Ollama handler renders the Ollama error shape
/// instead of the OpenAI default, without threading a [`Dialect`] flag through every call.
pub struct OllamaError(pub GatewayError);

pub type OllamaResult<T> = std::result::Result<T, OllamaError>;

impl From<GatewayError> for OllamaError {
    fn from(e: GatewayError) -> Self {
        OllamaError(e)
    }
}

impl From<anyhow::Error> for OllamaError {
    fn from(e: anyhow::Error) -> Self {
        OllamaError(GatewayError::Internal(e))
    }
}

impl IntoResponse for OllamaError {
    fn into_response(self) -> Response {
        self.0.into_ollama_response()
    }
}
