//! Request-pipeline error type, mirroring the teacher's hand-rolled
//! `forward/error.rs::ForwardError` rather than `thiserror`: these variants
//! sit right at the HTTP boundary and the manual `IntoResponse` impl keeps
//! the wire shape next to the variant list instead of a derive attribute.

use axum::{http::StatusCode, response::IntoResponse, response::Response, Json};

#[derive(Debug, Clone)]
pub enum OrchestratorError {
    AuthMissing,
    AuthInvalid,
    PresetFault(String),
    UpstreamExhausted(String),
    UpstreamPermanent(String),
    DeadlineExceeded,
    Internal(String),
}

impl std::fmt::Display for OrchestratorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrchestratorError::AuthMissing => write!(f, "missing tenant key"),
            OrchestratorError::AuthInvalid => write!(f, "invalid tenant key"),
            OrchestratorError::PresetFault(msg) => write!(f, "preset expansion failed: {}", msg),
            OrchestratorError::UpstreamExhausted(msg) => write!(f, "upstream exhausted: {}", msg),
            OrchestratorError::UpstreamPermanent(msg) => write!(f, "invalid request: {}", msg),
            OrchestratorError::DeadlineExceeded => write!(f, "deadline exceeded"),
            OrchestratorError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for OrchestratorError {}

impl IntoResponse for OrchestratorError {
    fn into_response(self) -> Response {
        let (status, kind, message) = match &self {
            OrchestratorError::AuthMissing => {
                (StatusCode::UNAUTHORIZED, "invalid_api_key", self.to_string())
            }
            OrchestratorError::AuthInvalid => {
                (StatusCode::UNAUTHORIZED, "invalid_api_key", self.to_string())
            }
            OrchestratorError::PresetFault(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "preset_fault", self.to_string())
            }
            OrchestratorError::UpstreamExhausted(_) => {
                (StatusCode::BAD_GATEWAY, "upstream_error", self.to_string())
            }
            OrchestratorError::UpstreamPermanent(msg) => {
                (StatusCode::BAD_REQUEST, "invalid_request", msg.clone())
            }
            OrchestratorError::DeadlineExceeded => {
                (StatusCode::GATEWAY_TIMEOUT, "deadline_exceeded", self.to_string())
            }
            OrchestratorError::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", self.to_string())
            }
        };

        tracing::error!(kind, message = %message, "rejecting request");

        (
            status,
            Json(serde_json::json!({
                "error": { "type": kind, "message": message }
            })),
        )
            .into_response()
    }
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;
