//! Store/config-layer error type.
//!
//! Request-pipeline errors live in [`crate::orchestrator::error`] and use a
//! hand-rolled `IntoResponse` impl instead, mirroring the split between the
//! two kinds of failure this crate produces.

use axum::{http::StatusCode, response::IntoResponse, response::Response, Json};

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config error: {0}")]
    Config(String),
    #[error("not found: {0}")]
    NotFound(String),
}

#[derive(serde::Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(serde::Serialize)]
struct ErrorBody {
    #[serde(rename = "type")]
    kind: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, kind) = match &self {
            AppError::Database(_) | AppError::Io(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
            }
            AppError::Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error"),
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
        };
        tracing::error!(error = %self, "store error surfaced to client");
        (
            status,
            Json(ErrorResponse {
                error: ErrorBody {
                    kind,
                    message: self.to_string(),
                },
            }),
        )
            .into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
