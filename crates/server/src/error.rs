// crates/server/src/error.rs
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Structured JSON error body for API errors.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct ErrorResponse {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: None,
        }
    }

    pub fn with_details(error: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: Some(details.into()),
        }
    }
}

/// API error types mapped to HTTP status codes.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Backend not found: {0}")]
    BackendNotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Not supported: {0}")]
    NotSupported(String),

    /// Missing CLI binary; the detail carries install instructions.
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            ApiError::SessionNotFound(id) => (
                StatusCode::NOT_FOUND,
                ErrorResponse::with_details("Session not found", format!("Session ID: {id}")),
            ),
            ApiError::BackendNotFound(name) => (
                StatusCode::NOT_FOUND,
                ErrorResponse::with_details("Backend not found", name.clone()),
            ),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, ErrorResponse::new(msg)),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, ErrorResponse::new(msg)),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, ErrorResponse::new(msg)),
            ApiError::NotSupported(msg) => (StatusCode::NOT_IMPLEMENTED, ErrorResponse::new(msg)),
            ApiError::ServiceUnavailable(msg) => {
                (StatusCode::SERVICE_UNAVAILABLE, ErrorResponse::new(msg))
            }
            ApiError::Internal(msg) => {
                tracing::error!("Internal error: {msg}");
                (StatusCode::INTERNAL_SERVER_ERROR, ErrorResponse::new(msg))
            }
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        let resp = ApiError::SessionNotFound("x".into()).into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = ApiError::Forbidden("no".into()).into_response();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        let resp = ApiError::ServiceUnavailable("cli".into()).into_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        let resp = ApiError::Conflict("busy".into()).into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }
}
