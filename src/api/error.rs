use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use crate::session::RegistryError;
use crate::source::SourceError;
use crate::supervisor::SupervisorError;

/// Structured error type for all API handlers.
///
/// Each variant maps to an HTTP status code, a machine-readable code string,
/// and a human-readable message. Implements [`IntoResponse`] so handlers can
/// return `Result<T, ApiError>` directly.
#[derive(Debug)]
pub enum ApiError {
    /// 401 - No authentication credentials provided.
    AuthRequired,
    /// 403 - Credentials provided but invalid.
    AuthInvalid,
    /// 400 - Malformed or invalid request.
    InvalidRequest(String),
    /// 400 - The device could not be turned into a source URI.
    InvalidSource(String),
    /// 404 - A specific stream id was not found.
    StreamNotFound(String),
    /// 500 - The transcoder could not be launched.
    StreamStartFailed(String),
    /// 503 - The session limit is reached.
    TooManyStreams,
    /// 503 - The supervisor is shutting down.
    ShuttingDown,
    /// 500 - Catch-all internal error.
    InternalError(String),
}

impl ApiError {
    /// Returns the HTTP status code for this error variant.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::AuthRequired => StatusCode::UNAUTHORIZED,
            ApiError::AuthInvalid => StatusCode::FORBIDDEN,
            ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::InvalidSource(_) => StatusCode::BAD_REQUEST,
            ApiError::StreamNotFound(_) => StatusCode::NOT_FOUND,
            ApiError::StreamStartFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::TooManyStreams => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns a machine-readable error code string.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::AuthRequired => "auth_required",
            ApiError::AuthInvalid => "auth_invalid",
            ApiError::InvalidRequest(_) => "invalid_request",
            ApiError::InvalidSource(_) => "invalid_source",
            ApiError::StreamNotFound(_) => "stream_not_found",
            ApiError::StreamStartFailed(_) => "stream_start_failed",
            ApiError::TooManyStreams => "too_many_streams",
            ApiError::ShuttingDown => "shutting_down",
            ApiError::InternalError(_) => "internal_error",
        }
    }

    /// Returns a human-readable error message.
    pub fn message(&self) -> String {
        match self {
            ApiError::AuthRequired => {
                "Authentication required. Provide a token via the Authorization header.".to_string()
            }
            ApiError::AuthInvalid => "Invalid authentication token.".to_string(),
            ApiError::InvalidRequest(detail) => format!("Invalid request: {}.", detail),
            ApiError::InvalidSource(detail) => format!("Invalid source: {}.", detail),
            ApiError::StreamNotFound(id) => format!("Stream not found or already stopped: {}.", id),
            ApiError::StreamStartFailed(detail) => format!("Failed to start stream: {}.", detail),
            ApiError::TooManyStreams => "Maximum number of concurrent streams reached.".to_string(),
            ApiError::ShuttingDown => "Server is shutting down.".to_string(),
            ApiError::InternalError(detail) => format!("Internal error: {}.", detail),
        }
    }
}

impl From<SupervisorError> for ApiError {
    fn from(err: SupervisorError) -> Self {
        match err {
            SupervisorError::Launch(e) => ApiError::StreamStartFailed(e.to_string()),
            SupervisorError::Registry(RegistryError::InvalidId(detail)) => {
                ApiError::InvalidRequest(detail)
            }
            SupervisorError::Registry(RegistryError::MaxSessionsReached) => ApiError::TooManyStreams,
            SupervisorError::InvalidDuration => {
                ApiError::InvalidRequest("duration must be positive".into())
            }
            SupervisorError::ShuttingDown => ApiError::ShuttingDown,
            other @ (SupervisorError::Io { .. } | SupervisorError::Config(_)) => {
                ApiError::InternalError(other.to_string())
            }
        }
    }
}

impl From<SourceError> for ApiError {
    fn from(err: SourceError) -> Self {
        ApiError::InvalidSource(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": {
                "code": self.code(),
                "message": self.message(),
            }
        });
        (self.status_code(), Json(body)).into_response()
    }
}
