//! HTTP error responses.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::Error;

/// Error body returned by control-plane endpoints.
#[derive(Debug, Serialize)]
pub struct ApiErrorResponse {
    pub code: String,
    pub message: String,
}

/// API error with a stable code.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, "CONFLICT", message)
    }

    pub fn too_many_streams() -> Self {
        Self::new(
            StatusCode::TOO_MANY_REQUESTS,
            "TOO_MANY_STREAMS",
            "concurrent stream limit reached",
        )
    }

    pub fn bad_gateway(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, "BAD_GATEWAY", message)
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, "SERVICE_UNAVAILABLE", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiErrorResponse {
            code: self.code,
            message: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        match &err {
            Error::ChannelNotFound(slug) => ApiError::not_found(format!("channel {slug:?}")),
            Error::RefMismatch { .. } | Error::Readiness(_) => {
                ApiError::service_unavailable(err.to_string())
            }
            Error::UpstreamNotAllowed(_) => {
                ApiError::new(StatusCode::FORBIDDEN, "UPSTREAM_NOT_ALLOWED", err.to_string())
            }
            Error::Session(_) | Error::Runner(_) | Error::Zap(_) => {
                ApiError::bad_gateway(err.to_string())
            }
            Error::Timeout(_) => ApiError::new(
                StatusCode::GATEWAY_TIMEOUT,
                "GATEWAY_TIMEOUT",
                err.to_string(),
            ),
            Error::Cancelled => ApiError::new(
                StatusCode::REQUEST_TIMEOUT,
                "CLIENT_CLOSED",
                "request cancelled",
            ),
            _ => {
                tracing::error!(error = %err, "internal error");
                ApiError::internal("internal error")
            }
        }
    }
}
