//! HTTP error envelope.
//!
//! Every failed request is answered with
//! `{"status": u16, "error": str, "error_code": u32, "details": str}`.
//! Internal failures are logged and never expose their cause.

use crate::dispatcher::DispatchError;
use crate::emote_store::StoreError;
use crate::stager::StageError;
use crate::validator::ValidateError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;
use tracing::error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("missing internal dependency")]
    DependencyUnavailable,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("payload too large: {0}")]
    PayloadTooLarge(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("insufficient privilege")]
    InsufficientPrivilege,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Wire body of an error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub status: u16,
    pub error: String,
    pub error_code: u32,
    pub details: String,
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::DependencyUnavailable => StatusCode::LOCKED,
            ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::InsufficientPrivilege => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_code(&self) -> u32 {
        match self {
            ApiError::Internal(_) => 10000,
            ApiError::Unauthorized => 10001,
            ApiError::InvalidRequest(_) | ApiError::PayloadTooLarge(_) => 10002,
            ApiError::InsufficientPrivilege => 10003,
            ApiError::DependencyUnavailable => 10004,
            ApiError::NotFound(_) => 10005,
        }
    }

    fn body(&self) -> ErrorResponse {
        let (error, details) = match self {
            ApiError::DependencyUnavailable => (
                "missing internal dependency",
                "Emote Processing Service Unavailable".to_string(),
            ),
            ApiError::InvalidRequest(details) | ApiError::PayloadTooLarge(details) => {
                ("invalid request", details.clone())
            }
            ApiError::Unauthorized => ("unauthorized", "Sign-In Required".to_string()),
            ApiError::InsufficientPrivilege => (
                "insufficient privilege",
                "You are not allowed to do that".to_string(),
            ),
            ApiError::NotFound(details) => ("not found", details.clone()),
            ApiError::Internal(_) => ("internal server error", "Internal Server Error".to_string()),
        };

        ErrorResponse {
            status: self.status_code().as_u16(),
            error: error.to_string(),
            error_code: self.error_code(),
            details,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let ApiError::Internal(cause) = &self {
            error!(error = %cause, "Request failed");
        }
        (self.status_code(), Json(self.body())).into_response()
    }
}

impl From<ValidateError> for ApiError {
    fn from(e: ValidateError) -> Self {
        match e {
            ValidateError::Invalid(invalid) => ApiError::InvalidRequest(invalid.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        ApiError::Internal(e.to_string())
    }
}

impl From<StageError> for ApiError {
    fn from(e: StageError) -> Self {
        ApiError::Internal(e.to_string())
    }
}

impl From<DispatchError> for ApiError {
    fn from(e: DispatchError) -> Self {
        ApiError::Internal(e.to_string())
    }
}
