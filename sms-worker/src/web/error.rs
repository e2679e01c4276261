//! Mapping of library errors onto HTTP responses.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tracing::error;

use crate::error::{Error, ErrorKind};

/// Error returned by every handler.
#[derive(Debug)]
pub enum ApiError {
    Domain(Error),
    /// Missing owner header or bad callback signature.
    Unauthorized(&'static str),
    /// Request that never reached the library (bad multipart, bad JSON).
    BadRequest(String),
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError::Domain(err)
    }
}

impl ApiError {
    fn parts(&self) -> (StatusCode, &'static str, String) {
        let err = match self {
            ApiError::Unauthorized(msg) => {
                return (StatusCode::UNAUTHORIZED, "unauthorized", msg.to_string())
            }
            ApiError::BadRequest(msg) => return (StatusCode::BAD_REQUEST, "bad_request", msg.clone()),
            ApiError::Domain(err) => err,
        };

        match (err.kind(), err) {
            (_, Error::NotFound { .. }) => (StatusCode::NOT_FOUND, "not_found", err.to_string()),
            (_, Error::InvalidTransition { .. } | Error::Conflict(_) | Error::Cancelled) => {
                (StatusCode::CONFLICT, "conflict", err.to_string())
            }
            (_, Error::TemplateNotUsable { .. }) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "template_not_usable",
                err.to_string(),
            ),
            (_, Error::TooManyImports { .. }) => {
                (StatusCode::TOO_MANY_REQUESTS, "too_many_imports", err.to_string())
            }
            (ErrorKind::ResourceExhausted, _) => {
                (StatusCode::PAYLOAD_TOO_LARGE, "too_large", err.to_string())
            }
            (ErrorKind::Validation, _) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "validation_failed",
                err.to_string(),
            ),
            (ErrorKind::Transient, _) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "unavailable",
                "storage is busy, retry shortly".to_string(),
            ),
            (ErrorKind::Permanent | ErrorKind::Fatal, _) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal",
                "internal error".to_string(),
            ),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = self.parts();
        if status.is_server_error() {
            if let ApiError::Domain(err) = &self {
                error!(error = %err, status = status.as_u16(), "request_failed");
            }
        }
        (status, Json(ErrorBody { error: code, message })).into_response()
    }
}
