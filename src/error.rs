use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use rmcp::model::{ErrorCode, ErrorData};
use serde::Serialize;
use thiserror::Error;

use crate::config::ConfigError;
use crate::security::ValidationError;

/// Failures while resolving a tool call, before anything is spawned.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Invalid arguments for {tool}: {message}")]
    InvalidArguments { tool: String, message: String },

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

impl From<ToolError> for ErrorData {
    fn from(err: ToolError) -> Self {
        let code = match err {
            ToolError::UnknownTool(_) => ErrorCode::INTERNAL_ERROR,
            ToolError::InvalidArguments { .. } | ToolError::Validation(_) => {
                ErrorCode::INVALID_PARAMS
            }
        };
        ErrorData::new(code, err.to_string(), None)
    }
}

/// Errors returned by the REST handlers.
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    status: u16,
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            HttpError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            HttpError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            HttpError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        let body = ErrorBody {
            error: message,
            status: status.as_u16(),
        };
        (status, axum::Json(body)).into_response()
    }
}

impl From<ToolError> for HttpError {
    fn from(err: ToolError) -> Self {
        match err {
            ToolError::UnknownTool(name) => HttpError::NotFound(format!("Unknown tool: {name}")),
            other => HttpError::BadRequest(other.to_string()),
        }
    }
}

impl From<ValidationError> for HttpError {
    fn from(err: ValidationError) -> Self {
        HttpError::BadRequest(err.to_string())
    }
}

impl From<ConfigError> for HttpError {
    fn from(err: ConfigError) -> Self {
        HttpError::Internal(err.to_string())
    }
}
