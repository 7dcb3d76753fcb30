//! Error types shared by the service backends.

use thiserror::Error;

/// Errors raised while talking to the task-list service or the local store.
#[derive(Error, Debug)]
pub enum BackendError {
    /// Missing, expired or rejected session.
    #[error("not authenticated")]
    Unauthorized,

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// The request was rejected as invalid input.
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("conflict: {0}")]
    Conflict(String),

    /// Any other non-success status from the service.
    #[error("server error: {status} - {message}")]
    Server { status: u16, message: String },

    /// The service answered with a payload that does not match the contract.
    #[error("unexpected response: {0}")]
    InvalidResponse(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BackendError {
    /// Stable machine-readable code used in CLI output.
    pub fn code(&self) -> &'static str {
        match self {
            BackendError::Unauthorized => "UNAUTHORIZED",
            BackendError::Forbidden(_) => "FORBIDDEN",
            BackendError::NotFound(_) => "NOT_FOUND",
            BackendError::Validation(_) => "VALIDATION",
            BackendError::Conflict(_) => "CONFLICT",
            BackendError::Server { .. } => "SERVER_ERROR",
            BackendError::InvalidResponse(_) => "INVALID_RESPONSE",
            BackendError::Http(_) => "HTTP_ERROR",
            BackendError::Database(_) => "DATABASE_ERROR",
            BackendError::Json(_) => "JSON_ERROR",
            BackendError::Io(_) => "IO_ERROR",
        }
    }

    /// Transient failures are worth retrying on the next poll cycle.
    pub fn is_transient(&self) -> bool {
        match self {
            BackendError::Http(err) => err.is_timeout() || err.is_connect() || err.is_request(),
            BackendError::Server { status, .. } => *status >= 500,
            BackendError::Io(_) => true,
            _ => false,
        }
    }
}

pub type BackendResult<T> = std::result::Result<T, BackendError>;
