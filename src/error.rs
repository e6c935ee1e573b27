// src/error.rs
// Standardized error taxonomy for the memory service core

use thiserror::Error;

use crate::search::SearchType;

/// Error kinds surfaced by every core operation. Transports map these to
/// protocol statuses; the core never constructs status codes itself.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Target absent, or hidden by access policy. The two cases are
    /// deliberately indistinguishable to avoid existence oracles.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Invariant violation detected at commit (duplicate transfer,
    /// explicit-epoch collision, fork parent mismatch).
    #[error("conflict: {0}")]
    Conflict(String),

    /// Optimistic-lock miss; the caller retries.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("search type unavailable; available: {available:?}")]
    SearchTypeUnavailable { available: Vec<SearchType> },

    /// The operation must be retried against the advertised peer.
    #[error("redirect to {host}:{port}")]
    Redirect { host: String, port: u16 },

    /// Transient backend failure; caller may retry with backoff.
    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Convenience type alias for Result using CoreError
pub type CoreResult<T> = std::result::Result<T, CoreError>;

impl CoreError {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        CoreError::InvalidArgument(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        CoreError::NotFound(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        CoreError::Forbidden(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        CoreError::Conflict(msg.into())
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        CoreError::Unavailable(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        tracing::error!("internal error: {}", msg);
        CoreError::Internal(msg)
    }

    /// Stable kind name, used by transports and in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::InvalidArgument(_) => "INVALID_ARGUMENT",
            CoreError::NotFound(_) => "NOT_FOUND",
            CoreError::Forbidden(_) => "FORBIDDEN",
            CoreError::Conflict(_) => "CONFLICT",
            CoreError::PreconditionFailed(_) => "PRECONDITION_FAILED",
            CoreError::SearchTypeUnavailable { .. } => "SEARCH_TYPE_UNAVAILABLE",
            CoreError::Redirect { .. } => "REDIRECT",
            CoreError::Unavailable(_) => "UNAVAILABLE",
            CoreError::Internal(_) => "INTERNAL",
        }
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => CoreError::NotFound("row not found".into()),
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                CoreError::Unavailable(format!("database unavailable: {err}"))
            }
            other => CoreError::internal(format!("database error: {other}")),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::internal(format!("serialization error: {err}"))
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        CoreError::Unavailable(format!("I/O error: {err}"))
    }
}
