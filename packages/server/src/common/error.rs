//! Core error taxonomy surfaced outside the job and artifact modules.
//!
//! Storage-level failures are wrapped as `Internal`; callers that can retry
//! (HTTP clients, the worker loop) receive `Unavailable`. Structured job
//! failures travel separately in the `Job` record, never through this enum.

use thiserror::Error;

/// Errors surfaced by the core to handlers and the worker pool.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("temporarily unavailable: {0}")]
    Unavailable(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl CoreError {
    /// Whether the caller may retry the same operation and expect progress.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::Unavailable(_))
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => CoreError::NotFound("row not found".to_string()),
            sqlx::Error::PoolTimedOut => {
                CoreError::Unavailable("database pool timed out".to_string())
            }
            other => CoreError::Internal(anyhow::Error::new(other)),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Internal(anyhow::Error::new(err))
    }
}
