use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;
use tracing::error;

use crate::common::CoreError;

pub mod health;
pub mod jobs;
pub mod waveforms;

pub use health::health_handler;
pub use jobs::{delete_job, get_job, list_jobs, retry_job};
pub use waveforms::{get_episode_waveform, trigger_episode_waveform};

#[derive(Serialize)]
pub struct ErrorBody {
    pub status: &'static str,
    pub message: String,
}

impl ErrorBody {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            status: "error",
            message: message.into(),
        }
    }
}

/// Map a core error onto its HTTP response.
pub fn core_error_response(err: CoreError) -> (StatusCode, Json<ErrorBody>) {
    match err {
        CoreError::NotFound(message) => (StatusCode::NOT_FOUND, Json(ErrorBody::new(message))),
        CoreError::InvalidInput(message) => {
            (StatusCode::BAD_REQUEST, Json(ErrorBody::new(message)))
        }
        CoreError::Conflict(message) => (StatusCode::CONFLICT, Json(ErrorBody::new(message))),
        CoreError::Unavailable(message) => {
            (StatusCode::SERVICE_UNAVAILABLE, Json(ErrorBody::new(message)))
        }
        CoreError::Internal(source) => {
            error!(error = %source, "internal error");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorBody::new("internal server error")),
            )
        }
    }
}
