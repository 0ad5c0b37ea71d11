//! Application setup and server configuration.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::Extension,
    http::Method,
    routing::{get, post},
    Router,
};
use sqlx::PgPool;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::domains::waveforms::{WaveformCoordinator, WaveformStore};
use crate::kernel::jobs::JobService;
use crate::server::routes::{
    delete_job, get_episode_waveform, get_job, health_handler, list_jobs, retry_job,
    trigger_episode_waveform,
};

/// Shared handler state: the job service, the artifact stores, and the
/// read-path coordinators built over them.
#[derive(Clone)]
pub struct AppState {
    pub jobs: Arc<JobService>,
    pub waveforms: Arc<dyn WaveformStore>,
    pub waveform_requests: Arc<WaveformCoordinator>,
    /// Present in production; absent when handlers run over in-memory stores.
    pub db_pool: Option<PgPool>,
}

pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route(
            "/api/v1/episodes/:id/waveform",
            get(get_episode_waveform).post(trigger_episode_waveform),
        )
        .route("/api/v1/jobs", get(list_jobs))
        .route("/api/v1/jobs/:id", get(get_job).delete(delete_job))
        .route("/api/v1/jobs/:id/retry", post(retry_job))
        .layer(TimeoutLayer::new(Duration::from_secs(10)))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET, Method::POST, Method::DELETE])
                .allow_headers(Any),
        )
        .layer(Extension(state))
}
