//! Job inspection and administration endpoints.

use axum::extract::{Extension, Path, Query};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::kernel::jobs::{Job, JobFilter};
use crate::server::app::AppState;
use crate::server::routes::{core_error_response, ErrorBody};

#[derive(Deserialize)]
pub struct JobListQuery {
    #[serde(rename = "type")]
    pub job_type: Option<String>,
    pub status: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Serialize)]
pub struct JobListResponse {
    pub jobs: Vec<Job>,
    pub limit: i64,
    pub offset: i64,
}

/// `GET /api/v1/jobs?type=&status=&limit=&offset=`
pub async fn list_jobs(
    Extension(state): Extension<AppState>,
    Query(query): Query<JobListQuery>,
) -> Response {
    let job_type: Option<crate::kernel::jobs::JobType> =
        match query.job_type.as_deref().map(str::parse).transpose() {
            Ok(parsed) => parsed,
            Err(message) => {
                return (StatusCode::BAD_REQUEST, Json(ErrorBody::new(message))).into_response()
            }
        };
    let status: Option<crate::kernel::jobs::JobStatus> =
        match query.status.as_deref().map(str::parse).transpose() {
            Ok(parsed) => parsed,
            Err(message) => {
                return (StatusCode::BAD_REQUEST, Json(ErrorBody::new(message))).into_response()
            }
        };

    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    let offset = query.offset.unwrap_or(0).max(0);

    let filter = JobFilter::builder()
        .job_type(job_type)
        .status(status)
        .limit(limit)
        .offset(offset)
        .build();

    match state.jobs.list(filter).await {
        Ok(jobs) => (
            StatusCode::OK,
            Json(JobListResponse {
                jobs,
                limit,
                offset,
            }),
        )
            .into_response(),
        Err(err) => core_error_response(err).into_response(),
    }
}

/// `GET /api/v1/jobs/{id}`
pub async fn get_job(Extension(state): Extension<AppState>, Path(id): Path<i64>) -> Response {
    match state.jobs.get(id).await {
        Ok(job) => (StatusCode::OK, Json(job)).into_response(),
        Err(err) => core_error_response(err).into_response(),
    }
}

/// `POST /api/v1/jobs/{id}/retry` — manual retry of a failed or
/// permanently-failed job.
pub async fn retry_job(Extension(state): Extension<AppState>, Path(id): Path<i64>) -> Response {
    match state.jobs.retry_failed_job(id).await {
        Ok(job) => (StatusCode::ACCEPTED, Json(job)).into_response(),
        Err(err) => core_error_response(err).into_response(),
    }
}

/// `DELETE /api/v1/jobs/{id}` — remove a permanently-failed job so a fresh
/// one can be enqueued.
pub async fn delete_job(Extension(state): Extension<AppState>, Path(id): Path<i64>) -> Response {
    match state.jobs.delete_permanently_failed(id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => core_error_response(err).into_response(),
    }
}
