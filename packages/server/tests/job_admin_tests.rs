//! Router-level tests for the job inspection endpoints.

mod common;

use axum::http::{Method, StatusCode};
use common::{get, post, request, test_app};
use serde_json::json;
use server_core::kernel::jobs::{JobError, JobStore, JobType};

#[tokio::test]
async fn list_jobs_filters_by_type_and_status() {
    let fixture = test_app();

    get(&fixture.app, "/api/v1/episodes/1/waveform").await;
    get(&fixture.app, "/api/v1/episodes/2/waveform").await;

    let (status, body) = get(&fixture.app, "/api/v1/jobs?type=waveform_generation").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["jobs"].as_array().unwrap().len(), 2);

    let (_, body) = get(&fixture.app, "/api/v1/jobs?status=processing").await;
    assert!(body["jobs"].as_array().unwrap().is_empty());

    let (_, body) = get(&fixture.app, "/api/v1/jobs?limit=1").await;
    assert_eq!(body["jobs"].as_array().unwrap().len(), 1);
    assert_eq!(body["limit"], 1);
}

#[tokio::test]
async fn list_jobs_rejects_unknown_filters() {
    let fixture = test_app();

    let (status, _) = get(&fixture.app, "/api/v1/jobs?type=shoe_shining").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = get(&fixture.app, "/api/v1/jobs?status=sleeping").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn get_job_returns_record_or_404() {
    let fixture = test_app();

    get(&fixture.app, "/api/v1/episodes/42/waveform").await;
    let job_id = fixture.job_store.all_jobs()[0].id;

    let (status, body) = get(&fixture.app, &format!("/api/v1/jobs/{job_id}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["job_type"], "waveform_generation");
    assert_eq!(body["payload"], json!({ "episode_id": 42 }));

    let (status, _) = get(&fixture.app, "/api/v1/jobs/999999").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn retry_endpoint_rejects_jobs_that_are_not_failed() {
    let fixture = test_app();

    get(&fixture.app, "/api/v1/episodes/42/waveform").await;
    let job_id = fixture.job_store.all_jobs()[0].id;

    let (status, _) = post(&fixture.app, &format!("/api/v1/jobs/{job_id}/retry")).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn retry_endpoint_reopens_failed_job() {
    let fixture = test_app();

    get(&fixture.app, "/api/v1/episodes/42/waveform").await;
    let job_id = fixture.job_store.all_jobs()[0].id;
    fixture
        .job_store
        .claim_one("w", &[JobType::WaveformGeneration])
        .await
        .unwrap();
    fixture
        .job_store
        .fail(job_id, &JobError::download("http_500", "flaky"))
        .await
        .unwrap();

    let (status, body) = post(&fixture.app, &format!("/api/v1/jobs/{job_id}/retry")).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "pending");
    assert_eq!(body["retry_count"], 1);
}

#[tokio::test]
async fn delete_endpoint_only_accepts_permanently_failed_jobs() {
    let fixture = test_app();

    get(&fixture.app, "/api/v1/episodes/42/waveform").await;
    let job_id = fixture.job_store.all_jobs()[0].id;

    let (status, _) = request(&fixture.app, Method::DELETE, &format!("/api/v1/jobs/{job_id}")).await;
    assert_eq!(status, StatusCode::CONFLICT);

    fixture
        .job_store
        .claim_one("w", &[JobType::WaveformGeneration])
        .await
        .unwrap();
    fixture
        .job_store
        .fail(job_id, &JobError::not_found("http_404", "gone"))
        .await
        .unwrap();

    let (status, _) = request(&fixture.app, Method::DELETE, &format!("/api/v1/jobs/{job_id}")).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(fixture.job_store.all_jobs().is_empty());
}

#[tokio::test]
async fn health_endpoint_reports_in_memory_mode() {
    let fixture = test_app();

    let (status, body) = get(&fixture.app, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["database"]["status"], "disabled");
}
