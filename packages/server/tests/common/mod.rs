//! Shared fixtures for integration tests: an app wired over in-memory stores.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use server_core::domains::waveforms::{waveform_coordinator, InMemoryWaveformStore, WaveformStore};
use server_core::kernel::jobs::{InMemoryJobStore, JobService, JobStore, RetryPolicy};
use server_core::server::{build_app, AppState};
use tower::ServiceExt;

pub struct TestApp {
    pub app: Router,
    pub job_store: Arc<InMemoryJobStore>,
    pub waveforms: Arc<InMemoryWaveformStore>,
    pub jobs: Arc<JobService>,
}

pub fn test_app() -> TestApp {
    let job_store = Arc::new(InMemoryJobStore::new());
    let jobs = Arc::new(JobService::with_retry_policy(
        job_store.clone() as Arc<dyn JobStore>,
        RetryPolicy {
            min_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(3600),
        },
    ));
    let waveforms = Arc::new(InMemoryWaveformStore::new());
    let waveform_store: Arc<dyn WaveformStore> = waveforms.clone();
    let coordinator = Arc::new(waveform_coordinator(waveform_store.clone(), jobs.clone()));

    let app = build_app(AppState {
        jobs: jobs.clone(),
        waveforms: waveform_store,
        waveform_requests: coordinator,
        db_pool: None,
    });

    TestApp {
        app,
        job_store,
        waveforms,
        jobs,
    }
}

pub async fn request(
    app: &Router,
    method: Method,
    uri: &str,
) -> (StatusCode, serde_json::Value) {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };

    (status, body)
}

pub async fn get(app: &Router, uri: &str) -> (StatusCode, serde_json::Value) {
    request(app, Method::GET, uri).await
}

pub async fn post(app: &Router, uri: &str) -> (StatusCode, serde_json::Value) {
    request(app, Method::POST, uri).await
}
