//! Waveform read and trigger endpoints.
//!
//! `GET /api/v1/episodes/{id}/waveform` answers from the coordinator's state
//! machine: `200` when the artifact exists, `202` while work is queued,
//! running, or waiting out a retry backoff. `POST` with `retry=true` forces a
//! manual retry of a failed or dead job.

use axum::extract::{Extension, Path, Query};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::domains::waveforms::Waveform;
use crate::kernel::jobs::Job;
use crate::kernel::{ArtifactRequest, TriggerOutcome};
use crate::server::app::AppState;
use crate::server::routes::{core_error_response, ErrorBody};

#[derive(Serialize)]
pub struct WaveformEnvelope {
    pub status: String,
    pub message: String,
    pub waveform: WaveformBody,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WaveformBody {
    pub id: String,
    pub episode_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<f64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<i32>,
    pub status: String,
}

fn ready_envelope(waveform: Waveform) -> WaveformEnvelope {
    WaveformEnvelope {
        status: "ok".to_string(),
        message: "Waveform available".to_string(),
        waveform: WaveformBody {
            id: waveform.id.to_string(),
            episode_id: waveform.episode_id,
            data: Some(waveform.peaks),
            duration: Some(waveform.duration_secs),
            sample_rate: Some(waveform.sample_rate),
            progress: None,
            status: "ok".to_string(),
        },
    }
}

fn pending_envelope(episode_id: i64, status: &str, message: String, progress: Option<i32>) -> WaveformEnvelope {
    WaveformEnvelope {
        status: status.to_string(),
        message,
        waveform: WaveformBody {
            id: episode_id.to_string(),
            episode_id,
            data: None,
            duration: None,
            sample_rate: None,
            progress,
            status: status.to_string(),
        },
    }
}

fn queued_envelope(job: &Job) -> WaveformEnvelope {
    pending_envelope(
        episode_id_of(job),
        "queued",
        "Waveform generation has been queued".to_string(),
        None,
    )
}

fn in_progress_envelope(job: &Job) -> WaveformEnvelope {
    pending_envelope(
        episode_id_of(job),
        "processing",
        "Waveform generation in progress".to_string(),
        Some(job.progress),
    )
}

fn retry_pending_envelope(job: &Job) -> WaveformEnvelope {
    pending_envelope(
        episode_id_of(job),
        "processing",
        format!(
            "Waveform generation failed, retry {}/{} pending",
            job.retry_count, job.max_retries
        ),
        None,
    )
}

fn episode_id_of(job: &Job) -> i64 {
    job.payload["episode_id"].as_i64().unwrap_or_default()
}

fn parse_episode_id(raw: &str) -> Result<i64, Response> {
    match raw.parse::<i64>() {
        Ok(id) if id > 0 => Ok(id),
        _ => Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorBody::new(format!("invalid episode id: {raw}"))),
        )
            .into_response()),
    }
}

/// `GET /api/v1/episodes/{id}/waveform`
pub async fn get_episode_waveform(
    Extension(state): Extension<AppState>,
    Path(id): Path<String>,
) -> Response {
    let episode_id = match parse_episode_id(&id) {
        Ok(id) => id,
        Err(response) => return response,
    };

    match state.waveform_requests.resolve(episode_id).await {
        Ok(ArtifactRequest::Ready { artifact }) => {
            (StatusCode::OK, Json(ready_envelope(artifact))).into_response()
        }
        Ok(ArtifactRequest::Queued { job }) => {
            (StatusCode::ACCEPTED, Json(queued_envelope(&job))).into_response()
        }
        Ok(ArtifactRequest::InProgress { job }) => {
            (StatusCode::ACCEPTED, Json(in_progress_envelope(&job))).into_response()
        }
        Ok(ArtifactRequest::RetryScheduled { job }) => {
            (StatusCode::ACCEPTED, Json(retry_pending_envelope(&job))).into_response()
        }
        Err(err) => core_error_response(err).into_response(),
    }
}

#[derive(Deserialize)]
pub struct TriggerQuery {
    #[serde(default)]
    pub retry: bool,
}

/// `POST /api/v1/episodes/{id}/waveform?retry=true`
pub async fn trigger_episode_waveform(
    Extension(state): Extension<AppState>,
    Path(id): Path<String>,
    Query(query): Query<TriggerQuery>,
) -> Response {
    let episode_id = match parse_episode_id(&id) {
        Ok(id) => id,
        Err(response) => return response,
    };

    match state.waveform_requests.trigger(episode_id, query.retry).await {
        Ok(TriggerOutcome::Exists { artifact }) => {
            (StatusCode::OK, Json(ready_envelope(artifact))).into_response()
        }
        Ok(TriggerOutcome::Queued { job }) => {
            (StatusCode::ACCEPTED, Json(queued_envelope(&job))).into_response()
        }
        Ok(TriggerOutcome::InProgress { job }) => {
            (StatusCode::ACCEPTED, Json(in_progress_envelope(&job))).into_response()
        }
        Ok(TriggerOutcome::RetryScheduled { job }) => {
            (StatusCode::ACCEPTED, Json(retry_pending_envelope(&job))).into_response()
        }
        Ok(TriggerOutcome::Retried { job }) => {
            let envelope = pending_envelope(
                episode_id_of(&job),
                "queued",
                "Waveform generation retry has been queued".to_string(),
                None,
            );
            (StatusCode::ACCEPTED, Json(envelope)).into_response()
        }
        Err(err) => core_error_response(err).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn episode_id_must_be_positive_decimal() {
        assert_eq!(parse_episode_id("42").unwrap(), 42);
        assert!(parse_episode_id("0").is_err());
        assert!(parse_episode_id("-3").is_err());
        assert!(parse_episode_id("abc").is_err());
        assert!(parse_episode_id("4.2").is_err());
    }

    #[test]
    fn queued_body_matches_contract() {
        let envelope = pending_envelope(
            42,
            "queued",
            "Waveform generation has been queued".to_string(),
            None,
        );

        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "status": "queued",
                "message": "Waveform generation has been queued",
                "waveform": { "id": "42", "episodeId": 42, "status": "queued" }
            })
        );
    }
}
