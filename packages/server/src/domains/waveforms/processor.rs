//! Waveform generation: download the enclosure, run the external transcoder,
//! persist the peaks.
//!
//! The podcast-index lookup and the transcoder binary are external
//! collaborators behind the [`EpisodeDirectory`] and [`PeakSource`] seams;
//! tests substitute fakes for both.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::model::NewWaveform;
use super::store::WaveformStore;
use crate::kernel::jobs::{Job, JobError, JobProcessor, JobType, ProcessContext};

/// Typed payload for `waveform_generation` jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaveformPayload {
    pub episode_id: i64,
}

/// Peaks document produced by the transcoder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedPeaks {
    pub duration_secs: i32,
    pub sample_rate: i32,
    pub peaks: Vec<f64>,
}

/// Resolves an episode id to its audio enclosure URL.
///
/// The production implementation talks to the podcast-index API; it lives
/// behind this seam because the full client (auth, caching, search) is not
/// part of the pipeline.
#[async_trait]
pub trait EpisodeDirectory: Send + Sync {
    async fn enclosure_url(&self, episode_id: i64) -> Result<String, JobError>;
}

/// Produces amplitude peaks for an episode's audio.
#[async_trait]
pub trait PeakSource: Send + Sync {
    async fn extract(
        &self,
        episode_id: i64,
        cancel: &CancellationToken,
    ) -> Result<ExtractedPeaks, JobError>;
}

// ============================================================================
// Transcoder-backed peak source
// ============================================================================

/// Downloads the enclosure and shells out to the external transcoder.
///
/// The binary is invoked as `<bin> --input <file> --output-format json` and
/// must print an [`ExtractedPeaks`] document on stdout.
pub struct TranscoderPeakSource {
    directory: Arc<dyn EpisodeDirectory>,
    http: reqwest::Client,
    binary: PathBuf,
}

impl TranscoderPeakSource {
    pub fn new(directory: Arc<dyn EpisodeDirectory>, binary: impl Into<PathBuf>) -> Self {
        Self {
            directory,
            http: reqwest::Client::new(),
            binary: binary.into(),
        }
    }

    async fn download(&self, url: &str) -> Result<NamedTempFile, JobError> {
        let response = self.http.get(url).send().await.map_err(|e| {
            let code = if e.is_timeout() {
                "timeout"
            } else if e.is_connect() {
                "connect"
            } else {
                "request"
            };
            JobError::download(code, format!("failed to fetch {url}: {e}"))
        })?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(JobError::not_found(
                "http_404",
                format!("enclosure {url} no longer exists"),
            ));
        }
        if !status.is_success() {
            return Err(JobError::download(
                format!("http_{}", status.as_u16()),
                format!("enclosure {url} returned {status}"),
            ));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| JobError::download("body", format!("failed to read {url}: {e}")))?;

        let mut tmp = NamedTempFile::new()
            .map_err(|e| JobError::system("tempfile", format!("failed to create tempfile: {e}")))?;
        std::io::Write::write_all(tmp.as_file_mut(), &bytes)
            .map_err(|e| JobError::system("tempfile", format!("failed to write audio: {e}")))?;

        debug!(url, bytes = bytes.len(), "downloaded enclosure");
        Ok(tmp)
    }

    async fn transcode(&self, audio: &NamedTempFile) -> Result<ExtractedPeaks, JobError> {
        let output = tokio::process::Command::new(&self.binary)
            .arg("--input")
            .arg(audio.path())
            .arg("--output-format")
            .arg("json")
            .output()
            .await
            .map_err(|e| {
                JobError::system(
                    "transcoder_spawn",
                    format!("failed to run {}: {e}", self.binary.display()),
                )
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(JobError::processing(
                "transcoder_exit",
                format!("transcoder exited with {}: {}", output.status, stderr.trim()),
            ));
        }

        serde_json::from_slice(&output.stdout).map_err(|e| {
            JobError::processing("truncated_output", format!("bad peaks document: {e}"))
        })
    }
}

#[async_trait]
impl PeakSource for TranscoderPeakSource {
    async fn extract(
        &self,
        episode_id: i64,
        cancel: &CancellationToken,
    ) -> Result<ExtractedPeaks, JobError> {
        let url = cancellable(cancel, self.directory.enclosure_url(episode_id)).await?;
        let audio = cancellable(cancel, self.download(&url)).await?;
        cancellable(cancel, self.transcode(&audio)).await
    }
}

/// Race a step against cancellation so a shutdown never waits on a slow
/// download or a wedged transcoder.
async fn cancellable<T>(
    cancel: &CancellationToken,
    step: impl std::future::Future<Output = Result<T, JobError>>,
) -> Result<T, JobError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(JobError::cancelled()),
        result = step => result,
    }
}

// ============================================================================
// Podcast-index directory
// ============================================================================

/// Minimal enclosure lookup against the podcast-index API.
pub struct PodcastIndexDirectory {
    http: reqwest::Client,
    base_url: String,
}

impl PodcastIndexDirectory {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl EpisodeDirectory for PodcastIndexDirectory {
    async fn enclosure_url(&self, episode_id: i64) -> Result<String, JobError> {
        let url = format!("{}/episodes/byid?id={episode_id}", self.base_url);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| JobError::download("index_request", format!("episode lookup failed: {e}")))?;

        if !response.status().is_success() {
            return Err(JobError::download(
                format!("index_http_{}", response.status().as_u16()),
                format!("episode lookup returned {}", response.status()),
            ));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| JobError::download("index_body", format!("episode lookup body: {e}")))?;

        match body["episode"]["enclosureUrl"].as_str() {
            Some(enclosure) if !enclosure.is_empty() => Ok(enclosure.to_string()),
            _ => Err(JobError::not_found(
                "episode_missing",
                format!("episode {episode_id} has no enclosure"),
            )),
        }
    }
}

// ============================================================================
// Processor
// ============================================================================

/// Processor for `waveform_generation` jobs.
pub struct WaveformProcessor {
    source: Arc<dyn PeakSource>,
    waveforms: Arc<dyn WaveformStore>,
}

impl WaveformProcessor {
    pub fn new(source: Arc<dyn PeakSource>, waveforms: Arc<dyn WaveformStore>) -> Self {
        Self { source, waveforms }
    }
}

#[async_trait]
impl JobProcessor for WaveformProcessor {
    fn job_type(&self) -> JobType {
        JobType::WaveformGeneration
    }

    async fn process(&self, ctx: &ProcessContext, job: &Job) -> Result<serde_json::Value, JobError> {
        let payload: WaveformPayload = job.decode_payload()?;
        ctx.report_progress(0).await;

        let extracted = self
            .source
            .extract(payload.episode_id, ctx.cancellation())
            .await?;
        ctx.report_progress(50).await;

        if ctx.is_cancelled() {
            return Err(JobError::cancelled());
        }

        let waveform = self
            .waveforms
            .upsert(
                NewWaveform::builder()
                    .episode_id(payload.episode_id)
                    .duration_secs(extracted.duration_secs)
                    .sample_rate(extracted.sample_rate)
                    .peaks(extracted.peaks)
                    .build(),
            )
            .await
            .map_err(|e| JobError::system("artifact_write", format!("failed to store waveform: {e}")))?;
        ctx.report_progress(100).await;

        Ok(serde_json::json!({
            "waveform_id": waveform.id,
            "episode_id": waveform.episode_id,
            "duration_secs": waveform.duration_secs,
            "sample_rate": waveform.sample_rate,
            "peak_count": waveform.peaks.len(),
        }))
    }
}
