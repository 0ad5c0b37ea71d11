//! Job model for the durable artifact pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use typed_builder::TypedBuilder;

// ============================================================================
// Enums
// ============================================================================

/// Closed set of work the pipeline knows how to dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "job_kind", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    WaveformGeneration,
    TranscriptionGeneration,
    PodcastSync,
    ClipExtraction,
    Autolabel,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::WaveformGeneration => "waveform_generation",
            JobType::TranscriptionGeneration => "transcription_generation",
            JobType::PodcastSync => "podcast_sync",
            JobType::ClipExtraction => "clip_extraction",
            JobType::Autolabel => "autolabel",
        }
    }

    /// Payload field identifying the logical target of a job of this type.
    ///
    /// At most one non-terminal job may exist per (type, target).
    pub fn unique_key_field(&self) -> &'static str {
        match self {
            JobType::PodcastSync => "feed_id",
            _ => "episode_id",
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waveform_generation" => Ok(JobType::WaveformGeneration),
            "transcription_generation" => Ok(JobType::TranscriptionGeneration),
            "podcast_sync" => Ok(JobType::PodcastSync),
            "clip_extraction" => Ok(JobType::ClipExtraction),
            "autolabel" => Ok(JobType::Autolabel),
            other => Err(format!("unknown job type: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "job_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
    PermanentlyFailed,
    Cancelled,
}

impl JobStatus {
    /// Terminal statuses admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::PermanentlyFailed | JobStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::PermanentlyFailed => "permanently_failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "permanently_failed" => Ok(JobStatus::PermanentlyFailed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// Classification of a job failure, driving the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "job_error_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    /// Fetching the source failed (HTTP 4xx/5xx, DNS, timeout).
    Download,
    /// The transcoder or decoder produced garbage or exited non-zero.
    Processing,
    /// Storage, serialization, or other infrastructure failure.
    System,
    /// The source is gone; retrying cannot succeed.
    NotFound,
}

impl ErrorType {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ErrorType::NotFound)
    }
}

// ============================================================================
// Job error
// ============================================================================

/// Structured failure carried in the job record.
///
/// Processors return these; anything unstructured is wrapped as `system`.
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct JobError {
    pub error_type: ErrorType,
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl JobError {
    pub fn new(error_type: ErrorType, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_type,
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn download(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorType::Download, code, message)
    }

    pub fn processing(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorType::Processing, code, message)
    }

    pub fn system(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorType::System, code, message)
    }

    pub fn not_found(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorType::NotFound, code, message)
    }

    /// Failure recorded when a worker is told to stop mid-job.
    pub fn cancelled() -> Self {
        Self::new(ErrorType::System, "cancelled", "job was cancelled")
    }

    /// Failure recorded by the stall reaper for jobs with an expired heartbeat.
    pub fn stalled() -> Self {
        Self::new(ErrorType::System, "stalled", "worker heartbeat expired")
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Wrap an unstructured error as a `system` failure.
    pub fn from_unstructured(err: &(dyn std::error::Error + 'static)) -> Self {
        Self::new(ErrorType::System, "unclassified", err.to_string())
    }
}

// ============================================================================
// Job model
// ============================================================================

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub job_type: JobType,
    pub status: JobStatus,

    /// Opaque input, decoded into a typed payload at processor entry.
    pub payload: serde_json::Value,
    /// Filled on completion.
    pub result: Option<serde_json::Value>,
    /// Materialized `payload[unique_key_field]` backing the uniqueness index.
    pub unique_key: Option<String>,

    pub priority: i32,
    pub retry_count: i32,
    pub max_retries: i32,
    pub progress: i32,

    pub worker_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_failed_at: Option<DateTime<Utc>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,

    pub error: Option<String>,
    pub error_type: Option<ErrorType>,
    pub error_code: Option<String>,
    pub error_details: Option<serde_json::Value>,

    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Decode the payload into a typed per-job-type structure.
    pub fn decode_payload<P: serde::de::DeserializeOwned>(&self) -> Result<P, JobError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            JobError::system(
                "bad_payload",
                format!("failed to decode {} payload: {e}", self.job_type),
            )
        })
    }
}

/// Insertion spec for a new pending job.
#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct NewJob {
    pub job_type: JobType,
    pub payload: serde_json::Value,
    #[builder(default)]
    pub unique_key: Option<String>,
    #[builder(default = 0)]
    pub priority: i32,
    #[builder(default = 3)]
    pub max_retries: i32,
    #[builder(default)]
    pub created_by: Option<String>,
}
