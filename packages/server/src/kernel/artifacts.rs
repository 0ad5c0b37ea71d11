//! Read-path state machine reconciling artifact presence with job state.
//!
//! The coordinator sits between the HTTP handlers and the queue: it looks up
//! the artifact, consults the most recent job for the same target, enqueues
//! work uniquely when neither exists, and returns a state the handler maps
//! onto an HTTP status. Because enqueueing goes through `enqueue_unique`, a
//! thundering herd of readers creates at most one job per artifact.

use std::sync::Arc;

use async_trait::async_trait;

use crate::common::CoreError;
use crate::kernel::jobs::{Job, JobService, JobStatus, JobType};

/// Contract for an artifact repository: an opaque `episode_id -> blob` store.
///
/// The coordinator only needs presence checks; writes stay inside the
/// processors.
#[async_trait]
pub trait ArtifactStore: Send + Sync + 'static {
    type Artifact: Clone + Send + Sync + 'static;

    async fn find_by_episode(&self, episode_id: i64) -> Result<Option<Self::Artifact>, CoreError>;
}

/// Outcome of a read-path request.
#[derive(Debug, Clone)]
pub enum ArtifactRequest<A> {
    /// The artifact exists; return it.
    Ready { artifact: A },
    /// No work existed; a job was just enqueued.
    Queued { job: Job },
    /// A job is pending or actively processing.
    InProgress { job: Job },
    /// The last attempt failed; the retry scheduler will reopen the job
    /// once its backoff elapses.
    RetryScheduled { job: Job },
}

/// Outcome of a trigger (write-path) request.
#[derive(Debug, Clone)]
pub enum TriggerOutcome<A> {
    /// The artifact already exists; nothing to do.
    Exists { artifact: A },
    /// A new job was enqueued.
    Queued { job: Job },
    /// An existing job is already active.
    InProgress { job: Job },
    /// A failed job is waiting out its backoff window.
    RetryScheduled { job: Job },
    /// A failed or dead job was manually reopened.
    Retried { job: Job },
}

/// The read-path coordinator for one artifact type.
pub struct ArtifactCoordinator<S: ArtifactStore> {
    artifacts: S,
    jobs: Arc<JobService>,
    job_type: JobType,
}

impl<S: ArtifactStore> ArtifactCoordinator<S> {
    pub fn new(artifacts: S, jobs: Arc<JobService>, job_type: JobType) -> Self {
        Self {
            artifacts,
            jobs,
            job_type,
        }
    }

    pub fn job_type(&self) -> JobType {
        self.job_type
    }

    /// Resolve a read request for an episode's artifact.
    pub async fn resolve(
        &self,
        episode_id: i64,
    ) -> Result<ArtifactRequest<S::Artifact>, CoreError> {
        validate_episode_id(episode_id)?;

        if let Some(artifact) = self.artifacts.find_by_episode(episode_id).await? {
            return Ok(ArtifactRequest::Ready { artifact });
        }

        match self.jobs.get_job_for_artifact(self.job_type, episode_id).await? {
            None => Ok(ArtifactRequest::Queued {
                job: self.enqueue(episode_id).await?,
            }),
            Some(job) => match job.status {
                JobStatus::Pending | JobStatus::Processing => {
                    Ok(ArtifactRequest::InProgress { job })
                }
                JobStatus::Failed => Ok(ArtifactRequest::RetryScheduled { job }),
                JobStatus::Completed => {
                    // The job finished after our artifact lookup; re-fetch.
                    match self.artifacts.find_by_episode(episode_id).await? {
                        Some(artifact) => Ok(ArtifactRequest::Ready { artifact }),
                        None => Err(CoreError::Internal(anyhow::anyhow!(
                            "job {} completed but artifact for episode {episode_id} is missing",
                            job.id
                        ))),
                    }
                }
                JobStatus::PermanentlyFailed => {
                    // Dead jobs are cleared on the next read so readers can
                    // trigger a fresh attempt just by polling.
                    self.jobs.delete_permanently_failed(job.id).await?;
                    Ok(ArtifactRequest::Queued {
                        job: self.enqueue(episode_id).await?,
                    })
                }
                JobStatus::Cancelled => Ok(ArtifactRequest::Queued {
                    job: self.enqueue(episode_id).await?,
                }),
            },
        }
    }

    /// Resolve a trigger request, optionally forcing a manual retry.
    ///
    /// Without `force_retry`, a permanently-failed job is a conflict; with
    /// it, failed and permanently-failed jobs are reopened in place.
    pub async fn trigger(
        &self,
        episode_id: i64,
        force_retry: bool,
    ) -> Result<TriggerOutcome<S::Artifact>, CoreError> {
        validate_episode_id(episode_id)?;

        if let Some(artifact) = self.artifacts.find_by_episode(episode_id).await? {
            return Ok(TriggerOutcome::Exists { artifact });
        }

        let existing = self.jobs.get_job_for_artifact(self.job_type, episode_id).await?;

        match existing {
            None => Ok(TriggerOutcome::Queued {
                job: self.enqueue(episode_id).await?,
            }),
            Some(job) if force_retry => {
                // Invalid states (pending, processing, ...) surface as
                // Conflict from the service.
                let job = self.jobs.retry_failed_job(job.id).await?;
                Ok(TriggerOutcome::Retried { job })
            }
            Some(job) => match job.status {
                JobStatus::Pending | JobStatus::Processing => {
                    Ok(TriggerOutcome::InProgress { job })
                }
                JobStatus::Failed => Ok(TriggerOutcome::RetryScheduled { job }),
                JobStatus::PermanentlyFailed => Err(CoreError::Conflict(format!(
                    "{} for episode {episode_id} has permanently failed; pass retry=true to retry",
                    self.job_type
                ))),
                JobStatus::Completed => match self.artifacts.find_by_episode(episode_id).await? {
                    Some(artifact) => Ok(TriggerOutcome::Exists { artifact }),
                    None => Err(CoreError::Internal(anyhow::anyhow!(
                        "job {} completed but artifact for episode {episode_id} is missing",
                        job.id
                    ))),
                },
                JobStatus::Cancelled => Ok(TriggerOutcome::Queued {
                    job: self.enqueue(episode_id).await?,
                }),
            },
        }
    }

    async fn enqueue(&self, episode_id: i64) -> Result<Job, CoreError> {
        let key_field = self.job_type.unique_key_field();
        let mut payload = serde_json::Map::new();
        payload.insert(key_field.to_string(), serde_json::Value::from(episode_id));
        self.jobs
            .enqueue_unique(self.job_type, serde_json::Value::Object(payload), key_field)
            .await
    }
}

fn validate_episode_id(episode_id: i64) -> Result<(), CoreError> {
    if episode_id <= 0 {
        return Err(CoreError::InvalidInput(format!(
            "episode id must be positive, got {episode_id}"
        )));
    }
    Ok(())
}
