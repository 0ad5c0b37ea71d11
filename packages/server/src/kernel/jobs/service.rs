//! Business rules over the job store.
//!
//! The service owns uniqueness, backoff arithmetic, and manual-retry policy;
//! the store below it owns atomicity. Handlers and the worker pool only talk
//! to the queue through this type.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::info;

use super::job::{Job, JobError, JobStatus, JobType, NewJob};
use super::store::{JobFilter, JobStore};
use crate::common::CoreError;

/// Exponential backoff bounds for automatic retries.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(3600),
        }
    }
}

impl RetryPolicy {
    /// `delay(n) = min(max_delay, min_delay * 2^n)`.
    pub fn delay_for(&self, retry_count: i32) -> Duration {
        let exponent = retry_count.clamp(0, 30) as u32;
        let scaled = self.min_delay.as_secs().saturating_mul(1u64 << exponent);
        Duration::from_secs(scaled.min(self.max_delay.as_secs()))
    }
}

/// Policy layer between the HTTP handlers / worker pool and the store.
pub struct JobService {
    store: Arc<dyn JobStore>,
    retry: RetryPolicy,
}

impl JobService {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(store: Arc<dyn JobStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Unconditionally enqueue a new pending job.
    pub async fn enqueue(&self, job_type: JobType, payload: Value) -> Result<Job, CoreError> {
        let job = self
            .store
            .create(NewJob::builder().job_type(job_type).payload(payload).build())
            .await?;

        info!(job_id = job.id, job_type = %job.job_type, "enqueued job");
        Ok(job)
    }

    /// Enqueue unless a non-terminal job already exists for the same
    /// (type, `payload[key_field]`) pair, in which case that job is returned
    /// unchanged. Races between concurrent callers resolve at the store's
    /// unique index; the loser re-reads and returns the winner's job.
    pub async fn enqueue_unique(
        &self,
        job_type: JobType,
        payload: Value,
        key_field: &str,
    ) -> Result<Job, CoreError> {
        let key = unique_key_value(&payload, key_field)?;

        if let Some(existing) = self.store.get_for_unique_key(job_type, &key).await? {
            return Ok(existing);
        }

        let spec = NewJob::builder()
            .job_type(job_type)
            .payload(payload)
            .unique_key(Some(key.clone()))
            .build();

        match self.store.create(spec).await {
            Ok(job) => {
                info!(job_id = job.id, job_type = %job.job_type, key = %key, "enqueued unique job");
                Ok(job)
            }
            Err(CoreError::Conflict(_)) => self
                .store
                .get_for_unique_key(job_type, &key)
                .await?
                .ok_or_else(|| {
                    // The winner finished and went terminal between our insert
                    // and the re-read; the caller can simply try again.
                    CoreError::Unavailable(format!(
                        "lost enqueue race for {job_type} target {key}; retry"
                    ))
                }),
            Err(e) => Err(e),
        }
    }

    /// Most recent job (any status) targeting an episode's artifact.
    pub async fn get_job_for_artifact(
        &self,
        job_type: JobType,
        episode_id: i64,
    ) -> Result<Option<Job>, CoreError> {
        self.store
            .get_latest_for_target(job_type, &episode_id.to_string())
            .await
    }

    pub async fn get(&self, id: i64) -> Result<Job, CoreError> {
        self.store.get(id).await
    }

    pub async fn list(&self, filter: JobFilter) -> Result<Vec<Job>, CoreError> {
        self.store.list(filter).await
    }

    /// Whether a failed job's backoff window has elapsed.
    pub fn can_retry_now(&self, job: &Job, now: DateTime<Utc>) -> bool {
        if job.status != JobStatus::Failed || job.retry_count > job.max_retries {
            return false;
        }
        let Some(failed_at) = job.last_failed_at else {
            return true;
        };
        let delay = self.retry.delay_for(job.retry_count);
        now.signed_duration_since(failed_at).num_milliseconds() >= delay.as_millis() as i64
    }

    /// Failed jobs whose backoff window has elapsed, ready to reopen.
    pub async fn due_retries(&self, limit: i64) -> Result<Vec<Job>, CoreError> {
        let now = Utc::now();
        let failed = self.store.list_failed(limit).await?;
        Ok(failed
            .into_iter()
            .filter(|job| self.can_retry_now(job, now))
            .collect())
    }

    /// Reopen a failed job once its backoff has elapsed (retry scheduler path).
    pub async fn reopen_for_retry(&self, id: i64) -> Result<Job, CoreError> {
        let job = self.store.reopen_for_retry(id).await?;
        info!(
            job_id = job.id,
            job_type = %job.job_type,
            retry_count = job.retry_count,
            "reopened failed job for retry"
        );
        Ok(job)
    }

    /// Manually retry a failed or permanently-failed job.
    ///
    /// A `failed` job keeps its retry counter (the next automatic attempt
    /// counts normally); a `permanently_failed` job restarts from zero.
    pub async fn retry_failed_job(&self, id: i64) -> Result<Job, CoreError> {
        let job = self.store.get(id).await?;

        let reopened = match job.status {
            JobStatus::Failed => self.store.reopen_for_retry(id).await?,
            JobStatus::PermanentlyFailed => self.store.reopen_permanently_failed(id).await?,
            other => {
                return Err(CoreError::Conflict(format!(
                    "cannot manually retry job {id} in status {other}"
                )))
            }
        };

        info!(job_id = reopened.id, job_type = %reopened.job_type, "manual retry requested");
        Ok(reopened)
    }

    /// Delete a permanently-failed job so a fresh one can be enqueued.
    pub async fn delete_permanently_failed(&self, id: i64) -> Result<(), CoreError> {
        let job = self.store.get(id).await?;
        if job.status != JobStatus::PermanentlyFailed {
            return Err(CoreError::Conflict(format!(
                "cannot delete job {id} in status {}",
                job.status
            )));
        }
        self.store.delete(id).await?;
        info!(job_id = id, "deleted permanently failed job");
        Ok(())
    }

    // Worker-facing pass-throughs.

    pub async fn claim_one(
        &self,
        worker_id: &str,
        allowed_types: &[JobType],
    ) -> Result<Option<Job>, CoreError> {
        self.store.claim_one(worker_id, allowed_types).await
    }

    pub async fn update_progress(&self, id: i64, percent: i32) -> Result<(), CoreError> {
        self.store.update_progress(id, percent).await
    }

    pub async fn record_heartbeat(&self, id: i64) -> Result<(), CoreError> {
        self.store.record_heartbeat(id).await
    }

    pub async fn complete(&self, id: i64, result: Value) -> Result<Job, CoreError> {
        self.store.complete(id, result).await
    }

    pub async fn fail(&self, id: i64, error: &JobError) -> Result<Job, CoreError> {
        self.store.fail(id, error).await
    }

    pub async fn release(&self, id: i64) -> Result<Job, CoreError> {
        self.store.release(id).await
    }

    pub async fn reap_stalled(&self, deadline: DateTime<Utc>) -> Result<Vec<Job>, CoreError> {
        self.store.reap_stalled(deadline).await
    }
}

fn unique_key_value(payload: &Value, key_field: &str) -> Result<String, CoreError> {
    match payload.get(key_field) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        Some(other) => Err(CoreError::InvalidInput(format!(
            "payload field {key_field} must be a string or number, got {other}"
        ))),
        None => Err(CoreError::InvalidInput(format!(
            "payload is missing unique key field {key_field}"
        ))),
    }
}
