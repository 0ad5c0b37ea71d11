//! Durable job queue storage.
//!
//! `JobStore` is the single coordination point between HTTP handlers and
//! workers: every mutation is transactional, and `claim_one` uses
//! `FOR UPDATE SKIP LOCKED` so that concurrent workers (in this process or
//! another) never claim the same job.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use typed_builder::TypedBuilder;

use super::job::{ErrorType, Job, JobError, JobStatus, JobType, NewJob};
use crate::common::CoreError;

/// Listing filter. Results are ordered `priority DESC, created_at ASC`.
#[derive(Debug, Clone, TypedBuilder)]
pub struct JobFilter {
    #[builder(default)]
    pub job_type: Option<JobType>,
    #[builder(default)]
    pub status: Option<JobStatus>,
    #[builder(default = 50)]
    pub limit: i64,
    #[builder(default = 0)]
    pub offset: i64,
}

impl Default for JobFilter {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Transactional operations over the durable queue.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new pending job. Fails with `Conflict` when the partial
    /// unique index rejects a duplicate non-terminal (type, target) pair.
    async fn create(&self, spec: NewJob) -> Result<Job, CoreError>;

    async fn get(&self, id: i64) -> Result<Job, CoreError>;

    async fn list(&self, filter: JobFilter) -> Result<Vec<Job>, CoreError>;

    /// Atomically claim one pending job of an allowed type.
    ///
    /// Ordering: `priority DESC, created_at ASC, id ASC`. Returns `None`
    /// when nothing is claimable.
    async fn claim_one(
        &self,
        worker_id: &str,
        allowed_types: &[JobType],
    ) -> Result<Option<Job>, CoreError>;

    /// Record progress for a processing job. Clamped to `[0, 100]` and
    /// monotonically non-decreasing within an attempt. `Conflict` when the
    /// job is not processing.
    async fn update_progress(&self, id: i64, percent: i32) -> Result<(), CoreError>;

    /// Refresh the heartbeat of a processing job.
    async fn record_heartbeat(&self, id: i64) -> Result<(), CoreError>;

    /// `processing -> completed`; sets `completed_at`, forces progress to
    /// 100, and clears failure bookkeeping.
    async fn complete(&self, id: i64, result: serde_json::Value) -> Result<Job, CoreError>;

    /// `processing -> failed` with retry accounting, or straight to
    /// `permanently_failed` for `not_found` errors and exhausted retries.
    async fn fail(&self, id: i64, error: &JobError) -> Result<Job, CoreError>;

    /// `failed -> pending`; used by the retry scheduler and manual retry.
    async fn reopen_for_retry(&self, id: i64) -> Result<Job, CoreError>;

    /// `permanently_failed -> pending` with `retry_count` reset to zero;
    /// backs the manual retry of a dead job.
    async fn reopen_permanently_failed(&self, id: i64) -> Result<Job, CoreError>;

    /// `processing -> pending` without touching retry accounting; used when
    /// a worker is cancelled mid-job.
    async fn release(&self, id: i64) -> Result<Job, CoreError>;

    /// Most recent **non-terminal** job for a (type, target) pair.
    async fn get_for_unique_key(
        &self,
        job_type: JobType,
        key: &str,
    ) -> Result<Option<Job>, CoreError>;

    /// Most recent job for a (type, target) pair in **any** status.
    async fn get_latest_for_target(
        &self,
        job_type: JobType,
        key: &str,
    ) -> Result<Option<Job>, CoreError>;

    async fn delete(&self, id: i64) -> Result<(), CoreError>;

    /// Fail every processing job whose heartbeat is older than `deadline`.
    /// Returns the jobs that were transitioned.
    async fn reap_stalled(&self, deadline: DateTime<Utc>) -> Result<Vec<Job>, CoreError>;

    /// Failed jobs, oldest failure first; input to the retry scheduler.
    async fn list_failed(&self, limit: i64) -> Result<Vec<Job>, CoreError>;
}

// ============================================================================
// Postgres implementation
// ============================================================================

pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Decide the post-failure state for a processing job.
    ///
    /// `not_found` short-circuits to `permanently_failed`; otherwise the
    /// retry counter advances and the job dies once it would exceed
    /// `max_retries`. The counter never exceeds `max_retries`.
    pub(crate) fn failure_transition(job: &Job, error: &JobError) -> (JobStatus, i32) {
        if error.error_type == ErrorType::NotFound {
            let capped = (job.retry_count + 1).min(job.max_retries);
            return (JobStatus::PermanentlyFailed, capped);
        }
        let next = job.retry_count + 1;
        if next > job.max_retries {
            (JobStatus::PermanentlyFailed, job.max_retries)
        } else {
            (JobStatus::Failed, next)
        }
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn create(&self, spec: NewJob) -> Result<Job, CoreError> {
        let result = sqlx::query_as::<_, Job>(
            r#"
            INSERT INTO jobs (job_type, status, payload, unique_key, priority, max_retries, created_by)
            VALUES ($1, 'pending', $2, $3, $4, $5, $6)
            RETURNING id, job_type, status, payload, result, unique_key, priority,
                      retry_count, max_retries, progress, worker_id, started_at,
                      completed_at, last_failed_at, last_heartbeat_at, error,
                      error_type, error_code, error_details, created_by, created_at, updated_at
            "#,
        )
        .bind(spec.job_type)
        .bind(&spec.payload)
        .bind(&spec.unique_key)
        .bind(spec.priority)
        .bind(spec.max_retries)
        .bind(&spec.created_by)
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(job) => Ok(job),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => Err(CoreError::Conflict(
                format!("active {} job already exists for this target", spec.job_type),
            )),
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, id: i64) -> Result<Job, CoreError> {
        let job = sqlx::query_as::<_, Job>(
            r#"
            SELECT id, job_type, status, payload, result, unique_key, priority,
                   retry_count, max_retries, progress, worker_id, started_at,
                   completed_at, last_failed_at, last_heartbeat_at, error,
                   error_type, error_code, error_details, created_by, created_at, updated_at
            FROM jobs
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        job.ok_or_else(|| CoreError::NotFound(format!("job {id} not found")))
    }

    async fn list(&self, filter: JobFilter) -> Result<Vec<Job>, CoreError> {
        let jobs = sqlx::query_as::<_, Job>(
            r#"
            SELECT id, job_type, status, payload, result, unique_key, priority,
                   retry_count, max_retries, progress, worker_id, started_at,
                   completed_at, last_failed_at, last_heartbeat_at, error,
                   error_type, error_code, error_details, created_by, created_at, updated_at
            FROM jobs
            WHERE ($1::job_kind IS NULL OR job_type = $1)
              AND ($2::job_status IS NULL OR status = $2)
            ORDER BY priority DESC, created_at ASC, id ASC
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(filter.job_type)
        .bind(filter.status)
        .bind(filter.limit)
        .bind(filter.offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(jobs)
    }

    async fn claim_one(
        &self,
        worker_id: &str,
        allowed_types: &[JobType],
    ) -> Result<Option<Job>, CoreError> {
        if allowed_types.is_empty() {
            return Ok(None);
        }

        let job = sqlx::query_as::<_, Job>(
            r#"
            WITH candidate AS (
                SELECT id
                FROM jobs
                WHERE status = 'pending' AND job_type = ANY($2)
                ORDER BY priority DESC, created_at ASC, id ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs
            SET status = 'processing',
                worker_id = $1,
                started_at = NOW(),
                last_heartbeat_at = NOW(),
                progress = 0,
                updated_at = NOW()
            WHERE id IN (SELECT id FROM candidate)
            RETURNING id, job_type, status, payload, result, unique_key, priority,
                      retry_count, max_retries, progress, worker_id, started_at,
                      completed_at, last_failed_at, last_heartbeat_at, error,
                      error_type, error_code, error_details, created_by, created_at, updated_at
            "#,
        )
        .bind(worker_id)
        .bind(allowed_types)
        .fetch_optional(&self.pool)
        .await?;

        Ok(job)
    }

    async fn update_progress(&self, id: i64, percent: i32) -> Result<(), CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET progress = GREATEST(progress, LEAST(100, GREATEST(0, $2))),
                updated_at = NOW()
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(id)
        .bind(percent)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let job = self.get(id).await?;
            return Err(CoreError::Conflict(format!(
                "cannot record progress for job {id} in status {}",
                job.status
            )));
        }

        Ok(())
    }

    async fn record_heartbeat(&self, id: i64) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET last_heartbeat_at = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn complete(&self, id: i64, result: serde_json::Value) -> Result<Job, CoreError> {
        let job = sqlx::query_as::<_, Job>(
            r#"
            UPDATE jobs
            SET status = 'completed',
                result = $2,
                progress = 100,
                completed_at = NOW(),
                worker_id = NULL,
                error = NULL,
                error_type = NULL,
                error_code = NULL,
                error_details = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status = 'processing'
            RETURNING id, job_type, status, payload, result, unique_key, priority,
                      retry_count, max_retries, progress, worker_id, started_at,
                      completed_at, last_failed_at, last_heartbeat_at, error,
                      error_type, error_code, error_details, created_by, created_at, updated_at
            "#,
        )
        .bind(id)
        .bind(&result)
        .fetch_optional(&self.pool)
        .await?;

        match job {
            Some(job) => Ok(job),
            None => {
                let current = self.get(id).await?;
                Err(CoreError::Conflict(format!(
                    "cannot complete job {id} in status {}",
                    current.status
                )))
            }
        }
    }

    async fn fail(&self, id: i64, error: &JobError) -> Result<Job, CoreError> {
        let mut tx = self.pool.begin().await.map_err(CoreError::from)?;

        let job = sqlx::query_as::<_, Job>(
            r#"
            SELECT id, job_type, status, payload, result, unique_key, priority,
                   retry_count, max_retries, progress, worker_id, started_at,
                   completed_at, last_failed_at, last_heartbeat_at, error,
                   error_type, error_code, error_details, created_by, created_at, updated_at
            FROM jobs
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("job {id} not found")))?;

        if job.status != JobStatus::Processing {
            return Err(CoreError::Conflict(format!(
                "cannot fail job {id} in status {}",
                job.status
            )));
        }

        let (next_status, next_retry_count) = Self::failure_transition(&job, error);

        let updated = sqlx::query_as::<_, Job>(
            r#"
            UPDATE jobs
            SET status = $2,
                retry_count = $3,
                last_failed_at = NOW(),
                worker_id = NULL,
                error = $4,
                error_type = $5,
                error_code = $6,
                error_details = $7,
                updated_at = NOW()
            WHERE id = $1
            RETURNING id, job_type, status, payload, result, unique_key, priority,
                      retry_count, max_retries, progress, worker_id, started_at,
                      completed_at, last_failed_at, last_heartbeat_at, error,
                      error_type, error_code, error_details, created_by, created_at, updated_at
            "#,
        )
        .bind(id)
        .bind(next_status)
        .bind(next_retry_count)
        .bind(&error.message)
        .bind(error.error_type)
        .bind(&error.code)
        .bind(&error.details)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await.map_err(CoreError::from)?;

        Ok(updated)
    }

    async fn reopen_for_retry(&self, id: i64) -> Result<Job, CoreError> {
        let job = sqlx::query_as::<_, Job>(
            r#"
            UPDATE jobs
            SET status = 'pending',
                worker_id = NULL,
                started_at = NULL,
                last_heartbeat_at = NULL,
                progress = 0,
                updated_at = NOW()
            WHERE id = $1 AND status = 'failed'
            RETURNING id, job_type, status, payload, result, unique_key, priority,
                      retry_count, max_retries, progress, worker_id, started_at,
                      completed_at, last_failed_at, last_heartbeat_at, error,
                      error_type, error_code, error_details, created_by, created_at, updated_at
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match job {
            Some(job) => Ok(job),
            None => {
                let current = self.get(id).await?;
                Err(CoreError::Conflict(format!(
                    "cannot reopen job {id} in status {}",
                    current.status
                )))
            }
        }
    }

    async fn reopen_permanently_failed(&self, id: i64) -> Result<Job, CoreError> {
        let job = sqlx::query_as::<_, Job>(
            r#"
            UPDATE jobs
            SET status = 'pending',
                retry_count = 0,
                worker_id = NULL,
                started_at = NULL,
                last_heartbeat_at = NULL,
                progress = 0,
                updated_at = NOW()
            WHERE id = $1 AND status = 'permanently_failed'
            RETURNING id, job_type, status, payload, result, unique_key, priority,
                      retry_count, max_retries, progress, worker_id, started_at,
                      completed_at, last_failed_at, last_heartbeat_at, error,
                      error_type, error_code, error_details, created_by, created_at, updated_at
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match job {
            Some(job) => Ok(job),
            None => {
                let current = self.get(id).await?;
                Err(CoreError::Conflict(format!(
                    "cannot revive job {id} in status {}",
                    current.status
                )))
            }
        }
    }

    async fn release(&self, id: i64) -> Result<Job, CoreError> {
        let job = sqlx::query_as::<_, Job>(
            r#"
            UPDATE jobs
            SET status = 'pending',
                worker_id = NULL,
                started_at = NULL,
                last_heartbeat_at = NULL,
                progress = 0,
                updated_at = NOW()
            WHERE id = $1 AND status = 'processing'
            RETURNING id, job_type, status, payload, result, unique_key, priority,
                      retry_count, max_retries, progress, worker_id, started_at,
                      completed_at, last_failed_at, last_heartbeat_at, error,
                      error_type, error_code, error_details, created_by, created_at, updated_at
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match job {
            Some(job) => Ok(job),
            None => {
                let current = self.get(id).await?;
                Err(CoreError::Conflict(format!(
                    "cannot release job {id} in status {}",
                    current.status
                )))
            }
        }
    }

    async fn get_for_unique_key(
        &self,
        job_type: JobType,
        key: &str,
    ) -> Result<Option<Job>, CoreError> {
        let job = sqlx::query_as::<_, Job>(
            r#"
            SELECT id, job_type, status, payload, result, unique_key, priority,
                   retry_count, max_retries, progress, worker_id, started_at,
                   completed_at, last_failed_at, last_heartbeat_at, error,
                   error_type, error_code, error_details, created_by, created_at, updated_at
            FROM jobs
            WHERE job_type = $1
              AND unique_key = $2
              AND status IN ('pending', 'processing', 'failed')
            ORDER BY created_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(job_type)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(job)
    }

    async fn get_latest_for_target(
        &self,
        job_type: JobType,
        key: &str,
    ) -> Result<Option<Job>, CoreError> {
        let job = sqlx::query_as::<_, Job>(
            r#"
            SELECT id, job_type, status, payload, result, unique_key, priority,
                   retry_count, max_retries, progress, worker_id, started_at,
                   completed_at, last_failed_at, last_heartbeat_at, error,
                   error_type, error_code, error_details, created_by, created_at, updated_at
            FROM jobs
            WHERE job_type = $1 AND unique_key = $2
            ORDER BY created_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(job_type)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(job)
    }

    async fn delete(&self, id: i64) -> Result<(), CoreError> {
        let result = sqlx::query("DELETE FROM jobs WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("job {id} not found")));
        }

        Ok(())
    }

    async fn reap_stalled(&self, deadline: DateTime<Utc>) -> Result<Vec<Job>, CoreError> {
        let stalled_ids = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT id
            FROM jobs
            WHERE status = 'processing' AND last_heartbeat_at < $1
            ORDER BY last_heartbeat_at ASC
            "#,
        )
        .bind(deadline)
        .fetch_all(&self.pool)
        .await?;

        let stalled_error = JobError::stalled();
        let mut reaped = Vec::with_capacity(stalled_ids.len());
        for id in stalled_ids {
            // The worker may have finished between the scan and this call;
            // fail() re-checks the status under a row lock.
            match self.fail(id, &stalled_error).await {
                Ok(job) => reaped.push(job),
                Err(CoreError::Conflict(_)) | Err(CoreError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }

        Ok(reaped)
    }

    async fn list_failed(&self, limit: i64) -> Result<Vec<Job>, CoreError> {
        let jobs = sqlx::query_as::<_, Job>(
            r#"
            SELECT id, job_type, status, payload, result, unique_key, priority,
                   retry_count, max_retries, progress, worker_id, started_at,
                   completed_at, last_failed_at, last_heartbeat_at, error,
                   error_type, error_code, error_details, created_by, created_at, updated_at
            FROM jobs
            WHERE status = 'failed'
            ORDER BY last_failed_at ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job_in(status: JobStatus, retry_count: i32, max_retries: i32) -> Job {
        Job {
            id: 1,
            job_type: JobType::WaveformGeneration,
            status,
            payload: serde_json::json!({ "episode_id": 42 }),
            result: None,
            unique_key: Some("42".to_string()),
            priority: 0,
            retry_count,
            max_retries,
            progress: 0,
            worker_id: None,
            started_at: None,
            completed_at: None,
            last_failed_at: None,
            last_heartbeat_at: None,
            error: None,
            error_type: None,
            error_code: None,
            error_details: None,
            created_by: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn first_failure_stays_retryable() {
        let job = job_in(JobStatus::Processing, 0, 3);
        let (status, count) =
            PostgresJobStore::failure_transition(&job, &JobError::processing("exit", "boom"));

        assert_eq!(status, JobStatus::Failed);
        assert_eq!(count, 1);
    }

    #[test]
    fn failure_at_max_minus_one_stays_failed() {
        let job = job_in(JobStatus::Processing, 2, 3);
        let (status, count) =
            PostgresJobStore::failure_transition(&job, &JobError::processing("exit", "boom"));

        assert_eq!(status, JobStatus::Failed);
        assert_eq!(count, 3);
    }

    #[test]
    fn failure_past_max_goes_permanent() {
        let job = job_in(JobStatus::Processing, 3, 3);
        let (status, count) =
            PostgresJobStore::failure_transition(&job, &JobError::processing("exit", "boom"));

        assert_eq!(status, JobStatus::PermanentlyFailed);
        assert_eq!(count, 3);
    }

    #[test]
    fn not_found_goes_straight_to_permanent() {
        let job = job_in(JobStatus::Processing, 0, 3);
        let (status, count) =
            PostgresJobStore::failure_transition(&job, &JobError::not_found("http_404", "gone"));

        assert_eq!(status, JobStatus::PermanentlyFailed);
        assert_eq!(count, 1);
    }

    #[test]
    fn retry_count_never_exceeds_max() {
        let job = job_in(JobStatus::Processing, 3, 3);
        let (_, count) =
            PostgresJobStore::failure_transition(&job, &JobError::not_found("http_404", "gone"));

        assert_eq!(count, 3);
    }
}
