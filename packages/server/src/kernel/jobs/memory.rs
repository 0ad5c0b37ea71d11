//! In-memory job store.
//!
//! Mirrors the Postgres store's semantics behind a single mutex so the
//! service, worker pool, and coordinator can be exercised in tests without a
//! database. One lock per operation gives the same atomicity the SQL
//! transactions do.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::job::{Job, JobError, JobStatus, JobType, NewJob};
use super::store::{JobFilter, JobStore, PostgresJobStore};
use crate::common::CoreError;

#[derive(Default)]
struct Inner {
    next_id: i64,
    jobs: HashMap<i64, Job>,
}

#[derive(Default)]
pub struct InMemoryJobStore {
    inner: Mutex<Inner>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Snapshot of every job, for test assertions.
    pub fn all_jobs(&self) -> Vec<Job> {
        self.lock().jobs.values().cloned().collect()
    }

    /// Rewrite a job's failure timestamp, for backoff tests.
    pub fn set_last_failed_at(&self, id: i64, at: DateTime<Utc>) {
        if let Some(job) = self.lock().jobs.get_mut(&id) {
            job.last_failed_at = Some(at);
        }
    }

    /// Rewrite a job's heartbeat timestamp, for stall-reaper tests.
    pub fn set_last_heartbeat_at(&self, id: i64, at: DateTime<Utc>) {
        if let Some(job) = self.lock().jobs.get_mut(&id) {
            job.last_heartbeat_at = Some(at);
        }
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create(&self, spec: NewJob) -> Result<Job, CoreError> {
        let mut inner = self.lock();

        if let Some(key) = &spec.unique_key {
            let duplicate = inner.jobs.values().any(|j| {
                j.job_type == spec.job_type
                    && j.unique_key.as_deref() == Some(key.as_str())
                    && !j.is_terminal()
            });
            if duplicate {
                return Err(CoreError::Conflict(format!(
                    "active {} job already exists for this target",
                    spec.job_type
                )));
            }
        }

        inner.next_id += 1;
        let now = Utc::now();
        let job = Job {
            id: inner.next_id,
            job_type: spec.job_type,
            status: JobStatus::Pending,
            payload: spec.payload,
            result: None,
            unique_key: spec.unique_key,
            priority: spec.priority,
            retry_count: 0,
            max_retries: spec.max_retries,
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
            created_by: spec.created_by,
            created_at: now,
            updated_at: now,
        };
        inner.jobs.insert(job.id, job.clone());

        Ok(job)
    }

    async fn get(&self, id: i64) -> Result<Job, CoreError> {
        self.lock()
            .jobs
            .get(&id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("job {id} not found")))
    }

    async fn list(&self, filter: JobFilter) -> Result<Vec<Job>, CoreError> {
        let inner = self.lock();
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| filter.job_type.map_or(true, |t| j.job_type == t))
            .filter(|j| filter.status.map_or(true, |s| j.status == s))
            .cloned()
            .collect();

        jobs.sort_by_key(|j| (Reverse(j.priority), j.created_at, j.id));

        Ok(jobs
            .into_iter()
            .skip(filter.offset.max(0) as usize)
            .take(filter.limit.max(0) as usize)
            .collect())
    }

    async fn claim_one(
        &self,
        worker_id: &str,
        allowed_types: &[JobType],
    ) -> Result<Option<Job>, CoreError> {
        let mut inner = self.lock();

        let candidate = inner
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Pending && allowed_types.contains(&j.job_type))
            .min_by_key(|j| (Reverse(j.priority), j.created_at, j.id))
            .map(|j| j.id);

        let Some(id) = candidate else {
            return Ok(None);
        };

        let now = Utc::now();
        let job = inner.jobs.get_mut(&id).expect("candidate exists");
        job.status = JobStatus::Processing;
        job.worker_id = Some(worker_id.to_string());
        job.started_at = Some(now);
        job.last_heartbeat_at = Some(now);
        job.progress = 0;
        job.updated_at = now;

        Ok(Some(job.clone()))
    }

    async fn update_progress(&self, id: i64, percent: i32) -> Result<(), CoreError> {
        let mut inner = self.lock();
        let job = inner
            .jobs
            .get_mut(&id)
            .ok_or_else(|| CoreError::NotFound(format!("job {id} not found")))?;

        if job.status != JobStatus::Processing {
            return Err(CoreError::Conflict(format!(
                "cannot record progress for job {id} in status {}",
                job.status
            )));
        }

        job.progress = job.progress.max(percent.clamp(0, 100));
        job.updated_at = Utc::now();

        Ok(())
    }

    async fn record_heartbeat(&self, id: i64) -> Result<(), CoreError> {
        let mut inner = self.lock();
        if let Some(job) = inner.jobs.get_mut(&id) {
            if job.status == JobStatus::Processing {
                let now = Utc::now();
                job.last_heartbeat_at = Some(now);
                job.updated_at = now;
            }
        }

        Ok(())
    }

    async fn complete(&self, id: i64, result: serde_json::Value) -> Result<Job, CoreError> {
        let mut inner = self.lock();
        let job = inner
            .jobs
            .get_mut(&id)
            .ok_or_else(|| CoreError::NotFound(format!("job {id} not found")))?;

        if job.status != JobStatus::Processing {
            return Err(CoreError::Conflict(format!(
                "cannot complete job {id} in status {}",
                job.status
            )));
        }

        let now = Utc::now();
        job.status = JobStatus::Completed;
        job.result = Some(result);
        job.progress = 100;
        job.completed_at = Some(now);
        job.worker_id = None;
        job.error = None;
        job.error_type = None;
        job.error_code = None;
        job.error_details = None;
        job.updated_at = now;

        Ok(job.clone())
    }

    async fn fail(&self, id: i64, error: &JobError) -> Result<Job, CoreError> {
        let mut inner = self.lock();
        let job = inner
            .jobs
            .get_mut(&id)
            .ok_or_else(|| CoreError::NotFound(format!("job {id} not found")))?;

        if job.status != JobStatus::Processing {
            return Err(CoreError::Conflict(format!(
                "cannot fail job {id} in status {}",
                job.status
            )));
        }

        let (next_status, next_retry_count) = PostgresJobStore::failure_transition(job, error);

        let now = Utc::now();
        job.status = next_status;
        job.retry_count = next_retry_count;
        job.last_failed_at = Some(now);
        job.worker_id = None;
        job.error = Some(error.message.clone());
        job.error_type = Some(error.error_type);
        job.error_code = Some(error.code.clone());
        job.error_details = error.details.clone();
        job.updated_at = now;

        Ok(job.clone())
    }

    async fn reopen_for_retry(&self, id: i64) -> Result<Job, CoreError> {
        let mut inner = self.lock();
        let job = inner
            .jobs
            .get_mut(&id)
            .ok_or_else(|| CoreError::NotFound(format!("job {id} not found")))?;

        if job.status != JobStatus::Failed {
            return Err(CoreError::Conflict(format!(
                "cannot reopen job {id} in status {}",
                job.status
            )));
        }

        job.status = JobStatus::Pending;
        job.worker_id = None;
        job.started_at = None;
        job.last_heartbeat_at = None;
        job.progress = 0;
        job.updated_at = Utc::now();

        Ok(job.clone())
    }

    async fn reopen_permanently_failed(&self, id: i64) -> Result<Job, CoreError> {
        let mut inner = self.lock();
        let job = inner
            .jobs
            .get_mut(&id)
            .ok_or_else(|| CoreError::NotFound(format!("job {id} not found")))?;

        if job.status != JobStatus::PermanentlyFailed {
            return Err(CoreError::Conflict(format!(
                "cannot revive job {id} in status {}",
                job.status
            )));
        }

        job.status = JobStatus::Pending;
        job.retry_count = 0;
        job.worker_id = None;
        job.started_at = None;
        job.last_heartbeat_at = None;
        job.progress = 0;
        job.updated_at = Utc::now();

        Ok(job.clone())
    }

    async fn release(&self, id: i64) -> Result<Job, CoreError> {
        let mut inner = self.lock();
        let job = inner
            .jobs
            .get_mut(&id)
            .ok_or_else(|| CoreError::NotFound(format!("job {id} not found")))?;

        if job.status != JobStatus::Processing {
            return Err(CoreError::Conflict(format!(
                "cannot release job {id} in status {}",
                job.status
            )));
        }

        job.status = JobStatus::Pending;
        job.worker_id = None;
        job.started_at = None;
        job.last_heartbeat_at = None;
        job.progress = 0;
        job.updated_at = Utc::now();

        Ok(job.clone())
    }

    async fn get_for_unique_key(
        &self,
        job_type: JobType,
        key: &str,
    ) -> Result<Option<Job>, CoreError> {
        let inner = self.lock();
        let job = inner
            .jobs
            .values()
            .filter(|j| {
                j.job_type == job_type && j.unique_key.as_deref() == Some(key) && !j.is_terminal()
            })
            .max_by_key(|j| (j.created_at, j.id))
            .cloned();

        Ok(job)
    }

    async fn get_latest_for_target(
        &self,
        job_type: JobType,
        key: &str,
    ) -> Result<Option<Job>, CoreError> {
        let inner = self.lock();
        let job = inner
            .jobs
            .values()
            .filter(|j| j.job_type == job_type && j.unique_key.as_deref() == Some(key))
            .max_by_key(|j| (j.created_at, j.id))
            .cloned();

        Ok(job)
    }

    async fn delete(&self, id: i64) -> Result<(), CoreError> {
        let mut inner = self.lock();
        inner
            .jobs
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| CoreError::NotFound(format!("job {id} not found")))
    }

    async fn reap_stalled(&self, deadline: DateTime<Utc>) -> Result<Vec<Job>, CoreError> {
        let stalled_ids: Vec<i64> = {
            let inner = self.lock();
            inner
                .jobs
                .values()
                .filter(|j| {
                    j.status == JobStatus::Processing
                        && j.last_heartbeat_at.is_some_and(|hb| hb < deadline)
                })
                .map(|j| j.id)
                .collect()
        };

        let stalled_error = JobError::stalled();
        let mut reaped = Vec::with_capacity(stalled_ids.len());
        for id in stalled_ids {
            match self.fail(id, &stalled_error).await {
                Ok(job) => reaped.push(job),
                Err(CoreError::Conflict(_)) | Err(CoreError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }

        Ok(reaped)
    }

    async fn list_failed(&self, limit: i64) -> Result<Vec<Job>, CoreError> {
        let inner = self.lock();
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Failed)
            .cloned()
            .collect();

        jobs.sort_by_key(|j| j.last_failed_at);
        jobs.truncate(limit.max(0) as usize);

        Ok(jobs)
    }
}
