//! Processor registry: maps job types to the code that executes them.
//!
//! Each artifact domain registers one processor at startup; the registry is
//! read-only afterwards. A claimed job whose type has no processor is failed
//! as a `system` error so it retries once the missing processor is deployed.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::job::{Job, JobError, JobType};
use super::service::JobService;

/// Execution context handed to a processor for one attempt.
///
/// Carries the cancellation token derived from the worker's shutdown signal
/// and a progress reporter that writes through the job service.
pub struct ProcessContext {
    job_id: i64,
    worker_id: String,
    cancel: CancellationToken,
    jobs: Arc<JobService>,
}

impl ProcessContext {
    pub fn new(
        job_id: i64,
        worker_id: impl Into<String>,
        cancel: CancellationToken,
        jobs: Arc<JobService>,
    ) -> Self {
        Self {
            job_id,
            worker_id: worker_id.into(),
            cancel,
            jobs,
        }
    }

    pub fn job_id(&self) -> i64 {
        self.job_id
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Record progress for this attempt. Failures are logged, not fatal:
    /// losing a progress update must not fail the job itself.
    pub async fn report_progress(&self, percent: i32) {
        if let Err(e) = self.jobs.update_progress(self.job_id, percent).await {
            warn!(job_id = self.job_id, error = %e, "failed to record progress");
        }
    }
}

/// A unit of executable work for one job type.
#[async_trait]
pub trait JobProcessor: Send + Sync {
    /// The single job type this processor handles.
    fn job_type(&self) -> JobType;

    /// Execute one attempt.
    ///
    /// Returns the job result on success. Errors carry their own
    /// classification; processors are expected to report progress at least
    /// at 0, ~50, and 100, and to return promptly once the context is
    /// cancelled.
    async fn process(&self, ctx: &ProcessContext, job: &Job) -> Result<serde_json::Value, JobError>;
}

/// Registry populated at startup, read-only afterwards.
#[derive(Default)]
pub struct ProcessorRegistry {
    processors: HashMap<JobType, Arc<dyn JobProcessor>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a processor. The last registration for a type wins.
    pub fn register(&mut self, processor: Arc<dyn JobProcessor>) {
        self.processors.insert(processor.job_type(), processor);
    }

    pub fn get(&self, job_type: JobType) -> Option<Arc<dyn JobProcessor>> {
        self.processors.get(&job_type).cloned()
    }

    pub fn can_process(&self, job_type: JobType) -> bool {
        self.processors.contains_key(&job_type)
    }

    /// Job types the worker pool should claim.
    pub fn supported_types(&self) -> Vec<JobType> {
        self.processors.keys().copied().collect()
    }
}
