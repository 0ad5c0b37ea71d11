//! Worker pool for processing queued jobs.
//!
//! The pool runs `N` independent worker loops against the shared job store,
//! plus two background tasks:
//! - a **retry scheduler** that reopens failed jobs once their exponential
//!   backoff has elapsed, and
//! - a **stall reaper** that fails `processing` jobs whose heartbeat has
//!   expired (crashed or partitioned workers).
//!
//! # Architecture
//!
//! ```text
//! WorkerPool
//!     │
//!     ├─► worker loop × N: claim_one ─► processor.process (heartbeat task
//!     │       alongside) ─► complete / fail / release
//!     ├─► retry scheduler: due_retries ─► reopen_for_retry
//!     └─► stall reaper: reap_stalled(now − k·heartbeat_interval)
//! ```
//!
//! There is no in-memory queue: the store is the coordination point, and
//! `claim_one` is atomic, so multiple pool instances can share one database
//! without duplicating work.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::job::{Job, JobError, JobStatus};
use super::registry::{ProcessContext, ProcessorRegistry};
use super::service::JobService;

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of concurrent worker loops.
    pub workers: usize,
    /// How long an idle worker sleeps between claim attempts.
    pub poll_interval: Duration,
    /// Heartbeat cadence for in-flight jobs.
    pub heartbeat_interval: Duration,
    /// A processing job is stalled after this many missed heartbeats.
    pub stall_multiplier: u32,
    /// How often the retry scheduler scans for due retries.
    pub retry_scan_interval: Duration,
    /// How long shutdown waits for in-flight jobs before aborting them.
    pub shutdown_grace: Duration,
    /// Optional hard deadline per attempt; an attempt that outlives it is
    /// cancelled and failed as a retryable `system` timeout.
    pub job_timeout: Option<Duration>,
    /// Base identifier for this pool instance.
    pub worker_id: String,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            poll_interval: Duration::from_millis(100),
            heartbeat_interval: Duration::from_secs(10),
            stall_multiplier: 3,
            retry_scan_interval: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(30),
            job_timeout: None,
            worker_id: format!("worker-{}", Uuid::new_v4()),
        }
    }
}

impl WorkerPoolConfig {
    /// Create a new config with a specific worker ID.
    pub fn with_worker_id(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..Default::default()
        }
    }
}

/// Pool of workers processing jobs from the shared store.
pub struct WorkerPool {
    service: Arc<JobService>,
    registry: Arc<ProcessorRegistry>,
    config: WorkerPoolConfig,
}

impl WorkerPool {
    pub fn new(service: Arc<JobService>, registry: Arc<ProcessorRegistry>) -> Self {
        Self {
            service,
            registry,
            config: WorkerPoolConfig::default(),
        }
    }

    pub fn with_config(
        service: Arc<JobService>,
        registry: Arc<ProcessorRegistry>,
        config: WorkerPoolConfig,
    ) -> Self {
        Self {
            service,
            registry,
            config,
        }
    }

    /// Spawn the worker loops and background tasks.
    pub fn start(self) -> WorkerPoolHandle {
        let shutdown = CancellationToken::new();
        let mut tasks = Vec::with_capacity(self.config.workers + 2);

        info!(
            worker_id = %self.config.worker_id,
            workers = self.config.workers,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "worker pool starting"
        );

        for n in 0..self.config.workers {
            let worker = Worker {
                id: format!("{}-{}", self.config.worker_id, n),
                service: self.service.clone(),
                registry: self.registry.clone(),
                config: self.config.clone(),
                shutdown: shutdown.clone(),
            };
            tasks.push(tokio::spawn(worker.run()));
        }

        tasks.push(tokio::spawn(run_retry_scheduler(
            self.service.clone(),
            self.config.retry_scan_interval,
            shutdown.clone(),
        )));
        tasks.push(tokio::spawn(run_stall_reaper(
            self.service.clone(),
            self.config.heartbeat_interval,
            self.config.stall_multiplier,
            shutdown.clone(),
        )));

        WorkerPoolHandle {
            shutdown,
            tasks,
            grace: self.config.shutdown_grace,
        }
    }
}

/// Handle for stopping a running pool.
pub struct WorkerPoolHandle {
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    grace: Duration,
}

impl WorkerPoolHandle {
    /// Token cancelled when shutdown begins; in-flight processors observe it
    /// through their `ProcessContext`.
    pub fn cancellation(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop claiming, cancel in-flight jobs, and wait up to the configured
    /// grace period for the loops to drain.
    pub async fn shutdown(self) {
        self.shutdown.cancel();

        let deadline = tokio::time::Instant::now() + self.grace;
        for mut task in self.tasks {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if tokio::time::timeout(remaining, &mut task).await.is_err() {
                task.abort();
            }
        }

        info!("worker pool stopped");
    }
}

// ============================================================================
// Worker loop
// ============================================================================

struct Worker {
    id: String,
    service: Arc<JobService>,
    registry: Arc<ProcessorRegistry>,
    config: WorkerPoolConfig,
    shutdown: CancellationToken,
}

impl Worker {
    async fn run(self) {
        let allowed_types = self.registry.supported_types();
        info!(worker_id = %self.id, ?allowed_types, "worker started");

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            match self.service.claim_one(&self.id, &allowed_types).await {
                Ok(Some(job)) => self.process_claimed(job).await,
                Ok(None) => {
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(jittered(self.config.poll_interval)) => {}
                    }
                }
                Err(e) => {
                    error!(worker_id = %self.id, error = %e, "failed to claim job");
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                }
            }
        }

        info!(worker_id = %self.id, "worker stopped");
    }

    async fn process_claimed(&self, job: Job) {
        let job_id = job.id;
        let job_type = job.job_type;
        let started = std::time::Instant::now();

        info!(
            worker_id = %self.id,
            job_id,
            job_type = %job_type,
            attempt = job.retry_count + 1,
            "claimed job"
        );

        let Some(processor) = self.registry.get(job_type) else {
            // Claimed types come from the registry, so this only happens when
            // another pool instance enqueues a type we do not carry yet.
            let err = JobError::system(
                "unregistered_type",
                format!("no processor registered for {job_type}"),
            );
            if let Err(e) = self.service.fail(job_id, &err).await {
                error!(job_id, error = %e, "failed to mark job as failed");
            }
            return;
        };

        let job_cancel = self.shutdown.child_token();
        let ctx = ProcessContext::new(job_id, self.id.clone(), job_cancel.clone(), self.service.clone());

        // Heartbeat task keeps the stall reaper off our back while the
        // processor runs.
        let heartbeat_cancel = job_cancel.child_token();
        let heartbeat_service = self.service.clone();
        let heartbeat_interval = self.config.heartbeat_interval;
        let heartbeat = tokio::spawn(async move {
            let mut interval = tokio::time::interval(heartbeat_interval);
            interval.tick().await; // Skip first immediate tick

            loop {
                tokio::select! {
                    _ = heartbeat_cancel.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = heartbeat_service.record_heartbeat(job_id).await {
                            warn!(job_id, error = %e, "heartbeat failed");
                        }
                    }
                }
            }
        });

        let outcome = match self.config.job_timeout {
            Some(limit) => tokio::select! {
                result = processor.process(&ctx, &job) => Some(result),
                _ = job_cancel.cancelled() => None,
                _ = tokio::time::sleep(limit) => {
                    job_cancel.cancel();
                    Some(Err(JobError::system(
                        "timeout",
                        format!("attempt exceeded the {}s deadline", limit.as_secs()),
                    )))
                }
            },
            None => tokio::select! {
                result = processor.process(&ctx, &job) => Some(result),
                _ = job_cancel.cancelled() => None,
            },
        };

        job_cancel.cancel();
        let _ = heartbeat.await;

        match outcome {
            Some(Ok(result)) => match self.service.complete(job_id, result).await {
                Ok(_) => info!(
                    worker_id = %self.id,
                    job_id,
                    job_type = %job_type,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "job completed"
                ),
                Err(e) => error!(job_id, error = %e, "failed to mark job as completed"),
            },
            Some(Err(job_err)) if !self.shutdown.is_cancelled() => {
                match self.service.fail(job_id, &job_err).await {
                    Ok(updated) => {
                        let will_retry = updated.status == JobStatus::Failed;
                        warn!(
                            worker_id = %self.id,
                            job_id,
                            job_type = %job_type,
                            error = %job_err,
                            error_type = ?job_err.error_type,
                            retry_count = updated.retry_count,
                            will_retry,
                            "job failed"
                        );
                    }
                    Err(e) => error!(job_id, error = %e, "failed to mark job as failed"),
                }
            }
            // Shutdown raced the processor: put the job back untouched so
            // another worker can pick it up. Cancellation never counts
            // against the retry budget.
            _ => match self.service.release(job_id).await {
                Ok(_) => info!(worker_id = %self.id, job_id, "job cancelled, released for re-claim"),
                Err(e) => error!(job_id, error = %e, "failed to release cancelled job"),
            },
        }
    }
}

/// Poll interval with up to 50% random jitter, so idle workers do not
/// hammer the store in lockstep.
fn jittered(interval: Duration) -> Duration {
    let base_ms = interval.as_millis() as u64;
    if base_ms < 2 {
        return interval;
    }
    let extra = rand::thread_rng().gen_range(0..=base_ms / 2);
    interval + Duration::from_millis(extra)
}

// ============================================================================
// Background tasks
// ============================================================================

async fn run_retry_scheduler(
    service: Arc<JobService>,
    scan_interval: Duration,
    shutdown: CancellationToken,
) {
    debug!(scan_interval_ms = scan_interval.as_millis() as u64, "retry scheduler started");
    let mut interval = tokio::time::interval(scan_interval);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {
                let due = match service.due_retries(100).await {
                    Ok(due) => due,
                    Err(e) => {
                        warn!(error = %e, "retry scheduler scan failed");
                        continue;
                    }
                };

                for job in due {
                    match service.reopen_for_retry(job.id).await {
                        Ok(_) => {}
                        // Another scheduler instance or a manual retry got
                        // there first.
                        Err(crate::common::CoreError::Conflict(_)) => {}
                        Err(e) => warn!(job_id = job.id, error = %e, "failed to reopen job"),
                    }
                }
            }
        }
    }

    debug!("retry scheduler stopped");
}

async fn run_stall_reaper(
    service: Arc<JobService>,
    heartbeat_interval: Duration,
    stall_multiplier: u32,
    shutdown: CancellationToken,
) {
    let threshold = heartbeat_interval * stall_multiplier.max(1);
    debug!(threshold_ms = threshold.as_millis() as u64, "stall reaper started");
    let mut interval = tokio::time::interval(heartbeat_interval.max(Duration::from_millis(10)));

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {
                let deadline = chrono::Utc::now()
                    - chrono::Duration::from_std(threshold)
                        .unwrap_or_else(|_| chrono::Duration::seconds(60));

                match service.reap_stalled(deadline).await {
                    Ok(reaped) => {
                        for job in &reaped {
                            warn!(
                                job_id = job.id,
                                job_type = %job.job_type,
                                status = %job.status,
                                "reaped stalled job"
                            );
                        }
                    }
                    Err(e) => warn!(error = %e, "stall reaper scan failed"),
                }
            }
        }
    }

    debug!("stall reaper stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = WorkerPoolConfig::default();
        assert_eq!(config.workers, 4);
        assert_eq!(config.poll_interval, Duration::from_millis(100));
        assert!(config.stall_multiplier >= 3);
        assert!(config.worker_id.starts_with("worker-"));
    }

    #[test]
    fn config_with_worker_id() {
        let config = WorkerPoolConfig::with_worker_id("my-worker");
        assert_eq!(config.worker_id, "my-worker");
    }

    #[test]
    fn jitter_stays_within_half_interval() {
        let base = Duration::from_millis(100);
        for _ in 0..50 {
            let j = jittered(base);
            assert!(j >= base);
            assert!(j <= base + Duration::from_millis(50));
        }
    }
}
