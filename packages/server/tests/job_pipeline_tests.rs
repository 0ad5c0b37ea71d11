//! End-to-end tests for the queue, worker pool, retry scheduler, and stall
//! reaper over the in-memory store.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use server_core::kernel::jobs::{
    InMemoryJobStore, Job, JobError, JobProcessor, JobService, JobStatus, JobStore, JobType,
    NewJob, ProcessContext, ProcessorRegistry, RetryPolicy, WorkerPool, WorkerPoolConfig,
    WorkerPoolHandle,
};

const WAVEFORM_TYPES: &[JobType] = &[JobType::WaveformGeneration];

/// Processor whose attempts are scripted: the first `failures` calls return
/// the given error, later calls succeed.
struct ScriptedProcessor {
    failures: usize,
    error: JobError,
    calls: AtomicUsize,
}

impl ScriptedProcessor {
    fn failing_then_ok(failures: usize, error: JobError) -> Self {
        Self {
            failures,
            error,
            calls: AtomicUsize::new(0),
        }
    }

    fn always_ok() -> Self {
        Self::failing_then_ok(0, JobError::system("unused", "unused"))
    }
}

#[async_trait]
impl JobProcessor for ScriptedProcessor {
    fn job_type(&self) -> JobType {
        JobType::WaveformGeneration
    }

    async fn process(&self, ctx: &ProcessContext, _job: &Job) -> Result<serde_json::Value, JobError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        ctx.report_progress(0).await;
        if call < self.failures {
            return Err(self.error.clone());
        }
        ctx.report_progress(50).await;
        ctx.report_progress(100).await;
        Ok(json!({ "attempt": call + 1 }))
    }
}

/// Processor that never finishes on its own; used to exercise cancellation.
struct StuckProcessor;

#[async_trait]
impl JobProcessor for StuckProcessor {
    fn job_type(&self) -> JobType {
        JobType::WaveformGeneration
    }

    async fn process(&self, _ctx: &ProcessContext, _job: &Job) -> Result<serde_json::Value, JobError> {
        tokio::time::sleep(Duration::from_secs(600)).await;
        Ok(json!({}))
    }
}

struct Pipeline {
    store: Arc<InMemoryJobStore>,
    jobs: Arc<JobService>,
    handle: WorkerPoolHandle,
}

fn start_pipeline(processor: Arc<dyn JobProcessor>) -> Pipeline {
    let store = Arc::new(InMemoryJobStore::new());
    let jobs = Arc::new(JobService::with_retry_policy(
        store.clone() as Arc<dyn JobStore>,
        RetryPolicy {
            min_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
        },
    ));

    let mut registry = ProcessorRegistry::new();
    registry.register(processor);

    let pool = WorkerPool::with_config(
        jobs.clone(),
        Arc::new(registry),
        WorkerPoolConfig {
            workers: 2,
            poll_interval: Duration::from_millis(10),
            heartbeat_interval: Duration::from_millis(30),
            stall_multiplier: 3,
            retry_scan_interval: Duration::from_millis(20),
            shutdown_grace: Duration::from_secs(2),
            ..WorkerPoolConfig::default()
        },
    );
    let handle = pool.start();

    Pipeline { store, jobs, handle }
}

async fn wait_for_status(store: &InMemoryJobStore, id: i64, status: JobStatus) -> Job {
    for _ in 0..200 {
        let job = store.get(id).await.unwrap();
        if job.status == status {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!(
        "job {id} never reached {status:?}; last state: {:?}",
        store.get(id).await.unwrap().status
    );
}

#[tokio::test]
async fn successful_job_runs_to_completion() {
    let pipeline = start_pipeline(Arc::new(ScriptedProcessor::always_ok()));

    let job = pipeline
        .jobs
        .enqueue_unique(
            JobType::WaveformGeneration,
            json!({ "episode_id": 42 }),
            "episode_id",
        )
        .await
        .unwrap();

    let done = wait_for_status(&pipeline.store, job.id, JobStatus::Completed).await;
    assert_eq!(done.progress, 100);
    assert_eq!(done.result.as_ref().unwrap()["attempt"], 1);
    assert!(done.worker_id.is_none());
    assert!(done.completed_at.is_some());

    pipeline.handle.shutdown().await;
}

#[tokio::test]
async fn failed_job_is_retried_after_backoff_and_completes() {
    let pipeline = start_pipeline(Arc::new(ScriptedProcessor::failing_then_ok(
        1,
        JobError::download("http_500", "flaky source"),
    )));

    let job = pipeline
        .jobs
        .enqueue_unique(
            JobType::WaveformGeneration,
            json!({ "episode_id": 42 }),
            "episode_id",
        )
        .await
        .unwrap();

    let done = wait_for_status(&pipeline.store, job.id, JobStatus::Completed).await;
    assert_eq!(done.retry_count, 1);
    assert_eq!(done.result.as_ref().unwrap()["attempt"], 2);

    pipeline.handle.shutdown().await;
}

#[tokio::test]
async fn not_found_failure_is_permanent_and_never_retried() {
    let processor = Arc::new(ScriptedProcessor::failing_then_ok(
        usize::MAX,
        JobError::not_found("http_404", "enclosure gone"),
    ));
    let pipeline = start_pipeline(processor.clone());

    let job = pipeline
        .jobs
        .enqueue_unique(
            JobType::WaveformGeneration,
            json!({ "episode_id": 42 }),
            "episode_id",
        )
        .await
        .unwrap();

    let dead = wait_for_status(&pipeline.store, job.id, JobStatus::PermanentlyFailed).await;
    assert_eq!(dead.retry_count, 1);
    assert_eq!(dead.error_type, Some(server_core::kernel::jobs::ErrorType::NotFound));

    // Give the retry scheduler time to (incorrectly) resurrect it.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        pipeline.store.get(job.id).await.unwrap().status,
        JobStatus::PermanentlyFailed
    );
    assert_eq!(processor.calls.load(Ordering::SeqCst), 1);

    pipeline.handle.shutdown().await;
}

#[tokio::test]
async fn retries_exhaust_into_permanent_failure() {
    let pipeline = start_pipeline(Arc::new(ScriptedProcessor::failing_then_ok(
        usize::MAX,
        JobError::processing("transcoder_exit", "always broken"),
    )));

    let job = pipeline
        .store
        .create(
            NewJob::builder()
                .job_type(JobType::WaveformGeneration)
                .payload(json!({ "episode_id": 42 }))
                .unique_key(Some("42".to_string()))
                .max_retries(1)
                .build(),
        )
        .await
        .unwrap();

    let dead = wait_for_status(&pipeline.store, job.id, JobStatus::PermanentlyFailed).await;
    assert_eq!(dead.retry_count, 1);

    pipeline.handle.shutdown().await;
}

#[tokio::test]
async fn shutdown_releases_in_flight_job_without_burning_a_retry() {
    let pipeline = start_pipeline(Arc::new(StuckProcessor));

    let job = pipeline
        .jobs
        .enqueue_unique(
            JobType::WaveformGeneration,
            json!({ "episode_id": 42 }),
            "episode_id",
        )
        .await
        .unwrap();

    wait_for_status(&pipeline.store, job.id, JobStatus::Processing).await;
    pipeline.handle.shutdown().await;

    let released = pipeline.store.get(job.id).await.unwrap();
    assert_eq!(released.status, JobStatus::Pending);
    assert_eq!(released.retry_count, 0);
    assert!(released.worker_id.is_none());
}

#[tokio::test]
async fn stalled_job_is_reaped_and_eventually_completes() {
    // Simulate a worker that died mid-job: claim the job and age its
    // heartbeat past the stall threshold before the pool starts.
    let store = Arc::new(InMemoryJobStore::new());
    let jobs = Arc::new(JobService::with_retry_policy(
        store.clone() as Arc<dyn JobStore>,
        RetryPolicy {
            min_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
        },
    ));

    let job = store
        .create(
            NewJob::builder()
                .job_type(JobType::WaveformGeneration)
                .payload(json!({ "episode_id": 42 }))
                .unique_key(Some("42".to_string()))
                .build(),
        )
        .await
        .unwrap();
    let claimed = store
        .claim_one("dead-worker", WAVEFORM_TYPES)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claimed.id, job.id);
    store.set_last_heartbeat_at(job.id, chrono::Utc::now() - chrono::Duration::minutes(10));

    let mut registry = ProcessorRegistry::new();
    registry.register(Arc::new(ScriptedProcessor::always_ok()));
    let handle = WorkerPool::with_config(
        jobs,
        Arc::new(registry),
        WorkerPoolConfig {
            workers: 2,
            poll_interval: Duration::from_millis(10),
            heartbeat_interval: Duration::from_millis(30),
            stall_multiplier: 3,
            retry_scan_interval: Duration::from_millis(20),
            shutdown_grace: Duration::from_secs(2),
            ..WorkerPoolConfig::default()
        },
    )
    .start();

    // Reaper fails it as system/stalled, scheduler reopens it, a live worker
    // finishes the attempt.
    let done = wait_for_status(&store, job.id, JobStatus::Completed).await;
    assert_eq!(done.retry_count, 1);

    handle.shutdown().await;
}

#[tokio::test]
async fn per_job_deadline_fails_overrunning_attempts() {
    let store = Arc::new(InMemoryJobStore::new());
    let jobs = Arc::new(JobService::with_retry_policy(
        store.clone() as Arc<dyn JobStore>,
        RetryPolicy {
            min_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
        },
    ));

    let job = store
        .create(
            NewJob::builder()
                .job_type(JobType::WaveformGeneration)
                .payload(json!({ "episode_id": 42 }))
                .unique_key(Some("42".to_string()))
                .max_retries(1)
                .build(),
        )
        .await
        .unwrap();

    let mut registry = ProcessorRegistry::new();
    registry.register(Arc::new(StuckProcessor));
    let handle = WorkerPool::with_config(
        jobs,
        Arc::new(registry),
        WorkerPoolConfig {
            workers: 1,
            poll_interval: Duration::from_millis(10),
            heartbeat_interval: Duration::from_millis(30),
            retry_scan_interval: Duration::from_millis(20),
            shutdown_grace: Duration::from_secs(2),
            job_timeout: Some(Duration::from_millis(50)),
            ..WorkerPoolConfig::default()
        },
    )
    .start();

    let dead = wait_for_status(&store, job.id, JobStatus::PermanentlyFailed).await;
    assert_eq!(dead.error_code.as_deref(), Some("timeout"));
    assert_eq!(dead.retry_count, 1);

    handle.shutdown().await;
}

#[tokio::test]
async fn concurrent_claims_never_hand_out_the_same_job() {
    let store = Arc::new(InMemoryJobStore::new());

    for episode in 1..=10 {
        store
            .create(
                NewJob::builder()
                    .job_type(JobType::WaveformGeneration)
                    .payload(json!({ "episode_id": episode }))
                    .unique_key(Some(episode.to_string()))
                    .build(),
            )
            .await
            .unwrap();
    }

    let mut handles = Vec::new();
    for n in 0..50 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store
                .claim_one(&format!("worker-{n}"), WAVEFORM_TYPES)
                .await
                .unwrap()
        }));
    }

    let mut claimed_ids = Vec::new();
    for handle in handles {
        if let Some(job) = handle.await.unwrap() {
            claimed_ids.push(job.id);
        }
    }

    claimed_ids.sort_unstable();
    let before_dedup = claimed_ids.len();
    claimed_ids.dedup();
    assert_eq!(before_dedup, claimed_ids.len(), "a job was claimed twice");
    assert_eq!(claimed_ids.len(), 10);
}

#[tokio::test]
async fn concurrent_unique_enqueues_create_one_job() {
    let store = Arc::new(InMemoryJobStore::new());
    let jobs = Arc::new(JobService::new(store.clone() as Arc<dyn JobStore>));

    let mut handles = Vec::new();
    for _ in 0..50 {
        let jobs = jobs.clone();
        handles.push(tokio::spawn(async move {
            jobs.enqueue_unique(
                JobType::WaveformGeneration,
                json!({ "episode_id": 7 }),
                "episode_id",
            )
            .await
            .unwrap()
        }));
    }

    let mut ids = Vec::new();
    for handle in handles {
        ids.push(handle.await.unwrap().id);
    }

    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 1, "all callers must observe the same job");
    assert_eq!(store.all_jobs().len(), 1);
}

#[tokio::test]
async fn higher_priority_jobs_are_dispatched_first() {
    let store = Arc::new(InMemoryJobStore::new());

    let normal = store
        .create(
            NewJob::builder()
                .job_type(JobType::WaveformGeneration)
                .payload(json!({ "episode_id": 1 }))
                .unique_key(Some("1".to_string()))
                .build(),
        )
        .await
        .unwrap();
    let urgent = store
        .create(
            NewJob::builder()
                .job_type(JobType::WaveformGeneration)
                .payload(json!({ "episode_id": 2 }))
                .unique_key(Some("2".to_string()))
                .priority(5)
                .build(),
        )
        .await
        .unwrap();

    let first = store.claim_one("w", WAVEFORM_TYPES).await.unwrap().unwrap();
    let second = store.claim_one("w", WAVEFORM_TYPES).await.unwrap().unwrap();

    assert_eq!(first.id, urgent.id);
    assert_eq!(second.id, normal.id);
}

#[tokio::test]
async fn unregistered_job_type_fails_as_system_error() {
    // A pool whose registry only carries waveforms, with a podcast_sync job
    // already queued; claim it manually to exercise the miss path the way a
    // mixed fleet would.
    let store = Arc::new(InMemoryJobStore::new());
    let jobs = Arc::new(JobService::new(store.clone() as Arc<dyn JobStore>));

    let job = jobs
        .enqueue_unique(
            JobType::PodcastSync,
            json!({ "feed_id": 9000 }),
            "feed_id",
        )
        .await
        .unwrap();

    // No processor for podcast_sync: the worker loop never claims it, and a
    // direct claim plus registry miss records a retryable system failure.
    let registry = ProcessorRegistry::new();
    assert!(!registry.can_process(JobType::PodcastSync));

    store.claim_one("w", &[JobType::PodcastSync]).await.unwrap();
    let failed = store
        .fail(
            job.id,
            &JobError::system("unregistered_type", "no processor registered for podcast_sync"),
        )
        .await
        .unwrap();

    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.error_code.as_deref(), Some("unregistered_type"));
}
