use std::env;
use std::str::FromStr;

use anyhow::{Context, Result};
use dotenvy::dotenv;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    /// Number of concurrent workers in the job pool.
    pub worker_count: usize,
    /// How long an idle worker sleeps between claim attempts (milliseconds).
    pub poll_interval_ms: u64,
    /// Base delay before the first automatic retry of a failed job (seconds).
    pub min_retry_delay_secs: u64,
    /// Upper bound on the exponential retry backoff (seconds).
    pub max_retry_delay_secs: u64,
    /// Heartbeat cadence for in-flight jobs (seconds).
    pub heartbeat_interval_secs: u64,
    /// A processing job is considered stalled after this many missed heartbeats.
    pub stall_multiplier: u32,
    /// How long shutdown waits for in-flight jobs before aborting them (seconds).
    pub shutdown_grace_secs: u64,
    /// Optional hard deadline per job attempt (seconds); unset means none.
    pub job_timeout_secs: Option<u64>,
    /// External transcoder binary that turns audio into a peaks document.
    pub transcoder_bin: String,
    /// Base URL of the podcast-index API used to resolve episode enclosures.
    pub podcast_index_base_url: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            port: env_or("PORT", 8080)?,
            worker_count: env_or("WORKER_COUNT", 4)?,
            poll_interval_ms: env_or("POLL_INTERVAL_MS", 100)?,
            min_retry_delay_secs: env_or("MIN_RETRY_DELAY_SECS", 30)?,
            max_retry_delay_secs: env_or("MAX_RETRY_DELAY_SECS", 3600)?,
            heartbeat_interval_secs: env_or("HEARTBEAT_INTERVAL_SECS", 10)?,
            stall_multiplier: env_or("STALL_MULTIPLIER", 3)?,
            shutdown_grace_secs: env_or("SHUTDOWN_GRACE_SECS", 30)?,
            job_timeout_secs: match env::var("JOB_TIMEOUT_SECS") {
                Ok(raw) => Some(raw.parse().context("JOB_TIMEOUT_SECS must be a valid number")?),
                Err(_) => None,
            },
            transcoder_bin: env::var("TRANSCODER_BIN")
                .unwrap_or_else(|_| "audiowaveform".to_string()),
            podcast_index_base_url: env::var("PODCAST_INDEX_BASE_URL")
                .unwrap_or_else(|_| "https://api.podcastindex.org/api/1.0".to_string()),
        })
    }
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("{key} must be a valid number")),
        Err(_) => Ok(default),
    }
}
