//! Waveform persistence.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;

use super::model::{NewWaveform, Waveform};
use crate::common::CoreError;
use crate::kernel::ArtifactStore;

/// Waveform repository. One row per episode, replaced on regeneration.
#[async_trait]
pub trait WaveformStore: Send + Sync {
    async fn find_by_episode(&self, episode_id: i64) -> Result<Option<Waveform>, CoreError>;

    async fn upsert(&self, spec: NewWaveform) -> Result<Waveform, CoreError>;

    async fn delete_by_episode(&self, episode_id: i64) -> Result<bool, CoreError>;
}

// The coordinator sees any waveform store as an opaque artifact repository.
//
// This wraps the trait object in a concrete newtype rather than
// blanket-impling `ArtifactStore` directly for `Arc<dyn WaveformStore>`:
// going through the generic `ArtifactCoordinator<S>` with `S` bound to a
// bare trait object makes rustc's higher-ranked trait-bound check demand
// `ArtifactStore` hold for every lifetime `'0` of `dyn WaveformStore + '0`,
// which it rejects as "not general enough" since the impl only covers
// `'static`. Pinning `S` to a concrete, non-dyn type sidesteps that check.
pub struct DynWaveformStore(pub Arc<dyn WaveformStore>);

#[async_trait]
impl ArtifactStore for DynWaveformStore {
    type Artifact = Waveform;

    async fn find_by_episode(&self, episode_id: i64) -> Result<Option<Waveform>, CoreError> {
        WaveformStore::find_by_episode(self.0.as_ref(), episode_id).await
    }
}

// ============================================================================
// Postgres implementation
// ============================================================================

pub struct PostgresWaveformStore {
    pool: PgPool,
}

impl PostgresWaveformStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WaveformStore for PostgresWaveformStore {
    async fn find_by_episode(&self, episode_id: i64) -> Result<Option<Waveform>, CoreError> {
        let waveform = sqlx::query_as::<_, Waveform>(
            r#"
            SELECT id, episode_id, duration_secs, sample_rate, peaks, created_at, updated_at
            FROM waveforms
            WHERE episode_id = $1
            "#,
        )
        .bind(episode_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(waveform)
    }

    async fn upsert(&self, spec: NewWaveform) -> Result<Waveform, CoreError> {
        let waveform = sqlx::query_as::<_, Waveform>(
            r#"
            INSERT INTO waveforms (episode_id, duration_secs, sample_rate, peaks)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (episode_id) DO UPDATE SET
                duration_secs = EXCLUDED.duration_secs,
                sample_rate = EXCLUDED.sample_rate,
                peaks = EXCLUDED.peaks,
                updated_at = NOW()
            RETURNING id, episode_id, duration_secs, sample_rate, peaks, created_at, updated_at
            "#,
        )
        .bind(spec.episode_id)
        .bind(spec.duration_secs)
        .bind(spec.sample_rate)
        .bind(sqlx::types::Json(&spec.peaks))
        .fetch_one(&self.pool)
        .await?;

        Ok(waveform)
    }

    async fn delete_by_episode(&self, episode_id: i64) -> Result<bool, CoreError> {
        let result = sqlx::query("DELETE FROM waveforms WHERE episode_id = $1")
            .bind(episode_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

// ============================================================================
// In-memory implementation (tests)
// ============================================================================

#[derive(Default)]
pub struct InMemoryWaveformStore {
    next_id: AtomicI64,
    waveforms: Mutex<HashMap<i64, Waveform>>,
}

impl InMemoryWaveformStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WaveformStore for InMemoryWaveformStore {
    async fn find_by_episode(&self, episode_id: i64) -> Result<Option<Waveform>, CoreError> {
        Ok(self
            .waveforms
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&episode_id)
            .cloned())
    }

    async fn upsert(&self, spec: NewWaveform) -> Result<Waveform, CoreError> {
        let mut waveforms = self.waveforms.lock().unwrap_or_else(|e| e.into_inner());
        let now = Utc::now();

        let waveform = match waveforms.get(&spec.episode_id) {
            Some(existing) => Waveform {
                duration_secs: spec.duration_secs,
                sample_rate: spec.sample_rate,
                peaks: spec.peaks,
                updated_at: now,
                ..existing.clone()
            },
            None => Waveform {
                id: self.next_id.fetch_add(1, Ordering::SeqCst) + 1,
                episode_id: spec.episode_id,
                duration_secs: spec.duration_secs,
                sample_rate: spec.sample_rate,
                peaks: spec.peaks,
                created_at: now,
                updated_at: now,
            },
        };

        waveforms.insert(spec.episode_id, waveform.clone());
        Ok(waveform)
    }

    async fn delete_by_episode(&self, episode_id: i64) -> Result<bool, CoreError> {
        Ok(self
            .waveforms
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&episode_id)
            .is_some())
    }
}
