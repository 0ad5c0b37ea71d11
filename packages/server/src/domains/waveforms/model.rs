//! Waveform model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use typed_builder::TypedBuilder;

/// A stored waveform: normalized amplitude peaks for one episode.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct Waveform {
    pub id: i64,
    /// Episode identifier from the podcast-index ecosystem.
    pub episode_id: i64,
    pub duration_secs: i32,
    pub sample_rate: i32,
    #[sqlx(json)]
    pub peaks: Vec<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Insertion spec for a freshly generated waveform.
#[derive(Debug, Clone, TypedBuilder)]
pub struct NewWaveform {
    pub episode_id: i64,
    pub duration_secs: i32,
    pub sample_rate: i32,
    pub peaks: Vec<f64>,
}
