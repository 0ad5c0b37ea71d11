//! Waveform artifacts: amplitude peaks derived from an episode's audio.
//!
//! The exemplar artifact domain. `WaveformProcessor` plugs into the kernel's
//! worker pool; `WaveformStore` is the opaque artifact repository consulted
//! by the read-path coordinator.

mod model;
mod processor;
mod store;

use std::sync::Arc;

use crate::kernel::jobs::{JobService, JobType};
use crate::kernel::ArtifactCoordinator;

pub use model::{NewWaveform, Waveform};
pub use processor::{
    EpisodeDirectory, ExtractedPeaks, PeakSource, PodcastIndexDirectory, TranscoderPeakSource,
    WaveformPayload, WaveformProcessor,
};
pub use store::{DynWaveformStore, InMemoryWaveformStore, PostgresWaveformStore, WaveformStore};

/// Read-path coordinator specialized to waveforms.
pub type WaveformCoordinator = ArtifactCoordinator<DynWaveformStore>;

pub fn waveform_coordinator(
    store: Arc<dyn WaveformStore>,
    jobs: Arc<JobService>,
) -> WaveformCoordinator {
    ArtifactCoordinator::new(DynWaveformStore(store), jobs, JobType::WaveformGeneration)
}
