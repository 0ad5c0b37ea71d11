// Kernel - core infrastructure shared by every artifact domain
//
// The job queue, worker pool, and the read-path coordinator live here.
// Business logic (what a waveform is, how peaks are produced) belongs in
// domain layers.

pub mod artifacts;
pub mod jobs;

pub use artifacts::{ArtifactCoordinator, ArtifactRequest, ArtifactStore, TriggerOutcome};
