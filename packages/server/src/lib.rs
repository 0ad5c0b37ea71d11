// Podcast Player - API Core
//
// This crate provides the backend job pipeline for derived episode artifacts
// (waveforms today; transcriptions, clips, and labels tomorrow). The durable
// queue, worker pool, and read-path coordinator live in kernel/; artifact
// domains register their processors and stores on top of it.

pub mod common;
pub mod config;
pub mod domains;
pub mod kernel;
pub mod server;

pub use config::*;
