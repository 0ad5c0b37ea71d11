// Artifact domains built on the kernel's job pipeline.

pub mod waveforms;
