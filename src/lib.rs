//! clipforge - Fan-out clip extraction and training manifest builder
//!
//! Turns annotated plays in multi-camera game footage into short clips and
//! JSONL training/validation manifests for video-understanding fine-tuning.
//!
//! # Architecture
//!
//! - One extraction unit per group (game) downloads each source video once,
//!   cuts every clip the group's records need, and commits a manifest pair.
//! - The orchestrator dispatches units without waiting on them, polls
//!   storage for committed manifest pairs, and combines whatever completed.
//! - Every orchestrator decision is appended to a per-run JSONL journal, so
//!   runs can be inspected and audited later.
//!
//! # Modules
//!
//! - `adapters`: Object storage, metadata, ffmpeg, unit invokers
//! - `core`: Planning, extraction, orchestration, assembly, journal
//! - `domain`: Data structures (records, manifests, pipeline events)
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Extract one group
//! clipforge extract game-0412
//!
//! # Fan out over several groups and combine the results
//! clipforge run --groups game-0412,game-0413
//!
//! # Check run status
//! clipforge status <run-id>
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;

// Re-export main types at crate root for convenience
pub use core::{ExtractionUnit, ManifestAssembler, Orchestrator};
pub use domain::{AnnotationRecord, CombinedManifest, ManifestEntry, PipelineRun, RunState};
