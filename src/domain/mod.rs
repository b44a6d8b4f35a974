//! Domain types for clip extraction and dataset assembly.
//!
//! This module contains the core data structures:
//! - Records: Annotation records and angle/role identifiers
//! - Artifacts: Per-(record, role) clips and their status
//! - Manifests: Entries, per-group splits, combined dataset
//! - Events and Run: Pipeline journal and reconstructed run state

pub mod artifact;
pub mod events;
pub mod manifest;
pub mod record;
pub mod run;

// Re-export commonly used types
pub use artifact::{ClipArtifact, ClipStatus};
pub use events::{EventType, GroupStatus, PipelineEvent};
pub use manifest::{
    decode_jsonl, encode_jsonl, CombinedManifest, DroppedGroup, GroupManifest, GroupManifestRef,
    ManifestEntry, Split,
};
pub use record::{AngleTag, AnnotationRecord, CameraRole, MalformedRow, RecordBatch};
pub use run::{PipelineRun, RunState};
