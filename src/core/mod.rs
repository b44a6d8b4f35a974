//! Core extraction and orchestration logic.
//!
//! This module contains:
//! - AngleTable, StorageLayout: data-driven angle mapping and key layout
//! - WorkPlan, split, prompt: the per-group work-list and manifest building
//! - ExtractionUnit: one group end-to-end
//! - Orchestrator: fan-out, completion polling, audit
//! - ManifestAssembler: combining group manifests
//! - EventStore: append-only pipeline journal

pub mod angles;
pub mod assembler;
pub mod event_store;
pub mod extraction;
pub mod layout;
pub mod orchestrator;
pub mod planner;
pub mod prompt;
pub mod retry;
pub mod split;

// Re-export commonly used types
pub use angles::{AngleTable, RoleSpec};
pub use assembler::{AssemblyError, ManifestAssembler};
pub use event_store::EventStore;
pub use extraction::{
    ExtractionError, ExtractionResult, ExtractionSettings, ExtractionUnit, FailureKind,
    FailureMarker, UnitOutcome,
};
pub use layout::{commit_timestamp, StorageLayout};
pub use orchestrator::{load_run, Orchestrator, OrchestratorSettings, PipelineReport};
pub use planner::{ClipJob, PlanError, WorkPlan};
pub use retry::{with_retry, RetryPolicy};
