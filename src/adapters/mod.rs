//! Adapter interfaces for external systems.
//!
//! The extraction engine talks to four collaborators, each behind a trait so
//! tests and deployments can swap implementations:
//! - `MetadataStore`: annotation records keyed by group id
//! - `ObjectStore`: source videos, clips and manifests
//! - `Transcoder`: the external tool that cuts sub-clips
//! - `UnitInvoker`: fire-and-forget dispatch of extraction units

pub mod ffmpeg;
pub mod invoker;
pub mod json_dir;
pub mod local_store;
pub mod postgrest;

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{AnnotationRecord, RecordBatch};

pub use ffmpeg::{FfmpegTranscoder, TranscodeError};
pub use invoker::{Dispatch, HttpUnitInvoker, NoDispatchInvoker, SpawnUnitInvoker};
pub use json_dir::JsonDirMetadataStore;
pub use local_store::LocalObjectStore;
pub use postgrest::PostgrestMetadataStore;

/// Object storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Invalid object key: {0}")]
    InvalidKey(String),

    #[error("Storage call timed out after {0:?}")]
    Timeout(Duration),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

impl StorageError {
    /// Whether repeating the call could succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Io(_) | Self::Backend(_))
    }
}

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Object storage used for source videos and output artifacts.
///
/// Keys are `/`-separated paths relative to the store's root.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Human-readable store name
    fn name(&self) -> &str;

    /// Externally visible URI for a key (written into manifests)
    fn uri(&self, key: &str) -> String;

    /// Check if an object exists
    async fn exists(&self, key: &str) -> StorageResult<bool>;

    /// Download an object to a local file, returning its size in bytes
    async fn download(&self, key: &str, local_path: &Path) -> StorageResult<u64>;

    /// Upload a local file
    async fn upload(&self, local_path: &Path, key: &str) -> StorageResult<()>;

    /// List keys starting with `prefix`
    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>>;

    /// Read a (small) object into memory
    async fn read(&self, key: &str) -> StorageResult<Vec<u8>>;

    /// Write a (small) object from memory
    async fn write(&self, key: &str, data: &[u8]) -> StorageResult<()>;

    /// Move an object to a new key, replacing nothing that is visible halfway
    async fn rename(&self, from: &str, to: &str) -> StorageResult<()>;

    /// Delete an object (missing objects are not an error)
    async fn delete(&self, key: &str) -> StorageResult<()>;
}

/// Queryable store of annotation records
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Human-readable store name
    fn name(&self) -> &str;

    /// All rows of a group. Readable records come ordered by start offset;
    /// rows that do not parse are returned separately instead of failing
    /// the fetch.
    async fn fetch_records(&self, group_id: &str) -> Result<RecordBatch>;
}

/// External media tool that cuts a sub-clip out of a local source file
#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Human-readable tool name
    fn name(&self) -> &str;

    /// Cut `[start, end)` seconds of `source` into `dest`.
    ///
    /// Implementations must enforce `timeout` and must not leave a partial
    /// `dest` behind on failure.
    async fn extract_subclip(
        &self,
        source: &Path,
        start: f64,
        end: f64,
        dest: &Path,
        timeout: Duration,
    ) -> std::result::Result<(), TranscodeError>;
}

/// Starts an extraction unit for one group without waiting for it
#[async_trait]
pub trait UnitInvoker: Send + Sync {
    /// Human-readable invoker name
    fn name(&self) -> &str;

    /// Send the invocation. Returning `Ok` means the unit was (probably)
    /// started; the unit's own result is never observed here.
    async fn invoke(&self, group_id: &str) -> Result<Dispatch>;
}

/// Order records by start offset (missing offsets last), then id
pub fn sort_records(records: &mut [AnnotationRecord]) {
    records.sort_by(|a, b| {
        let a_start = a.start_offset.unwrap_or(f64::INFINITY);
        let b_start = b.start_offset.unwrap_or(f64::INFINITY);
        a_start.total_cmp(&b_start).then_with(|| a.id.cmp(&b.id))
    });
}
