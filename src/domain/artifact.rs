//! Clip artifacts produced by the extraction unit.
//!
//! One artifact exists per (record, camera role) pair. It starts `Pending`
//! and is settled exactly once into a terminal state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::record::CameraRole;

/// A clip cut from one physical source file for one record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClipArtifact {
    /// Record the clip was cut for
    pub record_id: String,

    /// Storage key of the source video the clip was cut from
    pub physical_file_id: String,

    /// Camera role of the source video
    pub role: CameraRole,

    /// Storage key the clip is uploaded to
    pub output_key: String,

    /// Externally visible URI of the uploaded clip
    pub output_uri: String,

    /// Current status
    pub status: ClipStatus,

    /// Failure detail for terminal failure states
    pub error: Option<String>,

    /// When the artifact reached its terminal state
    pub settled_at: Option<DateTime<Utc>>,
}

impl ClipArtifact {
    /// Create a pending artifact
    pub fn pending(
        record_id: impl Into<String>,
        physical_file_id: impl Into<String>,
        role: CameraRole,
        output_key: impl Into<String>,
        output_uri: impl Into<String>,
    ) -> Self {
        Self {
            record_id: record_id.into(),
            physical_file_id: physical_file_id.into(),
            role,
            output_key: output_key.into(),
            output_uri: output_uri.into(),
            status: ClipStatus::Pending,
            error: None,
            settled_at: None,
        }
    }

    /// Move to a terminal state.
    ///
    /// Returns `false` and leaves the artifact untouched if it was already
    /// settled or if `status` is `Pending`.
    pub fn settle(&mut self, status: ClipStatus, error: Option<String>) -> bool {
        if self.status.is_terminal() || !status.is_terminal() {
            return false;
        }
        self.status = status;
        self.error = error;
        self.settled_at = Some(Utc::now());
        true
    }

    /// Whether the clip was cut and uploaded
    pub fn is_extracted(&self) -> bool {
        self.status == ClipStatus::Extracted
    }
}

/// Lifecycle of a clip artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClipStatus {
    /// Not yet processed
    Pending,

    /// Cut and uploaded
    Extracted,

    /// Cut locally but the upload failed
    UploadFailed,

    /// Source download or transcoding failed
    ExtractionFailed,
}

impl ClipStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl Default for ClipStatus {
    fn default() -> Self {
        Self::Pending
    }
}
