//! Events recorded in the pipeline journal.
//!
//! The orchestrator appends one event per state change. A run's state can be
//! rebuilt at any time by replaying its events in order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single entry in the append-only pipeline journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineEvent {
    /// Unique identifier for this event
    pub id: Uuid,

    /// When this event occurred (ISO 8601)
    pub timestamp: DateTime<Utc>,

    /// The pipeline run this event belongs to
    pub run_id: Uuid,

    /// Group the event concerns (if applicable)
    pub group_id: Option<String>,

    /// Type of event
    pub event_type: EventType,

    /// Idempotency key format: "{run_id}:{group}:{event_type}"
    pub idempotency_key: String,

    /// Human-readable summary
    pub payload_summary: String,

    /// Status of the group (or run) after this event
    pub status: GroupStatus,

    /// Time since run start in milliseconds
    pub duration_ms: Option<u64>,

    /// Error message if failed
    pub error: Option<String>,

    /// Structured payload (manifest refs, group lists, combined manifest)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl PipelineEvent {
    /// Create a new event with the current timestamp
    pub fn new(
        run_id: Uuid,
        group_id: Option<String>,
        event_type: EventType,
        payload_summary: String,
        status: GroupStatus,
    ) -> Self {
        let idempotency_key = format!(
            "{}:{}:{}",
            run_id,
            group_id.as_deref().unwrap_or("*"),
            event_type.as_str()
        );
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            run_id,
            group_id,
            event_type,
            idempotency_key,
            payload_summary,
            status,
            duration_ms: None,
            error: None,
            data: None,
        }
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_error(mut self, error: String) -> Self {
        self.error = Some(error);
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Types of events recorded by the orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A pipeline run started (data: group list and wait budget)
    RunStarted,

    /// A unit invocation was sent for a group
    GroupDispatched,

    /// The invocation call for a group returned an error
    GroupDispatchFailed,

    /// Both manifest files for a group were observed (data: manifest ref)
    GroupCompleted,

    /// The unit reported the group has no records
    GroupEmpty,

    /// The unit reported a fatal failure for the group
    GroupFailed,

    /// The group did not finish before the polling deadline
    GroupTimedOut,

    /// Completed manifests were merged (data: combined manifest)
    ManifestCombined,

    /// The run reached a terminal state (data: run state)
    RunFinished,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RunStarted => "run_started",
            Self::GroupDispatched => "group_dispatched",
            Self::GroupDispatchFailed => "group_dispatch_failed",
            Self::GroupCompleted => "group_completed",
            Self::GroupEmpty => "group_empty",
            Self::GroupFailed => "group_failed",
            Self::GroupTimedOut => "group_timed_out",
            Self::ManifestCombined => "manifest_combined",
            Self::RunFinished => "run_finished",
        }
    }
}

/// Status of one group within a pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupStatus {
    /// Not yet dispatched
    Pending,

    /// Invocation sent, manifests not yet observed
    Dispatched,

    /// Both manifest files observed
    Completed,

    /// Unit found no records for the group
    Empty,

    /// Dispatch failed or the unit reported a fatal failure
    Failed,

    /// Polling deadline passed before completion
    TimedOut,
}

impl GroupStatus {
    /// Whether polling for this group has stopped
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Completed | Self::Empty | Self::Failed)
    }
}

impl Default for GroupStatus {
    fn default() -> Self {
        Self::Pending
    }
}
