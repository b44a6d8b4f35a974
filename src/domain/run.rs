//! Pipeline run state and reconstruction from journal events.
//!
//! A `PipelineRun` represents one fan-out over a set of groups.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::events::{EventType, GroupStatus, PipelineEvent};
use super::manifest::{CombinedManifest, GroupManifestRef};

/// A fan-out pipeline run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    /// Unique identifier for this run
    pub id: Uuid,

    /// Groups the run was started with, in dispatch order
    pub groups: Vec<String>,

    /// Polling budget in seconds
    pub max_wait_seconds: u64,

    /// Current state of the run
    pub state: RunState,

    /// When the run started
    pub started_at: DateTime<Utc>,

    /// When the run reached a terminal state
    pub completed_at: Option<DateTime<Utc>>,

    /// Status of each group
    pub group_statuses: BTreeMap<String, GroupStatus>,

    /// Committed manifests of completed groups
    pub manifests: BTreeMap<String, GroupManifestRef>,

    /// Latest combined manifest, if assembly ran
    pub combined: Option<CombinedManifest>,
}

impl PipelineRun {
    /// Create a new run over `groups`
    pub fn new(id: Uuid, groups: Vec<String>, max_wait_seconds: u64) -> Self {
        let group_statuses = groups
            .iter()
            .map(|g| (g.clone(), GroupStatus::Pending))
            .collect();
        Self {
            id,
            groups,
            max_wait_seconds,
            state: RunState::Initializing,
            started_at: Utc::now(),
            completed_at: None,
            group_statuses,
            manifests: BTreeMap::new(),
            combined: None,
        }
    }

    /// Reconstruct run state from a sequence of events
    pub fn from_events(events: &[PipelineEvent]) -> Option<Self> {
        let first = events.first()?;

        let mut run = Self::new(first.run_id, Vec::new(), 0);
        run.started_at = first.timestamp;

        for event in events {
            run.apply_event(event);
        }

        Some(run)
    }

    /// Apply a single event to update run state
    pub fn apply_event(&mut self, event: &PipelineEvent) {
        match event.event_type {
            EventType::RunStarted => {
                self.state = RunState::Dispatching;
                self.started_at = event.timestamp;
                if let Some(data) = &event.data {
                    if let Some(groups) = data.get("groups").and_then(|g| g.as_array()) {
                        self.groups = groups
                            .iter()
                            .filter_map(|g| g.as_str().map(str::to_string))
                            .collect();
                    }
                    if let Some(wait) = data.get("max_wait_seconds").and_then(|w| w.as_u64()) {
                        self.max_wait_seconds = wait;
                    }
                }
                for group in &self.groups {
                    self.group_statuses
                        .entry(group.clone())
                        .or_insert(GroupStatus::Pending);
                }
            }
            EventType::GroupDispatched | EventType::GroupDispatchFailed => {
                // A failed invocation may still have started the unit, so the
                // group keeps being polled.
                self.set_group(event, GroupStatus::Dispatched);
            }
            EventType::GroupCompleted => {
                self.set_group(event, GroupStatus::Completed);
                if let (Some(group), Some(data)) = (&event.group_id, &event.data) {
                    if let Ok(manifest) = serde_json::from_value::<GroupManifestRef>(data.clone()) {
                        self.manifests.insert(group.clone(), manifest);
                    }
                }
            }
            EventType::GroupEmpty => self.set_group(event, GroupStatus::Empty),
            EventType::GroupFailed => self.set_group(event, GroupStatus::Failed),
            EventType::GroupTimedOut => self.set_group(event, GroupStatus::TimedOut),
            EventType::ManifestCombined => {
                if let Some(data) = &event.data {
                    if let Ok(combined) = serde_json::from_value::<CombinedManifest>(data.clone()) {
                        self.combined = Some(combined);
                    }
                }
            }
            EventType::RunFinished => {
                self.state = event
                    .data
                    .as_ref()
                    .and_then(|d| d.get("state").cloned())
                    .and_then(|s| serde_json::from_value(s).ok())
                    .unwrap_or_else(|| RunState::classify(self.group_statuses.values().copied(), false));
                self.completed_at = Some(event.timestamp);
            }
        }
    }

    fn set_group(&mut self, event: &PipelineEvent, status: GroupStatus) {
        if let Some(ref group) = event.group_id {
            if self.state == RunState::Dispatching && status != GroupStatus::Dispatched {
                self.state = RunState::Polling;
            }
            self.group_statuses.insert(group.clone(), status);
        }
    }

    /// Groups with the given status, in sorted order
    pub fn groups_with(&self, status: GroupStatus) -> Vec<String> {
        self.group_statuses
            .iter()
            .filter(|(_, s)| **s == status)
            .map(|(g, _)| g.clone())
            .collect()
    }

    /// Groups that have not completed and may still produce a late manifest
    pub fn unfinished_groups(&self) -> Vec<String> {
        self.group_statuses
            .iter()
            .filter(|(_, s)| matches!(s, GroupStatus::Pending | GroupStatus::Dispatched | GroupStatus::TimedOut | GroupStatus::Failed))
            .map(|(g, _)| g.clone())
            .collect()
    }

    /// Check if the run reached a terminal state
    pub fn is_finished(&self) -> bool {
        self.state.is_terminal()
    }
}

/// State of a pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Initializing,
    Dispatching,
    Polling,
    Finalizing,

    /// Every group completed (or was empty)
    Succeeded,

    /// Some groups completed, others failed or are still pending
    PartiallyCompleted,

    /// No group completed before the polling deadline
    TimedOut,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::PartiallyCompleted | Self::TimedOut)
    }

    /// Derive the terminal state from per-group outcomes
    pub fn classify(statuses: impl IntoIterator<Item = GroupStatus>, deadline_hit: bool) -> Self {
        let mut finished = 0usize;
        let mut unfinished = 0usize;
        let mut waiting = 0usize;

        for status in statuses {
            match status {
                GroupStatus::Completed | GroupStatus::Empty => finished += 1,
                GroupStatus::Failed => unfinished += 1,
                GroupStatus::Pending | GroupStatus::Dispatched | GroupStatus::TimedOut => {
                    unfinished += 1;
                    waiting += 1;
                }
            }
        }

        if unfinished == 0 {
            Self::Succeeded
        } else if finished == 0 && waiting > 0 && deadline_hit {
            Self::TimedOut
        } else {
            Self::PartiallyCompleted
        }
    }
}

impl Default for RunState {
    fn default() -> Self {
        Self::Initializing
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(run_id: Uuid, group: Option<&str>, event_type: EventType, status: GroupStatus) -> PipelineEvent {
        PipelineEvent::new(
            run_id,
            group.map(str::to_string),
            event_type,
            event_type.as_str().to_string(),
            status,
        )
    }

    #[test]
    fn test_run_creation() {
        let run_id = Uuid::new_v4();
        let run = PipelineRun::new(run_id, vec!["g1".to_string(), "g2".to_string()], 7200);

        assert_eq!(run.id, run_id);
        assert_eq!(run.state, RunState::Initializing);
        assert_eq!(run.groups_with(GroupStatus::Pending).len(), 2);
        assert!(!run.is_finished());
    }

    #[test]
    fn test_run_from_events() {
        let run_id = Uuid::new_v4();
        let manifest = GroupManifestRef {
            group_id: "g1".to_string(),
            timestamp: "20250101_000000".to_string(),
            training_key: "g1/manifest_training_20250101_000000.jsonl".to_string(),
            validation_key: "g1/manifest_validation_20250101_000000.jsonl".to_string(),
        };

        let events = vec![
            event(run_id, None, EventType::RunStarted, GroupStatus::Pending)
                .with_data(serde_json::json!({ "groups": ["g1", "g2"], "max_wait_seconds": 60 })),
            event(run_id, Some("g1"), EventType::GroupDispatched, GroupStatus::Dispatched),
            event(run_id, Some("g2"), EventType::GroupDispatchFailed, GroupStatus::Dispatched),
            event(run_id, Some("g1"), EventType::GroupCompleted, GroupStatus::Completed)
                .with_data(serde_json::to_value(&manifest).unwrap()),
            event(run_id, Some("g2"), EventType::GroupTimedOut, GroupStatus::TimedOut),
            event(run_id, None, EventType::RunFinished, GroupStatus::Pending)
                .with_data(serde_json::json!({ "state": "partially_completed" })),
        ];

        let run = PipelineRun::from_events(&events).unwrap();

        assert_eq!(run.id, run_id);
        assert_eq!(run.groups, vec!["g1", "g2"]);
        assert_eq!(run.max_wait_seconds, 60);
        assert_eq!(run.state, RunState::PartiallyCompleted);
        assert_eq!(run.group_statuses["g1"], GroupStatus::Completed);
        assert_eq!(run.group_statuses["g2"], GroupStatus::TimedOut);
        assert_eq!(run.manifests["g1"], manifest);
        assert_eq!(run.unfinished_groups(), vec!["g2"]);
        assert!(run.is_finished());
    }

    #[test]
    fn test_classify_terminal_state() {
        use GroupStatus::*;

        assert_eq!(RunState::classify([Completed, Empty], true), RunState::Succeeded);
        assert_eq!(RunState::classify([Completed, TimedOut], true), RunState::PartiallyCompleted);
        assert_eq!(RunState::classify([TimedOut, TimedOut], true), RunState::TimedOut);
        assert_eq!(RunState::classify([Failed, Failed], false), RunState::PartiallyCompleted);
        assert_eq!(RunState::classify([Completed, Failed], false), RunState::PartiallyCompleted);
        assert_eq!(RunState::classify(Vec::<GroupStatus>::new(), false), RunState::Succeeded);
    }
}
