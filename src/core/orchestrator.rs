//! Fan-out orchestrator.
//!
//! Dispatches one extraction unit per group without waiting for it, then
//! polls storage for each group's committed manifest pair (or failure
//! marker) until every group settles or the wait budget runs out. Completed
//! groups are merged by the assembler. Every state change is journaled, so
//! a run can be inspected and audited later.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::assembler::{AssemblyError, ManifestAssembler};
use super::event_store::EventStore;
use super::extraction::{FailureKind, FailureMarker};
use super::layout::{commit_timestamp, timestamp_of, StorageLayout};
use super::retry::{with_retry, RetryPolicy};
use crate::adapters::{ObjectStore, StorageResult, UnitInvoker};
use crate::domain::{
    CombinedManifest, EventType, GroupManifestRef, GroupStatus, PipelineEvent, PipelineRun,
    RunState,
};

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Delay between storage polls
    pub poll_interval: Duration,

    /// Limit for one storage call while polling
    pub io_timeout: Duration,

    /// Treat a group that already has a committed manifest pair as done
    /// instead of dispatching it again
    pub reuse_existing_manifests: bool,

    /// Retry policy for the assembler's reads and writes
    pub retry: RetryPolicy,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            io_timeout: Duration::from_secs(60),
            reuse_existing_manifests: true,
            retry: RetryPolicy::default(),
        }
    }
}

/// Per-group outcome of a pipeline run
#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub run_id: Uuid,
    pub state: RunState,
    pub completed: Vec<String>,
    pub empty: Vec<String>,
    /// Failed groups with the reason
    pub failed: BTreeMap<String, String>,
    /// Groups still outstanding (not dispatched, running or timed out)
    pub pending: Vec<String>,
    pub manifests: Vec<GroupManifestRef>,
    pub combined: Option<CombinedManifest>,
    pub elapsed: Duration,
}

impl PipelineReport {
    fn from_run(run: &PipelineRun, reasons: &BTreeMap<String, String>, elapsed: Duration) -> Self {
        let failed = run
            .groups_with(GroupStatus::Failed)
            .into_iter()
            .map(|g| {
                let reason = reasons
                    .get(&g)
                    .cloned()
                    .unwrap_or_else(|| "unit failed".to_string());
                (g, reason)
            })
            .collect();

        let pending = run
            .group_statuses
            .iter()
            .filter(|(_, s)| {
                matches!(s, GroupStatus::Pending | GroupStatus::Dispatched | GroupStatus::TimedOut)
            })
            .map(|(g, _)| g.clone())
            .collect();

        Self {
            run_id: run.id,
            state: run.state,
            completed: run.groups_with(GroupStatus::Completed),
            empty: run.groups_with(GroupStatus::Empty),
            failed,
            pending,
            manifests: run.manifests.values().cloned().collect(),
            combined: run.combined.clone(),
            elapsed,
        }
    }

    /// URI handed to the tuning service (the combined training file)
    pub fn combined_manifest_uri(&self) -> Option<&str> {
        self.combined.as_ref().map(|c| c.training_uri.as_str())
    }
}

/// What storage says about one group
#[derive(Debug, Clone, PartialEq)]
enum GroupSignal {
    Completed(GroupManifestRef),
    Empty(String),
    Failed(String),
    Pending,
}

/// A run being driven: journal, replayed state, and failure reasons
struct ActiveRun {
    journal: EventStore,
    run: PipelineRun,
    started: Instant,
    reasons: BTreeMap<String, String>,
}

impl ActiveRun {
    /// Journal an event and apply it to the in-memory run
    async fn record(&mut self, event: PipelineEvent) -> Result<()> {
        let event = event.with_duration(self.started.elapsed().as_millis() as u64);
        self.journal.append(&event).await?;
        self.run.apply_event(&event);
        Ok(())
    }

    fn group_event(&self, group_id: &str, event_type: EventType, summary: String, status: GroupStatus) -> PipelineEvent {
        PipelineEvent::new(self.run.id, Some(group_id.to_string()), event_type, summary, status)
    }

    fn status_of(&self, group_id: &str) -> GroupStatus {
        self.run
            .group_statuses
            .get(group_id)
            .copied()
            .unwrap_or_default()
    }

    async fn mark_completed(&mut self, group_id: &str, manifest: &GroupManifestRef, summary: String) -> Result<()> {
        let event = self
            .group_event(group_id, EventType::GroupCompleted, summary, GroupStatus::Completed)
            .with_data(serde_json::to_value(manifest)?);
        self.record(event).await
    }

    async fn mark_failed(&mut self, group_id: &str, reason: String) -> Result<()> {
        self.reasons.insert(group_id.to_string(), reason.clone());
        let event = self
            .group_event(
                group_id,
                EventType::GroupFailed,
                format!("Group {} failed", group_id),
                GroupStatus::Failed,
            )
            .with_error(reason);
        self.record(event).await
    }

    async fn mark_empty(&mut self, group_id: &str, message: String) -> Result<()> {
        let event = self.group_event(group_id, EventType::GroupEmpty, message, GroupStatus::Empty);
        self.record(event).await
    }
}

/// Fan-out orchestrator over a unit invoker and the shared object store
pub struct Orchestrator {
    invoker: Arc<dyn UnitInvoker>,
    store: Arc<dyn ObjectStore>,
    layout: StorageLayout,
    assembler: ManifestAssembler,
    settings: OrchestratorSettings,
    journal_root: PathBuf,
}

impl Orchestrator {
    /// Create an orchestrator journaling runs under `journal_root`
    pub fn new(
        invoker: Arc<dyn UnitInvoker>,
        store: Arc<dyn ObjectStore>,
        layout: StorageLayout,
        journal_root: impl Into<PathBuf>,
    ) -> Self {
        let settings = OrchestratorSettings::default();
        let assembler = ManifestAssembler::new(Arc::clone(&store), layout.clone())
            .with_retry_policy(settings.retry.clone(), settings.io_timeout);
        Self {
            invoker,
            store,
            layout,
            assembler,
            settings,
            journal_root: journal_root.into(),
        }
    }

    pub fn with_settings(mut self, settings: OrchestratorSettings) -> Self {
        self.assembler = ManifestAssembler::new(Arc::clone(&self.store), self.layout.clone())
            .with_retry_policy(settings.retry.clone(), settings.io_timeout);
        self.settings = settings;
        self
    }

    /// Dispatch every group, poll until all settle or `max_wait` passes,
    /// then combine the completed groups' manifests.
    #[instrument(skip(self, group_ids), fields(groups = group_ids.len(), invoker = self.invoker.name()))]
    pub async fn run_pipeline(&self, group_ids: &[String], max_wait: Duration) -> Result<PipelineReport> {
        let run_id = Uuid::new_v4();
        let started = Instant::now();
        let deadline = started + max_wait;

        let mut groups: Vec<String> = Vec::with_capacity(group_ids.len());
        for group in group_ids {
            if !groups.contains(group) {
                groups.push(group.clone());
            }
        }

        info!(%run_id, groups = groups.len(), ?max_wait, "Starting pipeline run");

        let journal = EventStore::open_in(&self.journal_root, run_id).await?;
        let run = PipelineRun::new(run_id, groups.clone(), max_wait.as_secs());
        // Only signals written after the run started belong to it
        let cutoff = timestamp_of(run.started_at);
        let mut active = ActiveRun {
            journal,
            run,
            started,
            reasons: BTreeMap::new(),
        };

        active
            .record(
                PipelineEvent::new(
                    run_id,
                    None,
                    EventType::RunStarted,
                    format!("Run started with {} groups", groups.len()),
                    GroupStatus::Pending,
                )
                .with_data(serde_json::json!({
                    "groups": groups,
                    "max_wait_seconds": max_wait.as_secs(),
                })),
            )
            .await?;

        self.dispatch_all(&mut active, &groups).await?;
        let deadline_hit = self.poll_until_settled(&mut active, deadline, &cutoff).await?;

        let outstanding: Vec<String> = active
            .run
            .group_statuses
            .iter()
            .filter(|(_, s)| !s.is_settled())
            .map(|(g, _)| g.clone())
            .collect();

        for group in outstanding {
            if let Some(reason) = active.reasons.get(&group).cloned() {
                // Never confirmed started and never produced anything
                active.mark_failed(&group, reason).await?;
            } else {
                warn!(group_id = %group, "Group did not finish before the deadline");
                let event = active.group_event(
                    &group,
                    EventType::GroupTimedOut,
                    format!("Group {} still pending after {:?}", group, max_wait),
                    GroupStatus::TimedOut,
                );
                active.record(event).await?;
            }
        }

        active.run.state = RunState::Finalizing;
        let manifests: Vec<GroupManifestRef> = active
            .run
            .groups
            .iter()
            .filter_map(|g| active.run.manifests.get(g).cloned())
            .collect();
        self.combine(&mut active, &run_id.to_string(), &manifests).await?;

        self.finish(&mut active, deadline_hit).await?;

        let report = PipelineReport::from_run(&active.run, &active.reasons, started.elapsed());
        info!(
            %run_id,
            state = ?report.state,
            completed = report.completed.len(),
            empty = report.empty.len(),
            failed = report.failed.len(),
            pending = report.pending.len(),
            elapsed_secs = report.elapsed.as_secs(),
            "Pipeline run finished"
        );

        Ok(report)
    }

    /// Send one invocation per group. A failure for one group is recorded
    /// and never stops the others.
    async fn dispatch_all(&self, active: &mut ActiveRun, groups: &[String]) -> Result<()> {
        active.run.state = RunState::Dispatching;

        for group in groups {
            if self.settings.reuse_existing_manifests {
                match self.find_manifest(group, None).await {
                    Ok(Some(manifest)) => {
                        info!(group_id = %group, timestamp = %manifest.timestamp, "Reusing committed manifest");
                        let summary = format!("Reused manifest {} for {}", manifest.timestamp, group);
                        active.mark_completed(group, &manifest, summary).await?;
                        continue;
                    }
                    Ok(None) => {}
                    Err(e) => warn!(group_id = %group, error = %e, "Could not check for an existing manifest"),
                }
            }

            match self.invoker.invoke(group).await {
                Ok(dispatch) => {
                    debug!(group_id = %group, ?dispatch, "Dispatched unit");
                    let event = active
                        .group_event(
                            group,
                            EventType::GroupDispatched,
                            format!("Dispatched unit for {}", group),
                            GroupStatus::Dispatched,
                        )
                        .with_data(serde_json::json!({ "dispatch": dispatch }));
                    active.record(event).await?;
                }
                Err(e) => {
                    error!(group_id = %group, error = %e, "Dispatch failed");
                    let reason = format!("dispatch failed: {:#}", e);
                    active.reasons.insert(group.clone(), reason.clone());
                    let event = active
                        .group_event(
                            group,
                            EventType::GroupDispatchFailed,
                            format!("Dispatch failed for {}", group),
                            GroupStatus::Dispatched,
                        )
                        .with_error(reason);
                    active.record(event).await?;
                }
            }
        }

        Ok(())
    }

    /// Poll until every group settles or the deadline passes. Returns
    /// whether the deadline was hit.
    async fn poll_until_settled(&self, active: &mut ActiveRun, deadline: Instant, cutoff: &str) -> Result<bool> {
        active.run.state = RunState::Polling;
        let mut round = 0u32;

        loop {
            round += 1;
            let waiting: Vec<String> = active
                .run
                .group_statuses
                .iter()
                .filter(|(_, s)| !s.is_settled())
                .map(|(g, _)| g.clone())
                .collect();

            if waiting.is_empty() {
                return Ok(false);
            }

            for group in &waiting {
                match self.check_group(group, Some(cutoff)).await {
                    Ok(GroupSignal::Completed(manifest)) => {
                        info!(group_id = %group, timestamp = %manifest.timestamp, "Group completed");
                        let summary = format!("Manifest pair {} observed", manifest.timestamp);
                        active.mark_completed(group, &manifest, summary).await?;
                    }
                    Ok(GroupSignal::Empty(message)) => {
                        info!(group_id = %group, "Group has no records");
                        active.mark_empty(group, message).await?;
                    }
                    Ok(GroupSignal::Failed(reason)) => {
                        warn!(group_id = %group, reason = %reason, "Unit reported failure");
                        active.mark_failed(group, reason).await?;
                    }
                    Ok(GroupSignal::Pending) => {}
                    Err(e) => warn!(group_id = %group, error = %e, "Poll failed, will retry next round"),
                }
            }

            let still_waiting = active
                .run
                .group_statuses
                .values()
                .filter(|s| !s.is_settled())
                .count();
            if still_waiting == 0 {
                return Ok(false);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(true);
            }

            debug!(round, still_waiting, "Waiting for next poll");
            sleep(self.settings.poll_interval.min(deadline - now)).await;
        }
    }

    async fn combine(&self, active: &mut ActiveRun, dataset_id: &str, manifests: &[GroupManifestRef]) -> Result<()> {
        if manifests.is_empty() {
            info!("No completed groups, skipping assembly");
            return Ok(());
        }

        let combined = match self.assembler.assemble(dataset_id, manifests).await {
            Ok(combined) => combined,
            Err(AssemblyError::PartialInput { combined }) => {
                for dropped in &combined.groups_dropped {
                    warn!(group_id = %dropped.group_id, reason = %dropped.reason, "Group dropped from combined manifest");
                }
                combined
            }
            Err(e) => {
                error!(error = %e, "Manifest assembly failed");
                return Ok(());
            }
        };

        let event = PipelineEvent::new(
            active.run.id,
            None,
            EventType::ManifestCombined,
            format!(
                "Combined {} training and {} validation entries",
                combined.training_entries, combined.validation_entries
            ),
            GroupStatus::Completed,
        )
        .with_data(serde_json::to_value(&combined)?);
        active.record(event).await
    }

    async fn finish(&self, active: &mut ActiveRun, deadline_hit: bool) -> Result<()> {
        let state = RunState::classify(active.run.group_statuses.values().copied(), deadline_hit);
        let event = PipelineEvent::new(
            active.run.id,
            None,
            EventType::RunFinished,
            format!("Run finished: {:?}", state),
            GroupStatus::Pending,
        )
        .with_data(serde_json::json!({ "state": state }));
        active.record(event).await
    }

    /// Re-check every group a finished run did not complete. Late manifest
    /// pairs are accepted and the completed set is combined again under a
    /// fresh dataset id.
    #[instrument(skip(self), fields(run_id = %run_id))]
    pub async fn audit(&self, run_id: Uuid) -> Result<PipelineReport> {
        let journal = EventStore::open_in(&self.journal_root, run_id).await?;
        let events = journal.replay().await?;
        if events.is_empty() {
            anyhow::bail!("No events found for run {}", run_id);
        }

        let run = PipelineRun::from_events(&events).context("Failed to reconstruct run state")?;
        let cutoff = timestamp_of(run.started_at);

        let mut reasons = BTreeMap::new();
        for event in &events {
            if let (Some(group), Some(error)) = (&event.group_id, &event.error) {
                reasons.insert(group.clone(), error.clone());
            }
        }

        let mut active = ActiveRun {
            journal,
            run,
            started: Instant::now(),
            reasons,
        };

        let mut changed = false;
        for group in active.run.unfinished_groups() {
            let previous = active.status_of(&group);
            match self.check_group(&group, Some(&cutoff)).await {
                Ok(GroupSignal::Completed(manifest)) => {
                    info!(group_id = %group, timestamp = %manifest.timestamp, "Accepting late manifest");
                    let summary = format!("Late manifest pair {} accepted by audit", manifest.timestamp);
                    active.mark_completed(&group, &manifest, summary).await?;
                    active.reasons.remove(&group);
                    changed = true;
                }
                Ok(GroupSignal::Empty(message)) => {
                    active.mark_empty(&group, message).await?;
                    active.reasons.remove(&group);
                    changed = true;
                }
                Ok(GroupSignal::Failed(reason)) if previous != GroupStatus::Failed => {
                    active.mark_failed(&group, reason).await?;
                    changed = true;
                }
                Ok(_) => debug!(group_id = %group, status = ?previous, "No new signal"),
                Err(e) => warn!(group_id = %group, error = %e, "Audit check failed"),
            }
        }

        if changed {
            let manifests: Vec<GroupManifestRef> = active
                .run
                .groups
                .iter()
                .filter_map(|g| active.run.manifests.get(g).cloned())
                .collect();
            let dataset_id = format!("{}/audit_{}", run_id, commit_timestamp());
            self.combine(&mut active, &dataset_id, &manifests).await?;
            self.finish(&mut active, true).await?;
        }

        let elapsed = (Utc::now() - active.run.started_at).to_std().unwrap_or_default();
        Ok(PipelineReport::from_run(&active.run, &active.reasons, elapsed))
    }

    /// Completion signal for one group in storage
    async fn check_group(&self, group_id: &str, since: Option<&str>) -> StorageResult<GroupSignal> {
        if let Some(manifest) = self.find_manifest(group_id, since).await? {
            return Ok(GroupSignal::Completed(manifest));
        }

        let prefix = self.layout.failure_marker_prefix(group_id);
        let markers = self.list(&prefix).await?;
        let latest = markers
            .iter()
            .filter_map(|key| {
                self.layout
                    .parse_failure_marker_key(group_id, key)
                    .map(|ts| (ts, key))
            })
            .filter(|(ts, _)| since.map_or(true, |cutoff| *ts >= cutoff))
            .max_by(|a, b| a.0.cmp(b.0));

        let Some((_, key)) = latest else {
            return Ok(GroupSignal::Pending);
        };

        let bytes = with_retry(&RetryPolicy::none(), self.settings.io_timeout, "read failure marker", || {
            self.store.read(key)
        })
        .await?;

        Ok(match serde_json::from_slice::<FailureMarker>(&bytes) {
            Ok(marker) if marker.kind == FailureKind::NoRecords => GroupSignal::Empty(marker.message),
            Ok(marker) => GroupSignal::Failed(marker.message),
            Err(e) => GroupSignal::Failed(format!("unreadable failure marker {}: {}", key, e)),
        })
    }

    async fn find_manifest(&self, group_id: &str, since: Option<&str>) -> StorageResult<Option<GroupManifestRef>> {
        let keys = self.list(&self.layout.manifest_prefix(group_id)).await?;
        Ok(self.layout.latest_complete_pair(group_id, &keys, since))
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        with_retry(&RetryPolicy::none(), self.settings.io_timeout, "list", || {
            self.store.list(prefix)
        })
        .await
    }
}

/// Reconstruct a run from its journal under `journal_root`
pub async fn load_run(journal_root: &Path, run_id: Uuid) -> Result<PipelineRun> {
    let journal = EventStore::open_in(journal_root, run_id).await?;
    let events = journal.replay().await?;
    PipelineRun::from_events(&events).with_context(|| format!("No events found for run {}", run_id))
}
