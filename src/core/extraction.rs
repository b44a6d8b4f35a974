//! Extraction unit: processes one group end-to-end.
//!
//! fetch records -> plan -> check sources -> per physical file
//! (download once, cut and upload every clip, delete) -> split -> commit the
//! manifest pair.
//!
//! Clip and file failures are absorbed and counted. Only failures that make
//! any manifest meaningless (no records, missing sources, metadata or
//! storage outages, the unit timeout) abort the run; those leave a failure
//! marker in storage for the orchestrator instead of a manifest.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::timeout;
use tracing::{debug, error, info, instrument, warn};

use super::angles::AngleTable;
use super::layout::{commit_timestamp, StorageLayout};
use super::planner::{ClipJob, WorkPlan};
use super::prompt::manifest_entry;
use super::retry::{with_retry, RetryPolicy};
use super::split::{split_items, split_rng};
use crate::adapters::{MetadataStore, ObjectStore, StorageError, Transcoder};
use crate::domain::{
    encode_jsonl, AnnotationRecord, CameraRole, ClipArtifact, ClipStatus, GroupManifest,
    GroupManifestRef, ManifestEntry, Split,
};

/// Tunables for one unit run
#[derive(Debug, Clone)]
pub struct ExtractionSettings {
    /// Hard limit for cutting a single clip
    pub transcode_timeout: Duration,

    /// Limit for a single storage call (per attempt)
    pub io_timeout: Duration,

    /// Limit for the whole unit run
    pub unit_timeout: Duration,

    /// Physical files processed at once (peak disk = this many sources)
    pub file_concurrency: usize,

    pub validation_ratio: f64,

    /// Base seed for reproducible splits; random when unset
    pub split_seed: Option<u64>,

    pub retry: RetryPolicy,

    /// Parent directory for scratch space (system temp when unset)
    pub work_dir: Option<PathBuf>,
}

impl Default for ExtractionSettings {
    fn default() -> Self {
        Self {
            transcode_timeout: Duration::from_secs(60),
            io_timeout: Duration::from_secs(600),
            unit_timeout: Duration::from_secs(3600),
            file_concurrency: 1,
            validation_ratio: 0.2,
            split_seed: None,
            retry: RetryPolicy::default(),
            work_dir: None,
        }
    }
}

/// How a completed run went
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitOutcome {
    /// Every planned clip was produced
    Completed,

    /// Some clips failed or some records were rejected
    CompletedWithFailures,

    /// Records existed but not a single clip was produced
    TotalFailure,
}

/// Summary returned by a completed unit run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub group_id: String,
    pub total_records: usize,
    pub records_rejected: usize,
    pub clips_needed: usize,
    pub clips_extracted: usize,
    pub clips_failed: usize,
    pub training_entries: usize,
    pub validation_entries: usize,
    pub training_file_uri: String,
    pub validation_file_uri: String,
    pub manifest: GroupManifestRef,
    pub outcome: UnitOutcome,
    pub duration_ms: u64,
}

impl ExtractionResult {
    /// Fraction of planned clips that were produced
    pub fn success_rate(&self) -> f64 {
        if self.clips_needed == 0 {
            return 0.0;
        }
        self.clips_extracted as f64 / self.clips_needed as f64
    }
}

/// Fatal unit errors
#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("No records found for group {group_id}")]
    NoRecords { group_id: String },

    #[error("Missing source files for group {group_id}: {}", .missing.join(", "))]
    MissingSource { group_id: String, missing: Vec<String> },

    #[error("Metadata store error for group {group_id}: {message}")]
    Metadata { group_id: String, message: String },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Failed to write manifests for group {group_id}: {message}")]
    ManifestWrite { group_id: String, message: String },

    #[error("Extraction for group {group_id} exceeded {limit:?}")]
    UnitTimeout { group_id: String, limit: Duration },
}

impl ExtractionError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::NoRecords { .. } => FailureKind::NoRecords,
            Self::MissingSource { .. } => FailureKind::MissingSource,
            Self::Metadata { .. } => FailureKind::Metadata,
            Self::Storage(_) => FailureKind::Storage,
            Self::ManifestWrite { .. } => FailureKind::ManifestWrite,
            Self::UnitTimeout { .. } => FailureKind::Timeout,
        }
    }
}

/// Category of a fatal unit failure, as recorded in the failure marker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    NoRecords,
    MissingSource,
    Metadata,
    Storage,
    ManifestWrite,
    Timeout,
}

/// Object written to `{group}/unit_failed_{ts}.json` when a unit aborts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureMarker {
    pub group_id: String,
    pub kind: FailureKind,
    pub message: String,
    pub timestamp: String,
}

/// All clips to cut from one physical file
#[derive(Debug, Clone)]
struct FileJob {
    role: CameraRole,
    source_key: String,
    clips: Vec<ClipJob>,
}

/// Extraction unit for one group at a time
pub struct ExtractionUnit {
    metadata: Arc<dyn MetadataStore>,
    store: Arc<dyn ObjectStore>,
    transcoder: Arc<dyn Transcoder>,
    angles: AngleTable,
    layout: StorageLayout,
    settings: ExtractionSettings,
}

impl ExtractionUnit {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        store: Arc<dyn ObjectStore>,
        transcoder: Arc<dyn Transcoder>,
    ) -> Self {
        Self {
            metadata,
            store,
            transcoder,
            angles: AngleTable::default(),
            layout: StorageLayout::default(),
            settings: ExtractionSettings::default(),
        }
    }

    pub fn with_angles(mut self, angles: AngleTable) -> Self {
        self.angles = angles;
        self
    }

    pub fn with_layout(mut self, layout: StorageLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn with_settings(mut self, settings: ExtractionSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Run the whole unit for `group_id`.
    ///
    /// On a fatal error a failure marker is written before returning.
    #[instrument(skip(self))]
    pub async fn run_extraction(&self, group_id: &str) -> Result<ExtractionResult, ExtractionError> {
        let started = Instant::now();
        info!("Starting extraction");

        let result = match timeout(self.settings.unit_timeout, self.extract(group_id, started)).await {
            Ok(result) => result,
            Err(_) => Err(ExtractionError::UnitTimeout {
                group_id: group_id.to_string(),
                limit: self.settings.unit_timeout,
            }),
        };

        match &result {
            Ok(summary) => match summary.outcome {
                UnitOutcome::Completed => info!(
                    clips_extracted = summary.clips_extracted,
                    training = summary.training_entries,
                    validation = summary.validation_entries,
                    duration_ms = summary.duration_ms,
                    "Extraction completed"
                ),
                UnitOutcome::CompletedWithFailures => warn!(
                    clips_extracted = summary.clips_extracted,
                    clips_failed = summary.clips_failed,
                    records_rejected = summary.records_rejected,
                    success_rate = summary.success_rate(),
                    "Extraction completed with failures"
                ),
                UnitOutcome::TotalFailure => error!(
                    total_records = summary.total_records,
                    clips_failed = summary.clips_failed,
                    records_rejected = summary.records_rejected,
                    "Extraction produced no clips"
                ),
            },
            Err(e) => {
                error!(error = %e, kind = ?e.kind(), "Extraction failed");
                self.write_failure_marker(group_id, e).await;
            }
        }

        result
    }

    async fn extract(&self, group_id: &str, started: Instant) -> Result<ExtractionResult, ExtractionError> {
        let batch = self
            .metadata
            .fetch_records(group_id)
            .await
            .map_err(|e| ExtractionError::Metadata {
                group_id: group_id.to_string(),
                message: format!("{:#}", e),
            })?;

        if batch.is_empty() {
            return Err(ExtractionError::NoRecords {
                group_id: group_id.to_string(),
            });
        }

        let total_records = batch.len();
        let unreadable = batch.malformed.len();
        info!(
            total_records,
            unreadable,
            metadata = self.metadata.name(),
            "Fetched annotation records"
        );
        for row in &batch.malformed {
            warn!(
                record_id = row.record_id.as_deref().unwrap_or("<none>"),
                reason = %row.reason,
                "Skipping unreadable record"
            );
        }

        self.save_records_snapshot(group_id, &batch.records).await;

        let plan = WorkPlan::build(group_id, batch.records, &self.angles, &self.layout);
        for rejected in &plan.rejected {
            warn!(record_id = %rejected.record_id, reason = %rejected.reason, "Skipping record");
        }

        let sources = self.resolve_sources(group_id, &plan).await?;
        info!(
            physical_files = sources.len(),
            clips_needed = plan.clips_needed(),
            "All source files present"
        );

        let artifacts = self.process_files(group_id, &plan, &sources).await;
        let clips_extracted = artifacts.iter().filter(|a| a.is_extracted()).count();
        let clips_failed = artifacts.len() - clips_extracted;

        let manifest = self.build_manifest(group_id, &plan, &artifacts);
        let manifest_ref = self.commit_manifest(group_id, &manifest).await?;

        let records_rejected = plan.rejected.len() + unreadable;
        let outcome = if clips_extracted == 0 {
            UnitOutcome::TotalFailure
        } else if clips_failed > 0 || records_rejected > 0 {
            UnitOutcome::CompletedWithFailures
        } else {
            UnitOutcome::Completed
        };

        Ok(ExtractionResult {
            group_id: group_id.to_string(),
            total_records,
            records_rejected,
            clips_needed: plan.clips_needed(),
            clips_extracted,
            clips_failed,
            training_entries: manifest.training.len(),
            validation_entries: manifest.validation.len(),
            training_file_uri: self.store.uri(&manifest_ref.training_key),
            validation_file_uri: self.store.uri(&manifest_ref.validation_key),
            manifest: manifest_ref,
            outcome,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Best effort: a failed snapshot never fails the run
    async fn save_records_snapshot(&self, group_id: &str, records: &[AnnotationRecord]) {
        let key = self.layout.records_key(group_id);
        let body = match serde_json::to_vec_pretty(records) {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "Failed to serialize records snapshot");
                return;
            }
        };

        match with_retry(&self.settings.retry, self.settings.io_timeout, "write records snapshot", || {
            self.store.write(&key, &body)
        })
        .await
        {
            Ok(()) => debug!(key = %key, records = records.len(), "Saved records snapshot"),
            Err(e) => warn!(key = %key, error = %e, "Failed to save records snapshot"),
        }
    }

    /// Map every planned role to an existing source key, or fail naming all
    /// roles that have none.
    async fn resolve_sources(
        &self,
        group_id: &str,
        plan: &WorkPlan,
    ) -> Result<BTreeMap<CameraRole, String>, ExtractionError> {
        let mut sources = BTreeMap::new();
        let mut missing = Vec::new();

        for role in plan.files.keys() {
            let Some(spec) = self.angles.role_spec(role) else {
                missing.push(role.to_string());
                continue;
            };

            let mut found = None;
            for candidate in self.layout.source_candidates(group_id, role, spec) {
                let exists = with_retry(&self.settings.retry, self.settings.io_timeout, "exists", || {
                    self.store.exists(&candidate)
                })
                .await?;
                if exists {
                    found = Some(candidate);
                    break;
                }
            }

            match found {
                Some(key) => {
                    debug!(role = %role, key = %key, "Resolved source file");
                    sources.insert(role.clone(), key);
                }
                None => missing.push(format!(
                    "{} ({}*{}.mp4)",
                    role,
                    self.layout.source_dir(group_id),
                    spec.file_stem
                )),
            }
        }

        if !missing.is_empty() {
            return Err(ExtractionError::MissingSource {
                group_id: group_id.to_string(),
                missing,
            });
        }

        Ok(sources)
    }

    async fn process_files(
        &self,
        group_id: &str,
        plan: &WorkPlan,
        sources: &BTreeMap<CameraRole, String>,
    ) -> Vec<ClipArtifact> {
        let worker = FileWorker {
            store: Arc::clone(&self.store),
            transcoder: Arc::clone(&self.transcoder),
            settings: self.settings.clone(),
            group_id: group_id.to_string(),
        };

        let jobs: Vec<FileJob> = plan
            .files
            .iter()
            .filter_map(|(role, clips)| {
                sources.get(role).map(|key| FileJob {
                    role: role.clone(),
                    source_key: key.clone(),
                    clips: clips.clone(),
                })
            })
            .collect();

        let mut artifacts = Vec::with_capacity(plan.clips_needed());

        if self.settings.file_concurrency <= 1 || jobs.len() <= 1 {
            for job in jobs {
                artifacts.extend(worker.process(job).await);
            }
            return artifacts;
        }

        let permits = Arc::new(Semaphore::new(self.settings.file_concurrency));
        let mut handles: Vec<(JoinHandle<Vec<ClipArtifact>>, Vec<ClipArtifact>)> = Vec::new();
        let mut guard = AbortOnDrop::default();

        for job in jobs {
            let fallback = worker.pending_artifacts(&job);
            let worker = worker.clone();
            let permits = Arc::clone(&permits);
            let handle = tokio::spawn(async move {
                let _permit = permits.acquire_owned().await.ok();
                worker.process(job).await
            });
            guard.0.push(handle.abort_handle());
            handles.push((handle, fallback));
        }

        for (handle, mut fallback) in handles {
            match handle.await {
                Ok(file_artifacts) => artifacts.extend(file_artifacts),
                Err(e) => {
                    error!(error = %e, "Physical file task aborted");
                    fail_all(&mut fallback, &format!("file task aborted: {}", e));
                    artifacts.extend(fallback);
                }
            }
        }

        artifacts
    }

    /// Entries for every extracted clip, split at record level
    fn build_manifest(&self, group_id: &str, plan: &WorkPlan, artifacts: &[ClipArtifact]) -> GroupManifest {
        let mut by_record: HashMap<&str, Vec<&ClipArtifact>> = HashMap::new();
        for artifact in artifacts.iter().filter(|a| a.is_extracted()) {
            by_record
                .entry(artifact.record_id.as_str())
                .or_default()
                .push(artifact);
        }

        let mut per_record: Vec<Vec<ManifestEntry>> = Vec::new();
        for record in &plan.records {
            let Some(mut clips) = by_record.remove(record.id.as_str()) else {
                continue;
            };
            clips.sort_by(|a, b| a.role.cmp(&b.role));

            let entries: Vec<ManifestEntry> = clips
                .into_iter()
                .filter_map(|clip| {
                    let spec = self.angles.role_spec(&clip.role)?;
                    Some(manifest_entry(record, &clip.role, spec, clip.output_uri.clone()))
                })
                .collect();

            if !entries.is_empty() {
                per_record.push(entries);
            }
        }

        let mut rng = split_rng(group_id, self.settings.split_seed);
        let (training, validation) = split_items(per_record, self.settings.validation_ratio, &mut rng);

        GroupManifest {
            training: training.into_iter().flatten().collect(),
            validation: validation.into_iter().flatten().collect(),
        }
    }

    /// Stage both split files, then promote them under one timestamp.
    ///
    /// On failure every object of this commit is removed again, so neither
    /// staging leftovers nor a lone promoted file survive.
    async fn commit_manifest(
        &self,
        group_id: &str,
        manifest: &GroupManifest,
    ) -> Result<GroupManifestRef, ExtractionError> {
        let ts = commit_timestamp();
        if let Err(e) = self.stage_and_promote(group_id, manifest, &ts).await {
            self.discard_commit(group_id, &ts).await;
            return Err(e);
        }

        info!(
            timestamp = %ts,
            training = manifest.training.len(),
            validation = manifest.validation.len(),
            "Committed manifest pair"
        );

        Ok(GroupManifestRef {
            group_id: group_id.to_string(),
            training_key: self.layout.manifest_key(group_id, Split::Training, &ts),
            validation_key: self.layout.manifest_key(group_id, Split::Validation, &ts),
            timestamp: ts,
        })
    }

    async fn stage_and_promote(
        &self,
        group_id: &str,
        manifest: &GroupManifest,
        ts: &str,
    ) -> Result<(), ExtractionError> {
        let write_error = |message: String| ExtractionError::ManifestWrite {
            group_id: group_id.to_string(),
            message,
        };

        for split in Split::ALL {
            let body = encode_jsonl(manifest.entries(split)).map_err(|e| write_error(e.to_string()))?;
            let staging = self.layout.staging_key(group_id, split, ts);
            with_retry(&self.settings.retry, self.settings.io_timeout, "stage manifest", || {
                self.store.write(&staging, body.as_bytes())
            })
            .await
            .map_err(|e| write_error(format!("{}: {}", staging, e)))?;
        }

        // Nothing is visible to the orchestrator until both renames are done
        for split in [Split::Validation, Split::Training] {
            let staging = self.layout.staging_key(group_id, split, ts);
            let committed = self.layout.manifest_key(group_id, split, ts);
            with_retry(&self.settings.retry, self.settings.io_timeout, "commit manifest", || {
                self.store.rename(&staging, &committed)
            })
            .await
            .map_err(|e| write_error(format!("{}: {}", committed, e)))?;
        }

        Ok(())
    }

    async fn discard_commit(&self, group_id: &str, ts: &str) {
        for split in Split::ALL {
            for key in [
                self.layout.staging_key(group_id, split, ts),
                self.layout.manifest_key(group_id, split, ts),
            ] {
                let deleted = with_retry(&self.settings.retry, self.settings.io_timeout, "discard manifest", || {
                    self.store.delete(&key)
                })
                .await;
                if let Err(e) = deleted {
                    warn!(key = %key, error = %e, "Failed to remove manifest object of failed commit");
                }
            }
        }
    }

    async fn write_failure_marker(&self, group_id: &str, err: &ExtractionError) {
        let ts = commit_timestamp();
        let marker = FailureMarker {
            group_id: group_id.to_string(),
            kind: err.kind(),
            message: err.to_string(),
            timestamp: ts.clone(),
        };

        let body = match serde_json::to_vec_pretty(&marker) {
            Ok(body) => body,
            Err(e) => {
                error!(error = %e, "Failed to serialize failure marker");
                return;
            }
        };

        let key = self.layout.failure_marker_key(group_id, &ts);
        if let Err(e) = with_retry(&self.settings.retry, self.settings.io_timeout, "write failure marker", || {
            self.store.write(&key, &body)
        })
        .await
        {
            error!(key = %key, error = %e, "Failed to write failure marker");
        }
    }
}

/// Processes the clips of one physical file in its own scratch directory
#[derive(Clone)]
struct FileWorker {
    store: Arc<dyn ObjectStore>,
    transcoder: Arc<dyn Transcoder>,
    settings: ExtractionSettings,
    group_id: String,
}

impl FileWorker {
    fn pending_artifacts(&self, job: &FileJob) -> Vec<ClipArtifact> {
        job.clips
            .iter()
            .map(|clip| {
                ClipArtifact::pending(
                    clip.record_id.clone(),
                    job.source_key.clone(),
                    clip.role.clone(),
                    clip.output_key.clone(),
                    self.store.uri(&clip.output_key),
                )
            })
            .collect()
    }

    fn scratch_dir(&self) -> std::io::Result<TempDir> {
        let builder = {
            let mut builder = tempfile::Builder::new();
            builder.prefix("clipforge-");
            builder
        };
        match self.settings.work_dir {
            Some(ref dir) => {
                std::fs::create_dir_all(dir)?;
                builder.tempdir_in(dir)
            }
            None => builder.tempdir(),
        }
    }

    /// Download once, cut and upload every clip, then drop the source.
    ///
    /// Every returned artifact is settled.
    async fn process(&self, job: FileJob) -> Vec<ClipArtifact> {
        let mut artifacts = self.pending_artifacts(&job);

        let scratch = match self.scratch_dir() {
            Ok(dir) => dir,
            Err(e) => {
                error!(group_id = %self.group_id, role = %job.role, error = %e, "Failed to create scratch directory");
                fail_all(&mut artifacts, &format!("scratch directory: {}", e));
                return artifacts;
            }
        };

        let source_path = scratch.path().join(format!("source_{}.mp4", job.role));
        info!(
            group_id = %self.group_id,
            role = %job.role,
            key = %job.source_key,
            clips = job.clips.len(),
            "Downloading source file"
        );

        let downloaded = with_retry(&self.settings.retry, self.settings.io_timeout, "download", || {
            self.store.download(&job.source_key, &source_path)
        })
        .await;

        match downloaded {
            Ok(bytes) => debug!(
                group_id = %self.group_id,
                role = %job.role,
                size_mb = bytes as f64 / 1_048_576.0,
                "Downloaded source file"
            ),
            Err(e) => {
                error!(
                    group_id = %self.group_id,
                    role = %job.role,
                    key = %job.source_key,
                    error = %e,
                    "Source download failed, skipping its clips"
                );
                fail_all(&mut artifacts, &format!("source download failed: {}", e));
                return artifacts;
            }
        }

        let total = job.clips.len();
        for (i, (clip, artifact)) in job.clips.iter().zip(artifacts.iter_mut()).enumerate() {
            self.process_clip(clip, artifact, &source_path, scratch.path()).await;
            if (i + 1) % 20 == 0 && i + 1 < total {
                info!(group_id = %self.group_id, role = %job.role, done = i + 1, total, "Clip progress");
            }
        }

        if let Err(e) = tokio::fs::remove_file(&source_path).await {
            warn!(path = %source_path.display(), error = %e, "Failed to delete source file");
        }

        let extracted = artifacts.iter().filter(|a| a.is_extracted()).count();
        info!(
            group_id = %self.group_id,
            role = %job.role,
            extracted,
            failed = total - extracted,
            "Finished source file"
        );

        artifacts
    }

    async fn process_clip(&self, clip: &ClipJob, artifact: &mut ClipArtifact, source: &Path, scratch: &Path) {
        let file_name = clip.output_key.rsplit('/').next().unwrap_or("clip.mp4");
        let local = scratch.join(file_name);

        if let Err(e) = self
            .transcoder
            .extract_subclip(source, clip.start, clip.end, &local, self.settings.transcode_timeout)
            .await
        {
            warn!(record_id = %clip.record_id, role = %clip.role, error = %e, "Clip extraction failed");
            artifact.settle(ClipStatus::ExtractionFailed, Some(e.to_string()));
            let _ = tokio::fs::remove_file(&local).await;
            return;
        }

        let uploaded = with_retry(&self.settings.retry, self.settings.io_timeout, "upload", || {
            self.store.upload(&local, &clip.output_key)
        })
        .await;

        match uploaded {
            Ok(()) => {
                debug!(record_id = %clip.record_id, key = %clip.output_key, "Uploaded clip");
                artifact.settle(ClipStatus::Extracted, None);
            }
            Err(e) => {
                warn!(record_id = %clip.record_id, key = %clip.output_key, error = %e, "Clip upload failed");
                artifact.settle(ClipStatus::UploadFailed, Some(e.to_string()));
            }
        }

        let _ = tokio::fs::remove_file(&local).await;
    }
}

/// Aborts the file tasks still running when dropped
#[derive(Default)]
struct AbortOnDrop(Vec<AbortHandle>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        for handle in &self.0 {
            handle.abort();
        }
    }
}

fn fail_all(artifacts: &mut [ClipArtifact], reason: &str) {
    for artifact in artifacts {
        artifact.settle(ClipStatus::ExtractionFailed, Some(reason.to_string()));
    }
}
