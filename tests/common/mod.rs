//! In-memory fakes shared by the integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use clipforge::adapters::{
    Dispatch, MetadataStore, ObjectStore, StorageError, StorageResult, TranscodeError, Transcoder,
    UnitInvoker,
};
use clipforge::core::{
    commit_timestamp, ExtractionSettings, FailureKind, FailureMarker, RetryPolicy, StorageLayout,
};
use clipforge::domain::{
    encode_jsonl, AngleTag, AnnotationRecord, ManifestEntry, RecordBatch, Split,
};

/// Bucket held in memory, with per-key download counters and failure
/// injection.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    downloads: Mutex<HashMap<String, usize>>,
    failing_downloads: Mutex<HashSet<String>>,
    failing_reads: Mutex<HashSet<String>>,
    failing_uploads: Mutex<HashSet<String>>,
    failing_renames: Mutex<Vec<String>>,
}

impl MemoryObjectStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn put(&self, key: &str, data: impl Into<Vec<u8>>) {
        self.objects.lock().unwrap().insert(key.to_string(), data.into());
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.lock().unwrap().contains_key(key)
    }

    pub fn remove(&self, key: &str) {
        self.objects.lock().unwrap().remove(key);
    }

    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.objects
            .lock()
            .unwrap()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect()
    }

    pub fn download_count(&self, key: &str) -> usize {
        self.downloads.lock().unwrap().get(key).copied().unwrap_or(0)
    }

    pub fn total_downloads(&self) -> usize {
        self.downloads.lock().unwrap().values().sum()
    }

    /// Every download of `key` fails with a transient backend error
    pub fn fail_downloads_of(&self, key: &str) {
        self.failing_downloads.lock().unwrap().insert(key.to_string());
    }

    /// Every read of `key` fails with a transient backend error
    pub fn fail_reads_of(&self, key: &str) {
        self.failing_reads.lock().unwrap().insert(key.to_string());
    }

    /// Every upload to `key` fails with a transient backend error
    pub fn fail_uploads_of(&self, key: &str) {
        self.failing_uploads.lock().unwrap().insert(key.to_string());
    }

    /// Every rename whose target contains `pattern` fails
    pub fn fail_renames_into(&self, pattern: &str) {
        self.failing_renames.lock().unwrap().push(pattern.to_string());
    }

    pub fn manifest_entries(&self, key: &str) -> Vec<ManifestEntry> {
        let bytes = self.get(key).unwrap_or_else(|| panic!("missing object {}", key));
        clipforge::domain::decode_jsonl(&String::from_utf8(bytes).unwrap()).unwrap()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    fn name(&self) -> &str {
        "memory"
    }

    fn uri(&self, key: &str) -> String {
        format!("mem://bucket/{}", key)
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        Ok(self.contains(key))
    }

    async fn download(&self, key: &str, local_path: &Path) -> StorageResult<u64> {
        *self.downloads.lock().unwrap().entry(key.to_string()).or_insert(0) += 1;
        if self.failing_downloads.lock().unwrap().contains(key) {
            return Err(StorageError::Backend(format!("injected download failure: {}", key)));
        }
        let data = self.get(key).ok_or_else(|| StorageError::NotFound(key.to_string()))?;
        tokio::fs::write(local_path, &data).await?;
        Ok(data.len() as u64)
    }

    async fn upload(&self, local_path: &Path, key: &str) -> StorageResult<()> {
        if self.failing_uploads.lock().unwrap().contains(key) {
            return Err(StorageError::Backend(format!("injected upload failure: {}", key)));
        }
        let data = tokio::fs::read(local_path).await?;
        self.put(key, data);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        Ok(self.keys_with_prefix(prefix))
    }

    async fn read(&self, key: &str) -> StorageResult<Vec<u8>> {
        if self.failing_reads.lock().unwrap().contains(key) {
            return Err(StorageError::Backend(format!("injected read failure: {}", key)));
        }
        self.get(key).ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn write(&self, key: &str, data: &[u8]) -> StorageResult<()> {
        self.put(key, data);
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> StorageResult<()> {
        if self.failing_renames.lock().unwrap().iter().any(|p| to.contains(p.as_str())) {
            return Err(StorageError::Backend(format!("injected rename failure: {}", to)));
        }
        let mut objects = self.objects.lock().unwrap();
        let data = objects
            .remove(from)
            .ok_or_else(|| StorageError::NotFound(from.to_string()))?;
        objects.insert(to.to_string(), data);
        Ok(())
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.remove(key);
        Ok(())
    }
}

/// Records per group, with optional hard failures
#[derive(Default)]
pub struct FakeMetadataStore {
    records: Mutex<HashMap<String, Vec<AnnotationRecord>>>,
    failing: Mutex<HashSet<String>>,
}

impl FakeMetadataStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, group_id: &str, records: Vec<AnnotationRecord>) {
        self.records.lock().unwrap().insert(group_id.to_string(), records);
    }

    pub fn fail_group(&self, group_id: &str) {
        self.failing.lock().unwrap().insert(group_id.to_string());
    }
}

#[async_trait]
impl MetadataStore for FakeMetadataStore {
    fn name(&self) -> &str {
        "fake"
    }

    async fn fetch_records(&self, group_id: &str) -> Result<RecordBatch> {
        if self.failing.lock().unwrap().contains(group_id) {
            anyhow::bail!("metadata backend unavailable");
        }
        let mut records = self
            .records
            .lock()
            .unwrap()
            .get(group_id)
            .cloned()
            .unwrap_or_default();
        clipforge::adapters::sort_records(&mut records);
        Ok(RecordBatch::from_records(records))
    }
}

/// Writes a small text file instead of cutting video. Sources whose file
/// name contains a failing role are rejected.
///
/// Each call also records how many files sit in the scratch directory it
/// writes into.
#[derive(Default)]
pub struct FakeTranscoder {
    calls: AtomicUsize,
    max_scratch_files: AtomicUsize,
    failing_roles: Mutex<HashSet<String>>,
    delay: Mutex<Option<Duration>>,
}

impl FakeTranscoder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_role(&self, role: &str) {
        self.failing_roles.lock().unwrap().insert(role.to_string());
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Most files ever seen in a scratch directory when a cut started
    pub fn max_scratch_files(&self) -> usize {
        self.max_scratch_files.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transcoder for FakeTranscoder {
    fn name(&self) -> &str {
        "fake"
    }

    async fn extract_subclip(
        &self,
        source: &Path,
        start: f64,
        end: f64,
        dest: &Path,
        _timeout: Duration,
    ) -> std::result::Result<(), TranscodeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if let Some(scratch) = dest.parent() {
            let files = std::fs::read_dir(scratch).map(|d| d.count()).unwrap_or(0);
            self.max_scratch_files.fetch_max(files, Ordering::SeqCst);
        }

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let source_name = source
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let failing = self
            .failing_roles
            .lock()
            .unwrap()
            .iter()
            .any(|role| source_name.contains(role.as_str()));
        if failing {
            return Err(TranscodeError::Failed {
                code: 1,
                stderr: format!("injected failure for {}", source_name),
            });
        }

        tokio::fs::write(dest, format!("clip {:.1}-{:.1}", start, end))
            .await
            .map_err(|e| TranscodeError::Spawn {
                binary: "fake".to_string(),
                source: e,
            })
    }
}

/// What a scripted unit does for one group when invoked
#[derive(Debug, Clone)]
pub enum Script {
    /// Commit a manifest pair with the given entry counts
    Commit { training: usize, validation: usize },
    /// Commit after a delay, in the background
    CommitAfter {
        delay: Duration,
        training: usize,
        validation: usize,
    },
    /// Write only the training file, as a unit that crashed mid-commit
    HalfCommit,
    /// Write a failure marker of this kind
    Marker(FailureKind),
    /// Reject the invocation
    RejectDispatch,
    /// Accept the invocation and never produce anything
    Silent,
}

/// Invoker that plays scripted unit behavior against the store
pub struct ScriptedInvoker {
    store: Arc<MemoryObjectStore>,
    layout: StorageLayout,
    scripts: HashMap<String, Script>,
    invoked: Mutex<Vec<String>>,
}

impl ScriptedInvoker {
    pub fn new(store: Arc<MemoryObjectStore>, scripts: &[(&str, Script)]) -> Arc<Self> {
        Arc::new(Self {
            store,
            layout: StorageLayout::default(),
            scripts: scripts
                .iter()
                .map(|(g, s)| (g.to_string(), s.clone()))
                .collect(),
            invoked: Mutex::new(Vec::new()),
        })
    }

    pub fn invoked(&self) -> Vec<String> {
        self.invoked.lock().unwrap().clone()
    }
}

#[async_trait]
impl UnitInvoker for ScriptedInvoker {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn invoke(&self, group_id: &str) -> Result<Dispatch> {
        self.invoked.lock().unwrap().push(group_id.to_string());

        match self.scripts.get(group_id).cloned().unwrap_or(Script::Silent) {
            Script::Commit { training, validation } => {
                commit_pair(&self.store, &self.layout, group_id, training, validation);
            }
            Script::CommitAfter {
                delay,
                training,
                validation,
            } => {
                let store = Arc::clone(&self.store);
                let layout = self.layout.clone();
                let group_id = group_id.to_string();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    commit_pair(&store, &layout, &group_id, training, validation);
                });
            }
            Script::HalfCommit => {
                let ts = commit_timestamp();
                let body = encode_jsonl(&entries(group_id, "t", 2)).unwrap();
                self.store
                    .put(&self.layout.manifest_key(group_id, Split::Training, &ts), body);
            }
            Script::Marker(kind) => {
                let ts = commit_timestamp();
                let marker = FailureMarker {
                    group_id: group_id.to_string(),
                    kind,
                    message: format!("{:?} for {}", kind, group_id),
                    timestamp: ts.clone(),
                };
                self.store.put(
                    &self.layout.failure_marker_key(group_id, &ts),
                    serde_json::to_vec(&marker).unwrap(),
                );
            }
            Script::RejectDispatch => anyhow::bail!("connection refused"),
            Script::Silent => {}
        }

        Ok(Dispatch::Accepted)
    }
}

/// Manifest entries with recognizable clip URIs
pub fn entries(group_id: &str, tag: &str, n: usize) -> Vec<ManifestEntry> {
    (0..n)
        .map(|i| ManifestEntry {
            clip_uri: format!("mem://bucket/{}/clips/{}{}.mp4", group_id, tag, i),
            prompt: "Describe the play".to_string(),
            expected_response: "[]".to_string(),
        })
        .collect()
}

/// Commit a manifest pair the way a unit does and return its timestamp
pub fn commit_pair(
    store: &MemoryObjectStore,
    layout: &StorageLayout,
    group_id: &str,
    training: usize,
    validation: usize,
) -> String {
    let ts = commit_timestamp();
    commit_pair_at(store, layout, group_id, &ts, training, validation);
    ts
}

pub fn commit_pair_at(
    store: &MemoryObjectStore,
    layout: &StorageLayout,
    group_id: &str,
    ts: &str,
    training: usize,
    validation: usize,
) {
    store.put(
        &layout.manifest_key(group_id, Split::Training, ts),
        encode_jsonl(&entries(group_id, "t", training)).unwrap(),
    );
    store.put(
        &layout.manifest_key(group_id, Split::Validation, ts),
        encode_jsonl(&entries(group_id, "v", validation)).unwrap(),
    );
}

pub fn record(id: &str, group_id: &str, angle: &str, start: f64, end: f64) -> AnnotationRecord {
    AnnotationRecord {
        id: id.to_string(),
        group_id: group_id.to_string(),
        angle_tag: AngleTag::new(angle),
        start_offset: Some(start),
        end_offset: Some(end),
        classification: Some("rebound".to_string()),
        note: None,
        primary_actor: Some("12".to_string()),
        secondary_actor: None,
        event_list: Vec::new(),
    }
}

/// Put all four default-table source videos for a group in the store
pub fn seed_sources(store: &MemoryObjectStore, group_id: &str) {
    for stem in ["farleft", "farright", "nearleft", "nearright"] {
        store.put(&format!("Games/{}/game1_{}.mp4", group_id, stem), format!("video {}", stem));
    }
}

/// Fast settings for tests: no backoff to speak of, fixed split seed
pub fn test_settings() -> ExtractionSettings {
    ExtractionSettings {
        transcode_timeout: Duration::from_secs(5),
        io_timeout: Duration::from_secs(5),
        unit_timeout: Duration::from_secs(30),
        retry: RetryPolicy {
            max_attempts: 2,
            initial_delay_ms: 1,
            max_delay_ms: 5,
            backoff_multiplier: 2.0,
        },
        split_seed: Some(42),
        ..ExtractionSettings::default()
    }
}
