//! Manifest assembler: merges committed group manifests into one dataset.
//!
//! Training and validation lists are concatenated separately, in the order
//! the groups are given. Entries are never re-split or shuffled here.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{info, instrument, warn};

use super::layout::StorageLayout;
use super::retry::{with_retry, RetryPolicy};
use crate::adapters::{ObjectStore, StorageError};
use crate::domain::{
    decode_jsonl, encode_jsonl, CombinedManifest, DroppedGroup, GroupManifestRef, ManifestEntry,
    Split,
};

#[derive(Debug, Error)]
pub enum AssemblyError {
    /// Some groups were unreadable. The combined files were still written
    /// from the readable ones; `combined.groups_dropped` lists the rest.
    #[error("{} of {} group manifests unreadable", .combined.groups_dropped.len(), .combined.groups_dropped.len() + .combined.groups_included.len())]
    PartialInput { combined: CombinedManifest },

    #[error("No group manifests to combine")]
    NoInput,

    #[error("Failed to write combined manifest: {0}")]
    Storage(#[from] StorageError),
}

pub struct ManifestAssembler {
    store: Arc<dyn ObjectStore>,
    layout: StorageLayout,
    retry: RetryPolicy,
    io_timeout: Duration,
}

impl ManifestAssembler {
    pub fn new(store: Arc<dyn ObjectStore>, layout: StorageLayout) -> Self {
        Self {
            store,
            layout,
            retry: RetryPolicy::default(),
            io_timeout: Duration::from_secs(600),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy, io_timeout: Duration) -> Self {
        self.retry = retry;
        self.io_timeout = io_timeout;
        self
    }

    /// Combine `manifests` and write `combined_{training,validation}.jsonl`
    /// under `dataset_id`.
    #[instrument(skip(self, manifests), fields(groups = manifests.len()))]
    pub async fn assemble(
        &self,
        dataset_id: &str,
        manifests: &[GroupManifestRef],
    ) -> Result<CombinedManifest, AssemblyError> {
        if manifests.is_empty() {
            return Err(AssemblyError::NoInput);
        }

        let mut training: Vec<ManifestEntry> = Vec::new();
        let mut validation: Vec<ManifestEntry> = Vec::new();
        let mut included = Vec::new();
        let mut dropped = Vec::new();
        let mut seen = BTreeSet::new();

        for manifest in manifests {
            if !seen.insert(manifest.group_id.as_str()) {
                continue;
            }

            // A group is included whole or not at all
            match self.read_pair(manifest).await {
                Ok((group_training, group_validation)) => {
                    training.extend(group_training);
                    validation.extend(group_validation);
                    included.push(manifest.group_id.clone());
                }
                Err(reason) => {
                    warn!(group_id = %manifest.group_id, reason = %reason, "Dropping unreadable group manifest");
                    dropped.push(DroppedGroup {
                        group_id: manifest.group_id.clone(),
                        reason,
                    });
                }
            }
        }

        let training_key = self.layout.combined_key(dataset_id, Split::Training);
        let validation_key = self.layout.combined_key(dataset_id, Split::Validation);
        self.write_entries(&training_key, &training).await?;
        self.write_entries(&validation_key, &validation).await?;

        let combined = CombinedManifest {
            training_uri: self.store.uri(&training_key),
            validation_uri: self.store.uri(&validation_key),
            training_entries: training.len(),
            validation_entries: validation.len(),
            groups_included: included,
            groups_dropped: dropped,
        };

        info!(
            training = combined.training_entries,
            validation = combined.validation_entries,
            included = combined.groups_included.len(),
            dropped = combined.groups_dropped.len(),
            "Combined manifests"
        );

        if combined.groups_dropped.is_empty() {
            Ok(combined)
        } else {
            Err(AssemblyError::PartialInput { combined })
        }
    }

    async fn read_pair(
        &self,
        manifest: &GroupManifestRef,
    ) -> Result<(Vec<ManifestEntry>, Vec<ManifestEntry>), String> {
        let training = self.read_entries(manifest.key(Split::Training)).await?;
        let validation = self.read_entries(manifest.key(Split::Validation)).await?;
        Ok((training, validation))
    }

    async fn read_entries(&self, key: &str) -> Result<Vec<ManifestEntry>, String> {
        let bytes = with_retry(&self.retry, self.io_timeout, "read manifest", || self.store.read(key))
            .await
            .map_err(|e| format!("{}: {}", key, e))?;
        let content = String::from_utf8(bytes).map_err(|e| format!("{}: not UTF-8: {}", key, e))?;
        decode_jsonl(&content).map_err(|e| format!("{}: malformed line: {}", key, e))
    }

    async fn write_entries(&self, key: &str, entries: &[ManifestEntry]) -> Result<(), AssemblyError> {
        let body = encode_jsonl(entries)
            .map_err(|e| StorageError::Backend(format!("encode {}: {}", key, e)))?;
        with_retry(&self.retry, self.io_timeout, "write combined manifest", || {
            self.store.write(key, body.as_bytes())
        })
        .await?;
        Ok(())
    }

    /// Newest complete manifest pair for each group; groups without one are
    /// reported as dropped.
    pub async fn locate_latest(
        &self,
        group_ids: &[String],
    ) -> Result<(Vec<GroupManifestRef>, Vec<DroppedGroup>), StorageError> {
        let mut found = Vec::new();
        let mut missing = Vec::new();

        for group_id in group_ids {
            let prefix = self.layout.manifest_prefix(group_id);
            let keys = with_retry(&self.retry, self.io_timeout, "list manifests", || self.store.list(&prefix)).await?;
            match self.layout.latest_complete_pair(group_id, &keys, None) {
                Some(manifest) => found.push(manifest),
                None => missing.push(DroppedGroup {
                    group_id: group_id.clone(),
                    reason: "no complete manifest pair".to_string(),
                }),
            }
        }

        Ok((found, missing))
    }
}
