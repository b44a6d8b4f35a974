//! Metadata store over a directory of JSON exports.
//!
//! Each group is one file, `{dir}/{group_id}.json`, holding an array of
//! records. A missing file means the group has no records.

use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;

use super::{sort_records, MetadataStore};
use crate::domain::RecordBatch;

pub struct JsonDirMetadataStore {
    dir: PathBuf,
}

impl JsonDirMetadataStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn group_path(&self, group_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", group_id))
    }
}

#[async_trait]
impl MetadataStore for JsonDirMetadataStore {
    fn name(&self) -> &str {
        "json_dir"
    }

    async fn fetch_records(&self, group_id: &str) -> Result<RecordBatch> {
        let path = self.group_path(group_id);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(RecordBatch::default()),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.display()))
            }
        };

        let mut rows: Vec<serde_json::Value> = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse records in {}", path.display()))?;

        // Exports may mix groups; rows without a readable group stay in
        rows.retain(|row| row_group(row).map_or(true, |g| g == group_id));

        let mut batch = RecordBatch::from_rows(rows);
        sort_records(&mut batch.records);
        Ok(batch)
    }
}

fn row_group(row: &serde_json::Value) -> Option<&str> {
    row.get("group_id")
        .or_else(|| row.get("game_id"))
        .and_then(|g| g.as_str())
}
