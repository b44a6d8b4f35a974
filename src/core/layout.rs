//! Object key layout for sources, clips, manifests and markers.
//!
//! ```text
//! {source_prefix}{group}/game1_farleft.mp4            source video
//! {output_prefix}{group}/clips/{record}_{ROLE}.mp4     extracted clip
//! {output_prefix}{group}/_staging/manifest_{split}_{ts}.jsonl
//! {output_prefix}{group}/manifest_{split}_{ts}.jsonl   committed manifest
//! {output_prefix}{group}/unit_failed_{ts}.json         fatal unit failure
//! {combined_prefix}{dataset}/combined_{split}.jsonl    combined manifest
//! ```

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};

use super::angles::RoleSpec;
use crate::domain::{CameraRole, GroupManifestRef, Split};

/// Timestamp shared by the two files of one manifest commit.
///
/// Sorts lexicographically in time order.
pub fn commit_timestamp() -> String {
    timestamp_of(Utc::now())
}

/// Key timestamp for an instant, comparable with `commit_timestamp()`
pub fn timestamp_of(at: DateTime<Utc>) -> String {
    at.format("%Y%m%d_%H%M%S_%3f").to_string()
}

/// Source file name patterns tried in order, `{stem}`/`{ROLE}` substituted
const SOURCE_PATTERNS: &[&str] = &[
    "game1_{stem}.mp4",
    "game2_{stem}.mp4",
    "game3_{stem}.mp4",
    "test_{stem}.mp4",
    "{stem}.mp4",
    "{ROLE}.mp4",
];

#[derive(Debug, Clone, PartialEq)]
pub struct StorageLayout {
    pub source_prefix: String,
    pub output_prefix: String,
    pub combined_prefix: String,
}

impl Default for StorageLayout {
    fn default() -> Self {
        Self {
            source_prefix: "Games/".to_string(),
            output_prefix: String::new(),
            combined_prefix: "combined/".to_string(),
        }
    }
}

impl StorageLayout {
    /// Directory holding a group's outputs
    pub fn group_dir(&self, group_id: &str) -> String {
        format!("{}{}/", self.output_prefix, group_id)
    }

    /// Directory holding a group's source videos
    pub fn source_dir(&self, group_id: &str) -> String {
        format!("{}{}/", self.source_prefix, group_id)
    }

    /// Candidate keys for a role's source video, most specific first
    pub fn source_candidates(&self, group_id: &str, role: &CameraRole, spec: &RoleSpec) -> Vec<String> {
        let dir = self.source_dir(group_id);
        SOURCE_PATTERNS
            .iter()
            .map(|pattern| {
                let name = pattern
                    .replace("{stem}", &spec.file_stem)
                    .replace("{ROLE}", role.as_str());
                format!("{}{}", dir, name)
            })
            .collect()
    }

    pub fn clip_key(&self, group_id: &str, record_id: &str, role: &CameraRole) -> String {
        format!(
            "{}clips/{}_{}.mp4",
            self.group_dir(group_id),
            sanitize(record_id),
            role
        )
    }

    /// Snapshot of the records a unit fetched, kept for reference
    pub fn records_key(&self, group_id: &str) -> String {
        format!("{}records.json", self.group_dir(group_id))
    }

    pub fn manifest_prefix(&self, group_id: &str) -> String {
        format!("{}manifest_", self.group_dir(group_id))
    }

    pub fn manifest_key(&self, group_id: &str, split: Split, ts: &str) -> String {
        format!("{}{}_{}.jsonl", self.manifest_prefix(group_id), split.as_str(), ts)
    }

    pub fn staging_key(&self, group_id: &str, split: Split, ts: &str) -> String {
        format!(
            "{}_staging/manifest_{}_{}.jsonl",
            self.group_dir(group_id),
            split.as_str(),
            ts
        )
    }

    pub fn failure_marker_prefix(&self, group_id: &str) -> String {
        format!("{}unit_failed_", self.group_dir(group_id))
    }

    pub fn failure_marker_key(&self, group_id: &str, ts: &str) -> String {
        format!("{}{}.json", self.failure_marker_prefix(group_id), ts)
    }

    /// Timestamp of a failure marker key
    pub fn parse_failure_marker_key<'a>(&self, group_id: &str, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(&self.failure_marker_prefix(group_id))?
            .strip_suffix(".json")
    }

    pub fn combined_key(&self, dataset_id: &str, split: Split) -> String {
        format!(
            "{}{}/combined_{}.jsonl",
            self.combined_prefix,
            dataset_id,
            split.as_str()
        )
    }

    /// Split and timestamp of a committed manifest key
    pub fn parse_manifest_key<'a>(&self, group_id: &str, key: &'a str) -> Option<(Split, &'a str)> {
        let rest = key
            .strip_prefix(&self.manifest_prefix(group_id))?
            .strip_suffix(".jsonl")?;
        let (split, ts) = rest.split_once('_')?;
        let split = match split {
            "training" => Split::Training,
            "validation" => Split::Validation,
            _ => return None,
        };
        if ts.is_empty() {
            return None;
        }
        Some((split, ts))
    }

    /// Newest commit for which both split files are present.
    ///
    /// With `since`, commits older than that timestamp are ignored. A lone
    /// training or validation file never counts.
    pub fn latest_complete_pair(
        &self,
        group_id: &str,
        keys: &[String],
        since: Option<&str>,
    ) -> Option<GroupManifestRef> {
        let mut training = BTreeSet::new();
        let mut validation = BTreeSet::new();

        for key in keys {
            if let Some((split, ts)) = self.parse_manifest_key(group_id, key) {
                if since.is_some_and(|cutoff| ts < cutoff) {
                    continue;
                }
                match split {
                    Split::Training => training.insert(ts),
                    Split::Validation => validation.insert(ts),
                };
            }
        }

        let ts = training.intersection(&validation).max()?;
        Some(GroupManifestRef {
            group_id: group_id.to_string(),
            timestamp: ts.to_string(),
            training_key: self.manifest_key(group_id, Split::Training, ts),
            validation_key: self.manifest_key(group_id, Split::Validation, ts),
        })
    }
}

/// Keep record ids from introducing path separators into keys
fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> StorageLayout {
        StorageLayout::default()
    }

    #[test]
    fn test_output_keys() {
        let l = layout();
        assert_eq!(
            l.clip_key("g1", "p42", &CameraRole::new("FAR_LEFT")),
            "g1/clips/p42_FAR_LEFT.mp4"
        );
        assert_eq!(
            l.manifest_key("g1", Split::Training, "20250101_120000_000"),
            "g1/manifest_training_20250101_120000_000.jsonl"
        );
        assert_eq!(
            l.staging_key("g1", Split::Validation, "ts"),
            "g1/_staging/manifest_validation_ts.jsonl"
        );
        assert_eq!(l.failure_marker_key("g1", "ts"), "g1/unit_failed_ts.json");
        assert_eq!(l.records_key("g1"), "g1/records.json");
        assert_eq!(l.combined_key("run-1", Split::Training), "combined/run-1/combined_training.jsonl");
    }

    #[test]
    fn test_clip_key_sanitizes_record_id() {
        assert_eq!(
            layout().clip_key("g1", "a/../b", &CameraRole::new("NEAR_LEFT")),
            "g1/clips/a_.._b_NEAR_LEFT.mp4"
        );
    }

    #[test]
    fn test_source_candidates_order() {
        let spec = RoleSpec {
            file_stem: "farleft".to_string(),
            context: String::new(),
        };
        let candidates = layout().source_candidates("g1", &CameraRole::new("FAR_LEFT"), &spec);
        assert_eq!(candidates.first().unwrap(), "Games/g1/game1_farleft.mp4");
        assert!(candidates.contains(&"Games/g1/farleft.mp4".to_string()));
        assert_eq!(candidates.last().unwrap(), "Games/g1/FAR_LEFT.mp4");
    }

    #[test]
    fn test_parse_manifest_key() {
        let l = layout();
        assert_eq!(
            l.parse_manifest_key("g1", "g1/manifest_validation_20250101_120000_000.jsonl"),
            Some((Split::Validation, "20250101_120000_000"))
        );
        assert_eq!(l.parse_manifest_key("g1", "g1/manifest_other_1.jsonl"), None);
        assert_eq!(l.parse_manifest_key("g1", "g2/manifest_training_1.jsonl"), None);
        assert_eq!(l.parse_manifest_key("g1", "g1/_staging/manifest_training_1.jsonl"), None);
    }

    #[test]
    fn test_lone_file_is_not_a_pair() {
        let l = layout();
        let keys = vec![l.manifest_key("g1", Split::Training, "20250101_000000_000")];
        assert!(l.latest_complete_pair("g1", &keys, None).is_none());
    }

    #[test]
    fn test_latest_complete_pair() {
        let l = layout();
        let keys = vec![
            l.manifest_key("g1", Split::Training, "20250101_000000_000"),
            l.manifest_key("g1", Split::Validation, "20250101_000000_000"),
            l.manifest_key("g1", Split::Training, "20250102_000000_000"),
            l.manifest_key("g1", Split::Validation, "20250102_000000_000"),
            // newest commit still half-written
            l.manifest_key("g1", Split::Validation, "20250103_000000_000"),
        ];

        let pair = l.latest_complete_pair("g1", &keys, None).unwrap();
        assert_eq!(pair.timestamp, "20250102_000000_000");
        assert_eq!(pair.training_key, keys[2]);
        assert_eq!(pair.validation_key, keys[3]);

        assert!(l
            .latest_complete_pair("g1", &keys, Some("20250102_000000_001"))
            .is_none());
    }
}
