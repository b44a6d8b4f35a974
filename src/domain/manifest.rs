//! Training manifests: per-entry schema, per-group split, combined dataset.
//!
//! Manifests are JSON Lines, one `ManifestEntry` per line, UTF-8.

use serde::{Deserialize, Serialize};

/// One supervised example: a clip plus the prompt and expected answer
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub clip_uri: String,
    pub prompt: String,
    pub expected_response: String,
}

/// Which side of the dataset split a file holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Split {
    Training,
    Validation,
}

impl Split {
    pub const ALL: [Split; 2] = [Split::Training, Split::Validation];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Training => "training",
            Self::Validation => "validation",
        }
    }
}

/// Per-group manifest, split once by the extraction unit
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupManifest {
    pub training: Vec<ManifestEntry>,
    pub validation: Vec<ManifestEntry>,
}

impl GroupManifest {
    pub fn entries(&self, split: Split) -> &[ManifestEntry] {
        match split {
            Split::Training => &self.training,
            Split::Validation => &self.validation,
        }
    }

    pub fn len(&self) -> usize {
        self.training.len() + self.validation.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Location of a committed group manifest pair in storage.
///
/// Both keys share the same commit timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupManifestRef {
    pub group_id: String,
    pub timestamp: String,
    pub training_key: String,
    pub validation_key: String,
}

impl GroupManifestRef {
    pub fn key(&self, split: Split) -> &str {
        match split {
            Split::Training => &self.training_key,
            Split::Validation => &self.validation_key,
        }
    }
}

/// A group the assembler could not read
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DroppedGroup {
    pub group_id: String,
    pub reason: String,
}

/// The merged dataset handed to the tuning service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombinedManifest {
    pub training_uri: String,
    pub validation_uri: String,
    pub training_entries: usize,
    pub validation_entries: usize,
    pub groups_included: Vec<String>,
    pub groups_dropped: Vec<DroppedGroup>,
}

/// Encode entries as JSON Lines (newline after every entry)
pub fn encode_jsonl(entries: &[ManifestEntry]) -> Result<String, serde_json::Error> {
    let mut out = String::new();
    for entry in entries {
        out.push_str(&serde_json::to_string(entry)?);
        out.push('\n');
    }
    Ok(out)
}

/// Decode JSON Lines, skipping blank lines
pub fn decode_jsonl(content: &str) -> Result<Vec<ManifestEntry>, serde_json::Error> {
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(serde_json::from_str)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(n: u32) -> ManifestEntry {
        ManifestEntry {
            clip_uri: format!("gs://bucket/g1/clips/p{}_FAR_LEFT.mp4", n),
            prompt: "Analyze this clip".to_string(),
            expected_response: "[]".to_string(),
        }
    }

    #[test]
    fn test_jsonl_line_per_entry() {
        let encoded = encode_jsonl(&[entry(1), entry(2)]).unwrap();
        assert_eq!(encoded.lines().count(), 2);
        assert!(encoded.ends_with('\n'));

        let first: serde_json::Value = serde_json::from_str(encoded.lines().next().unwrap()).unwrap();
        assert_eq!(first["clip_uri"], "gs://bucket/g1/clips/p1_FAR_LEFT.mp4");
        assert!(first.get("prompt").is_some());
        assert!(first.get("expected_response").is_some());
    }

    #[test]
    fn test_decode_skips_blank_lines() {
        let content = format!(
            "{}\n\n{}\n",
            serde_json::to_string(&entry(1)).unwrap(),
            serde_json::to_string(&entry(2)).unwrap()
        );
        let decoded = decode_jsonl(&content).unwrap();
        assert_eq!(decoded, vec![entry(1), entry(2)]);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_jsonl("not json\n").is_err());
    }

    #[test]
    fn test_empty_manifest_encodes_to_empty_file() {
        assert_eq!(encode_jsonl(&[]).unwrap(), "");
        assert!(GroupManifest::default().is_empty());
    }
}
