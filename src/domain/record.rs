//! Annotation records as fetched from the metadata store.
//!
//! Records are immutable once fetched. Column names from the upstream
//! `plays` table (`game_id`, `angle`, `start_timestamp`, ...) are accepted as
//! aliases so a raw export deserializes directly.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

/// Logical camera perspective recorded on an annotation (e.g. `LEFT`).
///
/// Tags are resolved to physical camera roles through the angle table,
/// never stored as file names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AngleTag(String);

impl AngleTag {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AngleTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A physical camera position (e.g. `FAR_LEFT`), one source video per role.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CameraRole(String);

impl CameraRole {
    pub fn new(role: impl Into<String>) -> Self {
        Self(role.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CameraRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One annotated event in a group's source footage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotationRecord {
    /// Record identifier (unique within the metadata store)
    pub id: String,

    /// Group (game) the record belongs to
    #[serde(alias = "game_id")]
    pub group_id: String,

    /// Logical angle, mapped to physical roles by the angle table. A missing
    /// or null angle reads as the empty tag, which no table maps.
    #[serde(default, alias = "angle", deserialize_with = "null_as_default")]
    pub angle_tag: AngleTag,

    /// Clip start in seconds from the start of the source video
    #[serde(default, alias = "start_timestamp")]
    pub start_offset: Option<f64>,

    /// Clip end in seconds from the start of the source video
    #[serde(default, alias = "end_timestamp")]
    pub end_offset: Option<f64>,

    #[serde(default)]
    pub classification: Option<String>,

    #[serde(default)]
    pub note: Option<String>,

    #[serde(default, alias = "player_a")]
    pub primary_actor: Option<String>,

    #[serde(default, alias = "player_b")]
    pub secondary_actor: Option<String>,

    /// Sub-events of the play, passed through verbatim
    #[serde(default, alias = "events", deserialize_with = "null_as_empty")]
    pub event_list: Vec<serde_json::Value>,
}

impl AnnotationRecord {
    /// Both offsets, if present and forming a non-empty range
    pub fn clip_range(&self) -> Option<(f64, f64)> {
        match (self.start_offset, self.end_offset) {
            (Some(start), Some(end)) if end > start && start >= 0.0 => Some((start, end)),
            _ => None,
        }
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<serde_json::Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<serde_json::Value>>::deserialize(deserializer)?.unwrap_or_default())
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// A row that could not be read as an annotation record
#[derive(Debug, Clone, PartialEq)]
pub struct MalformedRow {
    /// The row's `id`, when it has a readable one
    pub record_id: Option<String>,
    pub reason: String,
}

/// Everything a metadata store returned for one group
#[derive(Debug, Clone, Default)]
pub struct RecordBatch {
    pub records: Vec<AnnotationRecord>,
    pub malformed: Vec<MalformedRow>,
}

impl RecordBatch {
    pub fn from_records(records: Vec<AnnotationRecord>) -> Self {
        Self {
            records,
            malformed: Vec::new(),
        }
    }

    /// Parse raw rows one at a time; a bad row never hides its neighbours
    pub fn from_rows(rows: Vec<serde_json::Value>) -> Self {
        let mut batch = Self::default();
        for row in rows {
            let record_id = row.get("id").and_then(|id| match id {
                serde_json::Value::String(s) => Some(s.clone()),
                serde_json::Value::Number(n) => Some(n.to_string()),
                _ => None,
            });
            match serde_json::from_value::<AnnotationRecord>(row) {
                Ok(record) => batch.records.push(record),
                Err(e) => batch.malformed.push(MalformedRow {
                    record_id,
                    reason: e.to_string(),
                }),
            }
        }
        batch
    }

    /// Rows returned, readable or not
    pub fn len(&self) -> usize {
        self.records.len() + self.malformed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_upstream_columns() {
        let json = r#"{
            "id": "p1",
            "game_id": "g1",
            "angle": "LEFT",
            "start_timestamp": 12.5,
            "end_timestamp": 18.0,
            "classification": "FG_MAKE",
            "note": "Pull-up jumper",
            "player_a": "Player #4 (Blue Team)",
            "player_b": null,
            "events": null
        }"#;

        let record: AnnotationRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.group_id, "g1");
        assert_eq!(record.angle_tag, AngleTag::new("LEFT"));
        assert_eq!(record.clip_range(), Some((12.5, 18.0)));
        assert_eq!(record.primary_actor.as_deref(), Some("Player #4 (Blue Team)"));
        assert!(record.event_list.is_empty());
    }

    #[test]
    fn test_clip_range_rejects_bad_offsets() {
        let mut record: AnnotationRecord = serde_json::from_str(
            r#"{"id": "p1", "group_id": "g1", "angle_tag": "RIGHT"}"#,
        )
        .unwrap();
        assert_eq!(record.clip_range(), None);

        record.start_offset = Some(10.0);
        record.end_offset = Some(10.0);
        assert_eq!(record.clip_range(), None);

        record.end_offset = Some(9.0);
        assert_eq!(record.clip_range(), None);
    }

    #[test]
    fn test_null_angle_reads_as_empty_tag() {
        let record: AnnotationRecord = serde_json::from_str(
            r#"{"id": "p1", "game_id": "g1", "angle": null, "start_timestamp": 1.0, "end_timestamp": 2.0}"#,
        )
        .unwrap();
        assert_eq!(record.angle_tag.as_str(), "");

        let record: AnnotationRecord =
            serde_json::from_str(r#"{"id": "p2", "game_id": "g1"}"#).unwrap();
        assert_eq!(record.angle_tag, AngleTag::default());
    }

    #[test]
    fn test_batch_keeps_good_rows_next_to_bad_ones() {
        let rows = vec![
            serde_json::json!({ "id": "p1", "game_id": "g1", "angle": "LEFT", "start_timestamp": 1.0, "end_timestamp": 2.0 }),
            serde_json::json!({ "id": 7, "game_id": "g1", "angle": "LEFT", "start_timestamp": "soon" }),
            serde_json::json!({ "game_id": "g1", "angle": "RIGHT" }),
        ];

        let batch = RecordBatch::from_rows(rows);
        assert_eq!(batch.len(), 3);
        assert_eq!(batch.records.len(), 1);
        assert_eq!(batch.records[0].id, "p1");
        assert_eq!(batch.malformed.len(), 2);
        assert_eq!(batch.malformed[0].record_id.as_deref(), Some("7"));
        assert!(batch.malformed[1].record_id.is_none());
    }
}
