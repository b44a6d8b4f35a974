//! Prompt text and expected model response for a manifest entry.

use serde_json::json;

use super::angles::RoleSpec;
use crate::domain::{AnnotationRecord, CameraRole, ManifestEntry};

/// Event types a classification or sub-event label may take
pub const CLASSIFICATIONS: &[&str] = &[
    "FG_MAKE",
    "FG_MISS",
    "3PT_MAKE",
    "3PT_MISS",
    "FREE_THROW_MAKE",
    "FREE_THROW_MISS",
    "REBOUND",
    "ASSIST",
    "STEAL",
    "BLOCK",
    "TURNOVER",
    "FOUL",
    "TIMEOUT",
    "SUB",
];

/// Instruction shown to the model alongside a clip from `role`
pub fn build_prompt(role: &CameraRole, spec: &RoleSpec) -> String {
    let labels = CLASSIFICATIONS.join(", ");
    format!(
        "Analyze this basketball clip from the {role} camera angle and identify the play with its events.\n\n\
         The {role} view provides {context}.\n\n\
         For the play, provide:\n\
         1. timestamp_seconds: when the play occurs in the video (number)\n\
         2. classification: the primary event type ({labels})\n\
         3. note: a detailed description of what happened (string)\n\
         4. player_a: the primary player involved (\"Player #X (Color Team)\")\n\
         5. player_b: the secondary player, if any (\"Player #X (Color Team)\")\n\
         6. events: every event in the play, each with:\n   \
         - label: event type (same options as classification)\n   \
         - playerA: player identifier (\"Player #X (Color Team)\")\n   \
         - playerB: secondary player, if any\n\n\
         Return a JSON array holding the single play.",
        role = role,
        context = spec.context,
        labels = labels,
    )
}

/// Ground-truth answer for a record, as a JSON array string
pub fn expected_response(record: &AnnotationRecord) -> String {
    json!([{
        "timestamp_seconds": record.start_offset,
        "classification": record.classification,
        "note": record.note,
        "player_a": record.primary_actor,
        "player_b": record.secondary_actor,
        "events": record.event_list,
    }])
    .to_string()
}

pub fn manifest_entry(
    record: &AnnotationRecord,
    role: &CameraRole,
    spec: &RoleSpec,
    clip_uri: String,
) -> ManifestEntry {
    ManifestEntry {
        clip_uri,
        prompt: build_prompt(role, spec),
        expected_response: expected_response(record),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::AngleTable;
    use crate::domain::AngleTag;

    fn sample_record() -> AnnotationRecord {
        AnnotationRecord {
            id: "p1".to_string(),
            group_id: "g1".to_string(),
            angle_tag: AngleTag::new("LEFT"),
            start_offset: Some(12.5),
            end_offset: Some(18.0),
            classification: Some("FG_MAKE".to_string()),
            note: Some("Corner three".to_string()),
            primary_actor: Some("Player #4 (Blue Team)".to_string()),
            secondary_actor: None,
            event_list: vec![json!({ "type": "assist", "player": "#11" })],
        }
    }

    #[test]
    fn test_prompt_names_role_and_context() {
        let table = AngleTable::default();
        let role = CameraRole::new("NEAR_RIGHT");
        let prompt = build_prompt(&role, table.role_spec(&role).unwrap());

        assert!(prompt.contains("NEAR_RIGHT"));
        assert!(prompt.contains("close-up details of player numbers"));
        assert!(prompt.contains("timestamp_seconds"));
    }

    #[test]
    fn test_prompt_lists_vocabulary_and_event_fields() {
        let table = AngleTable::default();
        let role = CameraRole::new("FAR_LEFT");
        let prompt = build_prompt(&role, table.role_spec(&role).unwrap());

        for label in CLASSIFICATIONS {
            assert!(prompt.contains(label), "missing {}", label);
        }
        assert!(prompt.contains("- label:"));
        assert!(prompt.contains("- playerA:"));
        assert!(prompt.contains("- playerB:"));
        assert!(prompt.contains("wide court view"));
    }

    #[test]
    fn test_expected_response_shape() {
        let parsed: serde_json::Value = serde_json::from_str(&expected_response(&sample_record())).unwrap();
        let items = parsed.as_array().unwrap();
        assert_eq!(items.len(), 1);

        let event = &items[0];
        assert_eq!(event["timestamp_seconds"], 12.5);
        assert_eq!(event["classification"], "FG_MAKE");
        assert_eq!(event["player_a"], "Player #4 (Blue Team)");
        assert!(event["player_b"].is_null());
        assert_eq!(event["events"][0]["type"], "assist");
    }

    #[test]
    fn test_entry_is_deterministic() {
        let table = AngleTable::default();
        let role = CameraRole::new("FAR_LEFT");
        let spec = table.role_spec(&role).unwrap();
        let uri = "file:///data/g1/clips/p1_FAR_LEFT.mp4".to_string();

        let a = manifest_entry(&sample_record(), &role, spec, uri.clone());
        let b = manifest_entry(&sample_record(), &role, spec, uri);
        assert_eq!(a, b);
    }
}
