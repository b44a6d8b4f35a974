//! Per-run work-list: which clips to cut from which physical file.
//!
//! Built once at the start of a unit run from the fetched records. Records
//! with an unknown angle tag or unusable offsets are rejected here and never
//! reach the transcoder.

use std::collections::BTreeMap;

use thiserror::Error;

use super::angles::AngleTable;
use super::layout::StorageLayout;
use crate::domain::{AnnotationRecord, CameraRole};

/// Why a record was left out of the work-list
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PlanError {
    #[error("Unknown angle tag '{tag}' (expected one of: {expected})")]
    UnknownAngle { tag: String, expected: String },

    #[error("Invalid clip range for record {record_id}: start={start:?}, end={end:?}")]
    InvalidOffsets {
        record_id: String,
        start: Option<f64>,
        end: Option<f64>,
    },

    #[error("No source file convention for camera role '{role}'")]
    UnknownRole { role: String },
}

/// One sub-clip to cut and upload
#[derive(Debug, Clone, PartialEq)]
pub struct ClipJob {
    pub record_id: String,
    pub role: CameraRole,
    pub start: f64,
    pub end: f64,
    pub output_key: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RejectedRecord {
    pub record_id: String,
    pub reason: PlanError,
}

/// Clip jobs grouped by physical file, one entry per camera role
#[derive(Debug, Clone, Default)]
pub struct WorkPlan {
    /// Accepted records, in fetch order
    pub records: Vec<AnnotationRecord>,

    /// Clip jobs per role; each role is exactly one source video
    pub files: BTreeMap<CameraRole, Vec<ClipJob>>,

    pub rejected: Vec<RejectedRecord>,
}

impl WorkPlan {
    pub fn build(
        group_id: &str,
        records: Vec<AnnotationRecord>,
        angles: &AngleTable,
        layout: &StorageLayout,
    ) -> Self {
        let mut plan = Self::default();

        for record in records {
            match Self::jobs_for(group_id, &record, angles, layout) {
                Ok(jobs) => {
                    for job in jobs {
                        plan.files.entry(job.role.clone()).or_default().push(job);
                    }
                    plan.records.push(record);
                }
                Err(reason) => plan.rejected.push(RejectedRecord {
                    record_id: record.id.clone(),
                    reason,
                }),
            }
        }

        plan
    }

    fn jobs_for(
        group_id: &str,
        record: &AnnotationRecord,
        angles: &AngleTable,
        layout: &StorageLayout,
    ) -> Result<Vec<ClipJob>, PlanError> {
        let roles = angles.roles_for(&record.angle_tag)?;

        let (start, end) = record.clip_range().ok_or_else(|| PlanError::InvalidOffsets {
            record_id: record.id.clone(),
            start: record.start_offset,
            end: record.end_offset,
        })?;

        roles
            .iter()
            .map(|role| {
                if angles.role_spec(role).is_none() {
                    return Err(PlanError::UnknownRole {
                        role: role.to_string(),
                    });
                }
                Ok(ClipJob {
                    record_id: record.id.clone(),
                    role: role.clone(),
                    start,
                    end,
                    output_key: layout.clip_key(group_id, &record.id, role),
                })
            })
            .collect()
    }

    /// Total clips the plan asks for
    pub fn clips_needed(&self) -> usize {
        self.files.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::AngleTag;

    fn record(id: &str, angle: &str, start: f64, end: f64) -> AnnotationRecord {
        AnnotationRecord {
            id: id.to_string(),
            group_id: "g1".to_string(),
            angle_tag: AngleTag::new(angle),
            start_offset: Some(start),
            end_offset: Some(end),
            classification: Some("FG_MAKE".to_string()),
            note: None,
            primary_actor: None,
            secondary_actor: None,
            event_list: Vec::new(),
        }
    }

    #[test]
    fn test_groups_clips_by_physical_file() {
        let records = vec![
            record("p1", "LEFT", 10.0, 15.0),
            record("p2", "RIGHT", 20.0, 24.0),
            record("p3", "LEFT", 30.0, 33.0),
        ];

        let plan = WorkPlan::build("g1", records, &AngleTable::default(), &StorageLayout::default());

        assert_eq!(plan.files.len(), 4);
        assert_eq!(plan.clips_needed(), 6);
        assert!(plan.rejected.is_empty());

        let far_left = &plan.files[&CameraRole::new("FAR_LEFT")];
        let ids: Vec<&str> = far_left.iter().map(|j| j.record_id.as_str()).collect();
        assert_eq!(ids, vec!["p1", "p3"]);
        assert_eq!(far_left[0].output_key, "g1/clips/p1_FAR_LEFT.mp4");
        assert_eq!((far_left[0].start, far_left[0].end), (10.0, 15.0));

        assert_eq!(plan.files[&CameraRole::new("NEAR_LEFT")].len(), 1);
    }

    #[test]
    fn test_bad_records_rejected_individually() {
        let mut no_end = record("p3", "LEFT", 5.0, 6.0);
        no_end.end_offset = None;

        let records = vec![
            record("p1", "LEFT", 10.0, 15.0),
            record("p2", "OVERHEAD", 20.0, 24.0),
            no_end,
            record("p4", "RIGHT", 9.0, 9.0),
        ];

        let plan = WorkPlan::build("g1", records, &AngleTable::default(), &StorageLayout::default());

        assert_eq!(plan.records.len(), 1);
        assert_eq!(plan.clips_needed(), 2);
        assert_eq!(plan.rejected.len(), 3);
        assert!(matches!(plan.rejected[0].reason, PlanError::UnknownAngle { .. }));
        assert!(matches!(plan.rejected[1].reason, PlanError::InvalidOffsets { .. }));
        assert_eq!(plan.rejected[2].record_id, "p4");
    }

    #[test]
    fn test_role_without_spec_rejects_record() {
        let mut angles = AngleTable::default();
        angles
            .angles
            .insert(AngleTag::new("TOP"), vec![CameraRole::new("DRONE")]);

        let plan = WorkPlan::build(
            "g1",
            vec![record("p1", "TOP", 1.0, 2.0)],
            &angles,
            &StorageLayout::default(),
        );
        assert!(plan.is_empty());
        assert!(matches!(plan.rejected[0].reason, PlanError::UnknownRole { .. }));
    }
}
