//! Angle lookup table: logical angle tags to physical camera roles.
//!
//! New camera conventions are configuration, not code. The table is loaded
//! from the `angles` section of the config file and falls back to the
//! built-in LEFT/RIGHT mapping.

use std::collections::BTreeMap;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use super::planner::PlanError;
use crate::domain::{AngleTag, CameraRole};

/// How a camera role is found in storage and described in prompts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleSpec {
    /// File name stem of the role's source video (e.g. `farleft`)
    pub file_stem: String,

    /// What this view contributes, quoted in the prompt
    pub context: String,
}

/// Finite mapping `angle_tag -> [camera role]` plus per-role details
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AngleTable {
    pub angles: BTreeMap<AngleTag, Vec<CameraRole>>,
    pub roles: BTreeMap<CameraRole, RoleSpec>,
}

const FAR_CONTEXT: &str = "wide court view and team formation context";
const NEAR_CONTEXT: &str = "close-up details of player numbers and jerseys";

impl Default for AngleTable {
    /// Each side pairs its far camera with the opposite near camera, so the
    /// two clips cover the whole court without repeating a camera.
    fn default() -> Self {
        let role = |name: &str| CameraRole::new(name);
        let spec = |stem: &str, context: &str| RoleSpec {
            file_stem: stem.to_string(),
            context: context.to_string(),
        };

        let angles = BTreeMap::from([
            (AngleTag::new("LEFT"), vec![role("FAR_LEFT"), role("NEAR_RIGHT")]),
            (AngleTag::new("RIGHT"), vec![role("FAR_RIGHT"), role("NEAR_LEFT")]),
        ]);

        let roles = BTreeMap::from([
            (role("FAR_LEFT"), spec("farleft", FAR_CONTEXT)),
            (role("FAR_RIGHT"), spec("farright", FAR_CONTEXT)),
            (role("NEAR_LEFT"), spec("nearleft", NEAR_CONTEXT)),
            (role("NEAR_RIGHT"), spec("nearright", NEAR_CONTEXT)),
        ]);

        Self { angles, roles }
    }
}

impl AngleTable {
    /// Physical roles required by an angle tag
    pub fn roles_for(&self, tag: &AngleTag) -> Result<&[CameraRole], PlanError> {
        self.angles
            .get(tag)
            .map(Vec::as_slice)
            .ok_or_else(|| PlanError::UnknownAngle {
                tag: tag.to_string(),
                expected: self.known_tags(),
            })
    }

    /// Storage and prompt details for a role
    pub fn role_spec(&self, role: &CameraRole) -> Option<&RoleSpec> {
        self.roles.get(role)
    }

    fn known_tags(&self) -> String {
        self.angles
            .keys()
            .map(AngleTag::as_str)
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Check that the table is usable: every referenced role is described,
    /// and no tag lists the same role twice.
    pub fn validate(&self) -> Result<()> {
        if self.angles.is_empty() {
            anyhow::bail!("Angle table has no angle tags");
        }

        for (tag, roles) in &self.angles {
            if roles.is_empty() {
                anyhow::bail!("Angle tag '{}' maps to no camera roles", tag);
            }
            for (i, role) in roles.iter().enumerate() {
                if !self.roles.contains_key(role) {
                    anyhow::bail!("Angle tag '{}' references unknown camera role '{}'", tag, role);
                }
                if roles[..i].contains(role) {
                    anyhow::bail!("Angle tag '{}' lists camera role '{}' twice", tag, role);
                }
            }
        }

        Ok(())
    }
}
