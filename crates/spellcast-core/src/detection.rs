//! Perception output model.
//!
//! A detector reports labeled boxes for one screen capture. Labels that end
//! in [`READY_SUFFIX`] mark a skill that may be cast right now; every other
//! label (`frostbolt_cooldown`, ...) is informational only.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Suffix that marks an actionable label.
pub const READY_SUFFIX: &str = "_ready";

/// A single labeled detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// Class label, e.g. `frostbolt_ready`.
    #[serde(alias = "name")]
    pub label: String,
    #[serde(default)]
    pub confidence: f32,
    /// Bounding box as `[x1, y1, x2, y2]`.
    #[serde(rename = "box", default)]
    pub bbox: [i32; 4],
}

impl Detection {
    pub fn new(label: impl Into<String>, confidence: f32, bbox: [i32; 4]) -> Self {
        Self {
            label: label.into(),
            confidence,
            bbox,
        }
    }

    /// The skill name if this label carries the ready suffix.
    pub fn ready_skill(&self) -> Option<&str> {
        self.label
            .strip_suffix(READY_SUFFIX)
            .filter(|name| !name.is_empty())
    }
}

/// Skill names that are currently ready, with the suffix stripped.
pub fn ready_skills(detections: &[Detection]) -> HashSet<String> {
    detections
        .iter()
        .filter_map(Detection::ready_skill)
        .map(str::to_string)
        .collect()
}

/// Raw labels in detection order, for telemetry.
pub fn labels(detections: &[Detection]) -> Vec<String> {
    detections.iter().map(|d| d.label.clone()).collect()
}

/// Screen capture rectangle as `[x1, y1, x2, y2]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region(pub [i32; 4]);

impl Region {
    pub fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self([x1, y1, x2, y2])
    }

    pub fn width(&self) -> i64 {
        i64::from(self.0[2]) - i64::from(self.0[0])
    }

    pub fn height(&self) -> i64 {
        i64::from(self.0[3]) - i64::from(self.0[1])
    }

    /// A region must have positive width and height.
    pub fn is_valid(&self) -> bool {
        self.width() > 0 && self.height() > 0
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [x1, y1, x2, y2] = self.0;
        write!(f, "{},{},{},{}", x1, y1, x2, y2)
    }
}
