//! The violation entity produced by the engine and persisted by the store.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::detect::Detection;
use crate::frame::FrameMeta;
use crate::geometry::BBox;

/// Closed set of violation kinds.
///
/// Parsing an unknown name fails; there is no fallback variant, so a record
/// can never be silently miscategorized.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ViolationType {
    /// A hand inside a zone touched an item without holding the required tool.
    #[serde(rename = "tool-not-used")]
    ToolNotUsed,
}

impl ViolationType {
    pub const ALL: [ViolationType; 1] = [ViolationType::ToolNotUsed];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ToolNotUsed => "tool-not-used",
        }
    }
}

impl fmt::Display for ViolationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown violation type '{0}'")]
pub struct UnknownViolationType(pub String);

impl FromStr for ViolationType {
    type Err = UnknownViolationType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ViolationType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownViolationType(s.to_string()))
    }
}

/// A box implicated in a violation, with the class and confidence it was
/// detected with.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImplicatedBox {
    #[serde(rename = "class")]
    pub label: String,
    pub confidence: f32,
    pub bbox: BBox,
}

impl From<&Detection> for ImplicatedBox {
    fn from(d: &Detection) -> Self {
        Self {
            label: d.label.clone(),
            confidence: d.confidence,
            bbox: d.bbox,
        }
    }
}

/// Boxes keyed by the role they played in the decision.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoleBoxes {
    pub hand: ImplicatedBox,
    pub item: ImplicatedBox,
    /// The closest tool that was checked and judged not held, if any tool
    /// overlapped the hand at all.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<ImplicatedBox>,
}

/// One violation: a single (hand, item) pair in a single frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub stream_id: String,
    pub frame_id: u64,
    pub timestamp_ms: u64,
    pub violation_type: ViolationType,
    pub boxes: RoleBoxes,
    /// Class labels of every detection that survived gating in the frame.
    pub detected_objects: Vec<String>,
    /// Confidences aligned with `detected_objects`.
    pub confidences: Vec<f32>,
}

impl Violation {
    pub fn frame_meta(&self) -> FrameMeta {
        FrameMeta {
            stream_id: self.stream_id.clone(),
            frame_id: self.frame_id,
            timestamp_ms: self.timestamp_ms,
        }
    }
}
