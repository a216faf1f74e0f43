use serde::{Deserialize, Serialize};

use crate::geometry::BBox;

/// One classified, localized object in a frame.
///
/// Detections never outlive the processing of their frame except as part of
/// the latest-frame snapshot held by the aggregation cache.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// Class label as produced by the detector (e.g. "hand", "pizza").
    #[serde(rename = "class")]
    pub label: String,
    /// Confidence in [0, 1].
    pub confidence: f32,
    #[serde(rename = "bbox")]
    pub bbox: BBox,
}

impl Detection {
    pub fn new(label: impl Into<String>, confidence: f32, bbox: BBox) -> Self {
        Self {
            label: label.into(),
            confidence,
            bbox,
        }
    }

    /// Finite confidence in [0, 1] and a box with positive extent.
    pub fn is_well_formed(&self) -> bool {
        self.confidence.is_finite() && (0.0..=1.0).contains(&self.confidence) && self.bbox.is_valid()
    }
}
