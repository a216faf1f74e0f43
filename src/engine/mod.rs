//! Violation engine: turns one frame's detections into violation decisions.
//!
//! Per frame:
//! 1. Gate: malformed detections and those under the confidence threshold are
//!    dropped and never seen again, not even in the cached snapshot.
//! 2. Suppress duplicate boxes per class (IoU, see `nms`).
//! 3. For each hand whose anchor lies in a zone and which holds no tool, the
//!    first item it touches yields one `tool-not-used` violation.
//!
//! Touch and possession use `BBox::overlap_ratio` (intersection over the
//! smaller area). Every threshold comparison is strict.

mod nms;

pub use nms::suppress_duplicates;

use serde::{Deserialize, Serialize};

use crate::detect::Detection;
use crate::frame::FrameMeta;
use crate::geometry::{Anchor, Zone};
use crate::violation::{ImplicatedBox, RoleBoxes, Violation, ViolationType};

pub const DEFAULT_CONF_THRESHOLD: f32 = 0.3;
pub const DEFAULT_IOU_THRESHOLD: f32 = 0.45;
pub const DEFAULT_POSSESSION_OVERLAP: f32 = 0.05;
pub const DEFAULT_TOUCH_OVERLAP: f32 = 0.1;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    /// Detections below this confidence are discarded.
    pub conf: f32,
    /// Same-class boxes with IoU above this are duplicates.
    pub iou: f32,
    /// Tool overlap above this means the hand holds the tool.
    pub possession: f32,
    /// Item overlap above this means the hand touches the item.
    pub touch: f32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            conf: DEFAULT_CONF_THRESHOLD,
            iou: DEFAULT_IOU_THRESHOLD,
            possession: DEFAULT_POSSESSION_OVERLAP,
            touch: DEFAULT_TOUCH_OVERLAP,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Hand,
    Item,
    Tool,
}

/// Detector class labels assigned to each role.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleLabels {
    pub hands: Vec<String>,
    pub items: Vec<String>,
    pub tools: Vec<String>,
}

impl Default for RoleLabels {
    fn default() -> Self {
        Self {
            hands: vec!["hand".to_string()],
            items: vec!["pizza".to_string()],
            tools: vec!["scooper".to_string()],
        }
    }
}

impl RoleLabels {
    /// Every label of every role.
    pub fn all(&self) -> Vec<String> {
        self.hands
            .iter()
            .chain(&self.items)
            .chain(&self.tools)
            .cloned()
            .collect()
    }

    pub fn role_of(&self, label: &str) -> Option<Role> {
        if self.hands.iter().any(|l| l == label) {
            Some(Role::Hand)
        } else if self.items.iter().any(|l| l == label) {
            Some(Role::Item)
        } else if self.tools.iter().any(|l| l == label) {
            Some(Role::Tool)
        } else {
            None
        }
    }
}

/// Outcome of evaluating one frame.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Assessment {
    /// Detections that passed gating and duplicate suppression.
    pub detections: Vec<Detection>,
    pub violations: Vec<Violation>,
}

/// Stateless evaluator holding the process-wide zones and thresholds.
///
/// Shared read-only between workers; nothing is carried from one frame to
/// the next.
#[derive(Clone, Debug)]
pub struct ViolationEngine {
    zones: Vec<Zone>,
    thresholds: Thresholds,
    anchor: Anchor,
    labels: RoleLabels,
}

impl ViolationEngine {
    pub fn new(zones: Vec<Zone>, thresholds: Thresholds) -> Self {
        Self {
            zones,
            thresholds,
            anchor: Anchor::default(),
            labels: RoleLabels::default(),
        }
    }

    pub fn with_anchor(mut self, anchor: Anchor) -> Self {
        self.anchor = anchor;
        self
    }

    pub fn with_labels(mut self, labels: RoleLabels) -> Self {
        self.labels = labels;
        self
    }

    pub fn zones(&self) -> &[Zone] {
        &self.zones
    }

    pub fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }

    pub fn evaluate(&self, meta: &FrameMeta, detections: &[Detection]) -> Vec<Violation> {
        self.assess(meta, detections).violations
    }

    pub fn assess(&self, meta: &FrameMeta, detections: &[Detection]) -> Assessment {
        assess_frame(
            meta,
            detections,
            &self.zones,
            &self.thresholds,
            self.anchor,
            &self.labels,
        )
    }
}

/// Evaluate one frame with the default anchor and labels.
pub fn evaluate(
    meta: &FrameMeta,
    detections: &[Detection],
    zones: &[Zone],
    thresholds: &Thresholds,
) -> Vec<Violation> {
    assess_frame(
        meta,
        detections,
        zones,
        thresholds,
        Anchor::default(),
        &RoleLabels::default(),
    )
    .violations
}

fn assess_frame(
    meta: &FrameMeta,
    detections: &[Detection],
    zones: &[Zone],
    thresholds: &Thresholds,
    anchor: Anchor,
    labels: &RoleLabels,
) -> Assessment {
    let gated: Vec<Detection> = detections
        .iter()
        .filter(|d| d.is_well_formed() && d.confidence >= thresholds.conf)
        .cloned()
        .collect();
    // Detections without a role take no part in the decision and are not
    // reported with it.
    let survivors: Vec<Detection> = suppress_duplicates(gated, thresholds.iou)
        .into_iter()
        .filter(|d| labels.role_of(&d.label).is_some())
        .collect();

    let mut hands = Vec::new();
    let mut items = Vec::new();
    let mut tools = Vec::new();
    for d in &survivors {
        match labels.role_of(&d.label) {
            Some(Role::Hand) => hands.push(d),
            Some(Role::Item) => items.push(d),
            Some(Role::Tool) => tools.push(d),
            None => {}
        }
    }

    let mut violations = Vec::new();
    if !hands.is_empty() && !items.is_empty() {
        let detected_objects: Vec<String> = survivors.iter().map(|d| d.label.clone()).collect();
        let confidences: Vec<f32> = survivors.iter().map(|d| d.confidence).collect();

        for hand in hands {
            let point = hand.bbox.anchor(anchor);
            if !zones.iter().any(|z| z.rect.contains(point)) {
                continue;
            }

            // Closest tool, held or not.
            let nearest_tool = tools
                .iter()
                .map(|t| (*t, hand.bbox.overlap_ratio(&t.bbox)))
                .filter(|(_, overlap)| *overlap > 0.0)
                .fold(None::<(&Detection, f32)>, |best, cur| match best {
                    Some(b) if b.1 >= cur.1 => Some(b),
                    _ => Some(cur),
                });
            if matches!(nearest_tool, Some((_, overlap)) if overlap > thresholds.possession) {
                continue;
            }

            let touched = items
                .iter()
                .find(|item| hand.bbox.overlap_ratio(&item.bbox) > thresholds.touch);
            if let Some(item) = touched {
                log::debug!(
                    "{}: hand {:?} touched {} {:?} without a tool",
                    meta,
                    hand.bbox,
                    item.label,
                    item.bbox
                );
                violations.push(Violation {
                    stream_id: meta.stream_id.clone(),
                    frame_id: meta.frame_id,
                    timestamp_ms: meta.timestamp_ms,
                    violation_type: ViolationType::ToolNotUsed,
                    boxes: RoleBoxes {
                        hand: ImplicatedBox::from(hand),
                        item: ImplicatedBox::from(*item),
                        tool: nearest_tool.map(|(t, _)| ImplicatedBox::from(t)),
                    },
                    detected_objects: detected_objects.clone(),
                    confidences: confidences.clone(),
                });
            }
        }
    }

    Assessment {
        detections: survivors,
        violations,
    }
}
