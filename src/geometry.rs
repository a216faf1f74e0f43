//! Axis-aligned box geometry shared by detections and zones.
//!
//! Two overlap measures are used and must not be confused:
//! - `iou`: intersection over union, symmetric, used for duplicate suppression.
//! - `overlap_ratio`: intersection over the smaller box's area, used for the
//!   touch and possession checks. A small hand box mostly covered by a large
//!   item box scores high even though their IoU is low.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use anyhow::anyhow;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

/// Axis-aligned box as `[x1, y1, x2, y2]`.
///
/// Coordinates are whatever system the detector and the zone configuration
/// agree on (pixels or normalized); nothing here assumes one or the other.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f32; 4]", into = "[f32; 4]")]
pub struct BBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl From<[f32; 4]> for BBox {
    fn from(v: [f32; 4]) -> Self {
        Self::new(v[0], v[1], v[2], v[3])
    }
}

impl From<BBox> for [f32; 4] {
    fn from(b: BBox) -> Self {
        [b.x1, b.y1, b.x2, b.y2]
    }
}

impl BBox {
    pub const fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    /// All four coordinates are finite and the box has positive extent.
    pub fn is_valid(&self) -> bool {
        [self.x1, self.y1, self.x2, self.y2]
            .iter()
            .all(|v| v.is_finite())
            && self.x2 > self.x1
            && self.y2 > self.y1
    }

    pub fn center(&self) -> Point {
        Point {
            x: (self.x1 + self.x2) / 2.0,
            y: (self.y1 + self.y2) / 2.0,
        }
    }

    /// Inclusive on every edge.
    pub fn contains(&self, p: Point) -> bool {
        p.x >= self.x1 && p.x <= self.x2 && p.y >= self.y1 && p.y <= self.y2
    }

    pub fn intersection_area(&self, other: &BBox) -> f32 {
        let x_left = self.x1.max(other.x1);
        let y_top = self.y1.max(other.y1);
        let x_right = self.x2.min(other.x2);
        let y_bottom = self.y2.min(other.y2);

        if x_right <= x_left || y_bottom <= y_top {
            return 0.0;
        }
        (x_right - x_left) * (y_bottom - y_top)
    }

    /// Intersection over union. 0.0 when either box is degenerate.
    pub fn iou(&self, other: &BBox) -> f32 {
        let inter = self.intersection_area(other);
        if inter <= 0.0 {
            return 0.0;
        }
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            return 0.0;
        }
        inter / union
    }

    /// Intersection divided by the smaller of the two areas.
    pub fn overlap_ratio(&self, other: &BBox) -> f32 {
        let inter = self.intersection_area(other);
        if inter <= 0.0 {
            return 0.0;
        }
        let smaller = self.area().min(other.area());
        if smaller <= 0.0 {
            return 0.0;
        }
        (inter / smaller).min(1.0)
    }

    pub fn anchor(&self, anchor: Anchor) -> Point {
        match anchor {
            Anchor::Center => self.center(),
            Anchor::TopCenter => Point {
                x: (self.x1 + self.x2) / 2.0,
                y: self.y1,
            },
            Anchor::BottomCenter => Point {
                x: (self.x1 + self.x2) / 2.0,
                y: self.y2,
            },
            Anchor::TopLeft => Point {
                x: self.x1,
                y: self.y1,
            },
            Anchor::TopRight => Point {
                x: self.x2,
                y: self.y1,
            },
            Anchor::BottomLeft => Point {
                x: self.x1,
                y: self.y2,
            },
            Anchor::BottomRight => Point {
                x: self.x2,
                y: self.y2,
            },
        }
    }
}

/// Point of a hand box that is tested for zone membership.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Anchor {
    #[default]
    Center,
    TopCenter,
    BottomCenter,
    TopLeft,
    TopRight,
    BottomLeft,
    BottomRight,
}

impl FromStr for Anchor {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "center" | "centre" => Ok(Self::Center),
            "top_center" => Ok(Self::TopCenter),
            "bottom_center" => Ok(Self::BottomCenter),
            "top_left" => Ok(Self::TopLeft),
            "top_right" => Ok(Self::TopRight),
            "bottom_left" => Ok(Self::BottomLeft),
            "bottom_right" => Ok(Self::BottomRight),
            other => Err(anyhow!("unknown anchor '{}'", other)),
        }
    }
}

/// Configured region where the tool rule is enforced.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Zone {
    pub name: String,
    pub rect: BBox,
}

impl Zone {
    pub fn new(name: impl Into<String>, rect: BBox) -> Self {
        Self {
            name: name.into(),
            rect,
        }
    }
}
