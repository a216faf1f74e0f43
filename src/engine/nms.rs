//! Class-aware non-maximum suppression.

use crate::detect::Detection;

/// Collapse near-duplicate boxes of the same class.
///
/// Within each class, boxes are visited by descending confidence; a box is
/// suppressed when its IoU with an already kept box of that class exceeds
/// `iou_threshold`. Survivors come back in their original order, so running
/// the pass again over its own output changes nothing.
pub fn suppress_duplicates(detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    if detections.len() < 2 {
        return detections;
    }

    let mut order: Vec<usize> = (0..detections.len()).collect();
    // Stable sort: equal confidences keep detector order.
    order.sort_by(|&a, &b| {
        detections[b]
            .confidence
            .total_cmp(&detections[a].confidence)
    });

    let mut keep = vec![false; detections.len()];
    let mut kept: Vec<usize> = Vec::with_capacity(detections.len());
    for &idx in &order {
        let candidate = &detections[idx];
        let duplicate = kept.iter().any(|&k| {
            let other = &detections[k];
            other.label == candidate.label && other.bbox.iou(&candidate.bbox) > iou_threshold
        });
        if !duplicate {
            keep[idx] = true;
            kept.push(idx);
        }
    }

    detections
        .into_iter()
        .zip(keep)
        .filter_map(|(d, k)| k.then_some(d))
        .collect()
}
