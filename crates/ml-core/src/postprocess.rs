//! Box post-processing shared by detector back-ends.

use crate::Detection;

/// COCO labels for the vehicle classes the service counts.
pub fn vehicle_label(class_id: i64) -> Option<&'static str> {
    match class_id {
        1 => Some("bicycle"),
        2 => Some("car"),
        3 => Some("motorcycle"),
        5 => Some("bus"),
        7 => Some("truck"),
        _ => None,
    }
}

/// Intersection over union of two `[x, y, w, h]` boxes.
pub fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let left = a[0].max(b[0]);
    let top = a[1].max(b[1]);
    let right = (a[0] + a[2]).min(b[0] + b[2]);
    let bottom = (a[1] + a[3]).min(b[1] + b[3]);
    let inter = (right - left).max(0.0) * (bottom - top).max(0.0);
    let union = a[2].max(0.0) * a[3].max(0.0) + b[2].max(0.0) * b[3].max(0.0) - inter;
    if union <= 0.0 { 0.0 } else { inter / union }
}

/// Class-aware greedy non-maximum suppression, highest confidence first.
pub fn non_max_suppression(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<Detection> = Vec::with_capacity(detections.len());
    for candidate in detections {
        let suppressed = kept
            .iter()
            .any(|k| k.class == candidate.class && iou(&k.bbox, &candidate.bbox) > iou_threshold);
        if !suppressed {
            kept.push(candidate);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(bbox: [f32; 4], confidence: f32, class: &str) -> Detection {
        Detection {
            bbox,
            confidence,
            class: class.to_string(),
        }
    }

    #[test]
    fn iou_of_identical_and_disjoint_boxes() {
        let a = [0.0, 0.0, 10.0, 10.0];
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
        assert_eq!(iou(&a, &[20.0, 20.0, 5.0, 5.0]), 0.0);
    }

    #[test]
    fn iou_of_half_overlap() {
        let a = [0.0, 0.0, 10.0, 10.0];
        let b = [5.0, 0.0, 10.0, 10.0];
        assert!((iou(&a, &b) - 50.0 / 150.0).abs() < 1e-6);
    }

    #[test]
    fn nms_drops_overlapping_lower_scores() {
        let kept = non_max_suppression(
            vec![
                det([0.0, 0.0, 10.0, 10.0], 0.6, "car"),
                det([1.0, 1.0, 10.0, 10.0], 0.9, "car"),
                det([50.0, 50.0, 10.0, 10.0], 0.5, "car"),
            ],
            0.45,
        );
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].confidence, 0.9);
        assert_eq!(kept[1].bbox[0], 50.0);
    }

    #[test]
    fn nms_keeps_overlaps_of_different_classes() {
        let kept = non_max_suppression(
            vec![
                det([0.0, 0.0, 10.0, 10.0], 0.8, "car"),
                det([0.0, 0.0, 10.0, 10.0], 0.7, "truck"),
            ],
            0.45,
        );
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn vehicle_labels() {
        assert_eq!(vehicle_label(2), Some("car"));
        assert_eq!(vehicle_label(0), None);
    }
}
