//! Region selection and region-to-detection binding.

use common::geometry::expand_to_square;
use common::types::{DetectedFace, Rect, Region};

pub const REGION_EXPAND_FACTOR: f32 = 1.35;
pub const REGION_MIN_SIDE: f32 = 48.0;
const REGION_DEDUPE_IOU: f32 = 0.45;

/// Turn raw detections into user-selectable regions: square-expand each
/// box, drop the too-small ones, dedupe near-duplicates keeping the first
/// (detections arrive sorted by score).
pub fn detections_to_regions(faces: &[DetectedFace], img_w: u32, img_h: u32) -> Vec<Region> {
    let mut regions: Vec<Region> = Vec::new();
    for face in faces {
        let Some(expanded) =
            expand_to_square(&face.bbox, REGION_EXPAND_FACTOR, REGION_MIN_SIDE, img_w, img_h)
        else {
            continue;
        };
        let duplicate = regions
            .iter()
            .any(|r| r.rect.iou(&expanded) >= REGION_DEDUPE_IOU);
        if !duplicate {
            regions.push(Region {
                rect: expanded,
                face_source_id: None,
            });
        }
    }
    regions
}

/// Bind a user region to a detection: consider detections whose center
/// falls inside the square-expanded region, preferring ones inside the
/// original rectangle, then smaller center distance, then higher score.
/// `None` means "no face in this region" (reported, not fatal).
pub fn bind_region(region: &Rect, faces: &[DetectedFace], img_w: u32, img_h: u32) -> Option<usize> {
    let expanded = expand_to_square(region, REGION_EXPAND_FACTOR, 1.0, img_w, img_h)
        .unwrap_or(*region);
    let (rcx, rcy) = region.center();

    let mut best: Option<(usize, bool, f32, f32)> = None;
    for (i, face) in faces.iter().enumerate() {
        let (cx, cy) = face.bbox.center();
        if !expanded.contains(cx, cy) {
            continue;
        }
        let inside = region.contains(cx, cy);
        let dist = ((cx - rcx) * (cx - rcx) + (cy - rcy) * (cy - rcy)).sqrt();

        let better = match &best {
            None => true,
            Some((_, b_inside, b_dist, b_score)) => {
                (inside, -dist, face.score) > (*b_inside, -*b_dist, *b_score)
            }
        };
        if better {
            best = Some((i, inside, dist, face.score));
        }
    }
    best.map(|(i, _, _, _)| i)
}

/// Index of the detection with the largest box area.
pub fn largest_face(faces: &[DetectedFace]) -> Option<usize> {
    faces
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| {
            a.bbox
                .area()
                .partial_cmp(&b.bbox.area())
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|(i, _)| i)
}
