//! Identity tracking across video frames.
//!
//! Tracks are seeded once at the user-chosen key frame from the face-source
//! bindings, then advanced by IoU match with a centroid fallback. Detection
//! runs exactly once per frame; the tracker never triggers re-detection
//! after a swap.

use tracing::debug;

use common::types::Rect;

/// A track expires after this many consecutive unmatched frames.
pub const MAX_MISSED_FRAMES: u32 = 45;
const MATCH_IOU_THRESHOLD: f32 = 0.05;
const CENTROID_RADIUS_FACTOR: f32 = 0.65;

/// A stateful identity anchor across frames.
#[derive(Debug, Clone)]
pub struct FaceTrack {
    pub track_id: u32,
    pub face_source_id: String,
    pub last_bbox: Rect,
    pub missed_frames: u32,
}

#[derive(Debug, Default)]
pub struct IdentityTracker {
    tracks: Vec<FaceTrack>,
    next_track_id: u32,
}

impl IdentityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed tracks at the key frame: one per resolved binding.
    pub fn seed(&mut self, assignments: impl IntoIterator<Item = (Rect, String)>) {
        for (bbox, face_source_id) in assignments {
            let track_id = self.next_track_id;
            self.next_track_id += 1;
            debug!(track_id, %face_source_id, "seeded track");
            self.tracks.push(FaceTrack {
                track_id,
                face_source_id,
                last_bbox: bbox,
                missed_frames: 0,
            });
        }
    }

    pub fn active_tracks(&self) -> &[FaceTrack] {
        &self.tracks
    }

    /// Advance all tracks against this frame's detections. Returns
    /// `(detection index, face_source_id)` pairs for the matched tracks.
    /// Unmatched detections stay unbound; a face re-appearing after its
    /// track expired does not pick a binding back up.
    pub fn advance(&mut self, detections: &[Rect]) -> Vec<(usize, String)> {
        let mut assigned = vec![false; detections.len()];
        let mut matches = Vec::new();

        for track in &mut self.tracks {
            let found = best_match(&track.last_bbox, detections, &assigned);
            match found {
                Some(i) => {
                    assigned[i] = true;
                    track.last_bbox = detections[i];
                    track.missed_frames = 0;
                    matches.push((i, track.face_source_id.clone()));
                }
                None => {
                    track.missed_frames += 1;
                }
            }
        }

        let before = self.tracks.len();
        self.tracks.retain(|t| t.missed_frames <= MAX_MISSED_FRAMES);
        if self.tracks.len() != before {
            debug!(dropped = before - self.tracks.len(), "expired stale tracks");
        }

        matches
    }
}

/// Prefer the unassigned detection with the highest IoU at or above the
/// threshold; fall back to the nearest centroid within a radius scaled by
/// the track's own diagonal.
fn best_match(last_bbox: &Rect, detections: &[Rect], assigned: &[bool]) -> Option<usize> {
    let mut best_iou: Option<(usize, f32)> = None;
    for (i, det) in detections.iter().enumerate() {
        if assigned[i] {
            continue;
        }
        let iou = last_bbox.iou(det);
        if iou >= MATCH_IOU_THRESHOLD && best_iou.map_or(true, |(_, b)| iou > b) {
            best_iou = Some((i, iou));
        }
    }
    if let Some((i, _)) = best_iou {
        return Some(i);
    }

    let radius = CENTROID_RADIUS_FACTOR * last_bbox.diagonal();
    let mut best_dist: Option<(usize, f32)> = None;
    for (i, det) in detections.iter().enumerate() {
        if assigned[i] {
            continue;
        }
        let dist = last_bbox.centroid_distance(det);
        if dist <= radius && best_dist.map_or(true, |(_, b)| dist < b) {
            best_dist = Some((i, dist));
        }
    }
    best_dist.map(|(i, _)| i)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rect(left: f32, top: f32, side: f32) -> Rect {
        Rect::new(left, top, left + side, top + side)
    }

    #[test]
    fn track_follows_overlapping_detection() {
        let mut tracker = IdentityTracker::new();
        tracker.seed([(rect(100.0, 100.0, 80.0), "alice".to_string())]);

        let detections = [rect(110.0, 105.0, 80.0)];
        let matches = tracker.advance(&detections);
        assert_eq!(matches, vec![(0, "alice".to_string())]);
        assert_eq!(tracker.active_tracks()[0].last_bbox, detections[0]);
        assert_eq!(tracker.active_tracks()[0].missed_frames, 0);
    }

    #[test]
    fn centroid_fallback_catches_fast_motion() {
        let mut tracker = IdentityTracker::new();
        tracker.seed([(rect(100.0, 100.0, 80.0), "alice".to_string())]);

        // No overlap (IoU 0) but the center moved less than
        // 0.65 * diagonal(80x80) ~ 73.5 px.
        let detections = [rect(170.0, 100.0, 80.0)];
        let matches = tracker.advance(&detections);
        assert_eq!(matches.len(), 1);
    }

    #[test]
    fn far_detection_is_not_matched() {
        let mut tracker = IdentityTracker::new();
        tracker.seed([(rect(100.0, 100.0, 80.0), "alice".to_string())]);

        let detections = [rect(500.0, 400.0, 80.0)];
        let matches = tracker.advance(&detections);
        assert!(matches.is_empty());
        assert_eq!(tracker.active_tracks()[0].missed_frames, 1);
    }

    #[test]
    fn track_expires_after_max_missed_frames() {
        let mut tracker = IdentityTracker::new();
        tracker.seed([(rect(100.0, 100.0, 80.0), "alice".to_string())]);

        for _ in 0..MAX_MISSED_FRAMES {
            tracker.advance(&[]);
        }
        assert_eq!(tracker.active_tracks().len(), 1, "45 misses keep the track");

        tracker.advance(&[]);
        assert!(tracker.active_tracks().is_empty(), "46th miss drops it");
    }

    #[test]
    fn reappearing_face_gets_no_binding_after_expiry() {
        let mut tracker = IdentityTracker::new();
        tracker.seed([(rect(100.0, 100.0, 80.0), "alice".to_string())]);

        for _ in 0..=MAX_MISSED_FRAMES {
            tracker.advance(&[]);
        }
        assert!(tracker.active_tracks().is_empty());

        // The face comes back where it used to be: nothing matches it.
        let matches = tracker.advance(&[rect(100.0, 100.0, 80.0)]);
        assert!(matches.is_empty());
    }

    #[test]
    fn two_tracks_claim_distinct_detections() {
        let mut tracker = IdentityTracker::new();
        tracker.seed([
            (rect(100.0, 100.0, 80.0), "alice".to_string()),
            (rect(400.0, 100.0, 80.0), "bob".to_string()),
        ]);

        let detections = [rect(405.0, 102.0, 80.0), rect(98.0, 99.0, 80.0)];
        let mut matches = tracker.advance(&detections);
        matches.sort_by(|a, b| a.1.cmp(&b.1));
        assert_eq!(
            matches,
            vec![(1, "alice".to_string()), (0, "bob".to_string())]
        );
    }

    #[test]
    fn match_recovery_resets_missed_counter() {
        let mut tracker = IdentityTracker::new();
        tracker.seed([(rect(100.0, 100.0, 80.0), "alice".to_string())]);

        for _ in 0..20 {
            tracker.advance(&[]);
        }
        assert_eq!(tracker.active_tracks()[0].missed_frames, 20);

        tracker.advance(&[rect(102.0, 101.0, 80.0)]);
        assert_eq!(tracker.active_tracks()[0].missed_frames, 0);
    }
}
