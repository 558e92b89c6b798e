//! SCRFD face detector: letterboxed preprocessing, multi-stride anchor
//! decoding, NMS, five-point landmarks with a geometric fallback.

use anyhow::{Context, Result};
use ndarray::{Array, IxDyn};
use ort::value::Value;
use tracing::debug;

use common::types::{ChannelOrder, DetectedFace, Image, Rect};

use crate::session::SharedSession;

pub const DETECT_INPUT_SIZE: u32 = 640;
pub const SCORE_THRESHOLD: f32 = 0.5;
pub const NMS_IOU_THRESHOLD: f32 = 0.4;

const STRIDES: [u32; 3] = [8, 16, 32];

/// Landmark offsets (relative to box width/height) used when the model has
/// no landmark head. Deliberately coarse; callers that need identity
/// stability should use the landmark-equipped model.
const FALLBACK_LANDMARK_OFFSETS: [[f32; 2]; 5] = [
    [-0.17, -0.12],
    [0.17, -0.12],
    [0.0, 0.02],
    [-0.14, 0.18],
    [0.14, 0.18],
];

/// Output signature of the loaded detector graph, fixed at session-open
/// time by inspecting the output count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorOutputShape {
    /// 3 strides x {scores, bbox distances, landmark distances}.
    NineTensor,
    /// 3 strides x {scores, bbox distances}; no landmark head.
    SixTensor,
    /// One merged `(N, 15)` tensor: score, box, 5 landmark pairs.
    MergedTensor,
}

impl DetectorOutputShape {
    pub fn from_output_count(count: usize) -> Option<Self> {
        match count {
            9 => Some(Self::NineTensor),
            6 => Some(Self::SixTensor),
            1 => Some(Self::MergedTensor),
            _ => None,
        }
    }
}

pub struct Detector {
    session: SharedSession,
    output_shape: DetectorOutputShape,
}

/// A decoded candidate in letterboxed input coordinates.
#[derive(Debug, Clone)]
struct Candidate {
    bbox: Rect,
    score: f32,
    landmarks: Option<[[f32; 2]; 5]>,
}

impl Detector {
    pub fn new(session: SharedSession) -> Result<Self> {
        let output_count = {
            let guard = session
                .lock()
                .map_err(|e| anyhow::anyhow!("detector session lock poisoned: {e}"))?;
            guard.outputs.len()
        };
        let output_shape = DetectorOutputShape::from_output_count(output_count)
            .with_context(|| format!("unsupported detector output count: {output_count}"))?;
        debug!(?output_shape, "detector output signature");
        Ok(Self {
            session,
            output_shape,
        })
    }

    pub fn output_shape(&self) -> DetectorOutputShape {
        self.output_shape
    }

    /// Detect faces in a BGR frame. Results are in source pixels, sorted by
    /// descending score, NMS-filtered.
    pub fn detect(&self, frame: &Image) -> Result<Vec<DetectedFace>> {
        debug_assert_eq!(frame.order(), ChannelOrder::Bgr);

        let (input, scale) = letterbox(frame);
        let input_value = Value::from_array(input)?;

        let output_count = match self.output_shape {
            DetectorOutputShape::NineTensor => 9,
            DetectorOutputShape::SixTensor => 6,
            DetectorOutputShape::MergedTensor => 1,
        };

        let raw_outputs = {
            let mut session = self
                .session
                .lock()
                .map_err(|e| anyhow::anyhow!("detector session lock poisoned: {e}"))?;
            let outputs = session.run(ort::inputs![input_value])?;
            let mut raw = Vec::with_capacity(output_count);
            for i in 0..output_count {
                let (shape, data) = outputs[i].try_extract_tensor::<f32>()?;
                let dims: Vec<usize> = shape.as_ref().iter().map(|&d| d as usize).collect();
                raw.push((dims, data.to_vec()));
            }
            raw
        };

        let candidates = match self.output_shape {
            DetectorOutputShape::NineTensor => decode_split(&raw_outputs, true)?,
            DetectorOutputShape::SixTensor => decode_split(&raw_outputs, false)?,
            DetectorOutputShape::MergedTensor => decode_merged(&raw_outputs)?,
        };

        let kept = nms(candidates, NMS_IOU_THRESHOLD);

        Ok(kept
            .into_iter()
            .map(|c| into_face(c, scale, frame.width(), frame.height()))
            .collect())
    }
}

/// Letterbox a BGR frame into the normalized 640x640 NCHW input tensor.
/// The padding is filled with the normalized value of zero (about -0.996);
/// zero-filled padding shifts anchor statistics and must be avoided.
fn letterbox(frame: &Image) -> (Array<f32, IxDyn>, f32) {
    let size = DETECT_INPUT_SIZE;
    let scale = (size as f32 / frame.width() as f32).min(size as f32 / frame.height() as f32);
    let new_w = ((frame.width() as f32 * scale).round() as u32).clamp(1, size);
    let new_h = ((frame.height() as f32 * scale).round() as u32).clamp(1, size);

    let resized = common::geometry::resize_bilinear(frame, new_w, new_h);

    let pad_value = (0.0 - 127.5) / 128.0;
    let mut input =
        Array::from_elem(IxDyn(&[1, 3, size as usize, size as usize]), pad_value);

    for y in 0..new_h {
        for x in 0..new_w {
            let px = resized.pixel(x, y);
            for c in 0..3 {
                input[[0, c, y as usize, x as usize]] = (px[c] as f32 - 127.5) / 128.0;
            }
        }
    }

    (input, scale)
}

/// Decode the split-output variants: outputs are ordered scores per stride,
/// then bbox distances per stride, then (optionally) landmark distances.
fn decode_split(outputs: &[(Vec<usize>, Vec<f32>)], with_landmarks: bool) -> Result<Vec<Candidate>> {
    let groups = if with_landmarks { 3 } else { 2 };
    anyhow::ensure!(
        outputs.len() == groups * STRIDES.len(),
        "expected {} outputs, got {}",
        groups * STRIDES.len(),
        outputs.len()
    );

    let mut candidates = Vec::new();
    for (si, &stride) in STRIDES.iter().enumerate() {
        let scores = &outputs[si].1;
        let bboxes = &outputs[STRIDES.len() + si].1;
        let landmarks = with_landmarks.then(|| &outputs[2 * STRIDES.len() + si].1);
        candidates.extend(decode_stride(
            scores,
            bboxes,
            landmarks.map(|v| v.as_slice()),
            stride,
        )?);
    }
    Ok(candidates)
}

/// Decode one stride level. `scores` has one entry per anchor, `bboxes`
/// four edge distances (in stride units), `landmarks` ten offsets.
fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    landmarks: Option<&[f32]>,
    stride: u32,
) -> Result<Vec<Candidate>> {
    let n = scores.len();
    anyhow::ensure!(bboxes.len() == n * 4, "bbox tensor size mismatch");
    if let Some(lm) = landmarks {
        anyhow::ensure!(lm.len() == n * 10, "landmark tensor size mismatch");
    }

    let grid = (DETECT_INPUT_SIZE / stride) as usize;
    let anchors_per_point = n.div_ceil(grid * grid).max(1);
    let s = stride as f32;

    let mut out = Vec::new();
    for i in 0..n {
        let score = scores[i];
        if score < SCORE_THRESHOLD {
            continue;
        }

        let cell = i / anchors_per_point;
        let gx = (cell % grid) as f32;
        let gy = (cell / grid) as f32;
        let cx = (gx + 0.5) * s;
        let cy = (gy + 0.5) * s;

        let b = &bboxes[i * 4..i * 4 + 4];
        let bbox = Rect::new(cx - b[0] * s, cy - b[1] * s, cx + b[2] * s, cy + b[3] * s);

        let lms = landmarks.map(|lm| {
            let k = &lm[i * 10..i * 10 + 10];
            let mut pts = [[0.0f32; 2]; 5];
            for (j, pt) in pts.iter_mut().enumerate() {
                *pt = [cx + k[j * 2] * s, cy + k[j * 2 + 1] * s];
            }
            pts
        });

        out.push(Candidate {
            bbox,
            score,
            landmarks: lms,
        });
    }
    Ok(out)
}

/// Decode the merged single-tensor variant: `(N, 15)` rows of
/// `(score, x1, y1, x2, y2, lm0x, lm0y, ..., lm4x, lm4y)` in input pixels.
fn decode_merged(outputs: &[(Vec<usize>, Vec<f32>)]) -> Result<Vec<Candidate>> {
    anyhow::ensure!(outputs.len() == 1, "merged decoder expects one output");
    let (dims, data) = &outputs[0];
    let cols = *dims.last().context("merged output has no dimensions")?;
    anyhow::ensure!(cols == 15, "merged output must have 15 columns, got {cols}");

    let mut out = Vec::new();
    for row in data.chunks_exact(cols) {
        let score = row[0];
        if score < SCORE_THRESHOLD {
            continue;
        }
        let bbox = Rect::new(row[1], row[2], row[3], row[4]);
        let mut pts = [[0.0f32; 2]; 5];
        for (j, pt) in pts.iter_mut().enumerate() {
            *pt = [row[5 + j * 2], row[5 + j * 2 + 1]];
        }
        out.push(Candidate {
            bbox,
            score,
            landmarks: Some(pts),
        });
    }
    Ok(out)
}

/// Greedy NMS. Ordering is canonical (score descending, coordinates as the
/// tie-break) so the surviving set depends only on the candidate multiset,
/// never on input order.
fn nms(mut candidates: Vec<Candidate>, iou_threshold: f32) -> Vec<Candidate> {
    candidates.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                (a.bbox.left, a.bbox.top, a.bbox.right, a.bbox.bottom)
                    .partial_cmp(&(b.bbox.left, b.bbox.top, b.bbox.right, b.bbox.bottom))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
    });

    let mut kept: Vec<Candidate> = Vec::new();
    for c in candidates {
        if kept.iter().all(|k| k.bbox.iou(&c.bbox) < iou_threshold) {
            kept.push(c);
        }
    }
    kept
}

/// Scale a candidate back to source coordinates and fill in fallback
/// landmarks when the model had no landmark head.
fn into_face(c: Candidate, letterbox_scale: f32, img_w: u32, img_h: u32) -> DetectedFace {
    let inv = 1.0 / letterbox_scale;
    let bbox = Rect::new(
        c.bbox.left * inv,
        c.bbox.top * inv,
        c.bbox.right * inv,
        c.bbox.bottom * inv,
    )
    .clip(img_w, img_h);

    let (landmarks, predicted) = match c.landmarks {
        Some(lms) => {
            let mut scaled = [[0.0f32; 2]; 5];
            for (i, p) in lms.iter().enumerate() {
                scaled[i] = [
                    (p[0] * inv).clamp(0.0, img_w as f32),
                    (p[1] * inv).clamp(0.0, img_h as f32),
                ];
            }
            (scaled, true)
        }
        None => (fallback_landmarks(&bbox), false),
    };

    DetectedFace {
        bbox,
        score: c.score,
        landmarks,
        landmarks_predicted: predicted,
    }
}

/// Synthesize five landmarks from box geometry.
pub fn fallback_landmarks(bbox: &Rect) -> [[f32; 2]; 5] {
    let (cx, cy) = bbox.center();
    let w = bbox.width();
    let h = bbox.height();
    let mut pts = [[0.0f32; 2]; 5];
    for (i, off) in FALLBACK_LANDMARK_OFFSETS.iter().enumerate() {
        pts[i] = [cx + off[0] * w, cy + off[1] * h];
    }
    pts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(left: f32, top: f32, side: f32, score: f32) -> Candidate {
        Candidate {
            bbox: Rect::new(left, top, left + side, top + side),
            score,
            landmarks: None,
        }
    }

    #[test]
    fn output_shape_detection() {
        assert_eq!(
            DetectorOutputShape::from_output_count(9),
            Some(DetectorOutputShape::NineTensor)
        );
        assert_eq!(
            DetectorOutputShape::from_output_count(6),
            Some(DetectorOutputShape::SixTensor)
        );
        assert_eq!(
            DetectorOutputShape::from_output_count(1),
            Some(DetectorOutputShape::MergedTensor)
        );
        assert_eq!(DetectorOutputShape::from_output_count(4), None);
    }

    #[test]
    fn decode_stride_places_anchor_centers() {
        // One anchor per point on an 80x80 grid (stride 8). Activate the
        // anchor at cell (gx=3, gy=2) with symmetric distances of 2 stride
        // units: box centered on ((3.5)*8, (2.5)*8) = (28, 20).
        let grid = 80usize;
        let n = grid * grid;
        let mut scores = vec![0.0f32; n];
        let mut bboxes = vec![0.0f32; n * 4];
        let idx = 2 * grid + 3;
        scores[idx] = 0.9;
        bboxes[idx * 4..idx * 4 + 4].copy_from_slice(&[2.0, 2.0, 2.0, 2.0]);

        let out = decode_stride(&scores, &bboxes, None, 8).unwrap();
        assert_eq!(out.len(), 1);
        let b = out[0].bbox;
        assert!((b.left - 12.0).abs() < 1e-4);
        assert!((b.top - 4.0).abs() < 1e-4);
        assert!((b.right - 44.0).abs() < 1e-4);
        assert!((b.bottom - 36.0).abs() < 1e-4);
    }

    #[test]
    fn decode_stride_handles_two_anchors_per_point() {
        // Two anchors per point: indices 2k and 2k+1 share a cell.
        let grid = 16usize;
        let n = grid * grid * 2;
        let mut scores = vec![0.0f32; n];
        let mut bboxes = vec![0.0f32; n * 4];
        // Second anchor of cell index 1 (gx=1, gy=0) at stride 32.
        let idx = 3;
        scores[idx] = 0.8;
        bboxes[idx * 4..idx * 4 + 4].copy_from_slice(&[1.0, 1.0, 1.0, 1.0]);

        let out = decode_stride(&scores, &bboxes, None, 32).unwrap();
        assert_eq!(out.len(), 1);
        // cell = idx / 2 = 1 -> gx=1, gy=0, center (48, 16)
        let (cx, cy) = out[0].bbox.center();
        assert!((cx - 48.0).abs() < 1e-4);
        assert!((cy - 16.0).abs() < 1e-4);
    }

    #[test]
    fn decode_stride_extracts_landmarks() {
        let grid = 80usize;
        let n = grid * grid;
        let mut scores = vec![0.0f32; n];
        let bboxes = vec![0.0f32; n * 4];
        let mut lms = vec![0.0f32; n * 10];
        scores[0] = 0.7;
        // First landmark offset (1.0, -1.0) stride units from center (4, 4).
        lms[0] = 1.0;
        lms[1] = -1.0;

        let out = decode_stride(&scores, &bboxes, Some(&lms), 8).unwrap();
        let pts = out[0].landmarks.unwrap();
        // Center of cell 0 is (4, 4); offsets are in stride units.
        assert!((pts[0][0] - 12.0).abs() < 1e-4);
        assert!((pts[0][1] - (-4.0)).abs() < 1e-4);
    }

    #[test]
    fn decode_merged_reads_rows() {
        let mut data = vec![0.0f32; 15 * 2];
        data[0..15].copy_from_slice(&[
            0.9, 10.0, 20.0, 110.0, 140.0, 30.0, 40.0, 70.0, 40.0, 50.0, 60.0, 35.0, 90.0, 65.0,
            90.0,
        ]);
        // Second row below threshold.
        data[15] = 0.2;

        let out = decode_merged(&[(vec![2, 15], data)]).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].bbox, Rect::new(10.0, 20.0, 110.0, 140.0));
        assert_eq!(out[0].landmarks.unwrap()[0], [30.0, 40.0]);
    }

    #[test]
    fn nms_suppresses_overlaps_and_keeps_best() {
        let cands = vec![
            candidate(0.0, 0.0, 50.0, 0.8),
            candidate(5.0, 5.0, 50.0, 0.95),
            candidate(200.0, 200.0, 50.0, 0.6),
        ];
        let kept = nms(cands, NMS_IOU_THRESHOLD);
        assert_eq!(kept.len(), 2);
        assert!((kept[0].score - 0.95).abs() < 1e-6);
        assert!((kept[1].score - 0.6).abs() < 1e-6);
    }

    #[test]
    fn nms_is_order_independent() {
        let a = candidate(0.0, 0.0, 50.0, 0.8);
        let b = candidate(10.0, 10.0, 50.0, 0.9);
        let c = candidate(300.0, 0.0, 40.0, 0.9);
        let d = candidate(305.0, 5.0, 40.0, 0.9);

        let survivors = |cands: Vec<Candidate>| -> Vec<(i32, i32)> {
            nms(cands, NMS_IOU_THRESHOLD)
                .into_iter()
                .map(|c| (c.bbox.left as i32, c.bbox.top as i32))
                .collect()
        };

        let forward = survivors(vec![a.clone(), b.clone(), c.clone(), d.clone()]);
        let reversed = survivors(vec![d, c, b, a]);
        assert_eq!(forward, reversed);
    }

    #[test]
    fn fallback_landmarks_follow_box_geometry() {
        let bbox = Rect::new(100.0, 100.0, 200.0, 200.0);
        let pts = fallback_landmarks(&bbox);
        // Left eye offset (-0.17w, -0.12h) from center (150, 150).
        assert!((pts[0][0] - 133.0).abs() < 1e-3);
        assert!((pts[0][1] - 138.0).abs() < 1e-3);
        // Nose sits just below center.
        assert!((pts[2][0] - 150.0).abs() < 1e-3);
        assert!((pts[2][1] - 152.0).abs() < 1e-3);
        // Eyes are symmetric.
        assert!((pts[0][1] - pts[1][1]).abs() < 1e-6);
    }

    #[test]
    fn letterbox_pads_with_normalized_zero() {
        let frame = Image::zeroed(320, 240, ChannelOrder::Bgr);
        let (input, scale) = letterbox(&frame);
        assert!((scale - 2.0).abs() < 1e-6);
        // Black pixels normalize to the same value as padding here, but the
        // padded region below 480 rows must hold the normalized zero.
        let pad = input[[0, 0, 639, 639]];
        assert!((pad - (-127.5 / 128.0)).abs() < 1e-5);
    }
}
