//! Five-point face alignment against the canonical ArcFace template.

use common::geometry::{warp_affine, Affine};
use common::types::Image;

/// Reference landmark positions in the canonical 112x112 crop:
/// left eye, right eye, nose, left mouth corner, right mouth corner.
pub const ARCFACE_TEMPLATE_112: [[f32; 2]; 5] = [
    [38.2946, 51.6963],
    [73.5318, 51.5014],
    [56.0252, 71.7366],
    [41.5493, 92.3655],
    [70.7299, 92.2041],
];

/// Similarity transform taking source-image landmarks onto the template at
/// the requested crop size (112 for embedding, 128 for swapping, 512 for
/// enhancement). `None` when the landmarks are degenerate.
pub fn alignment_transform(landmarks: &[[f32; 2]; 5], crop_size: u32) -> Option<Affine> {
    let to_112 = common::geometry::umeyama(landmarks, &ARCFACE_TEMPLATE_112)?;
    Some(to_112.scaled(crop_size as f32 / 112.0))
}

/// Crop an aligned face: returns the warped crop plus the forward
/// (source -> template) transform needed for paste-back.
pub fn aligned_crop(
    frame: &Image,
    landmarks: &[[f32; 2]; 5],
    crop_size: u32,
) -> Option<(Image, Affine)> {
    let forward = alignment_transform(landmarks, crop_size)?;
    let inverse = forward.invert()?;
    let crop = warp_affine(frame, &inverse, crop_size, crop_size);
    Some((crop, forward))
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::types::ChannelOrder;

    #[test]
    fn template_landmarks_map_onto_themselves() {
        let m = alignment_transform(&ARCFACE_TEMPLATE_112, 112).unwrap();
        for p in &ARCFACE_TEMPLATE_112 {
            let (x, y) = m.apply(p[0], p[1]);
            assert!((x - p[0]).abs() < 1e-2);
            assert!((y - p[1]).abs() < 1e-2);
        }
    }

    #[test]
    fn scaled_template_alignment_hits_scaled_targets() {
        for size in [112u32, 128, 512] {
            let m = alignment_transform(&ARCFACE_TEMPLATE_112, size).unwrap();
            assert!(m.det() > 0.0, "det must stay positive at {size}");
            let k = size as f32 / 112.0;
            for p in &ARCFACE_TEMPLATE_112 {
                let (x, y) = m.apply(p[0], p[1]);
                assert!((x - p[0] * k).abs() < 0.5, "x at size {size}");
                assert!((y - p[1] * k).abs() < 0.5, "y at size {size}");
            }
        }
    }

    #[test]
    fn shifted_scaled_landmarks_align_to_template() {
        // A face twice template scale, offset into a larger frame.
        let landmarks: [[f32; 2]; 5] = {
            let mut out = [[0.0f32; 2]; 5];
            for (i, p) in ARCFACE_TEMPLATE_112.iter().enumerate() {
                out[i] = [p[0] * 2.0 + 300.0, p[1] * 2.0 + 150.0];
            }
            out
        };
        let m = alignment_transform(&landmarks, 112).unwrap();
        for (i, p) in landmarks.iter().enumerate() {
            let (x, y) = m.apply(p[0], p[1]);
            assert!((x - ARCFACE_TEMPLATE_112[i][0]).abs() < 1e-2);
            assert!((y - ARCFACE_TEMPLATE_112[i][1]).abs() < 1e-2);
        }
    }

    #[test]
    fn aligned_crop_has_requested_size() {
        let frame = Image::zeroed(640, 480, ChannelOrder::Bgr);
        let landmarks: [[f32; 2]; 5] = {
            let mut out = [[0.0f32; 2]; 5];
            for (i, p) in ARCFACE_TEMPLATE_112.iter().enumerate() {
                out[i] = [p[0] + 200.0, p[1] + 100.0];
            }
            out
        };
        let (crop, forward) = aligned_crop(&frame, &landmarks, 128).unwrap();
        assert_eq!(crop.width(), 128);
        assert_eq!(crop.height(), 128);
        assert!(forward.det() > 0.0);
    }
}
