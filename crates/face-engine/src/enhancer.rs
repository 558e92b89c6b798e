//! GFPGAN face enhancer. Optional stage: aligned 512 crop in, feathered
//! paste-back out. The model preserves color, so unlike the swapper there
//! is no color transfer.

use anyhow::{Context, Result};
use ndarray::{Array, IxDyn};
use ort::value::Value;

use common::geometry::feather_mask;
use common::types::{ChannelOrder, DetectedFace, Image};

use crate::align::aligned_crop;
use crate::session::SharedSession;
use crate::swapper::paste_back;

pub const ENHANCE_INPUT_SIZE: u32 = 512;
const MASK_BORDER_FRAC: f32 = 0.10;

pub struct Enhancer {
    session: SharedSession,
    mask: Vec<f32>,
}

impl Enhancer {
    pub fn new(session: SharedSession) -> Self {
        Self {
            session,
            mask: feather_mask(ENHANCE_INPUT_SIZE, MASK_BORDER_FRAC),
        }
    }

    /// Enhance one face region in a BGR frame, returning a new frame.
    /// Callers skip faces whose landmarks were synthesized rather than
    /// predicted; alignment this tight needs real landmarks.
    pub fn enhance_face(&self, frame: &Image, face: &DetectedFace) -> Result<Image> {
        debug_assert_eq!(frame.order(), ChannelOrder::Bgr);

        let (crop, forward) = aligned_crop(frame, &face.landmarks, ENHANCE_INPUT_SIZE)
            .context("degenerate landmarks, cannot align face")?;

        let input = preprocess(&crop);
        let output_chw = {
            let mut session = self
                .session
                .lock()
                .map_err(|e| anyhow::anyhow!("enhancer session lock poisoned: {e}"))?;
            let outputs = session.run(ort::inputs![Value::from_array(input)?])?;
            let (_, data) = outputs[0].try_extract_tensor::<f32>()?;
            data.to_vec()
        };

        let face_hwc = postprocess(&output_chw, ENHANCE_INPUT_SIZE);
        Ok(paste_back(
            frame,
            &face_hwc,
            ENHANCE_INPUT_SIZE,
            &self.mask,
            &forward,
        ))
    }
}

/// BGR u8 to NCHW `(p/255 - 0.5) / 0.5`.
fn preprocess(crop: &Image) -> Array<f32, IxDyn> {
    let size = crop.width() as usize;
    let mut input = Array::zeros(IxDyn(&[1, 3, size, size]));
    for y in 0..crop.height() {
        for x in 0..crop.width() {
            let px = crop.pixel(x, y);
            for c in 0..3 {
                input[[0, c, y as usize, x as usize]] = (px[c] as f32 / 255.0 - 0.5) / 0.5;
            }
        }
    }
    input
}

/// Model space back to pixel-valued HWC: `(o * 0.5 + 0.5) * 255`.
fn postprocess(chw: &[f32], size: u32) -> Vec<f32> {
    let hwc = crate::swapper::chw_to_hwc(chw, size);
    hwc.into_iter()
        .map(|o| ((o * 0.5 + 0.5) * 255.0).clamp(0.0, 255.0))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preprocess_maps_extremes_to_unit_range() {
        let mut crop = Image::zeroed(4, 4, ChannelOrder::Bgr);
        crop.set_pixel(0, 0, [0, 255, 128]);
        // Size mismatch with the real model is fine for the math check.
        let input = preprocess(&crop);
        assert!((input[[0, 0, 0, 0]] - (-1.0)).abs() < 1e-6);
        assert!((input[[0, 1, 0, 0]] - 1.0).abs() < 1e-6);
        assert!(input[[0, 2, 0, 0]].abs() < 0.01);
    }

    #[test]
    fn postprocess_inverts_preprocess() {
        // A -1..1 plane maps back onto 0..255.
        let size = 2u32;
        let chw = vec![-1.0, -1.0, -1.0, -1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 1.0];
        let hwc = postprocess(&chw, size);
        assert!((hwc[0] - 0.0).abs() < 1e-4);
        assert!((hwc[1] - 127.5).abs() < 1e-4);
        assert!((hwc[2] - 255.0).abs() < 1e-4);
    }

    #[test]
    fn postprocess_clamps_out_of_range_output() {
        let chw = vec![2.0, 2.0, 2.0, -3.0, -3.0, -3.0, 0.5, 0.5, 0.5, 0.5, 0.5, 0.5];
        let hwc = postprocess(&chw, 2);
        assert_eq!(hwc[0], 255.0);
        assert_eq!(hwc[1], 0.0);
    }
}
