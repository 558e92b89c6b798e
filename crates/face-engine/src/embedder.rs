//! ArcFace identity embedder: 112x112 aligned crop in, unit 512-vector out.

use anyhow::{Context, Result};
use ndarray::{Array, IxDyn};
use ort::value::Value;

use common::types::{ChannelOrder, DetectedFace, IdentityVector, Image};

use crate::align::aligned_crop;
use crate::session::SharedSession;

pub const EMBED_INPUT_SIZE: u32 = 112;

pub struct Embedder {
    session: SharedSession,
}

impl Embedder {
    pub fn new(session: SharedSession) -> Self {
        Self { session }
    }

    /// Extract the identity vector for one detected face in a BGR frame.
    pub fn embed(&self, frame: &Image, face: &DetectedFace) -> Result<IdentityVector> {
        debug_assert_eq!(frame.order(), ChannelOrder::Bgr);

        let (crop, _) = aligned_crop(frame, &face.landmarks, EMBED_INPUT_SIZE)
            .context("degenerate landmarks, cannot align face")?;

        let input = preprocess(&crop);
        let input_value = Value::from_array(input)?;

        let raw = {
            let mut session = self
                .session
                .lock()
                .map_err(|e| anyhow::anyhow!("embedder session lock poisoned: {e}"))?;
            let outputs = session.run(ort::inputs![input_value])?;
            let (_, data) = outputs[0].try_extract_tensor::<f32>()?;
            data.to_vec()
        };

        IdentityVector::from_raw(raw).context("embedding output was not a valid 512-vector")
    }
}

/// BGR crop to NCHW `(p - 127.5) / 127.5`.
fn preprocess(crop: &Image) -> Array<f32, IxDyn> {
    let size = EMBED_INPUT_SIZE as usize;
    let mut input = Array::zeros(IxDyn(&[1, 3, size, size]));
    for y in 0..crop.height() {
        for x in 0..crop.width() {
            let px = crop.pixel(x, y);
            for c in 0..3 {
                input[[0, c, y as usize, x as usize]] = (px[c] as f32 - 127.5) / 127.5;
            }
        }
    }
    input
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preprocess_normalizes_to_unit_range() {
        let mut crop = Image::zeroed(EMBED_INPUT_SIZE, EMBED_INPUT_SIZE, ChannelOrder::Bgr);
        crop.set_pixel(0, 0, [0, 128, 255]);
        let input = preprocess(&crop);
        assert_eq!(input.shape(), &[1, 3, 112, 112]);
        assert!((input[[0, 0, 0, 0]] - (-1.0)).abs() < 1e-6);
        assert!((input[[0, 1, 0, 0]] - (0.5 / 127.5)).abs() < 1e-6);
        assert!((input[[0, 2, 0, 0]] - 1.0).abs() < 1e-6);
    }
}
