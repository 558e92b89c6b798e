//! InSwapper face swapper: aligned 128 crop + emap-transformed identity in,
//! color-corrected and feather-composited source frame out.
//!
//! The raw model output is unusable by itself; the paste-back stages (color
//! transfer, feathered mask, inverse warp, composite) are what make the
//! result look attached to the frame.

use anyhow::{Context, Result};
use ndarray::{Array, IxDyn};
use ort::value::Value;

use common::geometry::{feather_mask, sample_bilinear_f32, Affine};
use common::types::{ChannelOrder, DetectedFace, IdentityVector, Image};

use crate::align::aligned_crop;
use crate::emap::EmapStatus;
use crate::session::SharedSession;

pub const SWAP_INPUT_SIZE: u32 = 128;
/// Feather ramp width as a fraction of the crop side.
const MASK_BORDER_FRAC: f32 = 0.12;
/// Inset margin used for color statistics, as a fraction of the side.
const STATS_INSET_FRAC: f32 = 1.0 / 6.0;

pub const DEFAULT_COLOR_TRANSFER_BLEND: f32 = 0.5;

pub struct Swapper {
    session: SharedSession,
    emap: EmapStatus,
    color_transfer_blend: f32,
    mask: Vec<f32>,
}

impl Swapper {
    /// `model_bytes` are the raw swapper ONNX bytes, scanned once for the
    /// embedded `emap` initializer.
    pub fn new(session: SharedSession, model_bytes: &[u8], color_transfer_blend: f32) -> Self {
        Self {
            session,
            emap: crate::emap::extract_emap(model_bytes),
            color_transfer_blend,
            mask: feather_mask(SWAP_INPUT_SIZE, MASK_BORDER_FRAC),
        }
    }

    pub fn emap_loaded(&self) -> bool {
        self.emap.is_loaded()
    }

    /// Run the emap transform over a raw identity (pass-through when the
    /// matrix is missing or corrupt).
    pub fn prepare_identity(&self, identity: &IdentityVector) -> IdentityVector {
        self.emap.transform(identity)
    }

    /// Swap one face in a BGR frame, returning a new frame.
    pub fn swap_face(
        &self,
        frame: &Image,
        face: &DetectedFace,
        identity: &IdentityVector,
    ) -> Result<Image> {
        debug_assert_eq!(frame.order(), ChannelOrder::Bgr);

        let (crop, forward) = aligned_crop(frame, &face.landmarks, SWAP_INPUT_SIZE)
            .context("degenerate landmarks, cannot align face")?;

        let target = crop_to_tensor(&crop);
        let prepared = self.prepare_identity(identity);
        let source = Array::from_shape_vec(
            IxDyn(&[1, IdentityVector::DIM]),
            prepared.as_slice().to_vec(),
        )?;

        let output_chw = {
            let mut session = self
                .session
                .lock()
                .map_err(|e| anyhow::anyhow!("swapper session lock poisoned: {e}"))?;
            let outputs = session.run(ort::inputs![
                "target" => Value::from_array(target)?,
                "source" => Value::from_array(source)?,
            ])?;
            let (_, data) = outputs[0].try_extract_tensor::<f32>()?;
            data.to_vec()
        };

        let mut face_hwc = chw_to_hwc(&output_chw, SWAP_INPUT_SIZE);
        let crop_hwc = image_to_hwc_f32(&crop);
        color_transfer(
            &mut face_hwc,
            &crop_hwc,
            SWAP_INPUT_SIZE,
            self.color_transfer_blend,
        );

        Ok(paste_back(
            frame,
            &face_hwc,
            SWAP_INPUT_SIZE,
            &self.mask,
            &forward,
        ))
    }
}

/// BGR u8 crop to NCHW f32 keeping the raw [0, 255] scale the swapper
/// expects.
fn crop_to_tensor(crop: &Image) -> Array<f32, IxDyn> {
    let size = crop.width() as usize;
    let mut input = Array::zeros(IxDyn(&[1, 3, size, size]));
    for y in 0..crop.height() {
        for x in 0..crop.width() {
            let px = crop.pixel(x, y);
            for c in 0..3 {
                input[[0, c, y as usize, x as usize]] = px[c] as f32;
            }
        }
    }
    input
}

pub(crate) fn image_to_hwc_f32(img: &Image) -> Vec<f32> {
    img.data().iter().map(|&b| b as f32).collect()
}

/// Reorder a `(1, 3, s, s)` tensor into packed HWC.
pub(crate) fn chw_to_hwc(data: &[f32], size: u32) -> Vec<f32> {
    let s = size as usize;
    let plane = s * s;
    let mut out = vec![0.0f32; plane * 3];
    for y in 0..s {
        for x in 0..s {
            let p = y * s + x;
            out[p * 3] = data[p];
            out[p * 3 + 1] = data[plane + p];
            out[p * 3 + 2] = data[2 * plane + p];
        }
    }
    out
}

/// Per-channel mean and standard deviation over the inner inset region.
pub(crate) fn color_stats(hwc: &[f32], size: u32) -> ([f32; 3], [f32; 3]) {
    let s = size as usize;
    let inset = (size as f32 * STATS_INSET_FRAC) as usize;
    let lo = inset;
    let hi = s - inset;

    let mut mean = [0.0f64; 3];
    let mut count = 0.0f64;
    for y in lo..hi {
        for x in lo..hi {
            let i = (y * s + x) * 3;
            for c in 0..3 {
                mean[c] += hwc[i + c] as f64;
            }
            count += 1.0;
        }
    }
    for m in &mut mean {
        *m /= count;
    }

    let mut var = [0.0f64; 3];
    for y in lo..hi {
        for x in lo..hi {
            let i = (y * s + x) * 3;
            for c in 0..3 {
                let d = hwc[i + c] as f64 - mean[c];
                var[c] += d * d;
            }
        }
    }

    let mean_f = [mean[0] as f32, mean[1] as f32, mean[2] as f32];
    let std_f = [
        (var[0] / count).sqrt() as f32,
        (var[1] / count).sqrt() as f32,
        (var[2] / count).sqrt() as f32,
    ];
    (mean_f, std_f)
}

/// Pull the swapped output toward the statistics of the input crop,
/// channel-wise, then mix with the raw output to avoid oversaturation.
/// Standard deviations are floored at 1.0.
pub(crate) fn color_transfer(out_hwc: &mut [f32], ref_hwc: &[f32], size: u32, blend: f32) {
    let (mu_src, sigma_src) = color_stats(ref_hwc, size);
    let (mu_tgt, sigma_tgt) = color_stats(out_hwc, size);

    let mut gain = [0.0f32; 3];
    for c in 0..3 {
        gain[c] = sigma_src[c].max(1.0) / sigma_tgt[c].max(1.0);
    }

    for px in out_hwc.chunks_exact_mut(3) {
        for c in 0..3 {
            let corrected = (px[c] - mu_tgt[c]) * gain[c] + mu_src[c];
            px[c] = blend * corrected + (1.0 - blend) * px[c];
        }
    }
}

/// Inverse-warp a processed face crop and its mask back into the source
/// frame, alpha-compositing in source space to avoid a redundant
/// resampling. Returns a new frame.
pub(crate) fn paste_back(
    frame: &Image,
    face_hwc: &[f32],
    crop_size: u32,
    mask: &[f32],
    forward: &Affine,
) -> Image {
    let mut out = frame.clone();
    let Some(inverse) = forward.invert() else {
        return out;
    };

    // Bounding box of the warped crop in source coordinates.
    let s = crop_size as f32;
    let corners = [(0.0, 0.0), (s, 0.0), (0.0, s), (s, s)];
    let mut min_x = f32::MAX;
    let mut min_y = f32::MAX;
    let mut max_x = f32::MIN;
    let mut max_y = f32::MIN;
    for &(cx, cy) in &corners {
        let (x, y) = inverse.apply(cx, cy);
        min_x = min_x.min(x);
        min_y = min_y.min(y);
        max_x = max_x.max(x);
        max_y = max_y.max(y);
    }

    let x0 = min_x.floor().max(0.0) as u32;
    let y0 = min_y.floor().max(0.0) as u32;
    let x1 = (max_x.ceil() as u32).min(frame.width());
    let y1 = (max_y.ceil() as u32).min(frame.height());

    for y in y0..y1 {
        for x in x0..x1 {
            let (qx, qy) = forward.apply(x as f32, y as f32);
            if qx < -1.0 || qy < -1.0 || qx > s || qy > s {
                continue;
            }
            let alpha = sample_mask(mask, crop_size, qx, qy);
            if alpha <= 0.0 {
                continue;
            }
            let warped = sample_bilinear_f32(face_hwc, crop_size, crop_size, qx, qy);
            let src = out.pixel(x, y);
            let mut px = [0u8; 3];
            for c in 0..3 {
                let v = src[c] as f32 * (1.0 - alpha) + warped[c] * alpha;
                px[c] = v.round().clamp(0.0, 255.0) as u8;
            }
            out.set_pixel(x, y, px);
        }
    }
    out
}

/// Bilinear mask lookup; outside the crop the alpha is zero.
fn sample_mask(mask: &[f32], size: u32, x: f32, y: f32) -> f32 {
    let s = size as i64;
    let x0 = x.floor() as i64;
    let y0 = y.floor() as i64;
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let mut acc = 0.0f32;
    for (dy, wy) in [(0i64, 1.0 - fy), (1, fy)] {
        for (dx, wx) in [(0i64, 1.0 - fx), (1, fx)] {
            let px = x0 + dx;
            let py = y0 + dy;
            if px < 0 || py < 0 || px >= s || py >= s {
                continue;
            }
            acc += mask[(py * s + px) as usize] * wx * wy;
        }
    }
    acc
}
