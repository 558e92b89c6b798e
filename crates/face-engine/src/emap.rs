//! Extraction of the `emap` initializer embedded in the InSwapper model.
//!
//! The swapper expects its identity input passed through a 512x512 linear
//! transform that ships inside the ONNX file as an initializer named
//! `emap`. Missing it silently degrades swap quality, so the scan result is
//! surfaced explicitly. The scan is a hand-rolled pass over the raw
//! protobuf bytes: the file format is fixed at model-export time and
//! linking a protobuf stack for one field would be disproportionate.

use tracing::warn;

use common::types::IdentityVector;

pub const EMAP_DIM: usize = 512;
const EMAP_BYTES: usize = EMAP_DIM * EMAP_DIM * 4;
/// How far past the name marker the payload may start.
const LOOKAHEAD: usize = EMAP_BYTES + 4096;

/// Field tags inside a TensorProto: `raw_data` (field 13) is preferred
/// over packed `float_data` (field 5).
const TAG_NAME: u8 = 0x0A;
const TAG_RAW_DATA: u8 = 0x6A;
const TAG_FLOAT_DATA: u8 = 0x2A;

/// Row-major 512x512 identity transform matrix.
pub struct Emap {
    m: Vec<f32>,
}

impl Emap {
    /// `v' = normalize(emap . v)`.
    pub fn apply(&self, v: &IdentityVector) -> IdentityVector {
        let input = v.as_slice();
        let mut out = vec![0.0f32; EMAP_DIM];
        for (i, o) in out.iter_mut().enumerate() {
            let row = &self.m[i * EMAP_DIM..(i + 1) * EMAP_DIM];
            *o = row.iter().zip(input.iter()).map(|(a, b)| a * b).sum();
        }
        // A validated matrix cannot map a unit vector to zero in practice;
        // fall back to the untransformed identity if it somehow does.
        IdentityVector::from_raw(out).unwrap_or_else(|| v.clone())
    }
}

/// Outcome of the scan, kept distinct because a missing initializer and a
/// corrupt one have different quality implications.
pub enum EmapStatus {
    Loaded(Box<Emap>),
    Missing,
    Corrupt,
}

impl EmapStatus {
    /// Apply the transform when present; otherwise pass the identity
    /// through unchanged.
    pub fn transform(&self, v: &IdentityVector) -> IdentityVector {
        match self {
            Self::Loaded(emap) => emap.apply(v),
            Self::Missing | Self::Corrupt => v.clone(),
        }
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self, Self::Loaded(_))
    }
}

/// Scan the raw model bytes for the `emap` initializer and parse its
/// payload. Never fails hard: the swap runs without the transform, at
/// reduced quality, and the condition is logged once.
pub fn extract_emap(model_bytes: &[u8]) -> EmapStatus {
    let Some(matrix) = scan_for_matrix(model_bytes) else {
        warn!("emap initializer not found in swapper model; swap quality will be degraded");
        return EmapStatus::Missing;
    };

    if !validate(&matrix) {
        warn!("emap initializer failed validation; proceeding without it");
        return EmapStatus::Corrupt;
    }

    EmapStatus::Loaded(Box::new(Emap { m: matrix }))
}

fn scan_for_matrix(bytes: &[u8]) -> Option<Vec<f32>> {
    // Name marker: field 1, wire type 2, length 4, ASCII "emap".
    let marker = [TAG_NAME, 0x04, b'e', b'm', b'a', b'p'];
    let start = bytes.windows(marker.len()).position(|w| w == marker)?;

    let window_end = (start + LOOKAHEAD).min(bytes.len());
    let window = &bytes[start..window_end];

    find_payload(window, TAG_RAW_DATA, start, bytes)
        .or_else(|| find_payload(window, TAG_FLOAT_DATA, start, bytes))
}

/// Find a length-delimited field with the given tag carrying exactly the
/// emap payload size, and decode it as little-endian f32.
fn find_payload(window: &[u8], tag: u8, base: usize, bytes: &[u8]) -> Option<Vec<f32>> {
    let mut j = 0;
    while j < window.len() {
        if window[j] == tag {
            if let Some((len, varint_len)) = read_varint(&window[j + 1..]) {
                if len == EMAP_BYTES as u64 {
                    let payload_start = base + j + 1 + varint_len;
                    let payload_end = payload_start + EMAP_BYTES;
                    if payload_end <= bytes.len() {
                        return Some(decode_f32_le(&bytes[payload_start..payload_end]));
                    }
                }
            }
        }
        j += 1;
    }
    None
}

fn read_varint(bytes: &[u8]) -> Option<(u64, usize)> {
    let mut value = 0u64;
    for (i, &b) in bytes.iter().take(10).enumerate() {
        value |= u64::from(b & 0x7F) << (7 * i);
        if b & 0x80 == 0 {
            return Some((value, i + 1));
        }
    }
    None
}

fn decode_f32_le(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Sparse sanity gate: every sampled entry finite, sampled mean absolute
/// value inside [0.001, 50].
pub(crate) fn validate(matrix: &[f32]) -> bool {
    if matrix.len() != EMAP_DIM * EMAP_DIM {
        return false;
    }

    const SAMPLE_STRIDE: usize = 257;
    let mut sum_abs = 0.0f64;
    let mut count = 0u32;
    let mut i = 0;
    while i < matrix.len() {
        let v = matrix[i];
        if !v.is_finite() {
            return false;
        }
        sum_abs += v.abs() as f64;
        count += 1;
        i += SAMPLE_STRIDE;
    }

    let mean_abs = sum_abs / count as f64;
    (0.001..=50.0).contains(&mean_abs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plausible_matrix() -> Vec<f32> {
        (0..EMAP_DIM * EMAP_DIM)
            .map(|i| ((i as f32 * 0.618).sin()) * 0.05)
            .collect()
    }

    /// Minimal TensorProto-shaped blob: name field then the payload field.
    fn synthetic_model(tag: u8, matrix: &[f32], pad_before_payload: usize) -> Vec<u8> {
        let mut out = vec![0x08, 0x01, 0x12, 0x00]; // unrelated leading fields
        out.extend_from_slice(&[TAG_NAME, 0x04]);
        out.extend_from_slice(b"emap");
        out.extend(std::iter::repeat(0x00).take(pad_before_payload));
        out.push(tag);
        // varint for 1_048_576 = 0x80 0x80 0x40
        out.extend_from_slice(&[0x80, 0x80, 0x40]);
        for v in matrix {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out
    }

    #[test]
    fn extracts_raw_data_payload() {
        let matrix = plausible_matrix();
        let model = synthetic_model(TAG_RAW_DATA, &matrix, 8);
        let status = extract_emap(&model);
        assert!(status.is_loaded());
        let EmapStatus::Loaded(emap) = status else {
            panic!("expected loaded emap");
        };
        assert!((emap.m[1] - matrix[1]).abs() < 1e-7);
    }

    #[test]
    fn extracts_float_data_payload() {
        let matrix = plausible_matrix();
        let model = synthetic_model(TAG_FLOAT_DATA, &matrix, 0);
        assert!(extract_emap(&model).is_loaded());
    }

    #[test]
    fn missing_initializer_is_reported_missing() {
        let model = vec![0x08, 0x01, 0x12, 0x04, b'n', b'o', b'p', b'e'];
        assert!(matches!(extract_emap(&model), EmapStatus::Missing));
    }

    #[test]
    fn nan_entry_is_reported_corrupt() {
        let mut matrix = plausible_matrix();
        matrix[0] = f32::NAN; // index 0 is always sampled
        let model = synthetic_model(TAG_RAW_DATA, &matrix, 0);
        assert!(matches!(extract_emap(&model), EmapStatus::Corrupt));
    }

    #[test]
    fn validator_accepts_plausible_and_rejects_out_of_band() {
        assert!(validate(&plausible_matrix()));

        let zeros = vec![0.0f32; EMAP_DIM * EMAP_DIM];
        assert!(!validate(&zeros));

        let huge = vec![1.0e4f32; EMAP_DIM * EMAP_DIM];
        assert!(!validate(&huge));

        let short = vec![0.5f32; 100];
        assert!(!validate(&short));
    }

    #[test]
    fn transform_preserves_unit_norm() {
        let matrix = plausible_matrix();
        let model = synthetic_model(TAG_RAW_DATA, &matrix, 0);
        let status = extract_emap(&model);

        let raw: Vec<f32> = (0..512).map(|i| ((i * 7) % 13) as f32 - 6.0).collect();
        let v = IdentityVector::from_raw(raw).unwrap();
        let out = status.transform(&v);
        assert!((out.norm() - 1.0).abs() < 1e-3);
    }

    #[test]
    fn missing_emap_passes_identity_through() {
        let v = IdentityVector::from_raw(vec![1.0; 512]).unwrap();
        let out = EmapStatus::Missing.transform(&v);
        assert_eq!(out, v);
    }

    #[test]
    fn truncated_payload_is_missing_not_a_panic() {
        let matrix = plausible_matrix();
        let mut model = synthetic_model(TAG_RAW_DATA, &matrix, 0);
        model.truncate(model.len() - 1024);
        assert!(matches!(extract_emap(&model), EmapStatus::Missing));
    }
}
