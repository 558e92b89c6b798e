//! Image decode/encode at the engine boundary.
//!
//! Everything inside the engine is 8-bit, 3-channel, known channel order;
//! this module is the only place that deals with file formats, bit depths
//! and grayscale. Re-encoding drops ancillary metadata (EXIF included).

use std::io::Cursor;
use std::path::{Path, PathBuf};

use image::{DynamicImage, ImageFormat, RgbImage};
use tracing::{debug, warn};

use crate::error::{SwapError, SwapResult};
use crate::types::{ChannelOrder, Image};

const SUPPORTED_IMAGE_FORMATS: &[ImageFormat] = &[
    ImageFormat::Png,
    ImageFormat::Jpeg,
    ImageFormat::WebP,
    ImageFormat::Bmp,
    ImageFormat::Tiff,
];

const SUPPORTED_VIDEO_EXTENSIONS: &[&str] = &["mp4", "mov", "avi", "mkv", "webm", "m4v"];

const JPEG_QUALITY: u8 = 95;

/// Decode image bytes into 8-bit RGB. 16-bit and grayscale inputs are
/// converted; HEIC/HEIF and other unsupported containers are rejected
/// before any decoding work.
pub fn decode_image(bytes: &[u8]) -> SwapResult<Image> {
    if is_heif(bytes) {
        return Err(SwapError::UnsupportedImageFormat("heic/heif".to_string()));
    }

    let format = image::guess_format(bytes)
        .map_err(|_| SwapError::UnsupportedImageFormat("unrecognized".to_string()))?;

    if !SUPPORTED_IMAGE_FORMATS.contains(&format) {
        return Err(SwapError::UnsupportedImageFormat(format!("{format:?}")));
    }

    let decoded = image::load_from_memory_with_format(bytes, format)
        .map_err(|e| SwapError::ImageDecodeFailed(e.to_string()))?;

    Ok(from_dynamic(decoded))
}

/// HEIF family sniff: ISO-BMFF `ftyp` box with a heif/heic brand.
fn is_heif(bytes: &[u8]) -> bool {
    if bytes.len() < 12 || &bytes[4..8] != b"ftyp" {
        return false;
    }
    matches!(
        &bytes[8..12],
        b"heic" | b"heix" | b"hevc" | b"heim" | b"heis" | b"hevm" | b"hevs" | b"mif1" | b"msf1"
    )
}

/// Flatten any decoded variant to 8-bit RGB.
pub fn from_dynamic(img: DynamicImage) -> Image {
    let rgb: RgbImage = img.to_rgb8();
    let (w, h) = rgb.dimensions();
    Image::new(w, h, ChannelOrder::Rgb, rgb.into_raw())
}

/// View an engine image as an `RgbImage` for encoding.
pub fn to_rgb_image(img: &Image) -> RgbImage {
    let rgb = img.clone().into_order(ChannelOrder::Rgb);
    let (w, h) = (rgb.width(), rgb.height());
    // Dimensions and length are consistent by construction.
    RgbImage::from_raw(w, h, rgb.into_data()).unwrap_or_else(|| RgbImage::new(w, h))
}

fn format_for_extension(ext: &str) -> Option<ImageFormat> {
    match ext.to_ascii_lowercase().as_str() {
        "png" => Some(ImageFormat::Png),
        "jpg" | "jpeg" => Some(ImageFormat::Jpeg),
        "webp" => Some(ImageFormat::WebP),
        "bmp" => Some(ImageFormat::Bmp),
        "tif" | "tiff" => Some(ImageFormat::Tiff),
        _ => None,
    }
}

fn encode_with_format(img: &Image, format: ImageFormat) -> Result<Vec<u8>, image::ImageError> {
    let rgb = to_rgb_image(img);
    let mut out = Cursor::new(Vec::new());
    match format {
        ImageFormat::Jpeg => {
            let encoder =
                image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY);
            rgb.write_with_encoder(encoder)?;
        }
        other => {
            DynamicImage::ImageRgb8(rgb).write_to(&mut out, other)?;
        }
    }
    Ok(out.into_inner())
}

/// Encode preserving the requested extension where possible. Unknown
/// extensions and encoder failures fall back to PNG; the returned
/// extension tells the caller what was actually produced.
pub fn encode_image(img: &Image, extension: &str) -> SwapResult<(Vec<u8>, String)> {
    if let Some(format) = format_for_extension(extension) {
        match encode_with_format(img, format) {
            Ok(bytes) => return Ok((bytes, extension.to_ascii_lowercase())),
            Err(e) => {
                warn!(extension, error = %e, "encoding failed, falling back to png");
            }
        }
    } else {
        debug!(extension, "unknown output extension, using png");
    }

    let bytes = encode_with_format(img, ImageFormat::Png)
        .map_err(|e| SwapError::OutputWriteFailed(e.to_string()))?;
    Ok((bytes, "png".to_string()))
}

/// Encode and write to disk next to the requested path, switching the
/// extension when PNG fallback kicks in. Returns the final path.
pub fn save_image(img: &Image, path: &Path) -> SwapResult<PathBuf> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("png")
        .to_string();
    let (bytes, actual_ext) = encode_image(img, &ext)?;
    let final_path = if actual_ext.eq_ignore_ascii_case(&ext) {
        path.to_path_buf()
    } else {
        path.with_extension(&actual_ext)
    };
    std::fs::write(&final_path, bytes)
        .map_err(|e| SwapError::OutputWriteFailed(format!("{}: {e}", final_path.display())))?;
    Ok(final_path)
}

/// Boundary gate for video paths: extension must be one of the supported
/// containers and the file must exist.
pub fn validate_video_path(path: &Path) -> SwapResult<()> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    if !SUPPORTED_VIDEO_EXTENSIONS.contains(&ext.as_str()) {
        return Err(SwapError::UnsupportedVideoFormat(ext));
    }
    if !path.exists() {
        return Err(SwapError::FileNotFound(path.to_path_buf()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn png_bytes(w: u32, h: u32) -> Vec<u8> {
        let img = RgbImage::from_fn(w, h, |x, y| image::Rgb([x as u8, y as u8, 128]));
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img)
            .write_to(&mut out, ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    #[test]
    fn decode_png_yields_rgb8() {
        let img = decode_image(&png_bytes(8, 6)).unwrap();
        assert_eq!(img.width(), 8);
        assert_eq!(img.height(), 6);
        assert_eq!(img.order(), ChannelOrder::Rgb);
        assert_eq!(img.pixel(3, 2), [3, 2, 128]);
    }

    #[test]
    fn decode_sixteen_bit_input_converts_to_eight_bit() {
        let gray16 = image::ImageBuffer::<image::Luma<u16>, Vec<u16>>::from_fn(4, 4, |_, _| {
            image::Luma([40_000u16])
        });
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageLuma16(gray16)
            .write_to(&mut out, ImageFormat::Png)
            .unwrap();

        let img = decode_image(&out.into_inner()).unwrap();
        let px = img.pixel(0, 0);
        // 40000/65535 scaled to 8-bit, equal in all three channels.
        assert_eq!(px[0], px[1]);
        assert_eq!(px[1], px[2]);
        assert!(px[0] > 140 && px[0] < 170);
    }

    #[test]
    fn heif_brand_is_rejected() {
        let mut fake = vec![0, 0, 0, 24];
        fake.extend_from_slice(b"ftypheic");
        fake.extend_from_slice(&[0u8; 32]);
        let err = decode_image(&fake).unwrap_err();
        assert_eq!(err.code(), "unsupported-image-format");
    }

    #[test]
    fn garbage_is_rejected_not_panicked() {
        let err = decode_image(&[0u8; 16]).unwrap_err();
        assert_eq!(err.code(), "unsupported-image-format");
    }

    #[test]
    fn encode_preserves_known_extension() {
        let img = decode_image(&png_bytes(4, 4)).unwrap();
        let (bytes, ext) = encode_image(&img, "jpg").unwrap();
        assert_eq!(ext, "jpg");
        assert_eq!(&bytes[0..3], &[0xFF, 0xD8, 0xFF]);
    }

    #[test]
    fn encode_unknown_extension_falls_back_to_png() {
        let img = decode_image(&png_bytes(4, 4)).unwrap();
        let (bytes, ext) = encode_image(&img, "xyz").unwrap();
        assert_eq!(ext, "png");
        assert_eq!(&bytes[1..4], b"PNG");
    }

    #[test]
    fn save_switches_extension_on_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let img = decode_image(&png_bytes(4, 4)).unwrap();
        let requested = dir.path().join("out.xyz");
        let written = save_image(&img, &requested).unwrap();
        assert_eq!(written.extension().and_then(|e| e.to_str()), Some("png"));
        assert!(written.exists());
    }

    #[test]
    fn video_extension_gate() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("clip.mp4");
        std::fs::write(&good, b"x").unwrap();
        assert!(validate_video_path(&good).is_ok());

        let err = validate_video_path(&dir.path().join("clip.wmv")).unwrap_err();
        assert_eq!(err.code(), "unsupported-video-format");

        let err = validate_video_path(&dir.path().join("missing.mp4")).unwrap_err();
        assert_eq!(err.code(), "file-not-found");
    }
}
