/// Boundary validation through the public facade: every rejection must
/// surface the right stable error code before any inference begins, so
/// none of these tests require model files or ffmpeg.
use std::io::Cursor;
use std::path::PathBuf;

use mirage::{Mirage, MirageConfig, SourceBinding, SwapSource, VideoSwapOptions};

fn facade() -> Mirage {
    Mirage::new(MirageConfig {
        models_dir: PathBuf::from("/nonexistent/models"),
        ..MirageConfig::default()
    })
}

fn png_bytes() -> Vec<u8> {
    let img = image::RgbImage::from_pixel(32, 32, image::Rgb([120, 130, 140]));
    let mut out = Cursor::new(Vec::new());
    image::DynamicImage::ImageRgb8(img)
        .write_to(&mut out, image::ImageFormat::Png)
        .unwrap();
    out.into_inner()
}

#[test]
fn garbage_subject_bytes_are_rejected_before_models_load() {
    let err = facade()
        .swap_image(
            &[0u8; 32],
            &SwapSource::Single {
                target_image: png_bytes(),
            },
            None,
            false,
        )
        .unwrap_err();
    assert_eq!(err.code(), "unsupported-image-format");
}

#[test]
fn heif_subject_is_rejected() {
    let mut heic = vec![0, 0, 0, 24];
    heic.extend_from_slice(b"ftypheic");
    heic.extend_from_slice(&[0u8; 64]);

    let err = facade().detect_faces_in_image(&heic).unwrap_err();
    assert_eq!(err.code(), "unsupported-image-format");
}

#[test]
fn decodable_subject_without_models_reports_model_load_failure() {
    let err = facade().detect_faces_in_image(&png_bytes()).unwrap_err();
    assert_eq!(err.code(), "model-load-failed");
}

#[test]
fn empty_bindings_are_rejected_before_decoding_the_subject() {
    let err = facade()
        .swap_image(
            &png_bytes(),
            &SwapSource::Multi { bindings: vec![] },
            None,
            false,
        )
        .unwrap_err();
    assert_eq!(err.code(), "missing-face-sources");
}

#[test]
fn binding_without_id_is_invalid() {
    let err = facade()
        .swap_image(
            &png_bytes(),
            &SwapSource::Multi {
                bindings: vec![SourceBinding {
                    face_source_id: String::new(),
                    image: png_bytes(),
                    region: None,
                }],
            },
            None,
            false,
        )
        .unwrap_err();
    assert_eq!(err.code(), "invalid-face-source-binding");
}

#[test]
fn unsupported_video_container_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let subject = dir.path().join("clip.wmv");
    std::fs::write(&subject, b"not a video").unwrap();

    let err = facade()
        .swap_video(VideoSwapOptions {
            subject,
            source: SwapSource::Single {
                target_image: png_bytes(),
            },
            key_frame_ms: None,
            use_accelerator: false,
            output: None,
            workers: None,
        })
        .unwrap_err();
    assert_eq!(err.code(), "unsupported-video-format");
}

#[test]
fn missing_video_file_is_file_not_found() {
    let err = facade()
        .swap_video(VideoSwapOptions {
            subject: PathBuf::from("/no/such/clip.mp4"),
            source: SwapSource::Single {
                target_image: png_bytes(),
            },
            key_frame_ms: None,
            use_accelerator: false,
            output: None,
            workers: None,
        })
        .unwrap_err();
    assert_eq!(err.code(), "file-not-found");
}

#[test]
fn video_probe_rejects_missing_file_before_ffprobe() {
    let err = facade()
        .detect_faces_in_video(&PathBuf::from("/no/such/clip.mkv"), 0)
        .unwrap_err();
    assert_eq!(err.code(), "file-not-found");
}

#[test]
fn sixteen_bit_tiff_subject_passes_the_boundary() {
    // S5: a 16-bit TIFF decodes to 8-bit internally. Without model files
    // the pipeline stops at model load, proving the boundary accepted it.
    let gray16 = image::ImageBuffer::<image::Luma<u16>, Vec<u16>>::from_pixel(16, 16, image::Luma([30_000u16]));
    let mut out = Cursor::new(Vec::new());
    image::DynamicImage::ImageLuma16(gray16)
        .write_to(&mut out, image::ImageFormat::Tiff)
        .unwrap();

    let err = facade().detect_faces_in_image(&out.into_inner()).unwrap_err();
    assert_eq!(err.code(), "model-load-failed");
}
