//! Audio pass-through: remux the source audio track into the final
//! container after the video-only file is written.

use std::path::Path;
use std::process::{Command, Stdio};

use tracing::{debug, warn};

use common::error::{SwapError, SwapResult};

/// Combine the freshly encoded video-only file with the first audio track
/// of the original container.
///
/// No audio track: the video-only file is renamed into place. Mux failure:
/// the video-only file is kept as the output and a non-fatal warning is
/// surfaced through the return flag (`true` means audio was carried over).
pub fn finalize_with_audio(
    video_only: &Path,
    original: &Path,
    output: &Path,
    has_audio: bool,
) -> SwapResult<bool> {
    if !video_only.exists() {
        return Err(SwapError::VideoOutputMissing);
    }

    if !has_audio {
        debug!(output = %output.display(), "no audio track, renaming video-only file");
        promote(video_only, output)?;
        return Ok(false);
    }

    let status = Command::new("ffmpeg")
        .args(["-v", "error", "-y", "-i"])
        .arg(video_only)
        .arg("-i")
        .arg(original)
        .args([
            "-map", "0:v:0", "-map", "1:a:0", "-c", "copy",
        ])
        .arg(output)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();

    match status {
        Ok(s) if s.success() && output.exists() => {
            let _ = std::fs::remove_file(video_only);
            Ok(true)
        }
        Ok(s) => {
            warn!(status = ?s, "audio remux failed, keeping video-only output");
            promote(video_only, output)?;
            Ok(false)
        }
        Err(e) => {
            warn!(error = %e, "could not run ffmpeg for audio remux, keeping video-only output");
            promote(video_only, output)?;
            Ok(false)
        }
    }
}

fn promote(video_only: &Path, output: &Path) -> SwapResult<()> {
    if video_only == output {
        return Ok(());
    }
    std::fs::rename(video_only, output)
        .map_err(|e| SwapError::VideoWriteFailed(format!("renaming output: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_video_only_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = finalize_with_audio(
            &dir.path().join("absent.mp4"),
            &dir.path().join("orig.mp4"),
            &dir.path().join("out.mp4"),
            false,
        )
        .unwrap_err();
        assert_eq!(err.code(), "video-output-missing");
    }

    #[test]
    fn no_audio_renames_into_place() {
        let dir = tempfile::tempdir().unwrap();
        let video_only = dir.path().join("work.mp4");
        let output = dir.path().join("final.mp4");
        std::fs::write(&video_only, b"fake video").unwrap();

        let carried = finalize_with_audio(
            &video_only,
            &dir.path().join("orig.mp4"),
            &output,
            false,
        )
        .unwrap();
        assert!(!carried);
        assert!(output.exists());
        assert!(!video_only.exists());
    }
}
