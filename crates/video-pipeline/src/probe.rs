//! Container probing via ffprobe.

use std::path::Path;
use std::process::Command;

use tracing::debug;

use common::error::{SwapError, SwapResult};

/// What the pipeline needs to know about a video before touching frames.
#[derive(Debug, Clone)]
pub struct VideoMetadata {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    /// Container-declared frame count when available; otherwise estimated
    /// from duration and fps.
    pub frame_count: Option<u64>,
    pub duration_secs: Option<f64>,
    pub has_audio: bool,
}

pub fn probe(path: &Path) -> SwapResult<VideoMetadata> {
    let output = Command::new("ffprobe")
        .args([
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-show_entries",
            "stream=width,height,r_frame_rate,nb_frames,duration",
            "-of",
            "csv=p=0",
        ])
        .arg(path)
        .output()
        .map_err(|e| SwapError::VideoOpenFailed(format!("failed to run ffprobe: {e}")))?;

    if !output.status.success() {
        return Err(SwapError::VideoOpenFailed(format!(
            "ffprobe exited with {:?} for {}",
            output.status,
            path.display()
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let line = stdout
        .lines()
        .next()
        .ok_or_else(|| SwapError::VideoOpenFailed("ffprobe returned no video stream".into()))?;

    let mut metadata = parse_video_line(line)
        .ok_or_else(|| SwapError::VideoOpenFailed(format!("unexpected ffprobe output: {line}")))?;
    metadata.has_audio = probe_has_audio(path);

    debug!(
        path = %path.display(),
        width = metadata.width,
        height = metadata.height,
        fps = metadata.fps,
        frames = ?metadata.frame_count,
        audio = metadata.has_audio,
        "probed video"
    );

    Ok(metadata)
}

/// Parse `width,height,r_frame_rate,duration,nb_frames`-ish CSV. ffprobe
/// emits fields in stream order: width, height, r_frame_rate, duration,
/// nb_frames; missing values show up as `N/A`.
fn parse_video_line(line: &str) -> Option<VideoMetadata> {
    let fields: Vec<&str> = line.trim().split(',').collect();
    if fields.len() < 3 {
        return None;
    }

    let width: u32 = fields[0].parse().ok()?;
    let height: u32 = fields[1].parse().ok()?;
    let fps = parse_rate(fields[2])?;
    if width == 0 || height == 0 || fps <= 0.0 {
        return None;
    }

    let duration_secs: Option<f64> = fields.get(3).and_then(|f| f.parse().ok());
    let mut frame_count: Option<u64> = fields.get(4).and_then(|f| f.parse().ok());
    if frame_count.is_none() {
        frame_count = duration_secs.map(|d| (d * fps).round() as u64);
    }

    Some(VideoMetadata {
        width,
        height,
        fps,
        frame_count,
        duration_secs,
        has_audio: false,
    })
}

/// `r_frame_rate` is a rational like `25/1` or `30000/1001`.
fn parse_rate(raw: &str) -> Option<f64> {
    if let Some((num, den)) = raw.split_once('/') {
        let num: f64 = num.parse().ok()?;
        let den: f64 = den.parse().ok()?;
        if den == 0.0 {
            return None;
        }
        return Some(num / den);
    }
    raw.parse().ok()
}

fn probe_has_audio(path: &Path) -> bool {
    Command::new("ffprobe")
        .args([
            "-v",
            "error",
            "-select_streams",
            "a",
            "-show_entries",
            "stream=index",
            "-of",
            "csv=p=0",
        ])
        .arg(path)
        .output()
        .map(|out| out.status.success() && !out.stdout.is_empty())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_line() {
        let m = parse_video_line("1280,720,25/1,5.000000,125").unwrap();
        assert_eq!(m.width, 1280);
        assert_eq!(m.height, 720);
        assert!((m.fps - 25.0).abs() < 1e-9);
        assert_eq!(m.frame_count, Some(125));
        assert!((m.duration_secs.unwrap() - 5.0).abs() < 1e-9);
    }

    #[test]
    fn estimates_frame_count_from_duration() {
        let m = parse_video_line("1920,1080,30000/1001,10.5,N/A").unwrap();
        assert!((m.fps - 29.97).abs() < 0.01);
        // 10.5s * 29.97 fps, rounded
        assert_eq!(m.frame_count, Some(315));
    }

    #[test]
    fn missing_duration_and_count_is_tolerated() {
        let m = parse_video_line("640,480,25/1,N/A,N/A").unwrap();
        assert_eq!(m.frame_count, None);
        assert_eq!(m.duration_secs, None);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_video_line("").is_none());
        assert!(parse_video_line("a,b,c").is_none());
        assert!(parse_video_line("0,480,25/1").is_none());
        assert!(parse_video_line("640,480,0/0").is_none());
    }

    #[test]
    fn parses_plain_rates() {
        assert!((parse_rate("24").unwrap() - 24.0).abs() < 1e-9);
        assert!((parse_rate("30000/1001").unwrap() - 29.97).abs() < 0.01);
        assert!(parse_rate("x/y").is_none());
    }
}
