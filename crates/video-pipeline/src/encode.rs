//! H.264 encoding via an ffmpeg subprocess fed raw BGR24 frames.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};

use anyhow::{Context, Result};
use tracing::debug;

use common::error::{SwapError, SwapResult};
use common::types::Image;

/// Reference encoding rate: 4 Mbps at 1080p, scaled by pixel count.
const REFERENCE_BITRATE: u64 = 4_000_000;
const REFERENCE_PIXELS: u64 = 1920 * 1080;
const MIN_BITRATE: u64 = 1_000_000;

/// Seam for the writer stage; production impl pipes into ffmpeg, tests
/// collect frames in memory.
pub trait FrameSink: Send {
    fn write_frame(&mut self, frame: &Image) -> Result<()>;
    /// Close the stream and wait for the encoder to finish.
    fn finish(&mut self) -> Result<()>;
}

/// Target bitrate scaled linearly by pixel count from the 1080p reference,
/// never below the floor.
pub fn bitrate_for(width: u32, height: u32) -> u64 {
    let pixels = width as u64 * height as u64;
    (REFERENCE_BITRATE * pixels / REFERENCE_PIXELS).max(MIN_BITRATE)
}

pub struct FfmpegFrameSink {
    child: Child,
    stdin: Option<ChildStdin>,
    output: PathBuf,
    finished: bool,
}

impl FfmpegFrameSink {
    /// Open an encoder writing H.264 MP4 with a one-second I-frame
    /// interval.
    pub fn create(output: &Path, width: u32, height: u32, fps: f64) -> SwapResult<Self> {
        let bitrate = bitrate_for(width, height);
        let gop = fps.round().max(1.0) as u32;

        let args: Vec<String> = vec![
            "-v".to_string(),
            "error".to_string(),
            "-y".to_string(),
            "-f".to_string(),
            "rawvideo".to_string(),
            "-pix_fmt".to_string(),
            "bgr24".to_string(),
            "-s".to_string(),
            format!("{width}x{height}"),
            "-r".to_string(),
            format!("{fps}"),
            "-i".to_string(),
            "pipe:0".to_string(),
            "-c:v".to_string(),
            "libx264".to_string(),
            "-pix_fmt".to_string(),
            "yuv420p".to_string(),
            "-b:v".to_string(),
            bitrate.to_string(),
            "-g".to_string(),
            gop.to_string(),
            "-movflags".to_string(),
            "+faststart".to_string(),
        ];

        let mut child = Command::new("ffmpeg")
            .args(&args)
            .arg(output)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| SwapError::VideoWriteFailed(format!("failed to spawn ffmpeg: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SwapError::VideoWriteFailed("ffmpeg stdin unavailable".into()))?;

        debug!(
            output = %output.display(),
            bitrate,
            gop,
            "opened ffmpeg encoder"
        );

        Ok(Self {
            child,
            stdin: Some(stdin),
            output: output.to_path_buf(),
            finished: false,
        })
    }
}

impl FrameSink for FfmpegFrameSink {
    fn write_frame(&mut self, frame: &Image) -> Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .context("encoder already finished")?;
        stdin
            .write_all(frame.data())
            .context("writing frame to ffmpeg")?;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        // Dropping stdin signals EOS to the encoder.
        drop(self.stdin.take());
        let status = self.child.wait().context("waiting for ffmpeg encoder")?;
        self.finished = true;
        anyhow::ensure!(status.success(), "ffmpeg encoder exited with {status:?}");
        anyhow::ensure!(
            self.output.exists(),
            "encoder reported success but {} is missing",
            self.output.display()
        );
        Ok(())
    }
}

impl Drop for FfmpegFrameSink {
    fn drop(&mut self) {
        if !self.finished {
            drop(self.stdin.take());
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitrate_scales_with_pixel_count() {
        assert_eq!(bitrate_for(1920, 1080), 4_000_000);
        // 720p is 4/9 the pixels of 1080p.
        let b720 = bitrate_for(1280, 720);
        assert!((b720 as i64 - 1_777_777).abs() < 2);
        // 4K doubles twice.
        assert_eq!(bitrate_for(3840, 2160), 16_000_000);
    }

    #[test]
    fn bitrate_is_floored() {
        assert_eq!(bitrate_for(320, 240), MIN_BITRATE);
    }
}
