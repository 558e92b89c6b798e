//! Frame decoding via an ffmpeg subprocess piping raw BGR24.

use std::io::Read;
use std::path::Path;
use std::process::{Child, ChildStdout, Command, Stdio};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use common::error::{SwapError, SwapResult};
use common::types::{ChannelOrder, Image};

use crate::probe::VideoMetadata;

/// Seam for the decoder stage so the pipeline can run against synthetic
/// frames in tests. `recycle` offers a returned frame buffer for reuse.
pub trait FrameSource: Send {
    fn next_frame(&mut self, recycle: Option<Vec<u8>>) -> Result<Option<Image>>;
}

/// Streaming rawvideo decoder: one ffmpeg child per source, frames read
/// off its stdout in decode order.
pub struct FfmpegFrameSource {
    child: Child,
    stdout: ChildStdout,
    width: u32,
    height: u32,
    frame_len: usize,
}

impl FfmpegFrameSource {
    pub fn open(path: &Path, metadata: &VideoMetadata) -> SwapResult<Self> {
        let mut child = Command::new("ffmpeg")
            .args(["-v", "error", "-i"])
            .arg(path)
            .args(["-f", "rawvideo", "-pix_fmt", "bgr24", "pipe:1"])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .stdin(Stdio::null())
            .spawn()
            .map_err(|e| SwapError::VideoOpenFailed(format!("failed to spawn ffmpeg: {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SwapError::VideoOpenFailed("ffmpeg stdout unavailable".into()))?;

        debug!(path = %path.display(), "opened ffmpeg decoder");

        Ok(Self {
            child,
            stdout,
            width: metadata.width,
            height: metadata.height,
            frame_len: metadata.width as usize * metadata.height as usize * 3,
        })
    }
}

impl FrameSource for FfmpegFrameSource {
    fn next_frame(&mut self, recycle: Option<Vec<u8>>) -> Result<Option<Image>> {
        let mut buf = recycle.unwrap_or_default();
        buf.resize(self.frame_len, 0);

        let mut filled = 0;
        while filled < self.frame_len {
            let n = self
                .stdout
                .read(&mut buf[filled..])
                .context("reading frame from ffmpeg")?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None); // clean EOS on a frame boundary
                }
                anyhow::bail!("truncated frame: got {filled} of {} bytes", self.frame_len);
            }
            filled += n;
        }

        Ok(Some(Image::new(
            self.width,
            self.height,
            ChannelOrder::Bgr,
            buf,
        )))
    }
}

impl Drop for FfmpegFrameSource {
    fn drop(&mut self) {
        if let Err(e) = self.child.kill() {
            debug!(error = %e, "ffmpeg decoder already exited");
        }
        let _ = self.child.wait();
    }
}

/// Decode exactly one frame at the given timestamp (for key-frame probing).
pub fn decode_frame_at(path: &Path, timestamp_ms: u64, metadata: &VideoMetadata) -> SwapResult<Image> {
    let frame_len = metadata.width as usize * metadata.height as usize * 3;
    let seek_secs = timestamp_ms as f64 / 1000.0;

    let output = Command::new("ffmpeg")
        .args(["-v", "error", "-ss"])
        .arg(format!("{seek_secs:.3}"))
        .arg("-i")
        .arg(path)
        .args([
            "-vframes", "1", "-f", "rawvideo", "-pix_fmt", "bgr24", "pipe:1",
        ])
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .output()
        .map_err(|e| SwapError::VideoOpenFailed(format!("failed to run ffmpeg: {e}")))?;

    if !output.status.success() || output.stdout.len() < frame_len {
        warn!(
            path = %path.display(),
            timestamp_ms,
            got = output.stdout.len(),
            want = frame_len,
            "single-frame decode failed"
        );
        return Err(SwapError::VideoOpenFailed(format!(
            "could not decode frame at {timestamp_ms} ms from {}",
            path.display()
        )));
    }

    let mut data = output.stdout;
    data.truncate(frame_len);
    Ok(Image::new(
        metadata.width,
        metadata.height,
        ChannelOrder::Bgr,
        data,
    ))
}

/// Frame index at a timestamp, for reporting which frame a probe used.
pub fn frame_index_at(timestamp_ms: u64, fps: f64) -> u64 {
    ((timestamp_ms as f64 / 1000.0) * fps).round() as u64
}
