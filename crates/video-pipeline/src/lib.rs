//! Concurrent video processing: ffmpeg-subprocess decode and encode,
//! a multi-worker frame pipeline with ordered write-back, identity
//! tracking across frames, and audio pass-through.

pub mod audio;
pub mod decode;
pub mod encode;
pub mod pipeline;
pub mod probe;
pub mod processor;
pub mod progress;
pub mod tracker;

pub use decode::{decode_frame_at, frame_index_at, FfmpegFrameSource, FrameSource};
pub use encode::{bitrate_for, FfmpegFrameSink, FrameSink};
pub use pipeline::{run, FrameProcessor, PipelineConfig, PipelineReport};
pub use probe::{probe, VideoMetadata};
pub use processor::{SwapFrameProcessor, VideoSwapMode};
pub use progress::ProgressTracker;
pub use tracker::{FaceTrack, IdentityTracker, MAX_MISSED_FRAMES};
