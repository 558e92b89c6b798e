//! The closed error taxonomy surfaced to callers.
//!
//! Every failure that crosses the task façade maps onto one of these
//! variants; `code()` yields the stable wire identifier used in task
//! status responses.

use std::path::PathBuf;
use thiserror::Error;

pub type SwapResult<T> = Result<T, SwapError>;

#[derive(Debug, Error)]
pub enum SwapError {
    #[error("unsupported image format: {0}")]
    UnsupportedImageFormat(String),

    #[error("unsupported video format: {0}")]
    UnsupportedVideoFormat(String),

    #[error("failed to decode image: {0}")]
    ImageDecodeFailed(String),

    #[error("failed to open video: {0}")]
    VideoOpenFailed(String),

    #[error("file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("no face detected in the subject")]
    NoFaceDetected,

    #[error("no face detected inside the selected regions")]
    NoFaceInSelectedRegions,

    #[error("no face sources were provided")]
    MissingFaceSources,

    #[error("invalid face source binding: {0}")]
    InvalidFaceSourceBinding(String),

    #[error("face source not found: {0}")]
    FaceSourceNotFound(String),

    #[error("failed to write output: {0}")]
    OutputWriteFailed(String),

    #[error("failed to write video: {0}")]
    VideoWriteFailed(String),

    #[error("video output file is missing")]
    VideoOutputMissing,

    #[error("task was cancelled")]
    Cancelled,

    #[error("failed to load model '{name}': {reason}")]
    ModelLoadFailed { name: String, reason: String },
}

impl SwapError {
    /// Stable error code reported through the task protocol.
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnsupportedImageFormat(_) => "unsupported-image-format",
            Self::UnsupportedVideoFormat(_) => "unsupported-video-format",
            Self::ImageDecodeFailed(_) => "image-decode-failed",
            Self::VideoOpenFailed(_) => "video-open-failed",
            Self::FileNotFound(_) => "file-not-found",
            Self::NoFaceDetected => "no-face-detected",
            Self::NoFaceInSelectedRegions => "no-face-in-selected-regions",
            Self::MissingFaceSources => "missing-face-sources",
            Self::InvalidFaceSourceBinding(_) => "invalid-face-source-binding",
            Self::FaceSourceNotFound(_) => "face-source-not-found",
            Self::OutputWriteFailed(_) => "output-write-failed",
            Self::VideoWriteFailed(_) => "video-write-failed",
            Self::VideoOutputMissing => "video-output-missing",
            Self::Cancelled => "cancelled",
            Self::ModelLoadFailed { .. } => "model-load-failed",
        }
    }
}
