//! Task lifecycle contracts for the headless swap API.
//!
//! These are the JSON-shaped request/response types any shell (desktop,
//! web, CLI) drives the core with, plus the in-process progress snapshot.

use serde::{Deserialize, Serialize};

use crate::types::Rect;

/// Task lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl TaskState {
    /// Whether the state is one of the three terminal outcomes.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

/// Point-in-time snapshot of a running task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskProgress {
    pub state: TaskState,

    /// 0-100.
    pub progress: f32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta_seconds: Option<f64>,

    /// Human-readable stage label ("detecting", "swapping frames", ...).
    pub stage: String,
}

impl TaskProgress {
    pub fn queued() -> Self {
        Self {
            state: TaskState::Queued,
            progress: 0.0,
            eta_seconds: None,
            stage: "queued".to_string(),
        }
    }
}

/// One face-source binding in a multi-source request: an identity image
/// plus the subject region it should be applied to. A binding without a
/// region targets the largest detected face.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaceSourceBinding {
    /// Identifier chosen by the caller, echoed in errors and tracking.
    pub face_source_id: String,

    /// Path or opaque reference to the identity image, resolved by the
    /// shell before the request reaches the core.
    pub face_source: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<Rect>,
}

/// A swap request as submitted through the headless API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwapRequest {
    pub id: String,

    /// Subject medium: image or video path.
    pub subject: String,

    /// Single-source identity image. Mutually exclusive with `bindings`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,

    /// Multi-source bindings. Mutually exclusive with `target`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bindings: Option<Vec<FaceSourceBinding>>,

    /// Restrict the swap to these subject regions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub regions: Option<Vec<Rect>>,

    /// Key-frame timestamp for seeding video identity tracks.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_frame_ms: Option<u64>,

    #[serde(default)]
    pub use_accelerator: bool,
}

/// Task status response mirrored back to shells.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatusResponse {
    pub status: TaskState,

    pub progress: f32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta_seconds: Option<f64>,

    pub stage: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_path: Option<String>,
}

/// Result of probing a video for faces at a key frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoProbeReport {
    pub regions: Vec<crate::types::Region>,
    pub frame_width: u32,
    pub frame_height: u32,
    pub frame_index: u64,
}
