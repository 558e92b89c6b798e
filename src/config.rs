//! Facade configuration: where the models live and which optional stages
//! run. Environment variables override the defaults so shells can
//! configure a packaged binary without touching code.

use std::env;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use face_engine::engine::EngineConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirageConfig {
    /// Directory holding the four ONNX model files.
    #[serde(default = "default_models_dir")]
    pub models_dir: PathBuf,

    /// Run GFPGAN enhancement after each swap.
    #[serde(default)]
    pub enhance: bool,

    /// Mix between color-corrected and raw swapper output.
    #[serde(default = "default_color_transfer_blend")]
    pub color_transfer_blend: f32,

    /// Where video outputs land; defaults to alongside the subject file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<PathBuf>,
}

fn default_models_dir() -> PathBuf {
    PathBuf::from("models")
}

fn default_color_transfer_blend() -> f32 {
    face_engine::swapper::DEFAULT_COLOR_TRANSFER_BLEND
}

impl Default for MirageConfig {
    fn default() -> Self {
        Self {
            models_dir: default_models_dir(),
            enhance: false,
            color_transfer_blend: default_color_transfer_blend(),
            output_dir: None,
        }
    }
}

impl MirageConfig {
    /// Defaults with environment overrides applied
    /// (`MIRAGE_MODELS_DIR`, `MIRAGE_ENHANCE`, `MIRAGE_OUTPUT_DIR`).
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(dir) = env::var("MIRAGE_MODELS_DIR") {
            config.models_dir = PathBuf::from(dir);
        }
        if let Ok(enhance) = env::var("MIRAGE_ENHANCE") {
            config.enhance = matches!(enhance.to_lowercase().as_str(), "1" | "true" | "yes");
        }
        if let Ok(dir) = env::var("MIRAGE_OUTPUT_DIR") {
            config.output_dir = Some(PathBuf::from(dir));
        }
        config
    }

    /// Engine settings for a given accelerator preference.
    pub fn engine_config(&self, use_accelerator: bool) -> EngineConfig {
        EngineConfig {
            models_dir: self.models_dir.clone(),
            use_accelerator,
            enhance: self.enhance,
            color_transfer_blend: self.color_transfer_blend,
        }
    }
}
