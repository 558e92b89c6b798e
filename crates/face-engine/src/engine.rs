//! Still-image orchestration: detect, bind, swap, optionally enhance.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use common::error::{SwapError, SwapResult};
use common::types::{ChannelOrder, DetectedFace, FaceSource, IdentityVector, Image, Rect, Region};

use crate::detector::Detector;
use crate::embedder::Embedder;
use crate::enhancer::Enhancer;
use crate::regions::{bind_region, detections_to_regions, largest_face};
use crate::session::{
    SessionManager, DETECTOR_MODEL, EMBEDDER_MODEL, ENHANCER_MODEL, SWAPPER_MODEL,
};
use crate::swapper::{Swapper, DEFAULT_COLOR_TRANSFER_BLEND};

/// Engine construction settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub models_dir: PathBuf,

    /// Try the platform accelerator before falling back to CPU.
    #[serde(default)]
    pub use_accelerator: bool,

    /// Run the GFPGAN enhancement pass after each swap.
    #[serde(default)]
    pub enhance: bool,

    /// Mix between color-corrected and raw swapper output.
    #[serde(default = "default_color_transfer_blend")]
    pub color_transfer_blend: f32,
}

fn default_color_transfer_blend() -> f32 {
    DEFAULT_COLOR_TRANSFER_BLEND
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            models_dir: PathBuf::from("models"),
            use_accelerator: false,
            enhance: false,
            color_transfer_blend: default_color_transfer_blend(),
        }
    }
}

/// A face source resolved to its identity vector, plus the subject region
/// it applies to (none = largest face).
#[derive(Debug, Clone)]
pub struct ResolvedBinding {
    pub face_source_id: String,
    pub identity: IdentityVector,
    pub region: Option<Rect>,
}

/// What to swap in a still image.
pub enum StillSwapPlan {
    /// One identity applied to every face, or only to the faces inside the
    /// given regions.
    SingleSource {
        identity: IdentityVector,
        regions: Option<Vec<Rect>>,
    },
    /// Ordered multi-source bindings, chained over the mutating image.
    MultiSource { bindings: Vec<ResolvedBinding> },
}

/// The four-model inference engine. Sessions are created once and shared
/// read-only for the engine's lifetime.
pub struct FaceEngine {
    detector: Detector,
    embedder: Embedder,
    swapper: Swapper,
    enhancer: Option<Enhancer>,
}

impl FaceEngine {
    pub fn new(config: &EngineConfig) -> SwapResult<Self> {
        let sessions = SessionManager::new(&config.models_dir, config.use_accelerator);

        let detector = Detector::new(sessions.load(DETECTOR_MODEL)?).map_err(|e| {
            SwapError::ModelLoadFailed {
                name: DETECTOR_MODEL.to_string(),
                reason: e.to_string(),
            }
        })?;

        let embedder = Embedder::new(sessions.load(EMBEDDER_MODEL)?);

        let swapper_session = sessions.load(SWAPPER_MODEL)?;
        let swapper_bytes = std::fs::read(sessions.model_path(SWAPPER_MODEL)).map_err(|e| {
            SwapError::ModelLoadFailed {
                name: SWAPPER_MODEL.to_string(),
                reason: e.to_string(),
            }
        })?;
        let swapper = Swapper::new(swapper_session, &swapper_bytes, config.color_transfer_blend);
        if !swapper.emap_loaded() {
            // Already warned in detail by the extractor; keep one summary
            // line at engine level for task logs.
            warn!("swapper running without emap transform");
        }

        let enhancer = if config.enhance {
            Some(Enhancer::new(sessions.load(ENHANCER_MODEL)?))
        } else {
            None
        };

        info!(
            models_dir = %config.models_dir.display(),
            provider = %sessions.provider_used(),
            enhance = config.enhance,
            "face engine ready"
        );

        Ok(Self {
            detector,
            embedder,
            swapper,
            enhancer,
        })
    }

    /// Detect faces in a BGR frame; inference errors propagate raw for
    /// callers that treat them as per-frame events.
    pub fn detect_faces_raw(&self, frame: &Image) -> anyhow::Result<Vec<DetectedFace>> {
        self.detector.detect(frame)
    }

    /// Detect faces, mapping engine failures onto the task taxonomy.
    pub fn detect_faces(&self, frame: &Image) -> SwapResult<Vec<DetectedFace>> {
        self.detect_faces_raw(frame)
            .map_err(|e| SwapError::ModelLoadFailed {
                name: DETECTOR_MODEL.to_string(),
                reason: e.to_string(),
            })
    }

    /// Detect and square-expand faces into selectable regions.
    pub fn regions_for_image(&self, frame: &Image) -> SwapResult<Vec<Region>> {
        let faces = self.detect_faces(frame)?;
        Ok(detections_to_regions(&faces, frame.width(), frame.height()))
    }

    /// Embed one detected face.
    pub fn embed_face(&self, frame: &Image, face: &DetectedFace) -> SwapResult<IdentityVector> {
        self.embedder
            .embed(frame, face)
            .map_err(|e| SwapError::ModelLoadFailed {
                name: EMBEDDER_MODEL.to_string(),
                reason: e.to_string(),
            })
    }

    /// Detect and embed the largest face of a face-source image once.
    pub fn resolve_source(&self, source: &FaceSource) -> SwapResult<IdentityVector> {
        let bgr = source.face_image.clone().into_order(ChannelOrder::Bgr);
        let faces = self.detect_faces(&bgr)?;
        let idx = largest_face(&faces).ok_or_else(|| {
            SwapError::FaceSourceNotFound(source.id.clone())
        })?;
        self.embed_face(&bgr, &faces[idx])
    }

    pub fn swap_face(
        &self,
        frame: &Image,
        face: &DetectedFace,
        identity: &IdentityVector,
    ) -> anyhow::Result<Image> {
        self.swapper.swap_face(frame, face, identity)
    }

    /// Run the optional enhancement pass. Faces with synthesized landmarks
    /// are skipped silently; enhancement failures leave the frame as-is.
    pub fn maybe_enhance(&self, frame: Image, face: &DetectedFace) -> Image {
        let Some(enhancer) = &self.enhancer else {
            return frame;
        };
        if !face.landmarks_predicted {
            debug!("skipping enhancement for face without predicted landmarks");
            return frame;
        }
        match enhancer.enhance_face(&frame, face) {
            Ok(enhanced) => enhanced,
            Err(e) => {
                warn!(error = %e, "enhancement failed, keeping swapped frame");
                frame
            }
        }
    }

    pub fn enhancer_enabled(&self) -> bool {
        self.enhancer.is_some()
    }

    pub fn emap_loaded(&self) -> bool {
        self.swapper.emap_loaded()
    }

    /// Swap faces in a still image according to the plan. Per-face failures
    /// are logged and skipped; the image is returned with the successful
    /// swaps applied.
    pub fn swap_still(&self, subject: Image, plan: &StillSwapPlan) -> SwapResult<Image> {
        debug_assert_eq!(subject.order(), ChannelOrder::Bgr);
        match plan {
            StillSwapPlan::SingleSource { identity, regions } => {
                self.swap_single_source(subject, identity, regions.as_deref())
            }
            StillSwapPlan::MultiSource { bindings } => self.swap_multi_source(subject, bindings),
        }
    }

    fn swap_single_source(
        &self,
        subject: Image,
        identity: &IdentityVector,
        regions: Option<&[Rect]>,
    ) -> SwapResult<Image> {
        let faces = self.detect_faces(&subject)?;
        if faces.is_empty() {
            return Err(SwapError::NoFaceDetected);
        }

        let selected: Vec<usize> = match regions {
            None => (0..faces.len()).collect(),
            Some(regions) => {
                let mut indices = Vec::new();
                for region in regions {
                    match bind_region(region, &faces, subject.width(), subject.height()) {
                        Some(i) if !indices.contains(&i) => indices.push(i),
                        Some(_) => {}
                        None => {
                            debug!(?region, "no face in selected region");
                        }
                    }
                }
                if indices.is_empty() {
                    return Err(SwapError::NoFaceInSelectedRegions);
                }
                indices
            }
        };

        let mut current = subject;
        for i in selected {
            let face = &faces[i];
            match self.swap_face(&current, face, identity) {
                Ok(swapped) => {
                    current = self.maybe_enhance(swapped, face);
                }
                Err(e) => {
                    warn!(face = i, error = %e, "face swap failed, continuing");
                }
            }
        }
        Ok(current)
    }

    /// Bindings chain: each swap returns a new owned image, and subsequent
    /// bindings detect on the already-swapped pixels, so ordering is
    /// caller-controlled and meaningful.
    fn swap_multi_source(
        &self,
        subject: Image,
        bindings: &[ResolvedBinding],
    ) -> SwapResult<Image> {
        if bindings.is_empty() {
            return Err(SwapError::MissingFaceSources);
        }

        let mut current = subject;
        let mut swapped_any = false;
        let mut any_region = false;

        for binding in bindings {
            let faces = self.detect_faces(&current)?;
            let idx = match &binding.region {
                Some(region) => {
                    any_region = true;
                    bind_region(region, &faces, current.width(), current.height())
                }
                None => largest_face(&faces),
            };
            let Some(idx) = idx else {
                warn!(
                    face_source_id = %binding.face_source_id,
                    "no face found for binding, skipping"
                );
                continue;
            };

            let face = &faces[idx];
            match self.swap_face(&current, face, &binding.identity) {
                Ok(swapped) => {
                    current = self.maybe_enhance(swapped, face);
                    swapped_any = true;
                }
                Err(e) => {
                    warn!(
                        face_source_id = %binding.face_source_id,
                        error = %e,
                        "face swap failed for binding, continuing"
                    );
                }
            }
        }

        if !swapped_any {
            return Err(if any_region {
                SwapError::NoFaceInSelectedRegions
            } else {
                SwapError::NoFaceDetected
            });
        }
        Ok(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = EngineConfig::default();
        assert!(!config.use_accelerator);
        assert!(!config.enhance);
        assert!((config.color_transfer_blend - 0.5).abs() < 1e-6);
        assert_eq!(config.models_dir, PathBuf::from("models"));
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"models_dir": "/opt/models"}"#).unwrap();
        assert_eq!(config.models_dir, PathBuf::from("/opt/models"));
        assert!((config.color_transfer_blend - 0.5).abs() < 1e-6);
        assert!(!config.use_accelerator);
    }

    #[test]
    fn engine_construction_fails_cleanly_without_models() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            models_dir: dir.path().to_path_buf(),
            ..EngineConfig::default()
        };
        let err = match FaceEngine::new(&config) {
            Err(e) => e,
            Ok(_) => panic!("engine must not construct without model files"),
        };
        assert_eq!(err.code(), "model-load-failed");
    }
}
