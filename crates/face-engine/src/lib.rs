//! The four-stage face replacement inference engine: SCRFD detection,
//! ArcFace embedding, InSwapper swapping, optional GFPGAN enhancement,
//! plus the geometry and session plumbing that binds them.

pub mod align;
pub mod detector;
pub mod embedder;
pub mod emap;
pub mod engine;
pub mod enhancer;
pub mod regions;
pub mod session;
pub mod swapper;

pub use detector::{Detector, DetectorOutputShape};
pub use embedder::Embedder;
pub use emap::{extract_emap, Emap, EmapStatus};
pub use engine::{EngineConfig, FaceEngine, ResolvedBinding, StillSwapPlan};
pub use enhancer::Enhancer;
pub use session::SessionManager;
pub use swapper::Swapper;
