//! ONNX session management: one shared session per logical model name,
//! with an execution-provider fallback chain that never fails on a missing
//! accelerator.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use ort::{
    execution_providers::{CPUExecutionProvider, CUDAExecutionProvider},
    session::{builder::GraphOptimizationLevel, Session},
};
use tracing::{info, warn};

use common::error::{SwapError, SwapResult};

/// Logical model names resolved against the models directory.
pub const DETECTOR_MODEL: &str = "scrfd_2.5g";
pub const EMBEDDER_MODEL: &str = "arcface_w600k_r50";
pub const SWAPPER_MODEL: &str = "inswapper_128_fp16";
pub const ENHANCER_MODEL: &str = "gfpgan_1.4";

/// Shared handle to a loaded model. `ort` sessions take `&mut self` for
/// `run`, so concurrent callers serialize on the mutex.
pub type SharedSession = Arc<Mutex<Session>>;

/// Loads models by logical name and caches one session per name for the
/// process lifetime.
pub struct SessionManager {
    models_dir: PathBuf,
    prefer_accelerator: bool,
    sessions: Mutex<HashMap<String, SharedSession>>,
    provider_used: Mutex<String>,
}

impl SessionManager {
    pub fn new(models_dir: impl Into<PathBuf>, prefer_accelerator: bool) -> Self {
        Self {
            models_dir: models_dir.into(),
            prefer_accelerator,
            sessions: Mutex::new(HashMap::new()),
            provider_used: Mutex::new("CPU".to_string()),
        }
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    pub fn prefer_accelerator(&self) -> bool {
        self.prefer_accelerator
    }

    /// Which execution provider the most recent session actually committed
    /// with. Diagnostic only.
    pub fn provider_used(&self) -> String {
        self.provider_used
            .lock()
            .map(|p| p.clone())
            .unwrap_or_else(|_| "CPU".to_string())
    }

    /// Path of a logical model on disk.
    pub fn model_path(&self, logical_name: &str) -> PathBuf {
        self.models_dir.join(format!("{logical_name}.onnx"))
    }

    /// Load (or fetch from cache) a model session by logical name.
    pub fn load(&self, logical_name: &str) -> SwapResult<SharedSession> {
        if let Ok(cache) = self.sessions.lock() {
            if let Some(session) = cache.get(logical_name) {
                return Ok(Arc::clone(session));
            }
        }

        let path = self.model_path(logical_name);
        if !path.exists() {
            return Err(SwapError::ModelLoadFailed {
                name: logical_name.to_string(),
                reason: format!("model file not found: {}", path.display()),
            });
        }

        let (session, provider) = self.build_session(logical_name, &path)?;

        info!(
            model = logical_name,
            provider = %provider,
            path = %path.display(),
            "loaded model session"
        );

        let shared = Arc::new(Mutex::new(session));
        if let Ok(mut cache) = self.sessions.lock() {
            cache.insert(logical_name.to_string(), Arc::clone(&shared));
        }
        if let Ok(mut used) = self.provider_used.lock() {
            *used = provider;
        }
        Ok(shared)
    }

    /// Three-tier fallback: platform accelerator, then a CPU session with
    /// full graph optimization, then the default CPU session. Each tier is
    /// attempted independently; only exhausting all three is an error.
    fn build_session(&self, logical_name: &str, path: &Path) -> SwapResult<(Session, String)> {
        if self.prefer_accelerator {
            let result = Session::builder()
                .and_then(|b| b.with_optimization_level(GraphOptimizationLevel::Level3))
                .and_then(|b| {
                    b.with_execution_providers([
                        CUDAExecutionProvider::default().build(),
                        CPUExecutionProvider::default().build(),
                    ])
                })
                .and_then(|b| b.commit_from_file(path));

            match result {
                Ok(session) => return Ok((session, "CUDA".to_string())),
                Err(e) => {
                    warn!(
                        model = logical_name,
                        error = %e,
                        "accelerated session failed, trying optimized CPU"
                    );
                }
            }
        }

        let optimized = Session::builder()
            .and_then(|b| b.with_optimization_level(GraphOptimizationLevel::Level3))
            .and_then(|b| b.commit_from_file(path));

        match optimized {
            Ok(session) => return Ok((session, "CPU".to_string())),
            Err(e) => {
                warn!(
                    model = logical_name,
                    error = %e,
                    "optimized CPU session failed, trying default CPU"
                );
            }
        }

        let session = Session::builder()
            .and_then(|b| b.commit_from_file(path))
            .map_err(|e| SwapError::ModelLoadFailed {
                name: logical_name.to_string(),
                reason: e.to_string(),
            })?;

        Ok((session, "CPU-default".to_string()))
    }
}
