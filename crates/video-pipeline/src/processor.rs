//! The per-frame face swap processor used by the video pipeline workers.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Result;
use tracing::warn;

use common::types::{IdentityVector, Image};
use face_engine::FaceEngine;

use crate::pipeline::FrameProcessor;
use crate::tracker::IdentityTracker;

/// How the processor decides which faces get which identity.
pub enum VideoSwapMode {
    /// One identity applied to every detected face in every frame.
    AllFaces { identity: IdentityVector },
    /// Key-frame-seeded identity tracking: each track carries the identity
    /// it was bound to; unbound faces pass through untouched.
    Tracked {
        tracker: Mutex<IdentityTracker>,
        identities: HashMap<String, IdentityVector>,
    },
}

pub struct SwapFrameProcessor<'a> {
    engine: &'a FaceEngine,
    mode: VideoSwapMode,
}

impl<'a> SwapFrameProcessor<'a> {
    pub fn new(engine: &'a FaceEngine, mode: VideoSwapMode) -> Self {
        Self { engine, mode }
    }
}

impl FrameProcessor for SwapFrameProcessor<'_> {
    /// Detection runs exactly once per frame; all swaps for the frame are
    /// driven off that single pass.
    fn process_frame(&self, _index: u64, frame: &Image) -> Result<Image> {
        let faces = self.engine.detect_faces_raw(frame)?;
        if faces.is_empty() {
            return Ok(frame.clone());
        }

        // (face index, identity) pairs to apply on this frame.
        let assignments: Vec<(usize, IdentityVector)> = match &self.mode {
            VideoSwapMode::AllFaces { identity } => (0..faces.len())
                .map(|i| (i, identity.clone()))
                .collect(),
            VideoSwapMode::Tracked {
                tracker,
                identities,
            } => {
                let bboxes: Vec<_> = faces.iter().map(|f| f.bbox).collect();
                let matches = match tracker.lock() {
                    Ok(mut t) => t.advance(&bboxes),
                    Err(_) => return Ok(frame.clone()),
                };
                matches
                    .into_iter()
                    .filter_map(|(i, source_id)| {
                        let Some(identity) = identities.get(&source_id) else {
                            warn!(%source_id, "track references unknown face source");
                            return None;
                        };
                        Some((i, identity.clone()))
                    })
                    .collect()
            }
        };

        let mut current = frame.clone();
        for (i, identity) in assignments {
            let face = &faces[i];
            match self.engine.swap_face(&current, face, &identity) {
                Ok(swapped) => {
                    current = self.engine.maybe_enhance(swapped, face);
                }
                Err(e) => {
                    warn!(face = i, error = %e, "face swap failed on frame, continuing");
                }
            }
        }
        Ok(current)
    }
}
