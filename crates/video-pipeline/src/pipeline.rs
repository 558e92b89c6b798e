//! The staged concurrent frame pipeline.
//!
//! One decoder thread feeds a bounded queue, N workers process frames, and
//! a single writer drains a reorder buffer so frames leave in decode order
//! regardless of completion order. Back-pressure comes from the bounded
//! queue only; the reorder buffer stays small because it can hold at most
//! one in-flight frame per worker plus the queue capacity.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use anyhow::Result;
use crossbeam_channel::bounded;
use tracing::{debug, warn};

use common::error::{SwapError, SwapResult};
use common::types::{FrameItem, Image};

use crate::decode::FrameSource;
use crate::encode::FrameSink;
use crate::progress::ProgressTracker;

/// Per-frame transformation applied by the worker threads. Stateless with
/// respect to per-call inputs; shared across workers.
pub trait FrameProcessor: Sync {
    fn process_frame(&self, index: u64, frame: &Image) -> Result<Image>;
}

#[derive(Debug, Clone, Copy)]
pub struct PipelineConfig {
    pub workers: usize,
    pub queue_capacity: usize,
}

impl PipelineConfig {
    pub fn for_hardware(accelerated: bool) -> Self {
        let workers = worker_count(accelerated);
        Self {
            workers,
            queue_capacity: queue_capacity(workers),
        }
    }

    pub fn with_workers(workers: usize) -> Self {
        let workers = workers.max(1);
        Self {
            workers,
            queue_capacity: queue_capacity(workers),
        }
    }
}

/// Two workers when an accelerator is active (GPU contention thrashes),
/// otherwise one per core minus one, capped at six.
pub fn worker_count(accelerated: bool) -> usize {
    if accelerated {
        2
    } else {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        cores.saturating_sub(1).clamp(1, 6)
    }
}

pub fn queue_capacity(workers: usize) -> usize {
    (3 * workers).max(5)
}

#[derive(Debug, Default)]
pub struct PipelineReport {
    pub frames_decoded: u64,
    pub frames_written: u64,
    /// Frames written unmodified because their worker failed.
    pub frames_passed_through: u64,
}

enum WorkItem {
    Frame(FrameItem),
    Eos,
}

#[derive(Default)]
struct ReorderState {
    frames: HashMap<u64, Image>,
    /// Total frame count, declared by the decoder at end of stream.
    total: Option<u64>,
    workers_done: usize,
    decode_error: Option<String>,
    /// Raised by the writer so the decoder and workers stop early.
    abort: bool,
}

/// Recycled frame backing stores, sized to the pipeline's working set.
struct BufferPool {
    slots: Mutex<Vec<Vec<u8>>>,
    capacity: usize,
}

impl BufferPool {
    fn new(capacity: usize) -> Self {
        Self {
            slots: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
        }
    }

    fn take(&self) -> Option<Vec<u8>> {
        self.slots.lock().ok().and_then(|mut s| s.pop())
    }

    fn put(&self, buf: Vec<u8>) {
        if let Ok(mut slots) = self.slots.lock() {
            if slots.len() < self.capacity {
                slots.push(buf);
            }
        }
    }
}

const WRITER_POLL: Duration = Duration::from_millis(50);

/// Run the pipeline to completion, cancellation, or failure.
///
/// Cancellation is cooperative: the flag is polled at the decoder after
/// each frame, at each worker before inference, and at the writer before
/// each write. Single-frame processor failures pass the original frame
/// through; decoder or writer failures abort.
pub fn run<S, K, P>(
    mut source: S,
    mut sink: K,
    processor: &P,
    config: PipelineConfig,
    cancel: &AtomicBool,
    progress: &ProgressTracker,
) -> SwapResult<PipelineReport>
where
    S: FrameSource,
    K: FrameSink,
    P: FrameProcessor,
{
    let state = Mutex::new(ReorderState::default());
    let cond = Condvar::new();
    let (tx, rx) = bounded::<WorkItem>(config.queue_capacity);
    let pool = BufferPool::new(config.workers + config.queue_capacity);
    let passed_through = AtomicU64::new(0);

    let (decoded, writer_result) = std::thread::scope(|scope| {
        let state = &state;
        let cond = &cond;
        let pool = &pool;
        let passed_through = &passed_through;

        let decoder = scope.spawn(move || -> u64 {
            let mut index = 0u64;
            loop {
                if cancel.load(Ordering::Relaxed) || aborted(state) {
                    break;
                }
                match source.next_frame(pool.take()) {
                    Ok(Some(pixels)) => {
                        if tx.send(WorkItem::Frame(FrameItem { index, pixels })).is_err() {
                            break;
                        }
                        index += 1;
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "decoder failed, aborting task");
                        if let Ok(mut s) = state.lock() {
                            s.decode_error = Some(e.to_string());
                        }
                        cond.notify_all();
                        break;
                    }
                }
            }
            // Deterministic worker shutdown: one sentinel each.
            for _ in 0..config.workers {
                let _ = tx.send(WorkItem::Eos);
            }
            if let Ok(mut s) = state.lock() {
                if s.decode_error.is_none() {
                    s.total = Some(index);
                }
            }
            cond.notify_all();
            index
        });

        for worker_id in 0..config.workers {
            let rx = rx.clone();
            scope.spawn(move || {
                while let Ok(item) = rx.recv() {
                    let item = match item {
                        WorkItem::Frame(item) => item,
                        WorkItem::Eos => break,
                    };
                    if cancel.load(Ordering::Relaxed) || aborted(state) {
                        // Drain without processing so the decoder unblocks.
                        continue;
                    }

                    let output = match processor.process_frame(item.index, &item.pixels) {
                        Ok(out) => out,
                        Err(e) => {
                            warn!(
                                worker = worker_id,
                                frame = item.index,
                                error = %e,
                                "frame processing failed, passing original through"
                            );
                            passed_through.fetch_add(1, Ordering::Relaxed);
                            item.pixels
                        }
                    };

                    if let Ok(mut s) = state.lock() {
                        s.frames.insert(item.index, output);
                    }
                    cond.notify_all();
                    progress.record_processed();
                }
                if let Ok(mut s) = state.lock() {
                    s.workers_done += 1;
                }
                cond.notify_all();
            });
        }

        let writer = scope.spawn(move || -> SwapResult<u64> {
            let mut next = 0u64;
            let mut written = 0u64;
            let mut guard = state
                .lock()
                .map_err(|_| SwapError::VideoWriteFailed("pipeline state poisoned".into()))?;
            loop {
                if cancel.load(Ordering::Relaxed) {
                    return Err(SwapError::Cancelled);
                }
                if let Some(e) = guard.decode_error.clone() {
                    return Err(SwapError::VideoOpenFailed(e));
                }

                if let Some(frame) = guard.frames.remove(&next) {
                    drop(guard);
                    if cancel.load(Ordering::Relaxed) {
                        return Err(SwapError::Cancelled);
                    }
                    if let Err(e) = sink.write_frame(&frame) {
                        if let Ok(mut s) = state.lock() {
                            s.abort = true;
                        }
                        return Err(SwapError::VideoWriteFailed(e.to_string()));
                    }
                    pool.put(frame.into_data());
                    next += 1;
                    written += 1;
                    guard = state.lock().map_err(|_| {
                        SwapError::VideoWriteFailed("pipeline state poisoned".into())
                    })?;
                    continue;
                }

                if guard.total == Some(next) {
                    drop(guard);
                    sink.finish()
                        .map_err(|e| SwapError::VideoWriteFailed(e.to_string()))?;
                    return Ok(written);
                }

                let (g, _) = cond.wait_timeout(guard, WRITER_POLL).map_err(|_| {
                    SwapError::VideoWriteFailed("pipeline state poisoned".into())
                })?;
                guard = g;
            }
        });

        let decoded = decoder.join().unwrap_or(0);
        let writer_result = writer
            .join()
            .unwrap_or_else(|_| Err(SwapError::VideoWriteFailed("writer thread panicked".into())));
        (decoded, writer_result)
    });

    if cancel.load(Ordering::Relaxed) {
        debug!("pipeline stopped by cancellation");
        return Err(SwapError::Cancelled);
    }

    let written = writer_result?;

    Ok(PipelineReport {
        frames_decoded: decoded,
        frames_written: written,
        frames_passed_through: passed_through.load(Ordering::Relaxed),
    })
}

fn aborted(state: &Mutex<ReorderState>) -> bool {
    state.lock().map(|s| s.abort).unwrap_or(true)
}
