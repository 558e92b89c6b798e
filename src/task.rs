//! Task lifecycle: a handle with `progress()`, `cancel()` and
//! `await_result()`, plus a thin progress-callback adapter.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, info};

use common::error::{SwapError, SwapResult};
use common::task::{TaskProgress, TaskState, TaskStatusResponse};
use std::path::PathBuf;
use video_pipeline::ProgressTracker;

type ProgressCallback = Box<dyn Fn(&TaskProgress) + Send + Sync>;

const CALLBACK_INTERVAL: Duration = Duration::from_millis(250);

struct TaskInner {
    state: TaskState,
    stage: String,
    tracker: Option<Arc<ProgressTracker>>,
    output_path: Option<PathBuf>,
    error: Option<SwapError>,
}

struct TaskShared {
    cancel: AtomicBool,
    inner: Mutex<TaskInner>,
    callbacks: Mutex<Vec<ProgressCallback>>,
}

impl TaskShared {
    fn snapshot(&self) -> TaskProgress {
        let Ok(inner) = self.inner.lock() else {
            return TaskProgress::queued();
        };
        let (progress, eta_seconds) = match inner.state {
            TaskState::Succeeded => (100.0, None),
            TaskState::Running => inner
                .tracker
                .as_ref()
                .map(|t| {
                    let (p, eta) = t.snapshot();
                    (p, eta)
                })
                .unwrap_or((0.0, None)),
            _ => (0.0, None),
        };
        TaskProgress {
            state: inner.state,
            progress,
            eta_seconds,
            stage: inner.stage.clone(),
        }
    }
}

/// Handle to an asynchronous swap task running on its own thread set.
pub struct TaskHandle {
    id: String,
    shared: Arc<TaskShared>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl TaskHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Point-in-time progress snapshot.
    pub fn progress(&self) -> TaskProgress {
        self.shared.snapshot()
    }

    /// Full status in the task-protocol shape.
    pub fn status(&self) -> TaskStatusResponse {
        let progress = self.progress();
        let (error_code, output_path) = match self.shared.inner.lock() {
            Ok(inner) => (
                inner.error.as_ref().map(|e| e.code().to_string()),
                inner
                    .output_path
                    .as_ref()
                    .map(|p| p.display().to_string()),
            ),
            Err(_) => (None, None),
        };
        TaskStatusResponse {
            status: progress.state,
            progress: progress.progress,
            eta_seconds: progress.eta_seconds,
            stage: progress.stage,
            error_code,
            output_path,
        }
    }

    /// Request cooperative cancellation. Best-effort: in-flight frames may
    /// still drain before the task reports `cancelled`.
    pub fn cancel(&self) {
        info!(task = %self.id, "cancellation requested");
        self.shared.cancel.store(true, Ordering::Relaxed);
    }

    /// Register a progress callback, invoked periodically from a monitor
    /// thread and once on completion.
    pub fn on_progress(&self, callback: impl Fn(&TaskProgress) + Send + Sync + 'static) {
        if let Ok(mut callbacks) = self.shared.callbacks.lock() {
            callbacks.push(Box::new(callback));
        }
    }

    /// Block until the task finishes and return the output path.
    pub fn await_result(&self) -> SwapResult<PathBuf> {
        let handle = self.join.lock().ok().and_then(|mut j| j.take());
        if let Some(handle) = handle {
            if handle.join().is_err() {
                if let Ok(mut inner) = self.shared.inner.lock() {
                    inner.state = TaskState::Failed;
                    inner.error = Some(SwapError::VideoWriteFailed(
                        "task thread panicked".to_string(),
                    ));
                }
            }
        }

        let Ok(mut inner) = self.shared.inner.lock() else {
            return Err(SwapError::VideoWriteFailed("task state poisoned".into()));
        };
        match inner.state {
            TaskState::Succeeded => inner
                .output_path
                .clone()
                .ok_or(SwapError::VideoOutputMissing),
            TaskState::Cancelled => Err(SwapError::Cancelled),
            _ => Err(inner
                .error
                .take()
                .unwrap_or_else(|| SwapError::VideoWriteFailed("task failed".into()))),
        }
    }
}

/// Shared-state view handed to the task body.
#[derive(Clone)]
pub(crate) struct TaskContext {
    shared: Arc<TaskShared>,
}

impl TaskContext {
    pub(crate) fn cancelled(&self) -> bool {
        self.shared.cancel.load(Ordering::Relaxed)
    }

    pub(crate) fn cancel_flag(&self) -> &AtomicBool {
        &self.shared.cancel
    }

    pub(crate) fn set_stage(&self, stage: &str) {
        debug!(stage, "task stage");
        if let Ok(mut inner) = self.shared.inner.lock() {
            inner.stage = stage.to_string();
        }
    }

    pub(crate) fn attach_tracker(&self, tracker: Arc<ProgressTracker>) {
        if let Ok(mut inner) = self.shared.inner.lock() {
            inner.tracker = Some(tracker);
        }
    }
}

/// Spawn a task body on its own thread and return the handle. A second
/// monitor thread drives registered progress callbacks until the task
/// reaches a terminal state.
pub(crate) fn spawn_task<F>(id: String, body: F) -> TaskHandle
where
    F: FnOnce(&TaskContext) -> SwapResult<PathBuf> + Send + 'static,
{
    let shared = Arc::new(TaskShared {
        cancel: AtomicBool::new(false),
        inner: Mutex::new(TaskInner {
            state: TaskState::Queued,
            stage: "queued".to_string(),
            tracker: None,
            output_path: None,
            error: None,
        }),
        callbacks: Mutex::new(Vec::new()),
    });

    let worker_shared = Arc::clone(&shared);
    let task_id = id.clone();
    let join = std::thread::spawn(move || {
        if let Ok(mut inner) = worker_shared.inner.lock() {
            inner.state = TaskState::Running;
            inner.stage = "starting".to_string();
        }

        let context = TaskContext {
            shared: Arc::clone(&worker_shared),
        };
        let result = body(&context);

        if let Ok(mut inner) = worker_shared.inner.lock() {
            match result {
                Ok(path) => {
                    info!(task = %task_id, output = %path.display(), "task succeeded");
                    inner.state = TaskState::Succeeded;
                    inner.stage = "done".to_string();
                    inner.output_path = Some(path);
                }
                Err(SwapError::Cancelled) => {
                    info!(task = %task_id, "task cancelled");
                    inner.state = TaskState::Cancelled;
                    inner.stage = "cancelled".to_string();
                }
                Err(e) => {
                    info!(task = %task_id, error = %e, "task failed");
                    inner.state = TaskState::Failed;
                    inner.stage = "failed".to_string();
                    inner.error = Some(e);
                }
            }
        }
    });

    let monitor_shared = Arc::clone(&shared);
    std::thread::spawn(move || loop {
        let progress = monitor_shared.snapshot();
        if let Ok(callbacks) = monitor_shared.callbacks.lock() {
            for callback in callbacks.iter() {
                callback(&progress);
            }
        }
        if progress.state.is_terminal() {
            break;
        }
        std::thread::sleep(CALLBACK_INTERVAL);
    });

    TaskHandle {
        id,
        shared,
        join: Mutex::new(Some(join)),
    }
}
