//! mirage: offline, on-device face replacement for still images and video.
//!
//! The headless task API any shell (desktop, web, CLI) drives: detect faces
//! for region pickers, swap a still image synchronously, or run a video
//! swap as an asynchronous task with progress and cooperative cancellation.

pub mod config;
pub mod task;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use common::error::{SwapError, SwapResult};
use common::imageio;
use common::task::{SwapRequest, VideoProbeReport};
use common::types::{ChannelOrder, FaceSource, IdentityVector, Rect, Region};
use face_engine::{FaceEngine, ResolvedBinding, StillSwapPlan};
use video_pipeline::audio::finalize_with_audio;
use video_pipeline::{
    decode_frame_at, frame_index_at, probe, FfmpegFrameSink, FfmpegFrameSource, IdentityTracker,
    PipelineConfig, ProgressTracker, SwapFrameProcessor, VideoSwapMode,
};

pub use common::error::SwapError as Error;
pub use common::task::{TaskProgress, TaskState, TaskStatusResponse};
pub use config::MirageConfig;
pub use task::TaskHandle;

/// Identity input for a swap: one target image, or ordered multi-source
/// bindings.
pub enum SwapSource {
    Single { target_image: Vec<u8> },
    Multi { bindings: Vec<SourceBinding> },
}

/// One multi-source binding: identity image bytes plus the subject region
/// it applies to (none = largest face).
pub struct SourceBinding {
    pub face_source_id: String,
    pub image: Vec<u8>,
    pub region: Option<Rect>,
}

/// Options for an asynchronous video swap.
pub struct VideoSwapOptions {
    pub subject: PathBuf,
    pub source: SwapSource,
    /// Key frame for seeding identity tracks (multi-source only).
    pub key_frame_ms: Option<u64>,
    pub use_accelerator: bool,
    /// Output file; defaults next to the subject.
    pub output: Option<PathBuf>,
    /// Worker-count override; defaults to the hardware policy.
    pub workers: Option<usize>,
}

/// The engine facade. Model sessions are loaded once per accelerator
/// preference and shared read-only across all tasks for the process
/// lifetime.
pub struct Mirage {
    config: MirageConfig,
    engines: Mutex<HashMap<bool, Arc<FaceEngine>>>,
}

impl Mirage {
    pub fn new(config: MirageConfig) -> Self {
        Self {
            config,
            engines: Mutex::new(HashMap::new()),
        }
    }

    /// Construct from defaults plus environment overrides.
    pub fn from_env() -> Self {
        Self::new(MirageConfig::from_env())
    }

    pub fn config(&self) -> &MirageConfig {
        &self.config
    }

    fn engine(&self, use_accelerator: bool) -> SwapResult<Arc<FaceEngine>> {
        if let Ok(cache) = self.engines.lock() {
            if let Some(engine) = cache.get(&use_accelerator) {
                return Ok(Arc::clone(engine));
            }
        }
        let engine = Arc::new(FaceEngine::new(
            &self.config.engine_config(use_accelerator),
        )?);
        if let Ok(mut cache) = self.engines.lock() {
            cache.insert(use_accelerator, Arc::clone(&engine));
        }
        Ok(engine)
    }

    /// Detect faces in an image and return selectable regions.
    pub fn detect_faces_in_image(&self, image_bytes: &[u8]) -> SwapResult<Vec<Region>> {
        let subject = imageio::decode_image(image_bytes)?.into_order(ChannelOrder::Bgr);
        self.engine(false)?.regions_for_image(&subject)
    }

    /// Seek a video to the key frame, decode one frame, and run the image
    /// detection pathway on it.
    pub fn detect_faces_in_video(
        &self,
        video_path: &Path,
        keyframe_ms: u64,
    ) -> SwapResult<VideoProbeReport> {
        imageio::validate_video_path(video_path)?;
        let metadata = probe(video_path)?;
        let frame = decode_frame_at(video_path, keyframe_ms, &metadata)?;
        let regions = self.engine(false)?.regions_for_image(&frame)?;
        Ok(VideoProbeReport {
            regions,
            frame_width: metadata.width,
            frame_height: metadata.height,
            frame_index: frame_index_at(keyframe_ms, metadata.fps),
        })
    }

    /// Synchronous still-image swap. The output encoding preserves the
    /// input format, falling back to PNG.
    pub fn swap_image(
        &self,
        subject_bytes: &[u8],
        source: &SwapSource,
        regions: Option<Vec<Rect>>,
        use_accelerator: bool,
    ) -> SwapResult<Vec<u8>> {
        let extension = extension_for_bytes(subject_bytes);
        let subject = imageio::decode_image(subject_bytes)?.into_order(ChannelOrder::Bgr);
        validate_source(source)?;

        let engine = self.engine(use_accelerator)?;
        let plan = resolve_still_plan(&engine, source, regions)?;
        let swapped = engine.swap_still(subject, &plan)?;

        let (bytes, _) = imageio::encode_image(&swapped, extension)?;
        Ok(bytes)
    }

    /// Asynchronous video swap. Boundary validation happens before the
    /// task spawns; everything after that is reported through the handle.
    pub fn swap_video(&self, options: VideoSwapOptions) -> SwapResult<TaskHandle> {
        imageio::validate_video_path(&options.subject)?;
        let metadata = probe(&options.subject)?;
        validate_source(&options.source)?;

        let output = options
            .output
            .clone()
            .unwrap_or_else(|| self.default_output_path(&options.subject));
        let engine = self.engine(options.use_accelerator)?;
        let task_id = uuid::Uuid::new_v4().to_string();

        info!(
            task = %task_id,
            subject = %options.subject.display(),
            output = %output.display(),
            accelerator = options.use_accelerator,
            "starting video swap task"
        );

        Ok(task::spawn_task(task_id, move |ctx| {
            run_video_swap(engine, options, metadata, output, ctx)
        }))
    }

    /// Drive the engine from a task-protocol request. Image subjects run
    /// inline on the task thread; video subjects run the full pipeline.
    pub fn submit(&self, request: &SwapRequest) -> SwapResult<TaskHandle> {
        let subject = PathBuf::from(&request.subject);
        let source = load_request_source(request)?;

        if imageio::validate_video_path(&subject).is_ok() {
            return self.swap_video(VideoSwapOptions {
                subject,
                source,
                key_frame_ms: request.key_frame_ms,
                use_accelerator: request.use_accelerator,
                output: None,
                workers: None,
            });
        }

        // Image pathway: read now (boundary), swap on the task thread.
        let subject_bytes =
            std::fs::read(&subject).map_err(|_| SwapError::FileNotFound(subject.clone()))?;
        let regions = request.regions.clone();
        let use_accelerator = request.use_accelerator;
        let engine = self.engine(use_accelerator)?;
        let output = self.default_image_output_path(&subject, &subject_bytes);

        Ok(task::spawn_task(request.id.clone(), move |ctx| {
            ctx.set_stage("swapping image");
            let decoded = imageio::decode_image(&subject_bytes)?.into_order(ChannelOrder::Bgr);
            let plan = resolve_still_plan(&engine, &source, regions)?;
            let swapped = engine.swap_still(decoded, &plan)?;
            imageio::save_image(&swapped, &output)
        }))
    }

    fn default_output_path(&self, subject: &Path) -> PathBuf {
        let stem = subject
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("output");
        let name = format!("{stem}-swapped.mp4");
        match &self.config.output_dir {
            Some(dir) => dir.join(name),
            None => subject.with_file_name(name),
        }
    }

    fn default_image_output_path(&self, subject: &Path, bytes: &[u8]) -> PathBuf {
        let stem = subject
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("output");
        let name = format!("{stem}-swapped.{}", extension_for_bytes(bytes));
        match &self.config.output_dir {
            Some(dir) => dir.join(name),
            None => subject.with_file_name(name),
        }
    }
}

/// Extension matching the sniffed input format, for format-preserving
/// output encoding.
fn extension_for_bytes(bytes: &[u8]) -> &'static str {
    match image::guess_format(bytes) {
        Ok(image::ImageFormat::Jpeg) => "jpg",
        Ok(image::ImageFormat::WebP) => "webp",
        Ok(image::ImageFormat::Bmp) => "bmp",
        Ok(image::ImageFormat::Tiff) => "tif",
        _ => "png",
    }
}

fn validate_source(source: &SwapSource) -> SwapResult<()> {
    match source {
        SwapSource::Single { target_image } => {
            if target_image.is_empty() {
                return Err(SwapError::InvalidFaceSourceBinding(
                    "empty target image".to_string(),
                ));
            }
        }
        SwapSource::Multi { bindings } => {
            if bindings.is_empty() {
                return Err(SwapError::MissingFaceSources);
            }
            for binding in bindings {
                if binding.face_source_id.is_empty() {
                    return Err(SwapError::InvalidFaceSourceBinding(
                        "binding without a face source id".to_string(),
                    ));
                }
                if binding.image.is_empty() {
                    return Err(SwapError::InvalidFaceSourceBinding(format!(
                        "empty image for face source '{}'",
                        binding.face_source_id
                    )));
                }
            }
        }
    }
    Ok(())
}

/// Resolve source images to identity vectors; each face source is detected
/// and embedded exactly once.
fn resolve_still_plan(
    engine: &FaceEngine,
    source: &SwapSource,
    regions: Option<Vec<Rect>>,
) -> SwapResult<StillSwapPlan> {
    validate_source(source)?;
    match source {
        SwapSource::Single { target_image } => {
            let identity = resolve_identity(engine, "target", target_image)?;
            Ok(StillSwapPlan::SingleSource { identity, regions })
        }
        SwapSource::Multi { bindings } => {
            let mut cache: HashMap<String, IdentityVector> = HashMap::new();
            let mut resolved = Vec::with_capacity(bindings.len());
            for binding in bindings {
                let identity = match cache.get(&binding.face_source_id) {
                    Some(v) => v.clone(),
                    None => {
                        let v =
                            resolve_identity(engine, &binding.face_source_id, &binding.image)?;
                        cache.insert(binding.face_source_id.clone(), v.clone());
                        v
                    }
                };
                resolved.push(ResolvedBinding {
                    face_source_id: binding.face_source_id.clone(),
                    identity,
                    region: binding.region,
                });
            }
            Ok(StillSwapPlan::MultiSource { bindings: resolved })
        }
    }
}

fn resolve_identity(engine: &FaceEngine, id: &str, bytes: &[u8]) -> SwapResult<IdentityVector> {
    let image = imageio::decode_image(bytes)?;
    engine.resolve_source(&FaceSource {
        id: id.to_string(),
        face_image: image,
    })
}

/// The video task body: prepare identities, seed tracking, run the
/// pipeline, remux audio.
fn run_video_swap(
    engine: Arc<FaceEngine>,
    options: VideoSwapOptions,
    metadata: video_pipeline::VideoMetadata,
    output: PathBuf,
    ctx: &task::TaskContext,
) -> SwapResult<PathBuf> {
    ctx.set_stage("preparing identities");
    let mode = build_video_mode(&engine, &options, &metadata)?;
    if ctx.cancelled() {
        return Err(SwapError::Cancelled);
    }

    let video_only = output.with_extension("noaudio.mp4");
    let source = FfmpegFrameSource::open(&options.subject, &metadata)?;
    let sink = FfmpegFrameSink::create(&video_only, metadata.width, metadata.height, metadata.fps)?;

    let tracker = Arc::new(ProgressTracker::new(metadata.frame_count));
    ctx.attach_tracker(Arc::clone(&tracker));
    ctx.set_stage("swapping frames");

    let pipeline_config = match options.workers {
        Some(workers) => PipelineConfig::with_workers(workers),
        None => PipelineConfig::for_hardware(options.use_accelerator),
    };

    let processor = SwapFrameProcessor::new(&engine, mode);
    let report = video_pipeline::run(
        source,
        sink,
        &processor,
        pipeline_config,
        ctx.cancel_flag(),
        &tracker,
    );

    let report = match report {
        Ok(report) => report,
        Err(e) => {
            // No partial outputs: a cancelled or failed task leaves nothing.
            let _ = std::fs::remove_file(&video_only);
            let _ = std::fs::remove_file(&output);
            return Err(e);
        }
    };

    info!(
        decoded = report.frames_decoded,
        written = report.frames_written,
        passed_through = report.frames_passed_through,
        "video frames processed"
    );

    ctx.set_stage("muxing audio");
    let carried =
        finalize_with_audio(&video_only, &options.subject, &output, metadata.has_audio)?;
    if !carried && metadata.has_audio {
        warn!("audio could not be carried over; output is video-only");
    }

    if !output.exists() {
        return Err(SwapError::VideoOutputMissing);
    }
    Ok(output)
}

/// Single-source swaps every face; multi-source seeds tracks at the key
/// frame per the binding rules.
fn build_video_mode(
    engine: &FaceEngine,
    options: &VideoSwapOptions,
    metadata: &video_pipeline::VideoMetadata,
) -> SwapResult<VideoSwapMode> {
    match &options.source {
        SwapSource::Single { target_image } => {
            let identity = resolve_identity(engine, "target", target_image)?;
            Ok(VideoSwapMode::AllFaces { identity })
        }
        SwapSource::Multi { bindings } => {
            let key_frame = decode_frame_at(
                &options.subject,
                options.key_frame_ms.unwrap_or(0),
                metadata,
            )?;
            let faces = engine.detect_faces(&key_frame)?;
            if faces.is_empty() {
                return Err(SwapError::NoFaceDetected);
            }

            let mut identities: HashMap<String, IdentityVector> = HashMap::new();
            let mut tracker = IdentityTracker::new();
            let mut seeds = Vec::new();
            let mut any_region = false;

            for binding in bindings {
                let face_index = match &binding.region {
                    Some(region) => {
                        any_region = true;
                        face_engine::regions::bind_region(
                            region,
                            &faces,
                            metadata.width,
                            metadata.height,
                        )
                    }
                    None => face_engine::regions::largest_face(&faces),
                };
                let Some(face_index) = face_index else {
                    warn!(
                        face_source_id = %binding.face_source_id,
                        "no face at key frame for binding, skipping"
                    );
                    continue;
                };

                if !identities.contains_key(&binding.face_source_id) {
                    let identity =
                        resolve_identity(engine, &binding.face_source_id, &binding.image)?;
                    identities.insert(binding.face_source_id.clone(), identity);
                }
                seeds.push((faces[face_index].bbox, binding.face_source_id.clone()));
            }

            if seeds.is_empty() {
                return Err(if any_region {
                    SwapError::NoFaceInSelectedRegions
                } else {
                    SwapError::NoFaceDetected
                });
            }
            tracker.seed(seeds);

            Ok(VideoSwapMode::Tracked {
                tracker: Mutex::new(tracker),
                identities,
            })
        }
    }
}

/// Read the identity inputs referenced by a protocol request.
fn load_request_source(request: &SwapRequest) -> SwapResult<SwapSource> {
    match (&request.target, &request.bindings) {
        (Some(_), Some(_)) => Err(SwapError::InvalidFaceSourceBinding(
            "request carries both target and bindings".to_string(),
        )),
        (Some(target), None) => {
            let path = PathBuf::from(target);
            let bytes =
                std::fs::read(&path).map_err(|_| SwapError::FileNotFound(path.clone()))?;
            Ok(SwapSource::Single {
                target_image: bytes,
            })
        }
        (None, Some(bindings)) => {
            let mut loaded = Vec::with_capacity(bindings.len());
            for binding in bindings {
                let path = PathBuf::from(&binding.face_source);
                let bytes =
                    std::fs::read(&path).map_err(|_| SwapError::FileNotFound(path.clone()))?;
                loaded.push(SourceBinding {
                    face_source_id: binding.face_source_id.clone(),
                    image: bytes,
                    region: binding.region,
                });
            }
            Ok(SwapSource::Multi { bindings: loaded })
        }
        (None, None) => Err(SwapError::MissingFaceSources),
    }
}
