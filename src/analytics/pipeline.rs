use std::collections::BTreeMap;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use axum::http::StatusCode;
use opencv::core::Mat;
use opencv::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::broadcast::{BoxMessage, Broadcaster, FrameMessage};
use crate::camera::{CaptureError, FrameSource, SourceOpener, SourceSpec};
use crate::config::{Config, PipelineConfig};
use crate::storage::{save_snapshot, EventSink, SnapshotError};

use super::analyze::AnalyzeJob;
use super::engine::InferenceEngine;
use super::registry::{ModelEntry, ModelRegistry, ModelUpdate, RegistryError};
use super::runner::{BackendLoader, InferError};
use super::tracker::Tracker;
use super::zones::{Zone, ZoneEvaluator};

const FPS_LOG_EVERY: u64 = 500;
const THERMAL_ZONE: &str = "/sys/class/thermal/thermal_zone0/temp";

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("pipeline already running")]
    AlreadyRunning,
    #[error("no models enabled, enable at least one model")]
    NoModelsEnabled,
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("model file not found for {model}: {}", path.display())]
    ModelFileMissing { model: String, path: PathBuf },
    #[error("failed to load model {model}: {source}")]
    ModelLoadFailure {
        model: String,
        #[source]
        source: InferError,
    },
    #[error("failed to open video source: {0}")]
    SourceOpenFailure(#[source] CaptureError),
    #[error("file not found: {}", .0.display())]
    FileNotFound(PathBuf),
    #[error("no active stream")]
    NotRunning,
    #[error("no frame captured yet")]
    NoFrame,
    #[error("snapshot failed: {0}")]
    Snapshot(#[from] SnapshotError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            PipelineError::AlreadyRunning
            | PipelineError::NoModelsEnabled
            | PipelineError::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            PipelineError::Registry(_)
            | PipelineError::ModelFileMissing { .. }
            | PipelineError::FileNotFound(_) => StatusCode::NOT_FOUND,
            PipelineError::NotRunning | PipelineError::NoFrame => StatusCode::CONFLICT,
            PipelineError::ModelLoadFailure { .. }
            | PipelineError::SourceOpenFailure(_)
            | PipelineError::Snapshot(_)
            | PipelineError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

fn default_model_conf() -> f32 {
    0.35
}

fn default_model_iou() -> f32 {
    0.45
}

/// Per-model settings carried by start and analyze requests.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    pub name: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_model_conf")]
    pub conf: f32,
    #[serde(default = "default_model_iou")]
    pub iou: f32,
    #[serde(default)]
    pub enabled_classes: BTreeMap<String, bool>,
}

impl ModelConfig {
    fn as_update(&self) -> ModelUpdate {
        ModelUpdate {
            enabled: Some(self.enabled),
            conf: Some(self.conf),
            iou: Some(self.iou),
            enabled_classes: Some(self.enabled_classes.clone()),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StartRequest {
    #[serde(default)]
    pub source: SourceSpec,
    #[serde(default)]
    pub models: Vec<ModelConfig>,
    #[serde(default)]
    pub zones: Vec<Zone>,
    #[serde(default)]
    pub zones_version: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnalyzeRequest {
    pub file_path: PathBuf,
    #[serde(default)]
    pub models: Vec<ModelConfig>,
    #[serde(default)]
    pub zones: Vec<Zone>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub running: bool,
    pub fps: f64,
    pub models: Vec<String>,
    pub temp_c: Option<f64>,
}

/// Logs the first failure and then every `every`-th one.
pub(crate) struct ErrorThrottle {
    every: u64,
    count: u64,
    last_logged: u64,
}

impl ErrorThrottle {
    pub(crate) fn new(every: u64) -> Self {
        Self {
            every: every.max(1),
            count: 0,
            last_logged: 0,
        }
    }

    /// Returns true when this occurrence was logged.
    pub(crate) fn record(&mut self, context: &str, error: &dyn Display) -> bool {
        self.count += 1;
        if self.count != 1 && self.count % self.every != 0 {
            return false;
        }
        let suppressed = self.count - self.last_logged - 1;
        self.last_logged = self.count;
        tracing::warn!(
            context = %context,
            error = %error,
            occurrences = self.count,
            suppressed,
            "frame processing error"
        );
        true
    }
}

/// Sleeps out the rest of a minimum frame interval.
struct FramePacer {
    interval: Option<Duration>,
}

impl FramePacer {
    fn new(target_fps: u32) -> Self {
        Self {
            interval: (target_fps > 0).then(|| Duration::from_secs_f64(1.0 / target_fps as f64)),
        }
    }

    fn remaining(&self, elapsed: Duration) -> Option<Duration> {
        self.interval
            .and_then(|i| i.checked_sub(elapsed))
            .filter(|d| !d.is_zero())
    }

    fn wait(&self, tick: Instant) {
        if let Some(rest) = self.remaining(tick.elapsed()) {
            thread::sleep(rest);
        }
    }
}

pub(crate) fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

pub(crate) fn lock_engine(engine: &Mutex<InferenceEngine>) -> MutexGuard<'_, InferenceEngine> {
    engine.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read_temp_c(path: &Path) -> Option<f64> {
    let raw = std::fs::read_to_string(path).ok()?;
    raw.trim().parse::<f64>().ok().map(|m| m / 1000.0)
}

struct ActiveRun {
    shutdown: Arc<AtomicBool>,
    handle: JoinHandle<()>,
    frames: Arc<AtomicU64>,
    started: Instant,
}

enum RunState {
    Idle,
    Running(ActiveRun),
}

impl RunState {
    /// A loop that ended on its own (end of file) counts as idle.
    fn reap(&mut self) {
        if matches!(self, RunState::Running(run) if run.handle.is_finished()) {
            tracing::info!("frame loop finished on its own");
            *self = RunState::Idle;
        }
    }
}

/// Owns the idle/running state machine and everything the frame loop needs.
pub struct Pipeline {
    registry: Arc<ModelRegistry>,
    engine: Arc<Mutex<InferenceEngine>>,
    broadcaster: Arc<Broadcaster>,
    opener: Arc<dyn SourceOpener>,
    events: Arc<dyn EventSink>,
    config: PipelineConfig,
    snaps_dir: PathBuf,
    snapshot_every: u64,
    camera_id: String,
    latest_frame: Arc<Mutex<Option<Mat>>>,
    state: tokio::sync::Mutex<RunState>,
}

impl Pipeline {
    pub fn new(
        config: &Config,
        registry: Arc<ModelRegistry>,
        loader: Arc<dyn BackendLoader>,
        opener: Arc<dyn SourceOpener>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            registry,
            engine: Arc::new(Mutex::new(InferenceEngine::new(loader))),
            broadcaster: Arc::new(Broadcaster::new(config.pipeline.subscriber_queue)),
            opener,
            events,
            config: config.pipeline.clone(),
            snaps_dir: config.storage.snaps_dir(),
            snapshot_every: config.storage.snapshot_every_frames,
            camera_id: config.events.camera_id.clone(),
            latest_frame: Arc::new(Mutex::new(None)),
            state: tokio::sync::Mutex::new(RunState::Idle),
        }
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    pub async fn start(&self, request: StartRequest) -> Result<Vec<String>, PipelineError> {
        let mut state = self.state.lock().await;
        state.reap();
        if matches!(*state, RunState::Running(_)) {
            return Err(PipelineError::AlreadyRunning);
        }

        let models = self.apply_model_configs(&request.models)?;
        for model in &models {
            tracing::info!(
                model = %model.name,
                conf = model.conf,
                classes = model.enabled_classes.values().filter(|on| **on).count(),
                "model enabled"
            );
        }

        self.load_models(models.clone(), true).await?;
        let tracker = Tracker::new(self.config.tracker_iou_threshold, self.config.tracker_max_age);
        let source = self.open_source(request.source.clone()).await?;
        let zones = ZoneEvaluator::new(request.zones, self.config.tripwire_threshold_px);

        tracing::info!(
            source = %request.source.uri,
            zones = zones.zones().len(),
            zones_version = ?request.zones_version,
            raw_mode = self.config.raw_mode,
            "starting detection"
        );

        let shutdown = Arc::new(AtomicBool::new(false));
        let frames = Arc::new(AtomicU64::new(0));
        let started = Instant::now();
        let frame_loop = FrameLoop {
            source,
            engine: Arc::clone(&self.engine),
            registry: Arc::clone(&self.registry),
            broadcaster: Arc::clone(&self.broadcaster),
            tracker,
            zones,
            config: self.config.clone(),
            frames: Arc::clone(&frames),
            started,
            latest_frame: Arc::clone(&self.latest_frame),
            errors: ErrorThrottle::new(self.config.error_log_every),
        };
        let loop_shutdown = Arc::clone(&shutdown);
        let handle = tokio::task::spawn_blocking(move || frame_loop.run(loop_shutdown));

        *state = RunState::Running(ActiveRun {
            shutdown,
            handle,
            frames,
            started,
        });

        Ok(models.into_iter().map(|m| m.name).collect())
    }

    /// Idempotent. Waits for the loop to finish its current iteration.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        if let RunState::Running(run) = std::mem::replace(&mut *state, RunState::Idle) {
            run.shutdown.store(true, Ordering::Relaxed);
            if let Err(e) = run.handle.await {
                tracing::error!(error = %e, "frame loop panicked");
            }
            tracing::info!(frames = run.frames.load(Ordering::Relaxed), "detection stopped");
        }
        *self
            .latest_frame
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub async fn status(&self) -> PipelineStatus {
        let mut state = self.state.lock().await;
        state.reap();
        let (running, fps) = match &*state {
            RunState::Running(run) => {
                let elapsed = run.started.elapsed().as_secs_f64();
                let frames = run.frames.load(Ordering::Relaxed) as f64;
                (true, if elapsed > 0.0 { frames / elapsed } else { 0.0 })
            }
            RunState::Idle => (false, 0.0),
        };
        PipelineStatus {
            running,
            fps,
            models: self.registry.enabled().into_iter().map(|m| m.name).collect(),
            temp_c: read_temp_c(Path::new(THERMAL_ZONE)),
        }
    }

    pub fn update_model(&self, name: &str, update: &ModelUpdate) -> Result<ModelEntry, PipelineError> {
        validate_thresholds(name, update.conf, update.iou)?;
        let entry = self.registry.update(name, update)?;
        tracing::info!(model = %name, enabled = entry.enabled, conf = entry.conf, "model updated");
        Ok(entry)
    }

    /// Writes the most recent frame of the running stream under the
    /// snapshot directory.
    pub async fn snapshot(&self) -> Result<PathBuf, PipelineError> {
        {
            let mut state = self.state.lock().await;
            state.reap();
            if matches!(*state, RunState::Idle) {
                return Err(PipelineError::NotRunning);
            }
        }

        let frame = {
            let slot = self.latest_frame.lock().unwrap_or_else(PoisonError::into_inner);
            match slot.as_ref() {
                Some(frame) => frame
                    .try_clone()
                    .map_err(|e| PipelineError::Snapshot(SnapshotError::Encode(e)))?,
                None => return Err(PipelineError::NoFrame),
            }
        };

        let file_name = format!("snap_{}.jpg", unix_now() as u64);
        Ok(save_snapshot(&self.snaps_dir, &file_name, &frame)?)
    }

    /// Starts a one-shot analysis of a video file and returns its job id.
    /// Independent of the live run.
    pub async fn analyze(&self, request: AnalyzeRequest) -> Result<String, PipelineError> {
        if !request.file_path.is_file() {
            return Err(PipelineError::FileNotFound(request.file_path));
        }

        let models = self.apply_model_configs(&request.models)?;
        self.load_models(models.clone(), false).await?;
        let uri = request.file_path.to_string_lossy().to_string();
        let source = self.open_source(SourceSpec::file(uri)).await?;

        let job = AnalyzeJob {
            job_id: uuid::Uuid::new_v4().to_string(),
            source,
            engine: Arc::clone(&self.engine),
            models,
            tracker: Tracker::new(self.config.tracker_iou_threshold, self.config.tracker_max_age),
            zones: ZoneEvaluator::new(request.zones, self.config.tripwire_threshold_px),
            events: Arc::clone(&self.events),
            camera_id: self.camera_id.clone(),
            snaps_dir: self.snaps_dir.clone(),
            snapshot_every: self.snapshot_every,
            errors: ErrorThrottle::new(self.config.error_log_every),
        };
        let job_id = job.job_id.clone();
        tracing::info!(job = %job_id, file = %request.file_path.display(), "analysis started");
        tokio::task::spawn_blocking(move || job.run());

        Ok(job_id)
    }

    /// Applies request model settings and returns the resulting enabled set.
    fn apply_model_configs(&self, configs: &[ModelConfig]) -> Result<Vec<ModelEntry>, PipelineError> {
        for cfg in configs {
            if self.registry.get(&cfg.name).is_none() {
                return Err(RegistryError::NotFound(cfg.name.clone()).into());
            }
            validate_thresholds(&cfg.name, Some(cfg.conf), Some(cfg.iou))?;
        }
        for cfg in configs {
            self.registry.update(&cfg.name, &cfg.as_update())?;
        }

        let enabled = self.registry.enabled();
        if enabled.is_empty() {
            return Err(PipelineError::NoModelsEnabled);
        }
        Ok(enabled)
    }

    /// Loads every model in `models` that is not loaded yet. With
    /// `clean_slate` all runners are dropped first, and again if any load
    /// fails.
    async fn load_models(&self, models: Vec<ModelEntry>, clean_slate: bool) -> Result<(), PipelineError> {
        let engine = Arc::clone(&self.engine);
        tokio::task::spawn_blocking(move || {
            let mut engine = lock_engine(&engine);
            if clean_slate {
                engine.unload_all();
            }

            let result = models.iter().try_for_each(|model| {
                if engine.is_loaded(&model.name) {
                    return Ok(());
                }
                if !model.path.exists() {
                    return Err(PipelineError::ModelFileMissing {
                        model: model.name.clone(),
                        path: model.path.clone(),
                    });
                }
                tracing::info!(model = %model.name, path = %model.path.display(), "loading model");
                engine
                    .load(&model.name, &model.path, &model.labels)
                    .map_err(|source| PipelineError::ModelLoadFailure {
                        model: model.name.clone(),
                        source,
                    })?;
                if let Ok((w, h)) = engine.input_shape(&model.name) {
                    tracing::debug!(model = %model.name, width = w, height = h, "model input shape");
                }
                Ok(())
            });

            if result.is_err() && clean_slate {
                engine.unload_all();
            }
            tracing::info!(loaded = ?engine.loaded(), "inference runners ready");
            result
        })
        .await
        .map_err(|e| PipelineError::Internal(e.to_string()))?
    }

    async fn open_source(&self, spec: SourceSpec) -> Result<Box<dyn FrameSource>, PipelineError> {
        let opener = Arc::clone(&self.opener);
        tokio::task::spawn_blocking(move || opener.open(&spec))
            .await
            .map_err(|e| PipelineError::Internal(e.to_string()))?
            .map_err(PipelineError::SourceOpenFailure)
    }
}

fn validate_thresholds(model: &str, conf: Option<f32>, iou: Option<f32>) -> Result<(), PipelineError> {
    for (field, value) in [("conf", conf), ("iou", iou)] {
        if let Some(v) = value {
            if !(0.0..=1.0).contains(&v) {
                return Err(PipelineError::InvalidConfig(format!(
                    "{model}: {field} must be within [0, 1], got {v}"
                )));
            }
        }
    }
    Ok(())
}

/// The capture, infer, track, zone, broadcast loop. Runs on a blocking
/// thread until the shutdown flag is set or a finite source runs out.
struct FrameLoop {
    source: Box<dyn FrameSource>,
    engine: Arc<Mutex<InferenceEngine>>,
    registry: Arc<ModelRegistry>,
    broadcaster: Arc<Broadcaster>,
    tracker: Tracker,
    zones: ZoneEvaluator,
    config: PipelineConfig,
    frames: Arc<AtomicU64>,
    started: Instant,
    latest_frame: Arc<Mutex<Option<Mat>>>,
    errors: ErrorThrottle,
}

impl FrameLoop {
    fn run(mut self, shutdown: Arc<AtomicBool>) {
        let (width, height) = self.source.size();
        tracing::info!(fps = self.source.fps(), width, height, "frame loop started");

        let pacer = FramePacer::new(self.config.target_fps);
        let refresh = self.config.model_refresh_frames.max(1);
        let mut models: Vec<ModelEntry> = Vec::new();
        let mut iteration: u64 = 0;

        while !shutdown.load(Ordering::Relaxed) {
            let tick = Instant::now();
            if iteration % refresh == 0 {
                models = self.registry.enabled();
            }
            iteration += 1;

            if !models.is_empty() {
                self.step(&models);
            }

            if self.source.at_end() {
                tracing::info!("end of stream");
                break;
            }
            pacer.wait(tick);
        }

        self.source.release();
        tracing::info!(frames = self.frames.load(Ordering::Relaxed), "frame loop stopped");
    }

    fn step(&mut self, models: &[ModelEntry]) {
        let frame = match self.source.read() {
            Ok(Some(frame)) => frame,
            Ok(None) => return,
            Err(e) => {
                self.errors.record("capture", &e);
                return;
            }
        };

        let frame_idx = self.frames.fetch_add(1, Ordering::Relaxed) + 1;
        let elapsed = self.started.elapsed().as_secs_f64();
        let fps = if elapsed > 0.0 { frame_idx as f64 / elapsed } else { 0.0 };
        if frame_idx % FPS_LOG_EVERY == 0 {
            tracing::info!(frame = frame_idx, fps = format!("{:.1}", fps), "loop stats");
        }

        let skip = self.config.frame_skip as u64;
        if skip <= 1 || frame_idx % skip == 0 {
            self.process(&frame, frame_idx, fps, models);
        }

        *self
            .latest_frame
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(frame);
    }

    fn process(&mut self, frame: &Mat, frame_idx: u64, fps: f64, models: &[ModelEntry]) {
        let ts = unix_now();
        let inference = lock_engine(&self.engine).infer_frame(frame, models);
        for (model, e) in &inference.failures {
            self.errors.record(model, e);
        }
        if inference.all_failed() {
            return;
        }

        let boxes = if self.config.raw_mode {
            inference
                .detections
                .iter()
                .map(|d| BoxMessage::new(d, None))
                .collect()
        } else {
            self.tracker
                .update(inference.detections, ts)
                .iter()
                .map(|d| BoxMessage::new(d, self.zones.check(d).as_ref()))
                .collect()
        };

        self.broadcaster.publish(FrameMessage {
            ts,
            frame_idx,
            boxes,
            fps: fps as f32,
            width: frame.cols().max(0) as u32,
            height: frame.rows().max(0) as u32,
        });
    }
}
