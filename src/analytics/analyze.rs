use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::camera::FrameSource;
use crate::storage::{save_snapshot, EventRecord, EventSink};

use super::detection::Detection;
use super::engine::InferenceEngine;
use super::pipeline::{lock_engine, unix_now, ErrorThrottle};
use super::registry::ModelEntry;
use super::tracker::Tracker;
use super::zones::{ZoneEvaluator, ZoneEvent};

const GENERAL_EVENT: &str = "general";

/// Batch analysis of one video file. Emits an event for every tracked
/// detection and saves a snapshot every `snapshot_every` frames once any
/// event has been emitted.
pub(crate) struct AnalyzeJob {
    pub job_id: String,
    pub source: Box<dyn FrameSource>,
    pub engine: Arc<Mutex<InferenceEngine>>,
    pub models: Vec<ModelEntry>,
    pub tracker: Tracker,
    pub zones: ZoneEvaluator,
    pub events: Arc<dyn EventSink>,
    pub camera_id: String,
    pub snaps_dir: PathBuf,
    pub snapshot_every: u64,
    pub errors: ErrorThrottle,
}

impl AnalyzeJob {
    pub fn run(mut self) {
        let mut frame_idx: u64 = 0;
        let mut emitted: u64 = 0;

        loop {
            let frame = match self.source.read() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(job = %self.job_id, error = %e, "read failed, ending analysis");
                    break;
                }
            };
            frame_idx += 1;
            let ts = unix_now();

            let inference = lock_engine(&self.engine).infer_frame(&frame, &self.models);
            for (model, e) in &inference.failures {
                self.errors.record(model, e);
            }
            if inference.all_failed() {
                continue;
            }

            for det in self.tracker.update(inference.detections, ts) {
                let zone = self.zones.check(&det);
                self.events.emit(self.record(frame_idx, ts, &det, zone.as_ref()));
                emitted += 1;
            }

            if emitted > 0 && self.snapshot_every > 0 && frame_idx % self.snapshot_every == 0 {
                let file_name = format!("{}_frame_{}.jpg", self.job_id, frame_idx);
                if let Err(e) = save_snapshot(&self.snaps_dir, &file_name, &frame) {
                    tracing::warn!(job = %self.job_id, frame = frame_idx, error = %e, "failed to save snapshot");
                }
            }
        }

        self.source.release();
        tracing::info!(job = %self.job_id, frames = frame_idx, events = emitted, "analysis complete");
    }

    fn record(&self, frame_idx: u64, ts: f64, det: &Detection, zone: Option<&ZoneEvent>) -> EventRecord {
        let track = det.track_id.unwrap_or(frame_idx);
        EventRecord {
            event_id: format!("{}_{}_{}", self.job_id, frame_idx, track),
            camera_id: self.camera_id.clone(),
            model: det
                .model
                .clone()
                .or_else(|| self.models.first().map(|m| m.name.clone()))
                .unwrap_or_else(|| "unknown".to_string()),
            kind: zone
                .map(|z| z.kind.as_str())
                .unwrap_or(GENERAL_EVENT)
                .to_string(),
            zone: zone.map(|z| z.zone_name.clone()),
            cls: det.class_name.clone(),
            track_id: det.track_id,
            conf: det.confidence,
            t_start: ts,
            bbox_xyxy: det.bbox.xyxy(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use crate::analytics::detection::BBox;
    use crate::analytics::engine::testing::ScriptedLoader;
    use crate::analytics::pipeline::{AnalyzeRequest, ModelConfig, Pipeline, PipelineError};
    use crate::analytics::registry::ModelRegistry;
    use crate::analytics::zones::{Zone, ZoneKind};
    use crate::camera::testing::MemoryOpener;
    use crate::config::Config;
    use crate::storage::testing::CollectingSink;

    use super::*;

    struct Fixture {
        dir: tempfile::TempDir,
        pipeline: Pipeline,
        sink: Arc<CollectingSink>,
        opener: Arc<MemoryOpener>,
    }

    fn fixture(frames: usize) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("m.onnx"), b"weights").unwrap();
        std::fs::write(dir.path().join("clip.mp4"), b"video").unwrap();

        let mut config = Config::default();
        config.storage.root = dir.path().join("storage");
        config.storage.snapshot_every_frames = 2;

        let registry = Arc::new(ModelRegistry::new(0.35, 0.45));
        registry
            .register("m", "custom", &dir.path().join("m.onnx"), None, None)
            .unwrap();

        let loader = ScriptedLoader::with(
            "m.onnx",
            vec![Detection::new("person", 0.9, BBox::new(10.0, 10.0, 30.0, 30.0))],
        );
        let sink = Arc::new(CollectingSink::default());
        let opener = MemoryOpener::new(frames, true);
        let pipeline = Pipeline::new(&config, registry, loader, opener.clone(), sink.clone());
        Fixture {
            dir,
            pipeline,
            sink,
            opener,
        }
    }

    fn request(fx: &Fixture, zones: Vec<Zone>) -> AnalyzeRequest {
        AnalyzeRequest {
            file_path: fx.dir.path().join("clip.mp4"),
            models: vec![ModelConfig {
                name: "m".into(),
                enabled: true,
                conf: 0.5,
                iou: 0.45,
                enabled_classes: Default::default(),
            }],
            zones,
        }
    }

    async fn wait_for_release(opener: &MemoryOpener) {
        for _ in 0..200 {
            if opener.released.load(Ordering::SeqCst) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("analysis did not finish");
    }

    #[tokio::test]
    async fn emits_one_event_per_tracked_detection() {
        let fx = fixture(3);
        let job_id = fx.pipeline.analyze(request(&fx, Vec::new())).await.unwrap();
        wait_for_release(&fx.opener).await;

        let records = fx.sink.records.lock().unwrap().clone();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].event_id, format!("{job_id}_1_1"));
        assert_eq!(records[2].event_id, format!("{job_id}_3_1"));
        assert!(records.iter().all(|r| r.kind == "general" && r.zone.is_none()));
        assert!(records.iter().all(|r| r.camera_id == "file" && r.model == "m"));
        assert!(!fx.pipeline.status().await.running);

        let snap = fx
            .dir
            .path()
            .join("storage/snaps")
            .join(format!("{job_id}_frame_2.jpg"));
        assert!(snap.exists());
    }

    #[tokio::test]
    async fn zone_hits_set_event_type() {
        let fx = fixture(1);
        let zone = Zone {
            zone_id: "z".into(),
            name: "Door".into(),
            kind: ZoneKind::Tripwire,
            points: vec![[0.0, 20.0], [100.0, 20.0]],
            allowed_classes: Vec::new(),
            min_size_px: 0,
            dwell_sec: 0.0,
            style: None,
        };
        fx.pipeline.analyze(request(&fx, vec![zone])).await.unwrap();
        wait_for_release(&fx.opener).await;

        let records = fx.sink.records.lock().unwrap().clone();
        assert_eq!(records[0].kind, "tripwire");
        assert_eq!(records[0].zone.as_deref(), Some("Door"));
    }

    #[tokio::test]
    async fn missing_file_is_rejected() {
        let fx = fixture(1);
        let mut req = request(&fx, Vec::new());
        req.file_path = fx.dir.path().join("nope.mp4");
        let err = fx.pipeline.analyze(req).await.unwrap_err();
        assert!(matches!(err, PipelineError::FileNotFound(_)));
        assert!(fx.sink.records.lock().unwrap().is_empty());
    }
}
