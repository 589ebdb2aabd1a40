use std::path::Path;

use opencv::core::Mat;
use opencv::prelude::*;
use opencv::videoio::{
    VideoCapture, CAP_ANY, CAP_PROP_BUFFERSIZE, CAP_PROP_FPS, CAP_PROP_FRAME_HEIGHT,
    CAP_PROP_FRAME_WIDTH,
};
use serde::Deserialize;
use thiserror::Error;

pub const FALLBACK_FPS: f64 = 30.0;
pub const FALLBACK_SIZE: (u32, u32) = (640, 480);

/// Frames grabbed per read on live sources; all but the last are discarded.
const DRAIN_GRABS: usize = 2;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to open video source {source_uri}: {reason}")]
    OpenFailed { source_uri: String, reason: String },
    #[error("capture error: {0}")]
    Read(#[from] opencv::Error),
}

/// Where frames come from, as sent by the control API.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceSpec {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default = "default_uri")]
    pub uri: String,
}

fn default_uri() -> String {
    "0".to_string()
}

impl Default for SourceSpec {
    fn default() -> Self {
        Self {
            kind: String::new(),
            uri: default_uri(),
        }
    }
}

impl SourceSpec {
    pub fn file(path: impl Into<String>) -> Self {
        Self {
            kind: "file".to_string(),
            uri: path.into(),
        }
    }

    fn device_index(&self) -> Option<i32> {
        if !self.uri.is_empty() && self.uri.bytes().all(|b| b.is_ascii_digit()) {
            self.uri.parse().ok()
        } else {
            None
        }
    }

    pub fn read_policy(&self) -> ReadPolicy {
        if self.kind == "file" {
            return ReadPolicy::Sequential;
        }
        if self.device_index().is_some()
            || self.uri.contains("://")
            || self.uri.starts_with("/dev/")
        {
            return ReadPolicy::Latest;
        }
        if Path::new(&self.uri).is_file() {
            ReadPolicy::Sequential
        } else {
            ReadPolicy::Latest
        }
    }
}

/// How `read` treats frames queued inside the capture backend. Fixed when
/// the source is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadPolicy {
    /// Live devices and streams: drain queued frames, return the newest.
    Latest,
    /// Files: return every frame in order.
    Sequential,
}

pub trait FrameSource: Send {
    /// Most recent frame, or `None` when nothing is available right now.
    fn read(&mut self) -> Result<Option<Mat>, CaptureError>;

    /// Idempotent.
    fn release(&mut self);

    fn fps(&self) -> f64;

    /// `(width, height)`.
    fn size(&self) -> (u32, u32);

    /// True once a finite source has delivered its last frame.
    fn at_end(&self) -> bool {
        false
    }
}

pub trait SourceOpener: Send + Sync {
    fn open(&self, spec: &SourceSpec) -> Result<Box<dyn FrameSource>, CaptureError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct OpenCvOpener;

impl SourceOpener for OpenCvOpener {
    fn open(&self, spec: &SourceSpec) -> Result<Box<dyn FrameSource>, CaptureError> {
        Ok(Box::new(VideoSource::open(spec)?))
    }
}

pub struct VideoSource {
    uri: String,
    capture: Option<VideoCapture>,
    policy: ReadPolicy,
    ended: bool,
}

impl VideoSource {
    pub fn open(spec: &SourceSpec) -> Result<Self, CaptureError> {
        let open_failed = |reason: String| CaptureError::OpenFailed {
            source_uri: spec.uri.clone(),
            reason,
        };

        let index = spec.device_index();
        let capture = match index {
            Some(i) => VideoCapture::new(i, CAP_ANY),
            None => VideoCapture::from_file(&spec.uri, CAP_ANY),
        }
        .map_err(|e| open_failed(e.to_string()))?;

        let mut capture = capture;
        if !capture.is_opened().map_err(|e| open_failed(e.to_string()))? {
            return Err(open_failed(
                "device unavailable or already in use".to_string(),
            ));
        }

        // Not every backend honours these.
        let _ = capture.set(CAP_PROP_BUFFERSIZE, 1.0);
        if index.is_some() {
            let _ = capture.set(CAP_PROP_FPS, FALLBACK_FPS);
        }

        let source = Self {
            uri: spec.uri.clone(),
            capture: Some(capture),
            policy: spec.read_policy(),
            ended: false,
        };
        let (width, height) = source.size();
        tracing::info!(
            source = %source.uri,
            policy = ?source.policy,
            fps = source.fps(),
            width,
            height,
            "video source opened"
        );
        Ok(source)
    }

    fn property(&self, prop: i32) -> Option<f64> {
        let value = self.capture.as_ref()?.get(prop).ok()?;
        (value.is_finite() && value > 0.0).then_some(value)
    }
}

impl FrameSource for VideoSource {
    fn read(&mut self) -> Result<Option<Mat>, CaptureError> {
        let Some(capture) = self.capture.as_mut() else {
            return Ok(None);
        };

        let mut frame = Mat::default();
        match self.policy {
            ReadPolicy::Sequential => {
                if !capture.read(&mut frame)? || frame.empty() {
                    self.ended = true;
                    return Ok(None);
                }
            }
            ReadPolicy::Latest => {
                let mut grabbed = false;
                for _ in 0..DRAIN_GRABS {
                    if !capture.grab()? {
                        break;
                    }
                    grabbed = true;
                }
                if !grabbed || !capture.retrieve(&mut frame, 0)? || frame.empty() {
                    return Ok(None);
                }
            }
        }

        Ok(Some(frame))
    }

    fn release(&mut self) {
        if let Some(mut capture) = self.capture.take() {
            if let Err(e) = capture.release() {
                tracing::warn!(source = %self.uri, error = %e, "failed to release capture");
            }
            tracing::debug!(source = %self.uri, "video source released");
        }
    }

    fn fps(&self) -> f64 {
        self.property(CAP_PROP_FPS).unwrap_or(FALLBACK_FPS)
    }

    fn size(&self) -> (u32, u32) {
        match (
            self.property(CAP_PROP_FRAME_WIDTH),
            self.property(CAP_PROP_FRAME_HEIGHT),
        ) {
            (Some(w), Some(h)) => (w as u32, h as u32),
            _ => FALLBACK_SIZE,
        }
    }

    fn at_end(&self) -> bool {
        self.ended
    }
}

impl Drop for VideoSource {
    fn drop(&mut self) {
        self.release();
    }
}
