use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_host")]
    pub host: String,
    #[serde(default = "default_http_port")]
    pub port: u16,
}

fn default_http_host() -> String {
    "0.0.0.0".to_string()
}

fn default_http_port() -> u16 {
    8010
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: default_http_host(),
            port: default_http_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelsConfig {
    #[serde(default = "default_models_root")]
    pub root: PathBuf,
    /// File name under `root` mapped to the model type tag.
    #[serde(default = "default_auto_register")]
    pub auto_register: BTreeMap<String, String>,
    #[serde(default = "default_conf")]
    pub default_conf: f32,
    #[serde(default = "default_iou")]
    pub default_iou: f32,
}

fn default_models_root() -> PathBuf {
    PathBuf::from("models")
}

fn default_auto_register() -> BTreeMap<String, String> {
    [
        ("best.onnx", "face"),
        ("w600k_mbf.onnx", "face"),
        ("yolo11npRETRAINED.onnx", "coco"),
        ("Fire_Event_best.onnx", "fire"),
    ]
    .into_iter()
    .map(|(file, kind)| (file.to_string(), kind.to_string()))
    .collect()
}

fn default_conf() -> f32 {
    0.35
}

fn default_iou() -> f32 {
    0.45
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            root: default_models_root(),
            auto_register: default_auto_register(),
            default_conf: default_conf(),
            default_iou: default_iou(),
        }
    }
}

fn default_target_fps() -> u32 {
    20
}

fn default_frame_skip() -> u32 {
    1
}

fn default_model_refresh_frames() -> u64 {
    100
}

fn default_tracker_iou() -> f32 {
    0.1
}

fn default_tracker_max_age() -> u32 {
    30
}

fn default_tripwire_threshold() -> f32 {
    50.0
}

fn default_subscriber_queue() -> usize {
    8
}

fn default_error_log_every() -> u64 {
    100
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Skip tracking and zone evaluation, forwarding filtered detections as-is.
    #[serde(default)]
    pub raw_mode: bool,
    /// Upper bound on loop iterations per second. 0 disables pacing.
    #[serde(default = "default_target_fps")]
    pub target_fps: u32,
    #[serde(default = "default_frame_skip")]
    pub frame_skip: u32,
    /// How many loop iterations the enabled-model snapshot is reused for.
    #[serde(default = "default_model_refresh_frames")]
    pub model_refresh_frames: u64,
    #[serde(default = "default_tracker_iou")]
    pub tracker_iou_threshold: f32,
    #[serde(default = "default_tracker_max_age")]
    pub tracker_max_age: u32,
    #[serde(default = "default_tripwire_threshold")]
    pub tripwire_threshold_px: f32,
    #[serde(default = "default_subscriber_queue")]
    pub subscriber_queue: usize,
    #[serde(default = "default_error_log_every")]
    pub error_log_every: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            raw_mode: false,
            target_fps: default_target_fps(),
            frame_skip: default_frame_skip(),
            model_refresh_frames: default_model_refresh_frames(),
            tracker_iou_threshold: default_tracker_iou(),
            tracker_max_age: default_tracker_max_age(),
            tripwire_threshold_px: default_tripwire_threshold(),
            subscriber_queue: default_subscriber_queue(),
            error_log_every: default_error_log_every(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,
    #[serde(default = "default_snapshot_every")]
    pub snapshot_every_frames: u64,
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("storage")
}

fn default_snapshot_every() -> u64 {
    30
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_storage_root(),
            snapshot_every_frames: default_snapshot_every(),
        }
    }
}

impl StorageConfig {
    pub fn snaps_dir(&self) -> PathBuf {
        self.root.join("snaps")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventsConfig {
    #[serde(default = "default_backend_url")]
    pub backend_url: String,
    #[serde(default = "default_camera_id")]
    pub camera_id: String,
    #[serde(default = "default_event_timeout")]
    pub timeout_secs: u64,
}

fn default_backend_url() -> String {
    "http://localhost:8000".to_string()
}

fn default_camera_id() -> String {
    "file".to_string()
}

fn default_event_timeout() -> u64 {
    5
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            backend_url: default_backend_url(),
            camera_id: default_camera_id(),
            timeout_secs: default_event_timeout(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub models: ModelsConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub events: EventsConfig,
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        match std::env::args().nth(1) {
            Some(path) => Self::load_from(path),
            None => Self::load_from(DEFAULT_CONFIG_PATH),
        }
    }

    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let p = &self.pipeline;
        if p.frame_skip == 0 {
            return Err(ConfigError::Invalid("pipeline.frame_skip must be >= 1".into()));
        }
        if p.subscriber_queue == 0 {
            return Err(ConfigError::Invalid(
                "pipeline.subscriber_queue must be >= 1".into(),
            ));
        }
        if p.model_refresh_frames == 0 {
            return Err(ConfigError::Invalid(
                "pipeline.model_refresh_frames must be >= 1".into(),
            ));
        }
        for (name, value) in [
            ("pipeline.tracker_iou_threshold", p.tracker_iou_threshold),
            ("pipeline.tripwire_threshold_px", p.tripwire_threshold_px),
            ("models.default_conf", self.models.default_conf),
            ("models.default_iou", self.models.default_iou),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be a non-negative number"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.http.port, 8010);
        assert_eq!(config.pipeline.target_fps, 20);
        assert_eq!(config.pipeline.tracker_max_age, 30);
        assert!(!config.pipeline.raw_mode);
        assert_eq!(config.models.auto_register.get("best.onnx").map(String::as_str), Some("face"));
        assert_eq!(config.storage.snaps_dir(), PathBuf::from("storage/snaps"));
    }

    #[test]
    fn sections_override_defaults() {
        let config = Config::parse(
            r#"
            [pipeline]
            raw_mode = true
            target_fps = 0

            [models]
            root = "/opt/models"
            "#,
        )
        .unwrap();
        assert!(config.pipeline.raw_mode);
        assert_eq!(config.pipeline.target_fps, 0);
        assert_eq!(config.models.root, PathBuf::from("/opt/models"));
        assert_eq!(config.pipeline.frame_skip, 1);
    }

    #[test]
    fn rejects_zero_frame_skip() {
        let err = Config::parse("[pipeline]\nframe_skip = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_negative_threshold() {
        let err = Config::parse("[pipeline]\ntripwire_threshold_px = -1.0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load_from(dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
