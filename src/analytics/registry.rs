use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const COCO_CLASSES: [&str; 80] = [
    "person",
    "bicycle",
    "car",
    "motorcycle",
    "airplane",
    "bus",
    "train",
    "truck",
    "boat",
    "traffic light",
    "fire hydrant",
    "stop sign",
    "parking meter",
    "bench",
    "bird",
    "cat",
    "dog",
    "horse",
    "sheep",
    "cow",
    "elephant",
    "bear",
    "zebra",
    "giraffe",
    "backpack",
    "umbrella",
    "handbag",
    "tie",
    "suitcase",
    "frisbee",
    "skis",
    "snowboard",
    "sports ball",
    "kite",
    "baseball bat",
    "baseball glove",
    "skateboard",
    "surfboard",
    "tennis racket",
    "bottle",
    "wine glass",
    "cup",
    "fork",
    "knife",
    "spoon",
    "bowl",
    "banana",
    "apple",
    "sandwich",
    "orange",
    "broccoli",
    "carrot",
    "hot dog",
    "pizza",
    "donut",
    "cake",
    "chair",
    "couch",
    "potted plant",
    "bed",
    "dining table",
    "toilet",
    "tv",
    "laptop",
    "mouse",
    "remote",
    "keyboard",
    "cell phone",
    "microwave",
    "oven",
    "toaster",
    "sink",
    "refrigerator",
    "book",
    "clock",
    "vase",
    "scissors",
    "teddy bear",
    "hair drier",
    "toothbrush",
];

pub const SECURITY_CLASSES: [&str; 18] = [
    "person",
    "car",
    "truck",
    "bus",
    "motorcycle",
    "bicycle",
    "dog",
    "cat",
    "cow",
    "horse",
    "sheep",
    "cell phone",
    "laptop",
    "backpack",
    "handbag",
    "suitcase",
    "knife",
    "gun",
];

const FACE_CLASSES: [&str; 1] = ["face"];
const FIRE_CLASSES: [&str; 2] = ["fire", "smoke"];

/// Label set implied by a model type tag. Unknown tags have no labels.
pub fn default_labels(kind: &str) -> Vec<String> {
    let labels: &[&str] = match kind {
        "coco" => &COCO_CLASSES,
        "security" => &SECURITY_CLASSES,
        "face" => &FACE_CLASSES,
        "fire" => &FIRE_CLASSES,
        _ => &[],
    };
    labels.iter().map(|s| s.to_string()).collect()
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("model file not found: {}", .0.display())]
    FileNotFound(PathBuf),
    #[error("model not found: {0}")]
    NotFound(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip)]
    pub path: PathBuf,
    pub labels: Vec<String>,
    pub enabled: bool,
    pub conf: f32,
    pub iou: f32,
    pub enabled_classes: BTreeMap<String, bool>,
}

impl ModelEntry {
    /// Whether detections of `class_name` pass this model's class filter.
    ///
    /// An empty map lets every class through. Once the map has any entry,
    /// classes it does not mention are rejected.
    pub fn allows_class(&self, class_name: &str) -> bool {
        if self.enabled_classes.is_empty() {
            return true;
        }
        self.enabled_classes.get(class_name).copied().unwrap_or(false)
    }
}

/// Partial update; `None` fields are left untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelUpdate {
    pub enabled: Option<bool>,
    pub conf: Option<f32>,
    pub iou: Option<f32>,
    pub enabled_classes: Option<BTreeMap<String, bool>>,
}

pub struct ModelRegistry {
    models: RwLock<BTreeMap<String, ModelEntry>>,
    default_conf: f32,
    default_iou: f32,
}

impl ModelRegistry {
    pub fn new(default_conf: f32, default_iou: f32) -> Self {
        Self {
            models: RwLock::new(BTreeMap::new()),
            default_conf,
            default_iou,
        }
    }

    pub fn register(
        &self,
        name: &str,
        kind: &str,
        path: &Path,
        labels: Option<Vec<String>>,
        enabled_classes: Option<BTreeMap<String, bool>>,
    ) -> Result<ModelEntry, RegistryError> {
        if !path.exists() {
            return Err(RegistryError::FileNotFound(path.to_path_buf()));
        }

        let labels = labels.unwrap_or_else(|| default_labels(kind));
        let mut enabled_classes = enabled_classes.unwrap_or_default();
        for label in &labels {
            enabled_classes.entry(label.clone()).or_insert(true);
        }

        let entry = ModelEntry {
            name: name.to_string(),
            kind: kind.to_string(),
            path: path.to_path_buf(),
            labels,
            enabled: false,
            conf: self.default_conf,
            iou: self.default_iou,
            enabled_classes,
        };

        tracing::info!(
            model = %name,
            kind = %kind,
            labels = entry.labels.len(),
            "registered model"
        );

        self.write().insert(name.to_string(), entry.clone());
        Ok(entry)
    }

    /// Registers every file from `files` (file name → type tag) that exists
    /// under `root`. Returns the names that were registered.
    pub fn auto_register(&self, root: &Path, files: &BTreeMap<String, String>) -> Vec<String> {
        let mut registered = Vec::new();
        for (file_name, kind) in files {
            let path = root.join(file_name);
            if !path.exists() {
                tracing::debug!(path = %path.display(), "model file absent, skipping");
                continue;
            }
            match self.register(file_name, kind, &path, None, None) {
                Ok(_) => registered.push(file_name.clone()),
                Err(e) => {
                    tracing::warn!(model = %file_name, error = %e, "failed to register model")
                }
            }
        }
        registered
    }

    pub fn update(&self, name: &str, update: &ModelUpdate) -> Result<ModelEntry, RegistryError> {
        let mut models = self.write();
        let entry = models
            .get_mut(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;

        if let Some(enabled) = update.enabled {
            entry.enabled = enabled;
        }
        if let Some(conf) = update.conf {
            entry.conf = conf;
        }
        if let Some(iou) = update.iou {
            entry.iou = iou;
        }
        if let Some(classes) = &update.enabled_classes {
            for (class, on) in classes {
                entry.enabled_classes.insert(class.clone(), *on);
            }
        }

        Ok(entry.clone())
    }

    pub fn get(&self, name: &str) -> Option<ModelEntry> {
        self.read().get(name).cloned()
    }

    pub fn list(&self) -> Vec<ModelEntry> {
        self.read().values().cloned().collect()
    }

    pub fn enabled(&self) -> Vec<ModelEntry> {
        self.read().values().filter(|m| m.enabled).cloned().collect()
    }

    /// False for unknown or disabled models; otherwise the model's class filter.
    pub fn is_class_enabled(&self, model: &str, class_name: &str) -> bool {
        match self.read().get(model) {
            Some(entry) if entry.enabled => entry.allows_class(class_name),
            _ => false,
        }
    }

    pub fn all_classes(&self) -> BTreeSet<String> {
        self.read()
            .values()
            .flat_map(|m| m.labels.iter().cloned())
            .collect()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, ModelEntry>> {
        self.models.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, ModelEntry>> {
        self.models.write().unwrap_or_else(PoisonError::into_inner)
    }
}
