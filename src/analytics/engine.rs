use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use opencv::core::Mat;

use super::detection::Detection;
use super::registry::ModelEntry;
use super::runner::{Backend, BackendLoader, InferError};

/// Result of running every enabled model on one frame.
#[derive(Debug, Default)]
pub struct FrameInference {
    pub detections: Vec<Detection>,
    pub failures: Vec<(String, InferError)>,
    pub succeeded: usize,
}

impl FrameInference {
    /// True when at least one model ran and none of them succeeded.
    pub fn all_failed(&self) -> bool {
        self.succeeded == 0 && !self.failures.is_empty()
    }
}

/// Loaded backends keyed by model name. Independent of the registry: a model
/// can be enabled without being loaded and vice versa.
pub struct InferenceEngine {
    loader: Arc<dyn BackendLoader>,
    runners: HashMap<String, Box<dyn Backend>>,
}

impl InferenceEngine {
    pub fn new(loader: Arc<dyn BackendLoader>) -> Self {
        Self {
            loader,
            runners: HashMap::new(),
        }
    }

    pub fn load(&mut self, name: &str, path: &Path, labels: &[String]) -> Result<(), InferError> {
        let backend = self.loader.load(path, labels)?;
        self.runners.insert(name.to_string(), backend);
        Ok(())
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.runners.contains_key(name)
    }

    pub fn loaded(&self) -> Vec<String> {
        let mut names: Vec<String> = self.runners.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn unload(&mut self, name: &str) -> bool {
        let removed = self.runners.remove(name).is_some();
        if removed {
            tracing::debug!(model = %name, "runner unloaded");
        }
        removed
    }

    pub fn unload_all(&mut self) {
        let names = self.loaded();
        let count = names.len();
        for name in &names {
            self.unload(name);
        }
        if count > 0 {
            tracing::debug!(count, "unloaded all runners");
        }
    }

    pub fn input_shape(&self, name: &str) -> Result<(u32, u32), InferError> {
        self.runners
            .get(name)
            .map(|r| r.input_shape())
            .ok_or_else(|| InferError::NotLoaded(name.to_string()))
    }

    /// Raw candidates from one model, unfiltered.
    pub fn infer(&mut self, name: &str, frame: &Mat) -> Result<Vec<Detection>, InferError> {
        let runner = self
            .runners
            .get_mut(name)
            .ok_or_else(|| InferError::NotLoaded(name.to_string()))?;
        runner.infer(frame)
    }

    /// Runs each loaded model in `models` and keeps detections that pass
    /// that model's confidence threshold and class filter. Models enabled
    /// after the runners were loaded are skipped. A failing model does not
    /// prevent the others from contributing.
    pub fn infer_frame(&mut self, frame: &Mat, models: &[ModelEntry]) -> FrameInference {
        let mut result = FrameInference::default();
        for model in models {
            if !self.is_loaded(&model.name) {
                continue;
            }
            match self.infer(&model.name, frame) {
                Ok(raw) => {
                    let raw_count = raw.len();
                    let kept = filter_detections(raw, model);
                    tracing::trace!(
                        model = %model.name,
                        raw = raw_count,
                        kept = kept.len(),
                        "inference"
                    );
                    result.detections.extend(kept);
                    result.succeeded += 1;
                }
                Err(e) => result.failures.push((model.name.clone(), e)),
            }
        }
        result
    }
}

/// Applies a model's confidence threshold and enabled-class map, stamping
/// the model name onto the survivors.
pub fn filter_detections(detections: Vec<Detection>, model: &ModelEntry) -> Vec<Detection> {
    detections
        .into_iter()
        .filter(|d| d.confidence >= model.conf && model.allows_class(&d.class_name))
        .map(|mut d| {
            d.model = Some(model.name.clone());
            d
        })
        .collect()
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;
    use std::path::{Path, PathBuf};
    use std::sync::{Arc, Mutex};

    use opencv::core::Mat;

    use crate::analytics::detection::Detection;
    use crate::analytics::runner::{Backend, BackendLoader, InferError};

    /// Backend that returns the same detections for every frame, or fails
    /// on frames listed in `fail_on` (1-based call index).
    pub struct ScriptedBackend {
        pub detections: Vec<Detection>,
        pub fail_on: Vec<usize>,
        pub calls: usize,
    }

    impl Backend for ScriptedBackend {
        fn infer(&mut self, _frame: &Mat) -> Result<Vec<Detection>, InferError> {
            self.calls += 1;
            if self.fail_on.contains(&self.calls) {
                return Err(InferError::FrameTooSmall);
            }
            Ok(self.detections.clone())
        }

        fn input_shape(&self) -> (u32, u32) {
            (640, 640)
        }
    }

    /// Loader handing out scripted backends by file name; records loads.
    #[derive(Default)]
    pub struct ScriptedLoader {
        pub scripts: Mutex<Vec<(String, Vec<Detection>, Vec<usize>)>>,
        pub loads: Mutex<VecDeque<PathBuf>>,
    }

    impl ScriptedLoader {
        pub fn with(file: &str, detections: Vec<Detection>) -> Arc<Self> {
            let loader = Self::default();
            loader.script(file, detections, Vec::new());
            Arc::new(loader)
        }

        pub fn script(&self, file: &str, detections: Vec<Detection>, fail_on: Vec<usize>) {
            self.scripts
                .lock()
                .unwrap()
                .push((file.to_string(), detections, fail_on));
        }

        pub fn load_count(&self) -> usize {
            self.loads.lock().unwrap().len()
        }
    }

    impl BackendLoader for ScriptedLoader {
        fn load(&self, path: &Path, _labels: &[String]) -> Result<Box<dyn Backend>, InferError> {
            self.loads.lock().unwrap().push_back(path.to_path_buf());
            let file = path.file_name().and_then(|f| f.to_str()).unwrap_or_default();
            let scripts = self.scripts.lock().unwrap();
            let (_, detections, fail_on) = scripts
                .iter()
                .find(|(name, _, _)| name == file)
                .ok_or_else(|| InferError::Load {
                    path: path.to_path_buf(),
                    reason: "no script".into(),
                })?;
            Ok(Box::new(ScriptedBackend {
                detections: detections.clone(),
                fail_on: fail_on.clone(),
                calls: 0,
            }))
        }
    }
}
