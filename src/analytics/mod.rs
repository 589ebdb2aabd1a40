mod analyze;
mod detection;
mod engine;
mod pipeline;
mod registry;
mod runner;
mod tracker;
mod zones;

pub use detection::{BBox, Detection};
pub use pipeline::{AnalyzeRequest, Pipeline, PipelineError, StartRequest};
pub use registry::{ModelRegistry, ModelUpdate, RegistryError};
pub use runner::OnnxLoader;
pub use zones::{EventKind, ZoneEvent};

#[cfg(test)]
pub(crate) use engine::testing;
