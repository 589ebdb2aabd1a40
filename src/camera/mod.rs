mod source;

pub use source::{CaptureError, FrameSource, OpenCvOpener, SourceOpener, SourceSpec};

#[cfg(test)]
pub(crate) use source::testing;
