use std::path::{Path, PathBuf};

use opencv::core::{Mat, Vector};
use opencv::imgcodecs;
use opencv::prelude::*;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("frame is empty")]
    EmptyFrame,
    #[error("jpeg encoding failed: {0}")]
    Encode(#[from] opencv::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub fn encode_jpeg(frame: &Mat) -> Result<Vec<u8>, SnapshotError> {
    if frame.empty() {
        return Err(SnapshotError::EmptyFrame);
    }
    let mut buf = Vector::<u8>::new();
    let params = Vector::<i32>::new();
    imgcodecs::imencode(".jpg", frame, &mut buf, &params)?;
    Ok(buf.to_vec())
}

/// Writes `frame` as `<dir>/<file_name>`, creating `dir` if needed.
pub fn save_snapshot(dir: &Path, file_name: &str, frame: &Mat) -> Result<PathBuf, SnapshotError> {
    let jpeg = encode_jpeg(frame)?;
    std::fs::create_dir_all(dir)?;
    let path = dir.join(file_name);
    std::fs::write(&path, jpeg)?;
    tracing::debug!(path = %path.display(), "snapshot saved");
    Ok(path)
}
