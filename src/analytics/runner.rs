use std::fmt::Display;
use std::path::{Path, PathBuf};

use ndarray::{Array4, ArrayView2, ArrayViewD, Axis, Ix2};
use opencv::core::{Mat, Size};
use opencv::imgproc;
use opencv::prelude::*;
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::TensorRef;
use thiserror::Error;

use super::detection::{BBox, Detection};

pub const DEFAULT_INPUT_SIZE: u32 = 640;
const MIN_PLAUSIBLE_DIM: i64 = 100;
const MAX_PLAUSIBLE_DIM: i64 = 2000;

#[derive(Debug, Error)]
pub enum InferError {
    #[error("failed to load model {}: {reason}", path.display())]
    Load { path: PathBuf, reason: String },
    #[error("model not loaded: {0}")]
    NotLoaded(String),
    #[error("onnx runtime error: {0}")]
    Ort(#[from] ort::Error),
    #[error("opencv error: {0}")]
    OpenCv(#[from] opencv::Error),
    #[error("unsupported output shape {0:?}")]
    Shape(Vec<usize>),
    #[error("frame data too small")]
    FrameTooSmall,
}

/// One loaded model on one inference backend.
pub trait Backend: Send {
    /// Runs the model on a frame and returns every candidate in frame
    /// coordinates. No confidence floor is applied here.
    fn infer(&mut self, frame: &Mat) -> Result<Vec<Detection>, InferError>;

    /// Expected input size as `(height, width)`.
    fn input_shape(&self) -> (u32, u32);
}

/// Creates backends from weight files.
pub trait BackendLoader: Send + Sync {
    fn load(&self, path: &Path, labels: &[String]) -> Result<Box<dyn Backend>, InferError>;
}

pub struct OnnxLoader {
    intra_threads: usize,
}

impl OnnxLoader {
    pub fn new(intra_threads: usize) -> Self {
        Self { intra_threads }
    }
}

impl Default for OnnxLoader {
    fn default() -> Self {
        Self::new(4)
    }
}

impl BackendLoader for OnnxLoader {
    fn load(&self, path: &Path, labels: &[String]) -> Result<Box<dyn Backend>, InferError> {
        let runner = OnnxRunner::load(path, labels.to_vec(), self.intra_threads)?;
        Ok(Box::new(runner))
    }
}

fn load_error(path: &Path, e: impl Display) -> InferError {
    InferError::Load {
        path: path.to_path_buf(),
        reason: e.to_string(),
    }
}

/// ONNX Runtime CPU backend.
pub struct OnnxRunner {
    session: Session,
    labels: Vec<String>,
    input_height: u32,
    input_width: u32,
}

impl OnnxRunner {
    pub fn load(path: &Path, labels: Vec<String>, intra_threads: usize) -> Result<Self, InferError> {
        if !path.is_file() {
            return Err(load_error(path, "file does not exist"));
        }

        let builder = Session::builder().map_err(|e| load_error(path, e))?;
        let builder = builder
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| load_error(path, e))?;
        let builder = builder
            .with_intra_threads(intra_threads)
            .map_err(|e| load_error(path, e))?;
        let session = builder
            .commit_from_file(path)
            .map_err(|e| load_error(path, e))?;

        let dims = declared_input_dims(&session);
        let (input_height, input_width) = input_size_from_dims(&dims);

        tracing::info!(
            path = %path.display(),
            declared = ?dims,
            height = input_height,
            width = input_width,
            "model loaded"
        );

        Ok(Self {
            session,
            labels,
            input_height,
            input_width,
        })
    }

    fn preprocess(&self, frame: &Mat) -> Result<Array4<f32>, InferError> {
        let (w, h) = (self.input_width as usize, self.input_height as usize);

        let mut resized = Mat::default();
        imgproc::resize(
            frame,
            &mut resized,
            Size::new(w as i32, h as i32),
            0.0,
            0.0,
            imgproc::INTER_NEAREST,
        )?;

        let code = match resized.channels() {
            1 => imgproc::COLOR_GRAY2RGB,
            4 => imgproc::COLOR_BGRA2RGB,
            _ => imgproc::COLOR_BGR2RGB,
        };
        let mut rgb = Mat::default();
        imgproc::cvt_color(&resized, &mut rgb, code, 0)?;

        let data = rgb.data_bytes()?;
        if data.len() < w * h * 3 {
            return Err(InferError::FrameTooSmall);
        }

        let mut tensor = Array4::<f32>::zeros((1, 3, h, w));
        for y in 0..h {
            for x in 0..w {
                let idx = (y * w + x) * 3;
                tensor[[0, 0, y, x]] = data[idx] as f32 / 255.0;
                tensor[[0, 1, y, x]] = data[idx + 1] as f32 / 255.0;
                tensor[[0, 2, y, x]] = data[idx + 2] as f32 / 255.0;
            }
        }

        Ok(tensor)
    }
}

impl Backend for OnnxRunner {
    fn infer(&mut self, frame: &Mat) -> Result<Vec<Detection>, InferError> {
        let rows = frame.rows();
        let cols = frame.cols();
        if rows == 0 || cols == 0 {
            return Ok(Vec::new());
        }

        let input = self.preprocess(frame)?;
        let tensor_ref = TensorRef::from_array_view(input.view())?.into_dyn();
        let outputs = self.session.run(ort::inputs![tensor_ref])?;
        let output = outputs[0].try_extract_array::<f32>()?.to_owned();
        drop(outputs);

        decode_output(
            &output.view(),
            &self.labels,
            (self.input_width as f32, self.input_height as f32),
            (cols as f32, rows as f32),
        )
    }

    fn input_shape(&self) -> (u32, u32) {
        (self.input_height, self.input_width)
    }
}

fn declared_input_dims(session: &Session) -> Vec<i64> {
    session
        .inputs()
        .first()
        .and_then(|input| input.dtype().tensor_shape())
        .map(|shape| shape.iter().copied().collect())
        .unwrap_or_default()
}

/// Picks `(height, width)` from a declared input shape: the first adjacent
/// pair of dimensions that both look like image sizes, else the square
/// default.
pub fn input_size_from_dims(dims: &[i64]) -> (u32, u32) {
    let plausible = |d: i64| (MIN_PLAUSIBLE_DIM..=MAX_PLAUSIBLE_DIM).contains(&d);
    dims.windows(2)
        .find(|pair| plausible(pair[0]) && plausible(pair[1]))
        .map(|pair| (pair[0] as u32, pair[1] as u32))
        .unwrap_or((DEFAULT_INPUT_SIZE, DEFAULT_INPUT_SIZE))
}

fn label_for(labels: &[String], index: usize) -> String {
    labels
        .get(index)
        .cloned()
        .unwrap_or_else(|| format!("class_{index}"))
}

/// Decodes raw network output into detections in frame coordinates.
///
/// Accepts `[N, 6]` rows of `(x1, y1, x2, y2, conf, class)` or `[N, 4+K]`
/// rows of `(cx, cy, w, h, conf, class_probs...)`, optionally with a leading
/// batch dimension of 1. `input` and `frame` are `(width, height)`.
pub fn decode_output(
    output: &ArrayViewD<f32>,
    labels: &[String],
    input: (f32, f32),
    frame: (f32, f32),
) -> Result<Vec<Detection>, InferError> {
    let view = match output.ndim() {
        3 if output.shape()[0] == 1 => output.index_axis(Axis(0), 0),
        2 => output.view(),
        _ => return Err(InferError::Shape(output.shape().to_vec())),
    };
    let rows: ArrayView2<f32> = view
        .into_dimensionality::<Ix2>()
        .map_err(|_| InferError::Shape(output.shape().to_vec()))?;

    let (frame_w, frame_h) = frame;
    let scale_x = frame_w / input.0;
    let scale_y = frame_h / input.1;

    let cols = rows.ncols();
    let mut detections = Vec::with_capacity(rows.nrows());

    if cols == 6 {
        for row in rows.rows() {
            let class_idx = row[5].max(0.0) as usize;
            let bbox = BBox::clamped(
                row[0] * scale_x,
                row[1] * scale_y,
                row[2] * scale_x,
                row[3] * scale_y,
                frame_w,
                frame_h,
            );
            detections.push(Detection::new(label_for(labels, class_idx), row[4], bbox));
        }
    } else if cols > 6 {
        for row in rows.rows() {
            let (cx, cy, w, h, objectness) = (row[0], row[1], row[2], row[3], row[4]);

            let mut best_idx = 0usize;
            let mut best_prob = f32::NEG_INFINITY;
            for (i, &p) in row.iter().skip(5).enumerate() {
                if p > best_prob {
                    best_prob = p;
                    best_idx = i;
                }
            }

            let bbox = BBox::clamped(
                (cx - w / 2.0) * scale_x,
                (cy - h / 2.0) * scale_y,
                (cx + w / 2.0) * scale_x,
                (cy + h / 2.0) * scale_y,
                frame_w,
                frame_h,
            );
            detections.push(Detection::new(
                label_for(labels, best_idx),
                objectness * best_prob,
                bbox,
            ));
        }
    } else {
        return Err(InferError::Shape(output.shape().to_vec()));
    }

    Ok(detections)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr2, Array3};

    fn labels(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn input_size_prefers_first_plausible_pair() {
        assert_eq!(input_size_from_dims(&[1, 3, 640, 640]), (640, 640));
        assert_eq!(input_size_from_dims(&[1, 320, 480, 3]), (320, 480));
        assert_eq!(input_size_from_dims(&[1, 3, 416, 256]), (416, 256));
    }

    #[test]
    fn input_size_falls_back_on_dynamic_shape() {
        assert_eq!(input_size_from_dims(&[-1, 3, -1, -1]), (640, 640));
        assert_eq!(input_size_from_dims(&[]), (640, 640));
        assert_eq!(input_size_from_dims(&[1, 3, 5000, 5000]), (640, 640));
    }

    #[test]
    fn decodes_xyxy_layout_with_independent_scales() {
        let out = arr2(&[[10.0f32, 20.0, 110.0, 220.0, 0.9, 1.0]]).into_dyn();
        let dets = decode_output(&out.view(), &labels(&["a", "b"]), (320.0, 320.0), (640.0, 480.0)).unwrap();
        assert_eq!(dets.len(), 1);
        let d = &dets[0];
        assert_eq!(d.class_name, "b");
        assert!((d.confidence - 0.9).abs() < 1e-6);
        assert_eq!(d.bbox, BBox::new(20.0, 30.0, 220.0, 330.0));
        assert_eq!(d.track_id, None);
    }

    #[test]
    fn decodes_center_layout_with_argmax() {
        // cx, cy, w, h, conf, p0, p1, p2
        let out = Array3::from_shape_vec(
            (1, 1, 8),
            vec![100.0f32, 100.0, 40.0, 20.0, 0.8, 0.1, 0.5, 0.4],
        )
        .unwrap()
        .into_dyn();
        let dets = decode_output(&out.view(), &labels(&["x", "y", "z"]), (200.0, 200.0), (200.0, 200.0)).unwrap();
        assert_eq!(dets.len(), 1);
        assert_eq!(dets[0].class_name, "y");
        assert!((dets[0].confidence - 0.4).abs() < 1e-6);
        assert_eq!(dets[0].bbox, BBox::new(80.0, 90.0, 120.0, 110.0));
    }

    #[test]
    fn clamps_into_frame_and_keeps_low_confidence() {
        let out = arr2(&[[-50.0f32, -10.0, 700.0, 700.0, 0.01, 7.0]]).into_dyn();
        let dets = decode_output(&out.view(), &[], (640.0, 640.0), (640.0, 480.0)).unwrap();
        assert_eq!(dets.len(), 1);
        assert_eq!(dets[0].class_name, "class_7");
        assert_eq!(dets[0].bbox, BBox::new(0.0, 0.0, 640.0, 480.0));
    }

    #[test]
    fn rejects_unknown_layouts() {
        let narrow = arr2(&[[1.0f32, 2.0, 3.0, 4.0]]).into_dyn();
        assert!(matches!(
            decode_output(&narrow.view(), &[], (640.0, 640.0), (640.0, 480.0)),
            Err(InferError::Shape(_))
        ));
        let batched = Array3::<f32>::zeros((2, 3, 6)).into_dyn();
        assert!(matches!(
            decode_output(&batched.view(), &[], (640.0, 640.0), (640.0, 480.0)),
            Err(InferError::Shape(_))
        ));
    }

    #[test]
    fn loading_missing_weights_fails() {
        let err = OnnxLoader::default()
            .load(Path::new("/nonexistent/model.onnx"), &[])
            .err()
            .unwrap();
        assert!(matches!(err, InferError::Load { .. }));
    }

    #[test]
    fn loading_malformed_weights_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.onnx");
        std::fs::write(&path, b"not a model").unwrap();
        let err = OnnxLoader::default().load(&path, &[]).err().unwrap();
        assert!(matches!(err, InferError::Load { .. }));
    }
}
