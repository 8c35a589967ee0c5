//! Face detection module using `UltraFace` via ONNX Runtime
//!
//! Detects frontal faces with the Ultra-Light-Fast-Generic-Face-Detector
//! (RFB-320 / RFB-640) exported to ONNX.
//!
//! Two export flavours are handled:
//! - the stock export, whose `scores` are probabilities and `boxes` are
//!   normalized corners
//! - raw exports without the post-processing head, whose scores are logits
//!   and boxes are regressions against prior boxes ([`anchors`])
//!
//! # Example
//! ```no_run
//! use drivecheck_face_detection::{FaceDetector, FaceDetectionConfig};
//! use image::open;
//!
//! # fn main() -> anyhow::Result<()> {
//! let mut detector = FaceDetector::new("models/version-RFB-320.onnx", FaceDetectionConfig::default())?;
//!
//! let img = open("frame.jpg")?.to_rgb8();
//! let faces = detector.detect(&img)?;
//! println!("{} face(s)", faces.len());
//! # Ok(())
//! # }
//! ```

pub mod anchors;

use anchors::Prior;
use drivecheck_common::ProcessingError;
use image::RgbImage;
use ndarray::Array4;
use ort::{
    session::{Session, SessionOutputs},
    value::TensorRef,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

/// `UltraFace` model variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UltraFaceModel {
    /// RFB backbone at 320x240 - 1.2MB model, fastest inference
    Rfb320,
    /// RFB backbone at 640x480 - better on small or distant faces
    Rfb640,
}

impl UltraFaceModel {
    /// Get the typical model filename for this variant
    #[must_use]
    pub fn filename(&self) -> &'static str {
        match self {
            UltraFaceModel::Rfb320 => "version-RFB-320.onnx",
            UltraFaceModel::Rfb640 => "version-RFB-640.onnx",
        }
    }

    /// Model input size (width, height)
    #[must_use]
    pub fn input_size(&self) -> (u32, u32) {
        match self {
            UltraFaceModel::Rfb320 => (320, 240),
            UltraFaceModel::Rfb640 => (640, 480),
        }
    }
}

/// Configuration for face detection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FaceDetectionConfig {
    /// Minimum confidence threshold for face detections (0.0-1.0)
    pub confidence_threshold: f32,
    /// `IoU` threshold for non-maximum suppression (0.0-1.0)
    pub nms_threshold: f32,
    /// Model input size (width, height)
    pub input_size: (u32, u32),
    /// Minimum box size as fraction of image (e.g., 0.02 = 2%)
    pub min_box_size: f32,
    /// Reject detections within this margin of edges (e.g., 0.05 = 5%)
    pub edge_margin: f32,
    /// Model emits logits and prior-relative regressions
    pub raw_outputs: bool,
}

impl Default for FaceDetectionConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.7,
            nms_threshold: 0.3,
            input_size: UltraFaceModel::Rfb320.input_size(),
            min_box_size: 0.01,
            edge_margin: 0.0,
            raw_outputs: false,
        }
    }
}

/// Bounding box for face detection
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    /// Left x coordinate (normalized 0.0-1.0)
    pub x1: f32,
    /// Top y coordinate (normalized 0.0-1.0)
    pub y1: f32,
    /// Right x coordinate (normalized 0.0-1.0)
    pub x2: f32,
    /// Bottom y coordinate (normalized 0.0-1.0)
    pub y2: f32,
}

impl BoundingBox {
    #[must_use]
    #[inline]
    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    #[must_use]
    #[inline]
    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    #[must_use]
    #[inline]
    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    /// Calculate `IoU` (Intersection over Union) with another box
    #[must_use]
    #[inline]
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x1.max(other.x1);
        let y1 = self.y1.max(other.y1);
        let x2 = self.x2.min(other.x2);
        let y2 = self.y2.min(other.y2);

        if x2 < x1 || y2 < y1 {
            return 0.0;
        }

        let intersection = (x2 - x1) * (y2 - y1);
        let union = self.area() + other.area() - intersection;
        if union > 0.0 {
            intersection / union
        } else {
            0.0
        }
    }

    /// Pixel rectangle `(x, y, width, height)` in an image of the given size
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn to_pixels(&self, image_width: u32, image_height: u32) -> (u32, u32, u32, u32) {
        let w = image_width as f32;
        let h = image_height as f32;
        (
            (self.x1 * w).round() as u32,
            (self.y1 * h).round() as u32,
            (self.width() * w).round() as u32,
            (self.height() * h).round() as u32,
        )
    }
}

/// Detected face
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Face {
    /// Detection confidence score (0.0-1.0)
    pub confidence: f32,
    /// Face bounding box (normalized coordinates)
    pub bbox: BoundingBox,
}

/// Errors that can occur during face detection
#[derive(Error, Debug)]
pub enum FaceDetectionError {
    #[error("Failed to run inference: {0}")]
    InferenceError(String),

    #[error("Postprocessing failed: {0}")]
    PostprocessingError(String),

    #[error(transparent)]
    ProcessingError(#[from] ProcessingError),
}

impl From<FaceDetectionError> for ProcessingError {
    fn from(err: FaceDetectionError) -> Self {
        match err {
            FaceDetectionError::ProcessingError(inner) => inner,
            other => ProcessingError::Other(other.to_string()),
        }
    }
}

/// Face detector using `UltraFace` via ONNX Runtime
pub struct FaceDetector {
    session: Session,
    config: FaceDetectionConfig,
    /// Only populated for raw exports
    priors: Option<Vec<Prior>>,
}

impl FaceDetector {
    /// Create a new face detector from an ONNX model file
    pub fn new<P: AsRef<Path>>(
        model_path: P,
        config: FaceDetectionConfig,
    ) -> Result<Self, FaceDetectionError> {
        let model_path = model_path.as_ref();
        info!("Loading UltraFace model from {}", model_path.display());

        let (width, height) = config.input_size;
        if width == 0 || height == 0 {
            return Err(ProcessingError::InvalidConfig(format!(
                "face detector input size {width}x{height}"
            ))
            .into());
        }

        let session = drivecheck_common::onnx::create_session(model_path)?;
        let priors = config.raw_outputs.then(|| anchors::generate_priors(width, height));

        info!(
            "UltraFace model loaded (input size: {}x{}, raw outputs: {})",
            width, height, config.raw_outputs
        );

        Ok(Self {
            session,
            config,
            priors,
        })
    }

    /// Detect faces in an RGB image
    pub fn detect(&mut self, image: &RgbImage) -> Result<Vec<Face>, FaceDetectionError> {
        debug!("Detecting faces in {}x{} image", image.width(), image.height());

        let (width, height) = self.config.input_size;
        let input = preprocess_image(image, width, height);

        let input_tensor = TensorRef::from_array_view(input.view())
            .map_err(|e| FaceDetectionError::InferenceError(e.to_string()))?;
        let outputs = self
            .session
            .run(ort::inputs![input_tensor])
            .map_err(|e| FaceDetectionError::InferenceError(e.to_string()))?;

        let (scores_shape, scores) = extract_output(&outputs, &["scores", "confidences"])?;
        let (boxes_shape, boxes) = extract_output(&outputs, &["boxes"])?;

        let faces = decode_faces(
            &scores_shape,
            scores,
            &boxes_shape,
            boxes,
            &self.config,
            self.priors.as_deref(),
        )?;

        debug!("Detected {} faces", faces.len());
        Ok(faces)
    }
}

/// Look up the first output present under any of `names`
fn extract_output<'o>(
    outputs: &'o SessionOutputs<'_>,
    names: &[&str],
) -> Result<(Vec<i64>, &'o [f32]), FaceDetectionError> {
    let value = names
        .iter()
        .find_map(|name| outputs.get(*name))
        .ok_or_else(|| {
            FaceDetectionError::PostprocessingError(format!("output {names:?} not found"))
        })?;

    let (shape, data) = value.try_extract_tensor::<f32>().map_err(|e| {
        FaceDetectionError::PostprocessingError(format!("Failed to extract {names:?}: {e}"))
    })?;
    let dims: &[i64] = shape.as_ref();
    Ok((dims.to_vec(), data))
}

/// Resize to the model input and normalize as `(pixel - 127) / 128`
fn preprocess_image(image: &RgbImage, width: u32, height: u32) -> Array4<f32> {
    let resized = image::imageops::resize(
        image,
        width,
        height,
        image::imageops::FilterType::Triangle,
    );

    let mut input = Array4::<f32>::zeros((1, 3, height as usize, width as usize));
    for (x, y, pixel) in resized.enumerate_pixels() {
        for channel in 0..3 {
            input[[0, channel, y as usize, x as usize]] = (f32::from(pixel[channel]) - 127.0) / 128.0;
        }
    }
    input
}

/// Turn raw `scores` `[1, N, 2]` and `boxes` `[1, N, 4]` tensors into faces
///
/// `priors` must be given when `config.raw_outputs` is set.
///
/// # Errors
///
/// Returns [`FaceDetectionError::PostprocessingError`] on malformed shapes or
/// when the prior count does not match the model output.
pub fn decode_faces(
    scores_shape: &[i64],
    scores_data: &[f32],
    boxes_shape: &[i64],
    boxes_data: &[f32],
    config: &FaceDetectionConfig,
    priors: Option<&[Prior]>,
) -> Result<Vec<Face>, FaceDetectionError> {
    if scores_shape.len() != 3 || boxes_shape.len() != 3 || scores_shape[2] != 2 || boxes_shape[2] != 4
    {
        return Err(FaceDetectionError::PostprocessingError(format!(
            "Invalid output shapes: scores={scores_shape:?}, boxes={boxes_shape:?}"
        )));
    }
    let num_boxes = usize::try_from(scores_shape[1]).unwrap_or(0);
    if boxes_shape[1] != scores_shape[1]
        || scores_data.len() < num_boxes * 2
        || boxes_data.len() < num_boxes * 4
    {
        return Err(FaceDetectionError::PostprocessingError(format!(
            "Mismatch between scores and boxes: scores={scores_shape:?}, boxes={boxes_shape:?}"
        )));
    }

    let decoded;
    let corners: &[f32] = if config.raw_outputs {
        let priors = priors.ok_or_else(|| {
            FaceDetectionError::PostprocessingError("raw outputs need prior boxes".into())
        })?;
        decoded = anchors::decode_boxes(
            &boxes_data[..num_boxes * 4],
            priors,
            anchors::CENTER_VARIANCE,
            anchors::SIZE_VARIANCE,
        )
        .ok_or_else(|| {
            FaceDetectionError::PostprocessingError(format!(
                "Prior count mismatch: {} priors, model outputs {} boxes",
                priors.len(),
                num_boxes
            ))
        })?
        .concat();
        &decoded
    } else {
        &boxes_data[..num_boxes * 4]
    };

    let mut faces: Vec<Face> = scores_data[..num_boxes * 2]
        .chunks_exact(2)
        .zip(corners.chunks_exact(4))
        .filter_map(|(score, corner)| {
            let confidence = if config.raw_outputs {
                // Two-class softmax over [background, face] logits
                1.0 / (1.0 + (score[0] - score[1]).exp())
            } else {
                score[1]
            };
            if confidence < config.confidence_threshold {
                return None;
            }

            let bbox = BoundingBox {
                x1: corner[0].clamp(0.0, 1.0),
                y1: corner[1].clamp(0.0, 1.0),
                x2: corner[2].clamp(0.0, 1.0),
                y2: corner[3].clamp(0.0, 1.0),
            };
            (bbox.x2 > bbox.x1 && bbox.y2 > bbox.y1).then_some(Face { confidence, bbox })
        })
        .collect();

    debug!(
        "Found {} faces above threshold {}",
        faces.len(),
        config.confidence_threshold
    );

    faces.retain(|face| {
        face.bbox.width() >= config.min_box_size
            && face.bbox.height() >= config.min_box_size
            && face.bbox.x1 >= config.edge_margin
            && face.bbox.y1 >= config.edge_margin
            && face.bbox.x2 <= 1.0 - config.edge_margin
            && face.bbox.y2 <= 1.0 - config.edge_margin
    });

    Ok(non_maximum_suppression(faces, config.nms_threshold))
}

/// Greedy NMS, highest confidence first
#[must_use]
pub fn non_maximum_suppression(mut faces: Vec<Face>, nms_threshold: f32) -> Vec<Face> {
    faces.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<Face> = Vec::with_capacity(faces.len());
    for face in faces {
        if keep.iter().all(|kept| kept.bbox.iou(&face.bbox) <= nms_threshold) {
            keep.push(face);
        }
    }
    keep
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shape(n: usize, k: usize) -> Vec<i64> {
        vec![1, n as i64, k as i64]
    }

    #[test]
    fn test_bounding_box_calculations() {
        let bbox = BoundingBox {
            x1: 0.2,
            y1: 0.3,
            x2: 0.6,
            y2: 0.7,
        };

        assert!((bbox.width() - 0.4).abs() < 0.001);
        assert!((bbox.height() - 0.4).abs() < 0.001);
        assert!((bbox.area() - 0.16).abs() < 0.001);
        assert_eq!(bbox.to_pixels(100, 100), (20, 30, 40, 40));
    }

    #[test]
    fn test_bounding_box_iou() {
        let bbox1 = BoundingBox {
            x1: 0.0,
            y1: 0.0,
            x2: 0.5,
            y2: 0.5,
        };
        let bbox2 = BoundingBox {
            x1: 0.25,
            y1: 0.25,
            x2: 0.75,
            y2: 0.75,
        };

        // Intersection 0.0625, union 0.4375
        assert!((bbox1.iou(&bbox2) - 0.1428).abs() < 0.001);
    }

    #[test]
    fn test_config_defaults() {
        let config = FaceDetectionConfig::default();
        assert_eq!(config.confidence_threshold, 0.7);
        assert_eq!(config.nms_threshold, 0.3);
        assert_eq!(config.input_size, (320, 240));
        assert_eq!(config.min_box_size, 0.01);
        assert_eq!(config.edge_margin, 0.0);
        assert!(!config.raw_outputs);
    }

    #[test]
    fn test_model_variants() {
        assert_eq!(UltraFaceModel::Rfb320.filename(), "version-RFB-320.onnx");
        assert_eq!(UltraFaceModel::Rfb640.input_size(), (640, 480));
    }

    #[test]
    fn test_decode_stock_outputs() {
        let config = FaceDetectionConfig::default();
        let scores = [0.1, 0.9, 0.8, 0.2, 0.05, 0.95];
        let boxes = [
            0.40, 0.20, 0.60, 0.50, // face
            0.10, 0.10, 0.20, 0.20, // background
            0.41, 0.21, 0.61, 0.51, // duplicate of the first face
        ];

        let faces = decode_faces(
            &shape(3, 2),
            &scores,
            &shape(3, 4),
            &boxes,
            &config,
            None,
        )
        .unwrap();

        assert_eq!(faces.len(), 1);
        assert!((faces[0].confidence - 0.95).abs() < 1e-6);
        assert!((faces[0].bbox.x1 - 0.41).abs() < 1e-6);
    }

    #[test]
    fn test_decode_applies_size_and_edge_filters() {
        let config = FaceDetectionConfig {
            min_box_size: 0.05,
            edge_margin: 0.05,
            ..Default::default()
        };
        let scores = [0.0, 0.9, 0.0, 0.9, 0.0, 0.9];
        let boxes = [
            0.50, 0.50, 0.52, 0.52, // too small
            0.00, 0.30, 0.20, 0.60, // touches the left edge
            0.30, 0.30, 0.50, 0.60, // kept
        ];

        let faces = decode_faces(
            &shape(3, 2),
            &scores,
            &shape(3, 4),
            &boxes,
            &config,
            None,
        )
        .unwrap();

        assert_eq!(faces.len(), 1);
        assert!((faces[0].bbox.x1 - 0.30).abs() < 1e-6);
    }

    #[test]
    fn test_decode_raw_outputs_with_priors() {
        let config = FaceDetectionConfig {
            raw_outputs: true,
            ..Default::default()
        };
        let priors = [
            Prior {
                cx: 0.5,
                cy: 0.5,
                w: 0.2,
                h: 0.2,
            },
            Prior {
                cx: 0.2,
                cy: 0.2,
                w: 0.1,
                h: 0.1,
            },
        ];
        // Logits: strongly face, strongly background
        let scores = [-2.0, 3.0, 4.0, -4.0];
        let boxes = [0.0; 8];

        let faces = decode_faces(
            &shape(2, 2),
            &scores,
            &shape(2, 4),
            &boxes,
            &config,
            Some(&priors[..]),
        )
        .unwrap();

        assert_eq!(faces.len(), 1);
        let expected = 1.0 / (1.0 + (-5.0f32).exp());
        assert!((faces[0].confidence - expected).abs() < 1e-6);
        assert!((faces[0].bbox.x1 - 0.4).abs() < 1e-6);
        assert!((faces[0].bbox.y2 - 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_decode_raw_outputs_need_matching_priors() {
        let config = FaceDetectionConfig {
            raw_outputs: true,
            ..Default::default()
        };
        let scores = [0.0; 4];
        let boxes = [0.0; 8];

        let missing = decode_faces(&shape(2, 2), &scores, &shape(2, 4), &boxes, &config, None);
        assert!(missing.is_err());

        let priors = anchors::generate_priors(320, 240);
        let mismatched = decode_faces(
            &shape(2, 2),
            &scores,
            &shape(2, 4),
            &boxes,
            &config,
            Some(&priors[..]),
        );
        assert!(mismatched.is_err());
    }

    #[test]
    fn test_decode_rejects_bad_shapes() {
        let config = FaceDetectionConfig::default();
        let result = decode_faces(&[1, 2], &[0.0; 4], &shape(2, 4), &[0.0; 8], &config, None);
        assert!(result.is_err());

        let result = decode_faces(&shape(3, 2), &[0.0; 6], &shape(2, 4), &[0.0; 8], &config, None);
        assert!(result.is_err());
    }

    #[test]
    fn test_nms_keeps_highest_confidence() {
        let face = |confidence: f32, x1: f32| Face {
            confidence,
            bbox: BoundingBox {
                x1,
                y1: 0.2,
                x2: x1 + 0.2,
                y2: 0.4,
            },
        };

        let kept = non_maximum_suppression(vec![face(0.8, 0.1), face(0.9, 0.12), face(0.7, 0.6)], 0.3);
        let confidences: Vec<f32> = kept.iter().map(|f| f.confidence).collect();
        assert_eq!(confidences, vec![0.9, 0.7]);
    }

    #[test]
    fn test_preprocess_normalization() {
        let img = RgbImage::from_pixel(64, 48, image::Rgb([255, 127, 0]));
        let input = preprocess_image(&img, 32, 24);
        assert_eq!(input.shape(), &[1, 3, 24, 32]);
        assert!((input[[0, 0, 0, 0]] - 1.0).abs() < 1e-6);
        assert_eq!(input[[0, 1, 0, 0]], 0.0);
        assert!((input[[0, 2, 0, 0]] + 127.0 / 128.0).abs() < 1e-6);
    }
}
