//! Object detection module using YOLO via ONNX Runtime
//!
//! Runs YOLO models exported to ONNX and decodes both output layouts found
//! in the wild:
//! - `YOLOv8` / `YOLO11`: `[1, 4 + classes, anchors]`, class scores only
//! - `YOLOv5`: `[1, anchors, 5 + classes]`, objectness times class score
//!
//! Class names come from the config, from the `names` metadata ultralytics
//! embeds on export, or fall back to the 80 COCO classes.
//!
//! # Example
//! ```no_run
//! use drivecheck_object_detection::{ObjectDetector, ObjectDetectionConfig};
//! use image::open;
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = ObjectDetectionConfig::default();
//! let mut detector = ObjectDetector::new("models/yolov5s.onnx", config)?;
//!
//! let img = open("frame.jpg")?.to_rgb8();
//! for detection in detector.detect(&img)? {
//!     println!("{}: {:.2}%", detection.class_name, detection.confidence * 100.0);
//! }
//! # Ok(())
//! # }
//! ```

use drivecheck_common::ProcessingError;
use image::RgbImage;
use ndarray::Array4;
use ort::{session::Session, value::TensorRef};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Pretrained YOLO variants with their usual export filenames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum YOLOModel {
    /// `YOLOv5` Small, the default hazard model
    V5Small,
    /// `YOLOv8` Nano - fastest inference
    V8Nano,
    /// `YOLOv8` Small - balanced speed/accuracy
    V8Small,
    /// `YOLOv8` Medium - best accuracy of the supported sizes
    V8Medium,
}

impl YOLOModel {
    /// Get the typical model filename for this variant
    #[must_use]
    pub fn filename(&self) -> &'static str {
        match self {
            YOLOModel::V5Small => "yolov5s.onnx",
            YOLOModel::V8Nano => "yolov8n.onnx",
            YOLOModel::V8Small => "yolov8s.onnx",
            YOLOModel::V8Medium => "yolov8m.onnx",
        }
    }
}

/// Configuration for object detection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectDetectionConfig {
    /// Minimum confidence threshold for detections (0.0-1.0)
    pub confidence_threshold: f32,
    /// `IoU` threshold for non-maximum suppression (0.0-1.0)
    pub iou_threshold: f32,
    /// Maximum number of detections to return per image
    pub max_detections: usize,
    /// Square model input size in pixels
    pub input_size: u32,
    /// Class names in model order; overrides model metadata
    pub class_names: Option<Vec<String>>,
}

impl Default for ObjectDetectionConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.25,
            iou_threshold: 0.45,
            max_detections: 300,
            input_size: 640,
            class_names: None,
        }
    }
}

/// Bounding box with normalized coordinates (0-1)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    /// X coordinate of top-left corner (normalized 0-1)
    pub x: f32,
    /// Y coordinate of top-left corner (normalized 0-1)
    pub y: f32,
    /// Width of box (normalized 0-1)
    pub width: f32,
    /// Height of box (normalized 0-1)
    pub height: f32,
}

impl BoundingBox {
    #[must_use]
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Get center coordinates
    #[must_use]
    pub fn center(&self) -> (f32, f32) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    #[must_use]
    #[inline]
    pub fn area(&self) -> f32 {
        self.width * self.height
    }

    /// Calculate Intersection over Union (`IoU`) with another box
    #[must_use]
    #[inline]
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);

        let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
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
            (self.x * w).round() as u32,
            (self.y * h).round() as u32,
            (self.width * w).round() as u32,
            (self.height * h).round() as u32,
        )
    }
}

/// Object detection result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// Class index in model order
    pub class_id: usize,
    /// Human-readable class name
    pub class_name: String,
    /// Confidence score (0-1)
    pub confidence: f32,
    /// Bounding box with normalized coordinates
    pub bbox: BoundingBox,
}

/// Object detector using a YOLO ONNX model
pub struct ObjectDetector {
    session: Session,
    config: ObjectDetectionConfig,
    class_names: Vec<String>,
}

impl ObjectDetector {
    /// Create a new object detector with the given ONNX model path
    pub fn new<P: AsRef<Path>>(
        model_path: P,
        config: ObjectDetectionConfig,
    ) -> Result<Self, ObjectDetectionError> {
        let model_path = model_path.as_ref();
        info!("Loading YOLO model from {}", model_path.display());

        if config.input_size == 0 || config.max_detections == 0 {
            return Err(ProcessingError::InvalidConfig(format!(
                "object detector input size {} with max detections {}",
                config.input_size, config.max_detections
            ))
            .into());
        }

        let session = drivecheck_common::onnx::create_session(model_path)?;

        let class_names = match &config.class_names {
            Some(names) => names.clone(),
            None => embedded_class_names(&session).unwrap_or_else(|| {
                debug!("No class names in model metadata, using COCO classes");
                COCO_CLASSES.iter().map(|&s| s.to_string()).collect()
            }),
        };

        info!("YOLO model loaded ({} classes)", class_names.len());

        Ok(Self {
            session,
            config,
            class_names,
        })
    }

    /// Class names in model order
    #[must_use]
    pub fn class_names(&self) -> &[String] {
        &self.class_names
    }

    /// Detect objects in a single image
    pub fn detect(&mut self, image: &RgbImage) -> Result<Vec<Detection>, ObjectDetectionError> {
        debug!(
            "Running object detection on {}x{} image",
            image.width(),
            image.height()
        );

        let input = preprocess_image(image, self.config.input_size);

        let input_tensor = TensorRef::from_array_view(input.view())
            .map_err(|e| ObjectDetectionError::Inference(e.to_string()))?;
        let outputs = self
            .session
            .run(ort::inputs![input_tensor])
            .map_err(|e| ObjectDetectionError::Inference(e.to_string()))?;

        let (shape, data) = outputs[0].try_extract_tensor::<f32>().map_err(|e| {
            ObjectDetectionError::Inference(format!("Failed to extract tensor: {e}"))
        })?;
        let dims: &[i64] = shape.as_ref();

        let detections = decode_predictions(dims, data, &self.config, &self.class_names)?;
        debug!("Detected {} objects", detections.len());

        Ok(detections)
    }
}

/// Read the ultralytics `names` entry from the model's custom metadata
fn embedded_class_names(session: &Session) -> Option<Vec<String>> {
    let metadata = match session.metadata() {
        Ok(metadata) => metadata,
        Err(e) => {
            warn!("Failed to read model metadata: {e}");
            return None;
        }
    };
    let raw = metadata.custom("names").ok().flatten()?;
    let names = parse_ultralytics_names(&raw);
    if names.is_none() {
        warn!("Unrecognized class names metadata: {raw}");
    }
    names
}

/// Resize to the square model input and convert to NCHW floats in [0, 1]
fn preprocess_image(image: &RgbImage, input_size: u32) -> Array4<f32> {
    let resized = image::imageops::resize(
        image,
        input_size,
        input_size,
        image::imageops::FilterType::Triangle,
    );

    let size = input_size as usize;
    let mut input = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in resized.enumerate_pixels() {
        for channel in 0..3 {
            input[[0, channel, y as usize, x as usize]] = f32::from(pixel[channel]) / 255.0;
        }
    }
    input
}

/// Memory layout of a YOLO prediction tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputLayout {
    /// `[1, 4 + classes, anchors]` (`YOLOv8` and later)
    FeaturesFirst { features: usize, anchors: usize },
    /// `[1, anchors, 5 + classes]` (`YOLOv5`)
    AnchorsFirst { anchors: usize, features: usize },
}

impl OutputLayout {
    fn detect(dims: &[i64]) -> Result<Self, ObjectDetectionError> {
        if dims.len() != 3 {
            return Err(ObjectDetectionError::Inference(format!(
                "Expected 3D output tensor, got {}D",
                dims.len()
            )));
        }
        let d1 = usize::try_from(dims[1]).unwrap_or(0);
        let d2 = usize::try_from(dims[2]).unwrap_or(0);

        // Anchor count (thousands) always dwarfs the per-anchor feature count
        let layout = if d1 < d2 {
            OutputLayout::FeaturesFirst {
                features: d1,
                anchors: d2,
            }
        } else {
            OutputLayout::AnchorsFirst {
                anchors: d1,
                features: d2,
            }
        };

        if layout.class_count() == 0 {
            return Err(ObjectDetectionError::Inference(format!(
                "Output shape {dims:?} has no class scores"
            )));
        }
        Ok(layout)
    }

    fn anchors(&self) -> usize {
        match *self {
            OutputLayout::FeaturesFirst { anchors, .. }
            | OutputLayout::AnchorsFirst { anchors, .. } => anchors,
        }
    }

    fn class_offset(&self) -> usize {
        match self {
            OutputLayout::FeaturesFirst { .. } => 4,
            OutputLayout::AnchorsFirst { .. } => 5,
        }
    }

    fn class_count(&self) -> usize {
        match *self {
            OutputLayout::FeaturesFirst { features, .. }
            | OutputLayout::AnchorsFirst { features, .. } => {
                features.saturating_sub(self.class_offset())
            }
        }
    }

    fn len(&self) -> usize {
        match *self {
            OutputLayout::FeaturesFirst { features, anchors }
            | OutputLayout::AnchorsFirst { anchors, features } => features * anchors,
        }
    }

    #[inline]
    fn value(&self, data: &[f32], feature: usize, anchor: usize) -> f32 {
        match *self {
            OutputLayout::FeaturesFirst { anchors, .. } => data[feature * anchors + anchor],
            OutputLayout::AnchorsFirst { features, .. } => data[anchor * features + feature],
        }
    }
}

/// Decode a raw YOLO prediction tensor into filtered, NMS-suppressed detections
///
/// Box coordinates in the tensor are in model-input pixels and are normalized
/// by `config.input_size`.
///
/// # Errors
///
/// Returns [`ObjectDetectionError::Inference`] when the shape is not a
/// recognised YOLO layout or `data` is shorter than the shape implies.
#[allow(clippy::cast_precision_loss)]
pub fn decode_predictions(
    dims: &[i64],
    data: &[f32],
    config: &ObjectDetectionConfig,
    class_names: &[String],
) -> Result<Vec<Detection>, ObjectDetectionError> {
    let layout = OutputLayout::detect(dims)?;
    if data.len() < layout.len() {
        return Err(ObjectDetectionError::Inference(format!(
            "Output tensor has {} values, shape {dims:?} needs {}",
            data.len(),
            layout.len()
        )));
    }
    debug!("YOLO output shape {:?} decoded as {:?}", dims, layout);

    let scale = config.input_size as f32;
    let offset = layout.class_offset();
    let mut candidates = Vec::new();

    for anchor in 0..layout.anchors() {
        let (class_id, class_score) = (0..layout.class_count())
            .map(|c| (c, layout.value(data, offset + c, anchor)))
            .fold((0, f32::MIN), |best, cur| if cur.1 > best.1 { cur } else { best });

        let confidence = match layout {
            OutputLayout::AnchorsFirst { .. } => layout.value(data, 4, anchor) * class_score,
            OutputLayout::FeaturesFirst { .. } => class_score,
        };
        if confidence < config.confidence_threshold {
            continue;
        }

        let cx = layout.value(data, 0, anchor);
        let cy = layout.value(data, 1, anchor);
        let w = layout.value(data, 2, anchor);
        let h = layout.value(data, 3, anchor);

        let x1 = ((cx - w / 2.0) / scale).clamp(0.0, 1.0);
        let y1 = ((cy - h / 2.0) / scale).clamp(0.0, 1.0);
        let x2 = ((cx + w / 2.0) / scale).clamp(0.0, 1.0);
        let y2 = ((cy + h / 2.0) / scale).clamp(0.0, 1.0);
        if x2 <= x1 || y2 <= y1 {
            continue;
        }

        candidates.push(Detection {
            class_id,
            class_name: class_names
                .get(class_id)
                .map_or_else(|| "unknown".to_string(), Clone::clone),
            confidence,
            bbox: BoundingBox::new(x1, y1, x2 - x1, y2 - y1),
        });
    }

    debug!("Raw detections before NMS: {}", candidates.len());
    Ok(non_maximum_suppression(
        candidates,
        config.iou_threshold,
        config.max_detections,
    ))
}

/// Class-aware greedy NMS, highest confidence first
#[must_use]
pub fn non_maximum_suppression(
    mut detections: Vec<Detection>,
    iou_threshold: f32,
    max_detections: usize,
) -> Vec<Detection> {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<Detection> = Vec::with_capacity(detections.len().min(max_detections));
    for candidate in detections {
        if keep.len() == max_detections {
            break;
        }
        let suppressed = keep.iter().any(|kept| {
            kept.class_id == candidate.class_id && kept.bbox.iou(&candidate.bbox) >= iou_threshold
        });
        if !suppressed {
            keep.push(candidate);
        }
    }
    keep
}

/// Parse the `names` metadata ultralytics writes into exported models
///
/// The value is a Python dict literal such as `{0: 'person', 1: 'cone'}`.
/// Returns `None` unless the ids are exactly `0..n`.
#[must_use]
pub fn parse_ultralytics_names(raw: &str) -> Option<Vec<String>> {
    let mut rest = raw.trim().strip_prefix('{')?.strip_suffix('}')?.trim();
    let mut entries: Vec<(usize, String)> = Vec::new();

    while !rest.is_empty() {
        let (key, value) = rest.split_once(':')?;
        let id = key.trim().parse::<usize>().ok()?;

        let value = value.trim_start();
        let quote = value.chars().next().filter(|c| *c == '\'' || *c == '"')?;
        let value = &value[1..];
        let end = value.find(quote)?;
        entries.push((id, value[..end].to_string()));

        rest = value[end + 1..].trim_start();
        rest = rest.strip_prefix(',').unwrap_or(rest).trim_start();
    }

    entries.sort_by_key(|(id, _)| *id);
    let contiguous = entries.iter().enumerate().all(|(i, (id, _))| i == *id);
    if entries.is_empty() || !contiguous {
        return None;
    }
    Some(entries.into_iter().map(|(_, name)| name).collect())
}

/// Error types for object detection
#[derive(Debug, Error)]
pub enum ObjectDetectionError {
    #[error("Inference error: {0}")]
    Inference(String),

    #[error(transparent)]
    Processing(#[from] ProcessingError),
}

impl From<ObjectDetectionError> for ProcessingError {
    fn from(err: ObjectDetectionError) -> Self {
        match err {
            ObjectDetectionError::Processing(inner) => inner,
            other => ProcessingError::Other(other.to_string()),
        }
    }
}

/// 80 COCO object classes (in order)
pub const COCO_CLASSES: &[&str] = &[
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
