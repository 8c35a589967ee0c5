//! Evaluation settings, loadable from YAML

use drivecheck_common::{ProcessingError, Result};
use drivecheck_face_detection::{FaceDetectionConfig, UltraFaceModel};
use drivecheck_object_detection::{ObjectDetectionConfig, YOLOModel};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default directory holding the ONNX models
pub const DEFAULT_MODEL_DIR: &str = "models";

/// Locations of the two ONNX models
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelPaths {
    pub object_model: PathBuf,
    pub face_model: PathBuf,
}

impl Default for ModelPaths {
    fn default() -> Self {
        let dir = Path::new(DEFAULT_MODEL_DIR);
        Self {
            object_model: dir.join(YOLOModel::V5Small.filename()),
            face_model: dir.join(UltraFaceModel::Rfb320.filename()),
        }
    }
}

/// Driving-test evaluation configuration
///
/// Every field has a default, so a YAML file only needs the keys it changes:
///
/// ```yaml
/// sample_interval: 5
/// hazard_labels: [cone, traffic cone]
/// models:
///   object_model: /opt/models/cones.onnx
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationConfig {
    /// Analyse every n-th decoded frame
    pub sample_interval: u32,
    /// Detector class names that count as touching a cone
    pub hazard_labels: Vec<String>,
    /// Stop decoding at the first frame with a violation
    pub stop_on_first_violation: bool,
    /// Draw detection boxes onto the evidence frame
    pub annotate: bool,
    pub models: ModelPaths,
    pub object_detection: ObjectDetectionConfig,
    pub face_detection: FaceDetectionConfig,
    /// TrueType font for box captions; the bundled DejaVu Sans Mono when unset
    pub label_font: Option<PathBuf>,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            sample_interval: 10,
            hazard_labels: vec![
                "cone".to_string(),
                "traffic cone".to_string(),
                "person".to_string(),
            ],
            stop_on_first_violation: true,
            annotate: true,
            models: ModelPaths::default(),
            object_detection: ObjectDetectionConfig::default(),
            face_detection: FaceDetectionConfig::default(),
            label_font: None,
        }
    }
}

impl EvaluationConfig {
    /// Load and validate a YAML configuration file
    pub fn from_yaml(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&contents).map_err(|e| match e {
            ProcessingError::InvalidConfig(msg) => {
                ProcessingError::InvalidConfig(format!("{}: {msg}", path.display()))
            }
            other => other,
        })
    }

    /// Parse and validate YAML text
    pub fn from_yaml_str(contents: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(contents)
            .map_err(|e| ProcessingError::InvalidConfig(format!("Failed to parse YAML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<()> {
        if self.sample_interval == 0 {
            return Err(ProcessingError::InvalidConfig(
                "sample_interval must be at least 1".to_string(),
            ));
        }
        if self.hazard_labels.iter().all(|label| label.trim().is_empty()) {
            return Err(ProcessingError::InvalidConfig(
                "hazard_labels must name at least one class".to_string(),
            ));
        }

        let thresholds = [
            ("object_detection.confidence_threshold", self.object_detection.confidence_threshold),
            ("object_detection.iou_threshold", self.object_detection.iou_threshold),
            ("face_detection.confidence_threshold", self.face_detection.confidence_threshold),
            ("face_detection.nms_threshold", self.face_detection.nms_threshold),
        ];
        for (name, value) in thresholds {
            if !(0.0..=1.0).contains(&value) {
                return Err(ProcessingError::InvalidConfig(format!(
                    "{name} must be within 0.0..=1.0, got {value}"
                )));
            }
        }

        let detection = &self.object_detection;
        if detection.input_size == 0 {
            return Err(ProcessingError::InvalidConfig(
                "object_detection.input_size must be at least 1".to_string(),
            ));
        }
        if detection.max_detections == 0 {
            return Err(ProcessingError::InvalidConfig(
                "object_detection.max_detections must be at least 1".to_string(),
            ));
        }

        let faces = &self.face_detection;
        if faces.input_size.0 == 0 || faces.input_size.1 == 0 {
            return Err(ProcessingError::InvalidConfig(format!(
                "face_detection.input_size must be non-zero, got {:?}",
                faces.input_size
            )));
        }
        if !(0.0..1.0).contains(&faces.min_box_size) {
            return Err(ProcessingError::InvalidConfig(format!(
                "face_detection.min_box_size must be within 0.0..1.0, got {}",
                faces.min_box_size
            )));
        }
        // Margins of half the frame or more leave no room for a face
        if !(0.0..0.5).contains(&faces.edge_margin) {
            return Err(ProcessingError::InvalidConfig(format!(
                "face_detection.edge_margin must be within 0.0..0.5, got {}",
                faces.edge_margin
            )));
        }

        Ok(())
    }

    /// Resolve both model file names inside `dir`
    #[must_use]
    pub fn with_model_dir(mut self, dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        let defaults = ModelPaths::default();
        let relocate = |current: &Path, fallback: &Path| {
            dir.join(current.file_name().or_else(|| fallback.file_name()).unwrap_or_default())
        };

        self.models = ModelPaths {
            object_model: relocate(&self.models.object_model, &defaults.object_model),
            face_model: relocate(&self.models.face_model, &defaults.face_model),
        };
        self
    }

    /// Whether a detector class name is one of the hazard labels
    #[must_use]
    pub fn is_hazard(&self, class_name: &str) -> bool {
        let class_name = class_name.trim();
        self.hazard_labels
            .iter()
            .any(|label| label.trim().eq_ignore_ascii_case(class_name))
    }
}
