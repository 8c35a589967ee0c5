//! Driving-test evaluation
//!
//! Samples frames from a test video, looks for hazards (cones, people) with
//! an object detector and for the driver's face with a face detector, and
//! turns the findings into a PASS/FAIL verdict.
//!
//! A sampled frame fails the test when any detection carries a hazard label,
//! or when no face is found. By default decoding stops at the first failing
//! frame and that frame, annotated, becomes the evidence.
//!
//! # Example
//! ```no_run
//! use drivecheck_evaluator::{EvaluationConfig, Evaluator};
//! use std::path::Path;
//!
//! # fn main() -> drivecheck_common::Result<()> {
//! let mut evaluator = Evaluator::load(EvaluationConfig::default())?;
//! let report = evaluator.evaluate_video(Path::new("test-drive.mp4"))?;
//! for line in report.summary_lines() {
//!     println!("{line}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod annotate;
pub mod config;
pub mod detectors;
pub mod report;

pub use annotate::{encode_jpeg, Annotator};
pub use config::{EvaluationConfig, ModelPaths};
pub use detectors::{FaceDetect, ObjectDetect};
pub use report::{EvaluationReport, Verdict, Violation, ViolationKind};

use drivecheck_common::{Result, VideoInfo};
use drivecheck_decoder::{for_each_frame, probe_video, DecoderConfig, Frame, FrameFilter};
use drivecheck_face_detection::FaceDetector;
use drivecheck_object_detection::{Detection, ObjectDetector};
use image::RgbImage;
use std::ops::ControlFlow;
use std::path::Path;
use tracing::{debug, info, warn};

/// Runs the driving-test rules over video frames
pub struct Evaluator {
    config: EvaluationConfig,
    objects: Box<dyn ObjectDetect>,
    faces: Box<dyn FaceDetect>,
    annotator: Annotator,
}

impl Evaluator {
    /// Load both ONNX models named by `config`
    pub fn load(config: EvaluationConfig) -> Result<Self> {
        config.validate()?;

        let objects = ObjectDetector::new(&config.models.object_model, config.object_detection.clone())?;
        let faces = FaceDetector::new(&config.models.face_model, config.face_detection.clone())?;

        Self::new(config, Box::new(objects), Box::new(faces))
    }

    /// Build an evaluator around already-constructed detectors
    pub fn new(
        config: EvaluationConfig,
        objects: Box<dyn ObjectDetect>,
        faces: Box<dyn FaceDetect>,
    ) -> Result<Self> {
        config.validate()?;
        let annotator = Annotator::new(config.label_font.as_deref());

        Ok(Self {
            config,
            objects,
            faces,
            annotator,
        })
    }

    #[must_use]
    pub fn config(&self) -> &EvaluationConfig {
        &self.config
    }

    /// Evaluate a video file, decoding only as far as needed
    pub fn evaluate_video(&mut self, path: &Path) -> Result<EvaluationReport> {
        let video = probe_video(path)?;
        info!(
            "Evaluating {} ({}x{}, {:.1} fps, ~{} frames, every {}th sampled)",
            path.display(),
            video.width,
            video.height,
            video.fps,
            video.estimated_frames,
            self.config.sample_interval
        );

        let decoder_config = DecoderConfig::every_nth(self.config.sample_interval);
        let mut run = Run::default();
        let summary = for_each_frame(path, &decoder_config, |frame| self.visit(&mut run, frame))?;

        run.frames_decoded = summary.frames_decoded;
        run.stopped_early = summary.stopped_early;
        Ok(self.finish(run, Some(video)))
    }

    /// Evaluate in-memory frames in decode order
    ///
    /// Frames are sampled by their `frame_number` exactly as
    /// [`Evaluator::evaluate_video`] samples a file.
    pub fn evaluate_frames<I>(&mut self, frames: I) -> Result<EvaluationReport>
    where
        I: IntoIterator<Item = Frame>,
    {
        let filter = FrameFilter::EveryNth(self.config.sample_interval);
        let mut run = Run::default();

        for frame in frames {
            run.frames_decoded += 1;
            if !filter.selects(frame.frame_number, frame.is_keyframe) {
                continue;
            }
            if self.visit(&mut run, frame).is_break() {
                run.stopped_early = true;
                break;
            }
        }

        Ok(self.finish(run, None))
    }

    fn visit(&mut self, run: &mut Run, frame: Frame) -> ControlFlow<()> {
        let (frame_number, timestamp) = (frame.frame_number, frame.timestamp);
        match frame.into_rgb_image() {
            Ok(image) => self.analyze_frame(run, frame_number, timestamp, image),
            Err(e) => {
                warn!("Skipping frame {frame_number}: {e}");
                ControlFlow::Continue(())
            }
        }
    }

    /// Apply both rules to one sampled frame
    fn analyze_frame(
        &mut self,
        run: &mut Run,
        frame_number: u64,
        timestamp: f64,
        mut image: RgbImage,
    ) -> ControlFlow<()> {
        run.frames_analyzed += 1;
        let mut violated = false;

        let detections = self.objects.detect_objects(&image).unwrap_or_else(|e| {
            warn!("Object detection failed on frame {frame_number}: {e}");
            run.detector_errors += 1;
            Vec::new()
        });
        let hazards: Vec<&Detection> = detections
            .iter()
            .filter(|d| self.config.is_hazard(&d.class_name))
            .collect();

        if !hazards.is_empty() {
            violated = true;
            run.cone_detected = true;
            let detail = hazards
                .iter()
                .map(|d| format!("{} ({:.2})", d.class_name, d.confidence))
                .collect::<Vec<_>>()
                .join(", ");
            info!("Frame {frame_number}: hazard detected: {detail}");
            run.violations.push(Violation {
                kind: ViolationKind::ConeContact,
                frame_number,
                timestamp,
                detail,
            });
        }

        let faces = match self.faces.detect_faces(&image) {
            Ok(faces) => {
                if faces.is_empty() {
                    violated = true;
                    run.face_missing = true;
                    info!("Frame {frame_number}: no face detected");
                    run.violations.push(Violation {
                        kind: ViolationKind::FaceMissing,
                        frame_number,
                        timestamp,
                        detail: "no face detected".to_string(),
                    });
                }
                faces
            }
            Err(e) => {
                warn!("Face detection failed on frame {frame_number}: {e}");
                run.detector_errors += 1;
                Vec::new()
            }
        };

        debug!(
            "Frame {} ({:.2}s): {} detections, {} hazards, {} faces",
            frame_number,
            timestamp,
            detections.len(),
            hazards.len(),
            faces.len()
        );

        if self.config.annotate {
            self.annotator.annotate(&mut image, &hazards, &faces);
        }

        // The first violating frame stays as evidence once captured
        if !run.evidence_is_violation {
            run.evidence = Some((frame_number, image));
            run.evidence_is_violation = violated;
        }

        if violated && self.config.stop_on_first_violation {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    }

    fn finish(&self, run: Run, video: Option<VideoInfo>) -> EvaluationReport {
        let verdict = if run.cone_detected || run.face_missing {
            Verdict::Fail
        } else {
            Verdict::Pass
        };

        if run.frames_analyzed == 0 {
            warn!("No frames sampled (interval {})", self.config.sample_interval);
        }
        info!(
            "Verdict {} after {} sampled frames ({} decoded, {} violations)",
            verdict,
            run.frames_analyzed,
            run.frames_decoded,
            run.violations.len()
        );

        let (evidence_frame_number, evidence_frame) = run.evidence.unzip();
        EvaluationReport {
            verdict,
            cone_detected: run.cone_detected,
            face_missing: run.face_missing,
            violations: run.violations,
            frames_decoded: run.frames_decoded,
            frames_analyzed: run.frames_analyzed,
            detector_errors: run.detector_errors,
            stopped_early: run.stopped_early,
            evidence_frame_number,
            video,
            evidence_frame,
        }
    }
}

/// Running tallies for one evaluation
#[derive(Default)]
struct Run {
    cone_detected: bool,
    face_missing: bool,
    violations: Vec<Violation>,
    frames_decoded: u64,
    frames_analyzed: u64,
    detector_errors: u64,
    stopped_early: bool,
    evidence: Option<(u64, RgbImage)>,
    evidence_is_violation: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use drivecheck_common::ProcessingError;
    use drivecheck_face_detection::{BoundingBox as FaceBox, Face};
    use drivecheck_object_detection::BoundingBox;
    use image::Rgb;

    /// Frames carry their frame number in the red channel of every pixel
    fn frames(count: u64) -> Vec<Frame> {
        (0..count)
            .map(|n| Frame {
                timestamp: n as f64 / 30.0,
                frame_number: n,
                width: 8,
                height: 6,
                data: vec![n as u8; 8 * 6 * 3],
                is_keyframe: n == 0,
            })
            .collect()
    }

    fn frame_id(image: &RgbImage) -> u64 {
        u64::from(image.get_pixel(0, 0)[0])
    }

    fn detection(label: &str) -> Detection {
        Detection {
            class_id: 0,
            class_name: label.to_string(),
            confidence: 0.8,
            bbox: BoundingBox::new(0.1, 0.1, 0.5, 0.5),
        }
    }

    fn face() -> Face {
        Face {
            confidence: 0.9,
            bbox: FaceBox {
                x1: 0.25,
                y1: 0.25,
                x2: 0.75,
                y2: 0.75,
            },
        }
    }

    /// Reports `label` on the listed frames
    struct FakeObjects {
        label: &'static str,
        on_frames: Vec<u64>,
    }

    impl FakeObjects {
        fn never() -> Self {
            Self::on("cone", &[])
        }

        fn on(label: &'static str, on_frames: &[u64]) -> Self {
            Self {
                label,
                on_frames: on_frames.to_vec(),
            }
        }
    }

    impl ObjectDetect for FakeObjects {
        fn detect_objects(&mut self, image: &RgbImage) -> Result<Vec<Detection>> {
            if self.on_frames.contains(&frame_id(image)) {
                Ok(vec![detection("car"), detection(self.label)])
            } else {
                Ok(vec![detection("car")])
            }
        }
    }

    /// Finds one face except on the listed frames
    struct FakeFaces {
        missing_on: Vec<u64>,
        fail_on: Vec<u64>,
    }

    impl FakeFaces {
        fn always() -> Self {
            Self {
                missing_on: Vec::new(),
                fail_on: Vec::new(),
            }
        }
    }

    impl FaceDetect for FakeFaces {
        fn detect_faces(&mut self, image: &RgbImage) -> Result<Vec<Face>> {
            let id = frame_id(image);
            if self.fail_on.contains(&id) {
                Err(ProcessingError::Other("inference failed".to_string()))
            } else if self.missing_on.contains(&id) {
                Ok(Vec::new())
            } else {
                Ok(vec![face()])
            }
        }
    }

    fn build(objects: FakeObjects, faces: FakeFaces, config: EvaluationConfig) -> Evaluator {
        Evaluator::new(config, Box::new(objects), Box::new(faces)).unwrap()
    }

    #[test]
    fn test_clean_run_passes() {
        let mut evaluator = build(FakeObjects::never(), FakeFaces::always(), EvaluationConfig::default());
        let report = evaluator.evaluate_frames(frames(35)).unwrap();

        assert_eq!(report.verdict, Verdict::Pass);
        assert_eq!(report.frames_decoded, 35);
        assert_eq!(report.frames_analyzed, 3);
        assert!(report.violations.is_empty());
        assert!(!report.stopped_early);
        // Last analysed frame is the evidence
        assert_eq!(report.evidence_frame_number, Some(29));
        assert!(report.evidence_frame.is_some());
    }

    #[test]
    fn test_hazard_stops_at_first_violation() {
        let mut evaluator = build(
            FakeObjects::on("traffic cone", &[19, 29]),
            FakeFaces::always(),
            EvaluationConfig::default(),
        );
        let report = evaluator.evaluate_frames(frames(50)).unwrap();

        assert_eq!(report.verdict, Verdict::Fail);
        assert!(report.cone_detected);
        assert!(!report.face_missing);
        assert!(report.stopped_early);
        assert_eq!(report.frames_decoded, 20);
        assert_eq!(report.frames_analyzed, 2);
        assert_eq!(report.violations.len(), 1);
        assert_eq!(report.violations[0].kind, ViolationKind::ConeContact);
        assert_eq!(report.violations[0].frame_number, 19);
        assert_eq!(report.violations[0].detail, "traffic cone (0.80)");
        assert_eq!(report.evidence_frame_number, Some(19));
    }

    #[test]
    fn test_person_counts_as_hazard() {
        let mut evaluator = build(
            FakeObjects::on("Person", &[9]),
            FakeFaces::always(),
            EvaluationConfig::default(),
        );
        let report = evaluator.evaluate_frames(frames(20)).unwrap();
        assert!(report.cone_detected);
    }

    #[test]
    fn test_missing_face_fails() {
        let faces = FakeFaces {
            missing_on: vec![29],
            fail_on: Vec::new(),
        };
        let mut evaluator = build(FakeObjects::never(), faces, EvaluationConfig::default());
        let report = evaluator.evaluate_frames(frames(100)).unwrap();

        assert_eq!(report.verdict, Verdict::Fail);
        assert!(report.face_missing);
        assert!(!report.cone_detected);
        assert_eq!(report.violations[0].kind, ViolationKind::FaceMissing);
        assert_eq!(
            report.summary_lines(),
            ["FAIL", "Face not detected - head may have moved out."]
        );
    }

    #[test]
    fn test_both_violations_on_one_frame() {
        let faces = FakeFaces {
            missing_on: vec![9],
            fail_on: Vec::new(),
        };
        let mut evaluator = build(FakeObjects::on("cone", &[9]), faces, EvaluationConfig::default());
        let report = evaluator.evaluate_frames(frames(30)).unwrap();

        assert!(report.cone_detected && report.face_missing);
        assert_eq!(report.violations.len(), 2);
        assert_eq!(report.frames_analyzed, 1);
    }

    #[test]
    fn test_no_early_stop_collects_all_violations() {
        let config = EvaluationConfig {
            stop_on_first_violation: false,
            ..Default::default()
        };
        let mut evaluator = build(FakeObjects::on("cone", &[19, 39]), FakeFaces::always(), config);
        let report = evaluator.evaluate_frames(frames(50)).unwrap();

        assert!(!report.stopped_early);
        assert_eq!(report.frames_analyzed, 5);
        assert_eq!(report.violations.len(), 2);
        // Evidence stays on the first violation
        assert_eq!(report.evidence_frame_number, Some(19));
    }

    #[test]
    fn test_detector_errors_are_not_violations() {
        let faces = FakeFaces {
            missing_on: Vec::new(),
            fail_on: vec![9, 19],
        };
        let mut evaluator = build(FakeObjects::never(), faces, EvaluationConfig::default());
        let report = evaluator.evaluate_frames(frames(30)).unwrap();

        assert_eq!(report.verdict, Verdict::Pass);
        assert_eq!(report.detector_errors, 2);
        assert_eq!(report.frames_analyzed, 3);
        assert_eq!(report.summary_lines().len(), 2);
    }

    #[test]
    fn test_short_video_passes_with_warning() {
        let mut evaluator = build(FakeObjects::never(), FakeFaces::always(), EvaluationConfig::default());
        let report = evaluator.evaluate_frames(frames(9)).unwrap();

        assert_eq!(report.verdict, Verdict::Pass);
        assert_eq!(report.frames_analyzed, 0);
        assert!(report.evidence_frame.is_none());
        assert!(report.summary_lines()[1].starts_with("Warning"));
    }

    #[test]
    fn test_custom_interval_and_labels() {
        let config = EvaluationConfig {
            sample_interval: 3,
            hazard_labels: vec!["bollard".to_string()],
            ..Default::default()
        };
        let mut evaluator = build(FakeObjects::on("cone", &[2, 5]), FakeFaces::always(), config);
        let report = evaluator.evaluate_frames(frames(10)).unwrap();

        // "cone" is not a hazard under this config
        assert_eq!(report.verdict, Verdict::Pass);
        assert_eq!(report.frames_analyzed, 3);
    }

    #[test]
    fn test_annotation_marks_evidence() {
        let config = EvaluationConfig {
            sample_interval: 1,
            ..Default::default()
        };
        let objects = FakeObjects::on("cone", &[0]);
        let mut evaluator = build(objects, FakeFaces::always(), config.clone());
        let report = evaluator.evaluate_frames(frames(1)).unwrap();
        let evidence = report.evidence_frame.unwrap();
        // Hazard box corner at (0.1 * 8, 0.1 * 6) rounds to (1, 1)
        assert_eq!(*evidence.get_pixel(1, 1), annotate::HAZARD_COLOR);

        let config = EvaluationConfig {
            annotate: false,
            ..config
        };
        let mut evaluator = build(FakeObjects::on("cone", &[0]), FakeFaces::always(), config);
        let report = evaluator.evaluate_frames(frames(1)).unwrap();
        assert_eq!(*report.evidence_frame.unwrap().get_pixel(1, 1), Rgb([0, 0, 0]));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = EvaluationConfig {
            sample_interval: 0,
            ..Default::default()
        };
        let result = Evaluator::new(config, Box::new(FakeObjects::never()), Box::new(FakeFaces::always()));
        assert!(result.is_err());
    }

    #[test]
    fn test_load_fails_without_models() {
        let config = EvaluationConfig::default().with_model_dir("/nonexistent/models");
        assert!(Evaluator::load(config).is_err());
    }
}
