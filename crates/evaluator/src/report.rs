//! Verdict and report types

use drivecheck_common::VideoInfo;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Final outcome of a driving test
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    Pass,
    Fail,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Pass => write!(f, "PASS"),
            Verdict::Fail => write!(f, "FAIL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    /// A hazard (cone or person) was detected
    ConeContact,
    /// No face was detected
    FaceMissing,
}

/// A rule broken on a sampled frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub kind: ViolationKind,
    /// Decode position (0-indexed)
    pub frame_number: u64,
    /// Seconds from the start of the video
    pub timestamp: f64,
    pub detail: String,
}

/// Everything learned from one evaluation run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub verdict: Verdict,
    pub cone_detected: bool,
    pub face_missing: bool,
    pub violations: Vec<Violation>,
    /// Frames decoded, sampled or not
    pub frames_decoded: u64,
    /// Sampled frames run through both detectors
    pub frames_analyzed: u64,
    /// Detector calls that failed; these never count as violations
    pub detector_errors: u64,
    /// Decoding stopped at a violation before the end of the video
    pub stopped_early: bool,
    /// Frame number of [`EvaluationReport::evidence_frame`]
    pub evidence_frame_number: Option<u64>,
    pub video: Option<VideoInfo>,
    /// First violating frame, else the last analysed frame, annotated
    #[serde(skip)]
    pub evidence_frame: Option<RgbImage>,
}

impl EvaluationReport {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.verdict == Verdict::Pass
    }

    /// Human-readable result, one message per line
    #[must_use]
    pub fn summary_lines(&self) -> Vec<String> {
        let mut lines = Vec::new();

        match self.verdict {
            Verdict::Pass => {
                lines.push("PASS: No cones touched, and head stayed inside vehicle.".to_string());
            }
            Verdict::Fail => {
                lines.push("FAIL".to_string());
                if self.cone_detected {
                    lines.push("Cone touched or crossed.".to_string());
                }
                if self.face_missing {
                    lines.push("Face not detected - head may have moved out.".to_string());
                }
            }
        }

        if self.frames_analyzed == 0 {
            lines.push("Warning: no frames were sampled from the video.".to_string());
        }
        if self.detector_errors > 0 {
            lines.push(format!(
                "Warning: detection failed {} time(s); those frames were not judged.",
                self.detector_errors
            ));
        }

        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(cone_detected: bool, face_missing: bool) -> EvaluationReport {
        EvaluationReport {
            verdict: if cone_detected || face_missing {
                Verdict::Fail
            } else {
                Verdict::Pass
            },
            cone_detected,
            face_missing,
            violations: Vec::new(),
            frames_decoded: 100,
            frames_analyzed: 10,
            detector_errors: 0,
            stopped_early: false,
            evidence_frame_number: Some(99),
            video: None,
            evidence_frame: None,
        }
    }

    #[test]
    fn test_pass_summary() {
        let report = report(false, false);
        assert!(report.passed());
        assert_eq!(
            report.summary_lines(),
            ["PASS: No cones touched, and head stayed inside vehicle."]
        );
    }

    #[test]
    fn test_fail_summaries() {
        assert_eq!(
            report(true, false).summary_lines(),
            ["FAIL", "Cone touched or crossed."]
        );
        assert_eq!(
            report(false, true).summary_lines(),
            ["FAIL", "Face not detected - head may have moved out."]
        );
        assert_eq!(report(true, true).summary_lines().len(), 3);
    }

    #[test]
    fn test_warnings() {
        let mut report = report(false, false);
        report.frames_analyzed = 0;
        report.detector_errors = 2;

        let lines = report.summary_lines();
        assert_eq!(lines.len(), 3);
        assert!(lines[1].contains("no frames"));
        assert!(lines[2].contains('2'));
    }

    #[test]
    fn test_serialization_skips_image() {
        let mut report = report(true, false);
        report.evidence_frame = Some(RgbImage::new(4, 4));
        report.violations.push(Violation {
            kind: ViolationKind::ConeContact,
            frame_number: 9,
            timestamp: 0.3,
            detail: "cone (0.91)".to_string(),
        });

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["verdict"], "FAIL");
        assert_eq!(json["violations"][0]["kind"], "cone_contact");
        assert!(json.get("evidence_frame").is_none());

        let back: EvaluationReport = serde_json::from_value(json).unwrap();
        assert!(back.evidence_frame.is_none());
        assert_eq!(back.violations, report.violations);
    }
}
