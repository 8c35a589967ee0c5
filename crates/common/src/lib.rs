//! Common types and utilities for driving-test video evaluation

pub mod onnx;

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Processing errors
#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("File too large: {size} bytes (max: {max})")]
    FileTooLarge { size: u64, max: u64 },

    #[error("No video stream found")]
    NoVideoStream,

    #[error("Corrupted file: {0}")]
    CorruptedFile(String),

    #[error("FFmpeg error: {0}")]
    FFmpegError(String),

    #[error("Failed to load model: {0}")]
    ModelLoad(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Image processing error: {0}")]
    ImageError(String),

    #[error("Other error: {0}")]
    Other(String),
}

impl From<image::ImageError> for ProcessingError {
    fn from(err: image::ImageError) -> Self {
        ProcessingError::ImageError(err.to_string())
    }
}

/// Result type for processing operations
pub type Result<T> = std::result::Result<T, ProcessingError>;

/// Container extensions accepted for uploaded test videos
pub const SUPPORTED_VIDEO_EXTENSIONS: &[&str] = &["mp4", "mov", "avi"];

/// Check an uploaded file name against [`SUPPORTED_VIDEO_EXTENSIONS`]
///
/// Returns the canonical (lowercase) extension.
pub fn validate_video_filename(name: &str) -> Result<&'static str> {
    let extension = Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .ok_or_else(|| ProcessingError::UnsupportedFormat(format!("{name} has no extension")))?;

    SUPPORTED_VIDEO_EXTENSIONS
        .iter()
        .find(|&&supported| supported == extension)
        .copied()
        .ok_or_else(|| {
            ProcessingError::UnsupportedFormat(format!(
                ".{extension} (expected one of: {})",
                SUPPORTED_VIDEO_EXTENSIONS.join(", ")
            ))
        })
}

/// Properties of the video stream in a container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoInfo {
    /// Container format name reported by the demuxer
    pub format: String,
    pub codec: String,
    pub width: u32,
    pub height: u32,
    /// Average frame rate (0.0 when the container does not say)
    pub fps: f64,
    /// Duration in seconds
    pub duration: f64,
    /// Frame count from the container header, or duration * fps
    pub estimated_frames: u64,
}

impl VideoInfo {
    /// Number of frames a sampler taking every `interval`-th frame will visit
    #[must_use]
    pub fn sampled_frames(&self, interval: u32) -> u64 {
        if interval == 0 {
            return 0;
        }
        self.estimated_frames / u64::from(interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_video_filename_accepts_supported() {
        assert_eq!(validate_video_filename("run1.mp4").unwrap(), "mp4");
        assert_eq!(validate_video_filename("Run1.MOV").unwrap(), "mov");
        assert_eq!(validate_video_filename("/tmp/clip.avi").unwrap(), "avi");
    }

    #[test]
    fn test_validate_video_filename_rejects_others() {
        assert!(matches!(
            validate_video_filename("notes.txt"),
            Err(ProcessingError::UnsupportedFormat(_))
        ));
        assert!(matches!(
            validate_video_filename("video"),
            Err(ProcessingError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_sampled_frames() {
        let info = VideoInfo {
            format: "mov,mp4,m4a,3gp,3g2,mj2".to_string(),
            codec: "h264".to_string(),
            width: 1280,
            height: 720,
            fps: 30.0,
            duration: 10.0,
            estimated_frames: 300,
        };

        assert_eq!(info.sampled_frames(10), 30);
        assert_eq!(info.sampled_frames(7), 42);
        assert_eq!(info.sampled_frames(0), 0);
    }
}
