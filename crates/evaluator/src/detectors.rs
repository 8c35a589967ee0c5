//! Detector seams used by the evaluation loop

use drivecheck_common::Result;
use drivecheck_face_detection::{Face, FaceDetector};
use drivecheck_object_detection::{Detection, ObjectDetector};
use image::RgbImage;

/// Anything that finds labelled objects in a frame
pub trait ObjectDetect: Send {
    fn detect_objects(&mut self, image: &RgbImage) -> Result<Vec<Detection>>;
}

/// Anything that finds faces in a frame
pub trait FaceDetect: Send {
    fn detect_faces(&mut self, image: &RgbImage) -> Result<Vec<Face>>;
}

impl ObjectDetect for ObjectDetector {
    fn detect_objects(&mut self, image: &RgbImage) -> Result<Vec<Detection>> {
        Ok(self.detect(image)?)
    }
}

impl FaceDetect for FaceDetector {
    fn detect_faces(&mut self, image: &RgbImage) -> Result<Vec<Face>> {
        Ok(self.detect(image)?)
    }
}
