//! Drawing detection boxes onto evidence frames

use ab_glyph::{FontArc, PxScale};
use drivecheck_common::Result;
use drivecheck_face_detection::Face;
use drivecheck_object_detection::Detection;
use image::{codecs::jpeg::JpegEncoder, Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;
use std::path::Path;
use tracing::{debug, warn};

/// Box color for hazards (cones, people)
pub const HAZARD_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
/// Box color for faces
pub const FACE_COLOR: Rgb<u8> = Rgb([0, 255, 0]);

pub const HAZARD_CAPTION: &str = "CONE";
pub const FACE_CAPTION: &str = "FACE";

const LINE_THICKNESS: u32 = 2;
/// Gap between the caption and the top edge of its box
const CAPTION_OFFSET: i32 = 10;
const CAPTION_SCALE: f32 = 20.0;

/// DejaVu Sans Mono, used when no caption font is configured
static BUNDLED_FONT: &[u8] = include_bytes!("../assets/DejaVuSansMono.ttf");

/// Box painter with an optional caption font
pub struct Annotator {
    font: Option<FontArc>,
}

impl Default for Annotator {
    /// Caption with the bundled font
    fn default() -> Self {
        match FontArc::try_from_slice(BUNDLED_FONT) {
            Ok(font) => Self { font: Some(font) },
            Err(e) => {
                warn!("Bundled caption font unusable: {e}; drawing boxes only");
                Self::without_captions()
            }
        }
    }
}

impl Annotator {
    /// Load the caption font, falling back to the bundled font on failure
    #[must_use]
    pub fn new(font_path: Option<&Path>) -> Self {
        let Some(path) = font_path else {
            return Self::default();
        };

        let font = std::fs::read(path)
            .map_err(|e| e.to_string())
            .and_then(|bytes| FontArc::try_from_vec(bytes).map_err(|e| e.to_string()));

        match font {
            Ok(font) => {
                debug!("Loaded caption font {}", path.display());
                Self { font: Some(font) }
            }
            Err(e) => {
                warn!("Cannot load caption font {}: {e}; using the bundled font", path.display());
                Self::default()
            }
        }
    }

    /// Draw boxes only
    #[must_use]
    pub fn without_captions() -> Self {
        Self { font: None }
    }

    #[must_use]
    pub fn has_font(&self) -> bool {
        self.font.is_some()
    }

    /// Draw hazards in red and faces in green
    pub fn annotate(&self, image: &mut RgbImage, hazards: &[&Detection], faces: &[Face]) {
        let (width, height) = image.dimensions();
        for detection in hazards {
            let rect = detection.bbox.to_pixels(width, height);
            self.draw_box(image, rect, HAZARD_COLOR, HAZARD_CAPTION);
        }
        for face in faces {
            let rect = face.bbox.to_pixels(width, height);
            self.draw_box(image, rect, FACE_COLOR, FACE_CAPTION);
        }
    }

    /// Draw one `(x, y, width, height)` pixel box with its caption above it
    #[allow(clippy::cast_possible_wrap, clippy::cast_possible_truncation)]
    pub fn draw_box(
        &self,
        image: &mut RgbImage,
        (x, y, w, h): (u32, u32, u32, u32),
        color: Rgb<u8>,
        caption: &str,
    ) {
        let (width, height) = image.dimensions();
        if x >= width || y >= height {
            return;
        }
        let w = w.min(width - x);
        let h = h.min(height - y);

        for t in 0..LINE_THICKNESS {
            let inner_w = w.saturating_sub(2 * t);
            let inner_h = h.saturating_sub(2 * t);
            if inner_w > 0 && inner_h > 0 {
                let rect = Rect::at((x + t) as i32, (y + t) as i32).of_size(inner_w, inner_h);
                draw_hollow_rect_mut(image, rect, color);
            }
        }

        if let Some(font) = &self.font {
            let text_y = (y as i32 - CAPTION_OFFSET - CAPTION_SCALE as i32).max(0);
            draw_text_mut(
                image,
                color,
                x as i32,
                text_y,
                PxScale::from(CAPTION_SCALE),
                font,
                caption,
            );
        }
    }
}

/// Encode a frame as JPEG
pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100)).encode_image(image)?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use drivecheck_face_detection::BoundingBox as FaceBox;
    use drivecheck_object_detection::BoundingBox;

    fn black(width: u32, height: u32) -> RgbImage {
        RgbImage::new(width, height)
    }

    #[test]
    fn test_box_outline_is_two_pixels() {
        let annotator = Annotator::without_captions();
        let mut img = black(100, 100);
        annotator.draw_box(&mut img, (10, 20, 30, 40), HAZARD_COLOR, HAZARD_CAPTION);

        assert_eq!(*img.get_pixel(10, 20), HAZARD_COLOR);
        assert_eq!(*img.get_pixel(11, 21), HAZARD_COLOR);
        assert_eq!(*img.get_pixel(39, 59), HAZARD_COLOR);
        // Third ring and interior untouched
        assert_eq!(*img.get_pixel(12, 30), Rgb([0, 0, 0]));
        assert_eq!(*img.get_pixel(25, 40), Rgb([0, 0, 0]));
    }

    #[test]
    fn test_box_is_clipped_to_image() {
        let annotator = Annotator::without_captions();
        let mut img = black(50, 50);
        annotator.draw_box(&mut img, (40, 40, 30, 30), FACE_COLOR, FACE_CAPTION);
        assert_eq!(*img.get_pixel(49, 49), FACE_COLOR);

        // Entirely outside: nothing drawn, no panic
        annotator.draw_box(&mut img, (60, 10, 5, 5), FACE_COLOR, FACE_CAPTION);
    }

    #[test]
    fn test_annotate_uses_detection_colors() {
        let annotator = Annotator::without_captions();
        let mut img = black(200, 100);
        let cone = Detection {
            class_id: 0,
            class_name: "cone".to_string(),
            confidence: 0.9,
            bbox: BoundingBox::new(0.1, 0.2, 0.2, 0.3),
        };
        let face = Face {
            confidence: 0.95,
            bbox: FaceBox {
                x1: 0.5,
                y1: 0.1,
                x2: 0.7,
                y2: 0.5,
            },
        };

        annotator.annotate(&mut img, &[&cone], &[face]);

        assert_eq!(*img.get_pixel(20, 20), HAZARD_COLOR);
        assert_eq!(*img.get_pixel(100, 10), FACE_COLOR);
    }

    #[test]
    fn test_missing_font_falls_back_to_bundled() {
        assert!(Annotator::new(None).has_font());
        let annotator = Annotator::new(Some(Path::new("/nonexistent/font.ttf")));
        assert!(annotator.has_font());

        let dir = tempfile::tempdir().unwrap();
        let bogus = dir.path().join("bogus.ttf");
        std::fs::write(&bogus, b"not a font").unwrap();
        assert!(Annotator::new(Some(&bogus)).has_font());
        assert!(!Annotator::without_captions().has_font());
    }

    #[test]
    fn test_default_annotator_writes_caption_above_box() {
        let mut img = black(120, 100);
        Annotator::default().draw_box(&mut img, (10, 60, 40, 30), HAZARD_COLOR, HAZARD_CAPTION);

        // Caption band: 10 px gap above the box, one caption line tall
        let caption_pixels = (10..70)
            .flat_map(|x| (30..50).map(move |y| (x, y)))
            .filter(|&(x, y)| img.get_pixel(x, y)[0] > 0)
            .count();
        assert!(caption_pixels > 0);

        let mut bare = black(120, 100);
        Annotator::without_captions().draw_box(&mut bare, (10, 60, 40, 30), HAZARD_COLOR, HAZARD_CAPTION);
        assert!((10..70).all(|x| (30..50).all(|y| bare.get_pixel(x, y)[0] == 0)));
    }

    #[test]
    fn test_encode_jpeg() {
        let img = RgbImage::from_pixel(32, 24, Rgb([200, 100, 50]));
        let jpeg = encode_jpeg(&img, 90).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);

        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!(decoded.width(), 32);
        assert_eq!(decoded.height(), 24);
    }
}
