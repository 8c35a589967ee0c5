//! UltraFace prior (anchor) boxes
//!
//! Models exported without their post-processing head emit box regressions
//! relative to a fixed grid of priors. The grid depends only on the input
//! size, so it is generated once per detector.

/// Feature map strides of the four detection heads
const STRIDES: [f32; 4] = [8.0, 16.0, 32.0, 64.0];

/// Prior box sizes in input pixels, per detection head
const MIN_BOXES: [&[f32]; 4] = [
    &[10.0, 16.0, 24.0],
    &[32.0, 48.0],
    &[64.0, 96.0],
    &[128.0, 192.0, 256.0],
];

/// Regression variances used when the model was trained
pub const CENTER_VARIANCE: f32 = 0.1;
pub const SIZE_VARIANCE: f32 = 0.2;

/// Prior box in center form, normalized to [0, 1]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prior {
    pub cx: f32,
    pub cy: f32,
    pub w: f32,
    pub h: f32,
}

/// Generate the priors for a `width` x `height` model input
///
/// Feature maps are `ceil(size / stride)` cells per axis; priors are emitted
/// row by row, cell by cell, one per min box size. 320x240 yields 4420
/// priors and 640x480 yields 17640.
#[must_use]
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn generate_priors(width: u32, height: u32) -> Vec<Prior> {
    let (width, height) = (width as f32, height as f32);
    let mut priors = Vec::new();

    for (stride, min_boxes) in STRIDES.iter().zip(MIN_BOXES) {
        let cols = (width / stride).ceil() as usize;
        let rows = (height / stride).ceil() as usize;

        for row in 0..rows {
            let cy = ((row as f32 + 0.5) / rows as f32).clamp(0.0, 1.0);
            for col in 0..cols {
                let cx = ((col as f32 + 0.5) / cols as f32).clamp(0.0, 1.0);
                priors.extend(min_boxes.iter().map(|&size| Prior {
                    cx,
                    cy,
                    w: (size / width).clamp(0.0, 1.0),
                    h: (size / height).clamp(0.0, 1.0),
                }));
            }
        }
    }

    priors
}

/// Decode `[dx, dy, dw, dh]` regressions against `priors` into corner boxes
///
/// Returns `None` when `locations` does not hold exactly four values per prior.
#[must_use]
pub fn decode_boxes(
    locations: &[f32],
    priors: &[Prior],
    center_variance: f32,
    size_variance: f32,
) -> Option<Vec<[f32; 4]>> {
    if locations.len() != priors.len() * 4 {
        return None;
    }

    let boxes = locations
        .chunks_exact(4)
        .zip(priors)
        .map(|(loc, prior)| {
            let cx = prior.cx + loc[0] * center_variance * prior.w;
            let cy = prior.cy + loc[1] * center_variance * prior.h;
            let w = prior.w * (loc[2] * size_variance).exp();
            let h = prior.h * (loc[3] * size_variance).exp();
            [cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0]
        })
        .collect();

    Some(boxes)
}
