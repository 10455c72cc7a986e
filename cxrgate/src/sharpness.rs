//! Focus metrics restricted to the lung mask.
//!
//! Both metrics run on the capture-resolution grayscale image (0..255 scale)
//! and only pixels where the mask is 255 contribute:
//! - Tenengrad: mean of `Gx^2 + Gy^2` from a Sobel derivative (kernel 1, 3 or 5)
//! - Laplacian variance: population variance of a 3x3 Laplacian response
//!
//! Borders are reflected without repeating the edge pixel (`dcb|abcd|cba`),
//! so responses at the frame edge match OpenCV's default border mode.

use crate::error::{PipelineError, Result};
use crate::segmentation_mask::{resize_nearest, FOREGROUND};
use image::imageops::FilterType;
use image::{DynamicImage, GrayImage, ImageBuffer, Luma};
use imageproc::filter::{filter3x3, separable_filter};
use serde::{Deserialize, Serialize};

type GrayF32 = ImageBuffer<Luma<f32>, Vec<f32>>;

const K_LAPLACIAN: [f32; 9] = [0.0, 1.0, 0.0, 1.0, -4.0, 1.0, 0.0, 1.0, 0.0];

/// Margin added before filtering; the widest kernel has radius 2
const BORDER: u32 = 2;

// Separable Sobel factors: (derivative, smoothing) per aperture size
const SOBEL_1: ([f32; 3], [f32; 1]) = ([-1.0, 0.0, 1.0], [1.0]);
const SOBEL_3: ([f32; 3], [f32; 3]) = ([-1.0, 0.0, 1.0], [1.0, 2.0, 1.0]);
const SOBEL_5: ([f32; 5], [f32; 5]) = ([-1.0, -2.0, 0.0, 2.0, 1.0], [1.0, 4.0, 6.0, 4.0, 1.0]);

/// Options for [`analyze`]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SharpnessOptions {
    /// Sobel aperture for the gradient metric: 1, 3 or 5
    pub kernel_size: u32,
    /// Downscale so the longest edge is at most this many pixels (0 disables)
    pub max_long_edge: u32,
}

impl Default for SharpnessOptions {
    fn default() -> Self {
        Self {
            kernel_size: 3,
            max_long_edge: 0,
        }
    }
}

impl SharpnessOptions {
    pub fn validate(&self) -> Result<()> {
        if !matches!(self.kernel_size, 1 | 3 | 5) {
            return Err(PipelineError::InvalidParameter(format!(
                "sobel kernel size must be 1, 3 or 5, got {}",
                self.kernel_size
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SharpnessScores {
    pub gradient_energy: f64,
    pub laplacian_variance: f64,
}

/// Compute both focus metrics of `img` inside `mask`.
///
/// `mask` must have the same dimensions as `img`. An empty mask yields zero
/// for both scores.
pub fn analyze(
    img: &DynamicImage,
    mask: &GrayImage,
    options: &SharpnessOptions,
) -> Result<SharpnessScores> {
    options.validate()?;

    let (width, height) = (img.width(), img.height());
    if width == 0 || height == 0 {
        return Err(PipelineError::Preprocess(format!(
            "image has zero dimension ({width}x{height})"
        )));
    }
    if mask.dimensions() != (width, height) {
        return Err(PipelineError::ShapeMismatch(format!(
            "mask is {:?} but image is {width}x{height}",
            mask.dimensions()
        )));
    }

    let gray = to_gray_rec601(img);
    let (gray, mask) = downscale_to_long_edge(gray, mask, options.max_long_edge);

    if !mask.pixels().any(|p| p[0] == FOREGROUND) {
        log::debug!("Empty mask, sharpness scores are zero");
        return Ok(SharpnessScores {
            gradient_energy: 0.0,
            laplacian_variance: 0.0,
        });
    }

    let gray = to_f32(&gray);
    let gradient_energy = tenengrad_masked(&gray, &mask, options.kernel_size)?;
    let laplacian_variance = laplacian_variance_masked(&gray, &mask);

    log::debug!(
        "Sharpness at {}x{}: tenengrad={:.2}, laplacian_var={:.2}",
        gray.width(),
        gray.height(),
        gradient_energy,
        laplacian_variance
    );

    Ok(SharpnessScores {
        gradient_energy,
        laplacian_variance,
    })
}

/// Mean squared Sobel gradient magnitude over masked pixels
pub fn tenengrad_masked(gray: &GrayF32, mask: &GrayImage, kernel_size: u32) -> Result<f64> {
    let (derivative, smoothing): (&[f32], &[f32]) = match kernel_size {
        1 => (&SOBEL_1.0, &SOBEL_1.1),
        3 => (&SOBEL_3.0, &SOBEL_3.1),
        5 => (&SOBEL_5.0, &SOBEL_5.1),
        other => {
            return Err(PipelineError::InvalidParameter(format!(
                "sobel kernel size must be 1, 3 or 5, got {other}"
            )))
        }
    };

    let padded = pad_reflect101(gray);
    let gx = separable_filter(&padded, derivative, smoothing);
    let gy = separable_filter(&padded, smoothing, derivative);

    let mut sum = 0f64;
    let mut count = 0usize;
    for ((x, y), m) in masked_indices(mask) {
        if m {
            let dx = gx.get_pixel(x + BORDER, y + BORDER)[0] as f64;
            let dy = gy.get_pixel(x + BORDER, y + BORDER)[0] as f64;
            sum += dx * dx + dy * dy;
            count += 1;
        }
    }

    Ok(if count == 0 { 0.0 } else { sum / count as f64 })
}

/// Population variance of the 3x3 Laplacian response over masked pixels
pub fn laplacian_variance_masked(gray: &GrayF32, mask: &GrayImage) -> f64 {
    let response: GrayF32 = filter3x3(&pad_reflect101(gray), &K_LAPLACIAN);

    let values: Vec<f64> = masked_indices(mask)
        .filter(|(_, m)| *m)
        .map(|((x, y), _)| response.get_pixel(x + BORDER, y + BORDER)[0] as f64)
        .collect();
    if values.is_empty() {
        return 0.0;
    }

    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n
}

fn masked_indices(mask: &GrayImage) -> impl Iterator<Item = ((u32, u32), bool)> + '_ {
    mask.enumerate_pixels()
        .map(|(x, y, p)| ((x, y), p[0] == FOREGROUND))
}

/// Rec.601 luma, rounded to 8 bits
fn to_gray_rec601(img: &DynamicImage) -> GrayImage {
    if let DynamicImage::ImageLuma8(gray) = img {
        return gray.clone();
    }
    let rgb = img.to_rgb8();
    GrayImage::from_fn(rgb.width(), rgb.height(), |x, y| {
        let p = rgb.get_pixel(x, y);
        let luma = 0.299 * p[0] as f32 + 0.587 * p[1] as f32 + 0.114 * p[2] as f32;
        Luma([luma.round().clamp(0.0, 255.0) as u8])
    })
}

fn to_f32(gray: &GrayImage) -> GrayF32 {
    ImageBuffer::from_fn(gray.width(), gray.height(), |x, y| {
        Luma([gray.get_pixel(x, y)[0] as f32])
    })
}

/// Shrink image and mask together so the longest edge fits `max_long_edge`.
/// The image is smoothed; the mask is resized nearest-neighbor to stay binary.
fn downscale_to_long_edge(
    gray: GrayImage,
    mask: &GrayImage,
    max_long_edge: u32,
) -> (GrayImage, GrayImage) {
    let (w, h) = gray.dimensions();
    let long_edge = w.max(h);
    if max_long_edge == 0 || long_edge <= max_long_edge {
        return (gray, mask.clone());
    }

    let scale = max_long_edge as f64 / long_edge as f64;
    let new_w = ((w as f64 * scale).round() as u32).max(1);
    let new_h = ((h as f64 * scale).round() as u32).max(1);
    log::debug!("Downscaling {w}x{h} to {new_w}x{new_h} for sharpness analysis");

    let small = image::imageops::resize(&gray, new_w, new_h, FilterType::Triangle);
    let small_mask = resize_nearest(mask, new_w, new_h);
    (small, small_mask)
}

/// Copy of `gray` with a `BORDER`-wide reflect-101 margin on every side
fn pad_reflect101(gray: &GrayF32) -> GrayF32 {
    let (w, h) = gray.dimensions();
    let offset = BORDER as i64;
    ImageBuffer::from_fn(w + 2 * BORDER, h + 2 * BORDER, |x, y| {
        let sx = reflect101(x as i64 - offset, w);
        let sy = reflect101(y as i64 - offset, h);
        *gray.get_pixel(sx, sy)
    })
}

fn reflect101(mut i: i64, len: u32) -> u32 {
    let last = len as i64 - 1;
    if last <= 0 {
        return 0;
    }
    while i < 0 || i > last {
        i = if i < 0 { -i } else { 2 * last - i };
    }
    i as u32
}
