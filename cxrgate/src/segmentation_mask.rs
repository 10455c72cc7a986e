//! Binary lung masks from segmentation network output.
//!
//! The mask is built at the network's native resolution, coverage is measured
//! there, and only then is the mask carried to the capture resolution with a
//! nearest-neighbor resize. Dilation exists solely to pad the boundary for the
//! sharpness analysis and never feeds back into coverage.

use crate::error::{PipelineError, Result};
use image::GrayImage;
use imageproc::distance_transform::Norm;
use ndarray::{ArrayViewD, Axis, Ix2};

pub const FOREGROUND: u8 = 255;
pub const BACKGROUND: u8 = 0;

/// Foreground probabilities at inference resolution, row-major, each in [0, 1]
#[derive(Debug, Clone, PartialEq)]
pub struct ProbabilityMap {
    pub data: Vec<f32>,
    pub width: u32,
    pub height: u32,
}

/// Thresholded mask together with its coverage at the same resolution
#[derive(Debug, Clone)]
pub struct SegmentationMask {
    pub mask: GrayImage,
    pub coverage: f64,
}

/// Reduce a raw segmentation output to a single foreground probability map.
///
/// Accepted layouts are `[1, C, H, W]`, `[C, H, W]` with `C` in {1, 2}, and a
/// bare `[H, W]`. For two channels the second one is foreground. The output
/// kind is decided for the whole map: if every value of both planes lies in
/// [0, 1] the foreground plane is taken as probabilities, otherwise the pair
/// is treated as logits and run through a two-way softmax. Reduced-precision
/// softmax outputs that do not sum exactly to 1 are still probabilities.
pub fn extract_probability(output: ArrayViewD<'_, f32>) -> Result<ProbabilityMap> {
    let shape = output.shape().to_vec();
    let chw = match shape.len() {
        4 if shape[0] == 1 => output.index_axis_move(Axis(0), 0),
        3 => output,
        2 => output.insert_axis(Axis(0)),
        _ => {
            return Err(PipelineError::ShapeMismatch(format!(
                "unsupported segmentation output shape {shape:?}"
            )))
        }
    };

    let (channels, height, width) = (chw.shape()[0], chw.shape()[1], chw.shape()[2]);
    if height == 0 || width == 0 {
        return Err(PipelineError::ShapeMismatch(format!(
            "segmentation output has empty spatial shape {shape:?}"
        )));
    }
    if chw.iter().any(|v| !v.is_finite()) {
        return Err(PipelineError::NonFinite {
            stage: "segmentation",
        });
    }

    let data: Vec<f32> = match channels {
        1 => chw
            .index_axis(Axis(0), 0)
            .iter()
            .map(|p| p.clamp(0.0, 1.0))
            .collect(),
        2 => {
            let background = chw.index_axis(Axis(0), 0);
            let foreground = chw.index_axis(Axis(0), 1);
            let is_probability = chw.iter().all(|v| (0.0..=1.0).contains(v));
            log::debug!(
                "Two-channel segmentation output treated as {}",
                if is_probability { "probabilities" } else { "logits" }
            );
            if is_probability {
                foreground.iter().map(|p| p.clamp(0.0, 1.0)).collect()
            } else {
                background
                    .iter()
                    .zip(foreground.iter())
                    .map(|(&b, &f)| (1.0 / (1.0 + (b - f).exp())).clamp(0.0, 1.0))
                    .collect()
            }
        }
        c => {
            return Err(PipelineError::ShapeMismatch(format!(
                "segmentation output must have 1 or 2 channels, got {c}"
            )))
        }
    };

    Ok(ProbabilityMap {
        data,
        width: width as u32,
        height: height as u32,
    })
}

/// Threshold a probability map into a 0/255 mask and measure its coverage.
pub fn build(prob_map: &[f32], width: u32, height: u32, cutoff: f32) -> Result<SegmentationMask> {
    if !(0.0..=1.0).contains(&cutoff) {
        return Err(PipelineError::InvalidParameter(format!(
            "cutoff must be within [0, 1], got {cutoff}"
        )));
    }
    let expected = width as usize * height as usize;
    if prob_map.len() != expected || expected == 0 {
        return Err(PipelineError::ShapeMismatch(format!(
            "probability map has {} values, expected {width}x{height} = {expected}",
            prob_map.len()
        )));
    }

    let pixels: Vec<u8> = prob_map
        .iter()
        .map(|&p| if p >= cutoff { FOREGROUND } else { BACKGROUND })
        .collect();
    let foreground = pixels.iter().filter(|&&v| v == FOREGROUND).count();
    let coverage = foreground as f64 / expected as f64;

    let mask = GrayImage::from_raw(width, height, pixels).ok_or_else(|| {
        PipelineError::ShapeMismatch(format!("cannot build {width}x{height} mask"))
    })?;

    log::debug!(
        "Mask {}x{} at cutoff {:.3}: {} foreground pixels, coverage {:.4}",
        width,
        height,
        cutoff,
        foreground,
        coverage
    );

    Ok(SegmentationMask { mask, coverage })
}

/// Convenience wrapper for [`build`] on an extracted map
pub fn build_from_map(map: &ProbabilityMap, cutoff: f32) -> Result<SegmentationMask> {
    build(&map.data, map.width, map.height, cutoff)
}

/// Fraction of foreground pixels in a binary mask
pub fn coverage_of(mask: &GrayImage) -> f64 {
    let total = mask.width() as usize * mask.height() as usize;
    if total == 0 {
        return 0.0;
    }
    let foreground = mask.pixels().filter(|p| p[0] == FOREGROUND).count();
    foreground as f64 / total as f64
}

/// Nearest-neighbor resize; every output pixel is copied from exactly one
/// source pixel, so a binary mask stays binary.
pub fn resize_nearest(mask: &GrayImage, width: u32, height: u32) -> GrayImage {
    let (src_w, src_h) = mask.dimensions();
    if (src_w, src_h) == (width, height) {
        return mask.clone();
    }
    if src_w == 0 || src_h == 0 {
        return GrayImage::new(width, height);
    }

    let x_map: Vec<u32> = (0..width)
        .map(|x| ((x as u64 * src_w as u64) / width as u64).min(src_w as u64 - 1) as u32)
        .collect();
    let y_map: Vec<u32> = (0..height)
        .map(|y| ((y as u64 * src_h as u64) / height as u64).min(src_h as u64 - 1) as u32)
        .collect();

    GrayImage::from_fn(width, height, |x, y| {
        *mask.get_pixel(x_map[x as usize], y_map[y as usize])
    })
}

/// Dilate with an all-ones square of side `2 * radius + 1`
pub fn dilate(mask: &GrayImage, radius: u8) -> GrayImage {
    if radius == 0 {
        return mask.clone();
    }
    // Chebyshev distance <= radius is exactly the square structuring element
    imageproc::morphology::dilate(mask, Norm::LInf, radius)
}

/// View a mask as a 2-D array of 0/1 values, row-major
pub fn mask_to_bits(mask: &GrayImage) -> ndarray::Array<u8, Ix2> {
    ndarray::Array2::from_shape_fn(
        (mask.height() as usize, mask.width() as usize),
        |(y, x)| u8::from(mask.get_pixel(x as u32, y as u32)[0] == FOREGROUND),
    )
}
