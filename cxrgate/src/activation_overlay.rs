//! Rendering of activation maps over the original capture

use crate::error::{PipelineError, Result};
use image::{DynamicImage, Rgb, RgbImage};
use ndarray::Array2;

/// Colormap stops, low to high: blue, cyan, green, yellow, red
const JET_STOPS: [(f32, [f32; 3]); 5] = [
    (0.0, [0.0, 0.0, 255.0]),
    (0.25, [0.0, 255.0, 255.0]),
    (0.5, [0.0, 255.0, 0.0]),
    (0.75, [255.0, 255.0, 0.0]),
    (1.0, [255.0, 0.0, 0.0]),
];

/// Bilinear interpolation at fractional grid coordinates (u = column,
/// v = row), clamped to the grid.
pub fn bilinear_sample(data: &Array2<f32>, u: f32, v: f32) -> f32 {
    let (rows, cols) = data.dim();

    let u = u.clamp(0.0, (cols - 1) as f32);
    let v = v.clamp(0.0, (rows - 1) as f32);

    let u0 = u.floor() as usize;
    let v0 = v.floor() as usize;
    let u1 = (u0 + 1).min(cols - 1);
    let v1 = (v0 + 1).min(rows - 1);

    let fu = u - u0 as f32;
    let fv = v - v0 as f32;

    let val00 = data[[v0, u0]];
    let val10 = data[[v0, u1]];
    let val01 = data[[v1, u0]];
    let val11 = data[[v1, u1]];

    let val0 = val00 * (1.0 - fu) + val10 * fu;
    let val1 = val01 * (1.0 - fu) + val11 * fu;

    val0 * (1.0 - fv) + val1 * fv
}

/// Upsample a small grid to `width x height` with half-pixel centers
pub fn upsample_bilinear(data: &Array2<f32>, width: u32, height: u32) -> Result<Array2<f32>> {
    let (rows, cols) = data.dim();
    if rows == 0 || cols == 0 {
        return Err(PipelineError::ShapeMismatch(
            "cannot upsample an empty activation map".to_string(),
        ));
    }

    let sx = cols as f32 / width as f32;
    let sy = rows as f32 / height as f32;

    Ok(Array2::from_shape_fn(
        (height as usize, width as usize),
        |(y, x)| {
            let u = (x as f32 + 0.5) * sx - 0.5;
            let v = (y as f32 + 0.5) * sy - 0.5;
            bilinear_sample(data, u, v)
        },
    ))
}

/// Map a value in [0, 1] to the blue-cyan-green-yellow-red ramp
pub fn jet_color(value: f32) -> Rgb<u8> {
    let t = if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    };

    for pair in JET_STOPS.windows(2) {
        let (t0, c0) = pair[0];
        let (t1, c1) = pair[1];
        if t <= t1 {
            let f = (t - t0) / (t1 - t0);
            let channel = |i: usize| (c0[i] + (c1[i] - c0[i]) * f).round() as u8;
            return Rgb([channel(0), channel(1), channel(2)]);
        }
    }
    Rgb([255, 0, 0])
}

/// `out = (1 - alpha) * base + alpha * color`, rounded
pub fn blend(base: Rgb<u8>, color: Rgb<u8>, alpha: f32) -> Rgb<u8> {
    let alpha = alpha.clamp(0.0, 1.0);
    let mix = |i: usize| {
        ((1.0 - alpha) * base[i] as f32 + alpha * color[i] as f32)
            .round()
            .clamp(0.0, 255.0) as u8
    };
    Rgb([mix(0), mix(1), mix(2)])
}

/// Colorize `activation` at the original's resolution and blend it over
/// the original.
pub fn render_overlay(
    original: &DynamicImage,
    activation: &Array2<f32>,
    alpha: f32,
) -> Result<RgbImage> {
    let (width, height) = (original.width(), original.height());
    if width == 0 || height == 0 {
        return Err(PipelineError::Preprocess(format!(
            "image has zero dimension ({width}x{height})"
        )));
    }

    let upsampled = upsample_bilinear(activation, width, height)?;
    let base = original.to_rgb8();

    let overlay = RgbImage::from_fn(width, height, |x, y| {
        let value = upsampled[[y as usize, x as usize]];
        blend(*base.get_pixel(x, y), jet_color(value), alpha)
    });

    log::trace!(
        "Rendered {}x{} overlay from {:?} activation map",
        width,
        height,
        activation.dim()
    );

    Ok(overlay)
}
