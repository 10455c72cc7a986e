//! Compact lung-mask encoding for TOML metadata.
//!
//! A binary mask is stored as alternating run lengths (starting with a
//! background run), gzip-compressed and base64-encoded, plus a small ASCII
//! preview so the mask can be eyeballed in the metadata file.

use crate::error::{PipelineError, Result};
use crate::segmentation_mask::{mask_to_bits, FOREGROUND};
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use image::GrayImage;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::io::{Read, Write};

pub const MASK_FORMAT: &str = "rle-binary-v1 | gzip | base64";

/// Longest preview edge, in characters
const PREVIEW_MAX_DIM: u32 = 40;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct MaskEntry {
    pub width: u32,
    pub height: u32,
    pub format: String,
    /// Fraction of foreground pixels in this mask
    pub coverage: f64,
    /// base64(gzip(comma-separated runs)), first run is background
    pub data: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview: Option<Vec<String>>,
}

/// Preview size keeping the aspect ratio, longest edge fixed
fn preview_dimensions(width: u32, height: u32) -> (u32, u32) {
    if width >= height {
        let h = (PREVIEW_MAX_DIM as f64 * height as f64 / width as f64).round() as u32;
        (PREVIEW_MAX_DIM, h.max(1))
    } else {
        let w = (PREVIEW_MAX_DIM as f64 * width as f64 / height as f64).round() as u32;
        (w.max(1), PREVIEW_MAX_DIM)
    }
}

/// Encode a 0/255 mask. Fails if the mask holds any other value.
pub fn encode_mask(mask: &GrayImage, with_preview: bool) -> Result<MaskEntry> {
    let (width, height) = mask.dimensions();
    if width == 0 || height == 0 {
        return Err(PipelineError::ShapeMismatch(
            "cannot encode an empty mask".to_string(),
        ));
    }
    if let Some(bad) = mask.pixels().find(|p| p[0] != 0 && p[0] != FOREGROUND) {
        return Err(PipelineError::InvalidParameter(format!(
            "mask holds non-binary value {}",
            bad[0]
        )));
    }

    let bits = mask_to_bits(mask);
    let flat: Vec<u8> = bits.iter().copied().collect();

    let mut runs: Vec<usize> = Vec::new();
    let mut current = 0u8;
    let mut run_len = 0usize;
    for &bit in &flat {
        if bit == current {
            run_len += 1;
        } else {
            runs.push(run_len);
            current ^= 1;
            run_len = 1;
        }
    }
    runs.push(run_len);

    let mut csv = String::with_capacity(runs.len() * 4);
    for (i, run) in runs.iter().enumerate() {
        if i > 0 {
            csv.push(',');
        }
        // Writing into a String cannot fail
        let _ = write!(csv, "{run}");
    }

    let compress_err =
        |e: std::io::Error| PipelineError::Preprocess(format!("mask compression failed: {e}"));
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(csv.as_bytes()).map_err(compress_err)?;
    let compressed = encoder.finish().map_err(compress_err)?;

    let foreground = flat.iter().filter(|&&b| b == 1).count();
    let preview = with_preview.then(|| {
        let (pw, ph) = preview_dimensions(width, height);
        ascii_preview(&flat, width, height, pw, ph)
    });

    Ok(MaskEntry {
        width,
        height,
        format: MASK_FORMAT.to_string(),
        coverage: foreground as f64 / flat.len() as f64,
        data: B64.encode(compressed),
        preview,
    })
}

/// Inverse of [`encode_mask`]
pub fn decode_mask(entry: &MaskEntry) -> Result<GrayImage> {
    let invalid = |msg: String| PipelineError::InvalidParameter(format!("bad mask entry: {msg}"));

    if entry.format != MASK_FORMAT {
        return Err(invalid(format!("unknown format '{}'", entry.format)));
    }
    let compressed = B64.decode(&entry.data).map_err(|e| invalid(e.to_string()))?;
    let mut csv = String::new();
    GzDecoder::new(compressed.as_slice())
        .read_to_string(&mut csv)
        .map_err(|e| invalid(e.to_string()))?;

    let total = entry.width as usize * entry.height as usize;
    let mut pixels = Vec::with_capacity(total);
    let mut value = 0u8;
    for field in csv.split(',') {
        let run: usize = field
            .trim()
            .parse()
            .map_err(|_| invalid(format!("run '{field}' is not a number")))?;
        pixels.extend(std::iter::repeat(value).take(run));
        value = if value == 0 { FOREGROUND } else { 0 };
    }

    if pixels.len() != total {
        return Err(PipelineError::ShapeMismatch(format!(
            "mask runs cover {} pixels, expected {total}",
            pixels.len()
        )));
    }
    GrayImage::from_raw(entry.width, entry.height, pixels)
        .ok_or_else(|| invalid("dimensions do not match data".to_string()))
}

/// Block-average downsample; a cell is '#' when at least half is foreground
fn ascii_preview(bits: &[u8], w: u32, h: u32, pw: u32, ph: u32) -> Vec<String> {
    let (w, h, pw, ph) = (w as usize, h as usize, pw as usize, ph as usize);
    let sx = w as f64 / pw as f64;
    let sy = h as f64 / ph as f64;

    (0..ph)
        .map(|oy| {
            let y0 = (oy as f64 * sy).floor() as usize;
            let y1 = (((oy as f64 + 1.0) * sy).ceil() as usize).min(h).max(y0 + 1);
            (0..pw)
                .map(|ox| {
                    let x0 = (ox as f64 * sx).floor() as usize;
                    let x1 = (((ox as f64 + 1.0) * sx).ceil() as usize).min(w).max(x0 + 1);
                    let sum: usize = (y0..y1)
                        .map(|y| bits[y * w + x0..y * w + x1].iter().map(|&b| b as usize).sum::<usize>())
                        .sum();
                    let area = (y1 - y0) * (x1 - x0);
                    if sum * 2 >= area {
                        '#'
                    } else {
                        '.'
                    }
                })
                .collect()
        })
        .collect()
}
