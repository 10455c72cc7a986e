use crate::error::{PipelineError, Result};
use image::imageops::FilterType;
use image::DynamicImage;
use ndarray::Array4;

/// ImageNet statistics used by the lung segmentation network
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Size and normalization constants for one network input
#[derive(Debug, Clone, PartialEq)]
pub struct TensorSpec {
    pub size: u32,
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

impl TensorSpec {
    /// 512x512, ImageNet normalization
    pub fn segmentation() -> Self {
        Self {
            size: 512,
            mean: IMAGENET_MEAN,
            std: IMAGENET_STD,
        }
    }

    /// 224x224, maps [0, 255] to [-1, 1]
    pub fn classifier() -> Self {
        Self {
            size: 224,
            mean: [0.5; 3],
            std: [0.5; 3],
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.size == 0 {
            return Err(PipelineError::InvalidParameter(
                "tensor size must be positive".to_string(),
            ));
        }
        if let Some(s) = self.std.iter().find(|s| !s.is_finite() || **s <= 0.0) {
            return Err(PipelineError::InvalidParameter(format!(
                "normalization std must be positive and finite, got {s}"
            )));
        }
        Ok(())
    }
}

/// Decode an encoded capture (JPEG, PNG, ...) into an image buffer
pub fn decode_image(bytes: &[u8]) -> Result<DynamicImage> {
    if bytes.is_empty() {
        return Err(PipelineError::Preprocess("empty image buffer".to_string()));
    }
    image::load_from_memory(bytes).map_err(|e| PipelineError::Preprocess(e.to_string()))
}

/// Resize and normalize an image into a `[1, 3, size, size]` tensor.
///
/// The resize is a square stretch with a triangle (bilinear) filter; the
/// aspect ratio is not preserved and no letterboxing is applied.
pub fn prepare(img: &DynamicImage, spec: &TensorSpec) -> Result<Array4<f32>> {
    spec.validate()?;

    let (width, height) = (img.width(), img.height());
    if width == 0 || height == 0 {
        return Err(PipelineError::Preprocess(format!(
            "image has zero dimension ({width}x{height})"
        )));
    }

    // Single-channel captures are replicated into R, G and B here
    let rgb_img = img.to_rgb8();

    let target = spec.size;
    let resized = image::imageops::resize(&rgb_img, target, target, FilterType::Triangle);
    if resized.dimensions() != (target, target) {
        return Err(PipelineError::Preprocess(format!(
            "resize produced {:?}, expected {target}x{target}",
            resized.dimensions()
        )));
    }

    let size = target as usize;
    let mut input = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in resized.enumerate_pixels() {
        for c in 0..3 {
            let value = pixel[c] as f32 / 255.0;
            input[[0, c, y as usize, x as usize]] = (value - spec.mean[c]) / spec.std[c];
        }
    }

    log::trace!(
        "Prepared tensor {:?} from {}x{} image",
        input.shape(),
        width,
        height
    );

    Ok(input)
}
