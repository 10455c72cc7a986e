//! Inference boundary.
//!
//! Both networks are opaque functions from an input tensor to output
//! tensors. The ONNX-backed adapters live in `onnx_session`; tests supply
//! closures.

use ndarray::{Array4, ArrayD};

/// Raw outputs of the multi-label classifier
#[derive(Debug, Clone, Default)]
pub struct ClassifierOutput {
    /// Penultimate feature map, `[1, C, H, W]`
    pub features: Option<ArrayD<f32>>,
    /// Per-label scores, length L after flattening
    pub logits: Option<ArrayD<f32>>,
}

impl ClassifierOutput {
    pub fn new(features: ArrayD<f32>, logits: ArrayD<f32>) -> Self {
        Self {
            features: Some(features),
            logits: Some(logits),
        }
    }
}

pub trait SegmentationModel: Send + Sync {
    /// `[1, 3, 512, 512]` in, `[1, 1, H, W]` or `[1, 2, H, W]` out
    fn infer_segmentation(&self, input: &Array4<f32>) -> anyhow::Result<ArrayD<f32>>;
}

pub trait ClassifierModel: Send + Sync {
    /// `[1, 3, 224, 224]` in, features and scores out
    fn infer_classifier(&self, input: &Array4<f32>) -> anyhow::Result<ClassifierOutput>;
}

impl<F> SegmentationModel for F
where
    F: Fn(&Array4<f32>) -> anyhow::Result<ArrayD<f32>> + Send + Sync,
{
    fn infer_segmentation(&self, input: &Array4<f32>) -> anyhow::Result<ArrayD<f32>> {
        self(input)
    }
}

impl<F> ClassifierModel for F
where
    F: Fn(&Array4<f32>) -> anyhow::Result<ClassifierOutput> + Send + Sync,
{
    fn infer_classifier(&self, input: &Array4<f32>) -> anyhow::Result<ClassifierOutput> {
        self(input)
    }
}
