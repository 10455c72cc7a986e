//! Error and rejection types shared by every pipeline stage.
//!
//! Two families live here:
//! - [`PipelineError`]: something went wrong while computing (bad input, bad
//!   configuration, missing model outputs). A stage that returns one of these
//!   never hands back partial results.
//! - [`RejectionReason`]: the pipeline ran fine but the capture is not usable.
//!   These are terminal, user-facing outcomes and drive the attempt counter.

use serde::Serialize;
use std::fmt;

/// Errors raised by the numeric pipeline.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The source image is empty, undecodable or could not be resized.
    #[error("preprocessing failed: {0}")]
    Preprocess(String),

    /// An inference output or mask does not have the expected size.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// A threshold, cutoff or option is outside its allowed range.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// A numeric output contained NaN or infinity where a value was required.
    #[error("non-finite value in {stage} output")]
    NonFinite { stage: &'static str },

    /// The classifier did not return one of the outputs the engine needs.
    #[error("inference output missing: {0}")]
    InferenceOutputMissing(&'static str),

    /// The classifier call itself failed.
    #[error("classifier inference failed: {0}")]
    Inference(String),

    /// The activation-map engine was built without a per-class weight table.
    #[error("per-class weight table was not supplied")]
    WeightsUnavailable,

    /// The caller cancelled the run between stages.
    #[error("pipeline run cancelled")]
    Cancelled,
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;

/// Why a capture was rejected by the quality gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    SegmentationFailed,
    MaskUnreliable,
    RegionBlurry,
}

impl RejectionReason {
    /// Short string the UI shows to the user.
    pub fn user_message(&self) -> &'static str {
        match self {
            RejectionReason::SegmentationFailed => "segmentation failed",
            RejectionReason::MaskUnreliable => "retake",
            RejectionReason::RegionBlurry => "blurry region",
        }
    }
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RejectionReason::SegmentationFailed => "SegmentationFailed",
            RejectionReason::MaskUnreliable => "MaskUnreliable",
            RejectionReason::RegionBlurry => "RegionBlurry",
        };
        f.write_str(name)
    }
}
