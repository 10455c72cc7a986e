//! Capture-quality gate and class activation maps for photographs of chest
//! radiographs.
//!
//! A capture passes the [`quality_gate`] (lung segmentation, coverage and
//! sharpness checks) before the classifier runs; [`pipeline`] ties both
//! stages together behind a cancellable, synchronous call.

pub mod activation_map;
pub mod activation_overlay;
pub mod class_weights;
pub mod color_utils;
pub mod config;
pub mod error;
pub mod image_input;
pub mod inference;
pub mod mask_encoding;
pub mod metadata;
#[cfg(feature = "onnx")]
pub mod onnx_session;
pub mod output_manager;
pub mod pipeline;
pub mod preprocessing;
pub mod processing;
pub mod quality_gate;
pub mod segmentation_mask;
pub mod sharpness;

pub use activation_map::{ActivationMapEngine, Diagnosis, LabelScore};
pub use class_weights::{LabelSet, WeightTable};
pub use config::{DiagnosisOptions, GateConfig, PipelineConfig, ScoreActivation};
pub use error::{PipelineError, RejectionReason};
pub use inference::{ClassifierModel, ClassifierOutput, SegmentationModel};
pub use pipeline::{CancellationToken, CaptureOutcome, CapturePipeline, CaptureSession};
pub use quality_gate::{AttemptCounter, QualityGate, QualityReport, Verdict};
