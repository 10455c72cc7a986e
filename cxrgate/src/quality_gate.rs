//! Capture quality gate.
//!
//! A capture walks `Idle -> Segmenting -> CoverageCheck -> SharpnessCheck`
//! and ends in `Accepted` or `Rejected`. Coverage out of bounds
//! short-circuits before any sharpness work is done.

use crate::config::GateConfig;
use crate::error::{PipelineError, RejectionReason, Result};
use crate::inference::SegmentationModel;
use crate::pipeline::CancellationToken;
use crate::preprocessing::{prepare, TensorSpec};
use crate::segmentation_mask::{self, SegmentationMask};
use crate::sharpness::{self, SharpnessScores};
use image::{DynamicImage, GrayImage};
use log::{debug, warn};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    Idle,
    Segmenting,
    CoverageCheck,
    SharpnessCheck,
    Accepted,
    Rejected(RejectionReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "verdict", content = "reason")]
pub enum Verdict {
    Accepted,
    Rejected(RejectionReason),
}

impl Verdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Verdict::Accepted)
    }

    pub fn rejection(&self) -> Option<RejectionReason> {
        match self {
            Verdict::Accepted => None,
            Verdict::Rejected(reason) => Some(*reason),
        }
    }

    pub fn state(&self) -> GateState {
        match self {
            Verdict::Accepted => GateState::Accepted,
            Verdict::Rejected(reason) => GateState::Rejected(*reason),
        }
    }
}

/// Everything the gate measured for one capture attempt
#[derive(Debug, Clone)]
pub struct QualityReport {
    /// Binary mask at the segmentation network's resolution
    pub mask: GrayImage,
    /// Same mask at the capture's resolution, undilated
    pub mask_original: GrayImage,
    /// Foreground fraction at the network's resolution
    pub coverage: f64,
    /// `None` when the coverage check short-circuited
    pub sharpness: Option<SharpnessScores>,
}

/// Result of running the gate on one capture
#[derive(Debug, Clone)]
pub enum GateAssessment {
    Accepted(QualityReport),
    Rejected {
        reason: RejectionReason,
        /// Missing only when segmentation itself failed
        report: Option<QualityReport>,
    },
}

impl GateAssessment {
    pub fn verdict(&self) -> Verdict {
        match self {
            GateAssessment::Accepted(_) => Verdict::Accepted,
            GateAssessment::Rejected { reason, .. } => Verdict::Rejected(*reason),
        }
    }

    pub fn report(&self) -> Option<&QualityReport> {
        match self {
            GateAssessment::Accepted(report) => Some(report),
            GateAssessment::Rejected { report, .. } => report.as_ref(),
        }
    }
}

/// Coverage bounds check. Returns the rejection if out of bounds.
pub fn evaluate_coverage(coverage: f64, config: &GateConfig) -> Option<RejectionReason> {
    if coverage < config.min_coverage || coverage > config.max_coverage {
        Some(RejectionReason::MaskUnreliable)
    } else {
        None
    }
}

/// The gate's decision table.
///
/// Coverage is checked first. Either sharpness metric reaching its
/// threshold is enough to accept.
pub fn decide(coverage: f64, scores: &SharpnessScores, config: &GateConfig) -> Verdict {
    if let Some(reason) = evaluate_coverage(coverage, config) {
        return Verdict::Rejected(reason);
    }
    if scores.gradient_energy >= config.gradient_threshold
        || scores.laplacian_variance >= config.laplacian_threshold
    {
        Verdict::Accepted
    } else {
        Verdict::Rejected(RejectionReason::RegionBlurry)
    }
}

/// Consecutive-rejection counter for one capture session
#[derive(Debug, Clone)]
pub struct AttemptCounter {
    consecutive: u32,
    threshold: u32,
}

impl AttemptCounter {
    pub fn new(threshold: u32) -> Self {
        Self {
            consecutive: 0,
            threshold: threshold.max(1),
        }
    }

    /// Count a rejection. Returns `true` only on the rejection that reaches
    /// the threshold; later rejections keep counting without signalling.
    pub fn record_rejection(&mut self) -> bool {
        self.consecutive = self.consecutive.saturating_add(1);
        self.consecutive == self.threshold
    }

    pub fn record_acceptance(&mut self) {
        self.consecutive = 0;
    }

    pub fn reset(&mut self) {
        self.consecutive = 0;
    }

    pub fn consecutive_rejections(&self) -> u32 {
        self.consecutive
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }
}

impl Default for AttemptCounter {
    fn default() -> Self {
        Self::new(GateConfig::default().guidance_after)
    }
}

/// Stateless gate: a function of the image, the segmentation output and
/// the configuration.
#[derive(Debug, Clone)]
pub struct QualityGate {
    config: GateConfig,
    spec: TensorSpec,
}

impl QualityGate {
    pub fn new(config: GateConfig) -> Result<Self> {
        config.validate()?;
        config.warn_if_outside_operating_range();
        Ok(Self {
            config,
            spec: TensorSpec::segmentation(),
        })
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    pub fn assess(
        &self,
        image: &DynamicImage,
        segmenter: &dyn SegmentationModel,
        cancel: &CancellationToken,
    ) -> Result<GateAssessment> {
        let mut state = GateState::Idle;
        cancel.check()?;

        transition(&mut state, GateState::Segmenting);
        let input = prepare(image, &self.spec)?;
        let seg = match self.segment(&input, segmenter)? {
            Some(seg) => seg,
            None => {
                let reason = RejectionReason::SegmentationFailed;
                transition(&mut state, GateState::Rejected(reason));
                return Ok(GateAssessment::Rejected {
                    reason,
                    report: None,
                });
            }
        };
        let mask_original =
            segmentation_mask::resize_nearest(&seg.mask, image.width(), image.height());
        cancel.check()?;

        transition(&mut state, GateState::CoverageCheck);
        if let Some(reason) = evaluate_coverage(seg.coverage, &self.config) {
            debug!(
                "Coverage {:.4} outside [{}, {}]",
                seg.coverage, self.config.min_coverage, self.config.max_coverage
            );
            transition(&mut state, GateState::Rejected(reason));
            return Ok(GateAssessment::Rejected {
                reason,
                report: Some(QualityReport {
                    mask: seg.mask,
                    mask_original,
                    coverage: seg.coverage,
                    sharpness: None,
                }),
            });
        }
        cancel.check()?;

        transition(&mut state, GateState::SharpnessCheck);
        let padded = segmentation_mask::dilate(&mask_original, self.config.dilation_radius_u8());
        let scores = sharpness::analyze(image, &padded, &self.config.sharpness_options())?;
        cancel.check()?;

        let verdict = decide(seg.coverage, &scores, &self.config);
        transition(&mut state, verdict.state());

        let report = QualityReport {
            mask: seg.mask,
            mask_original,
            coverage: seg.coverage,
            sharpness: Some(scores),
        };
        Ok(match verdict {
            Verdict::Accepted => GateAssessment::Accepted(report),
            Verdict::Rejected(reason) => GateAssessment::Rejected {
                reason,
                report: Some(report),
            },
        })
    }

    /// Inference plus mask building. `Ok(None)` means segmentation failed
    /// in a way that is a rejection rather than an error.
    fn segment(
        &self,
        input: &ndarray::Array4<f32>,
        segmenter: &dyn SegmentationModel,
    ) -> Result<Option<SegmentationMask>> {
        let output = match segmenter.infer_segmentation(input) {
            Ok(output) => output,
            Err(e) => {
                warn!("Segmentation inference failed: {e:#}");
                return Ok(None);
            }
        };

        let prob = match segmentation_mask::extract_probability(output.view()) {
            Ok(prob) => prob,
            Err(e @ (PipelineError::ShapeMismatch(_) | PipelineError::NonFinite { .. })) => {
                warn!("Unusable segmentation output: {e}");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        segmentation_mask::build_from_map(&prob, self.config.cutoff).map(Some)
    }
}

fn transition(state: &mut GateState, next: GateState) {
    debug!("Gate: {:?} -> {:?}", state, next);
    *state = next;
}
