//! Synchronous capture pipeline.
//!
//! One run is: quality gate, then (only on acceptance) classifier and
//! activation map. Runs block the calling thread; callers put them on a
//! worker of their own. A [`CaptureSession`] owns the attempt counter and
//! allows one run at a time.

use crate::activation_map::{ActivationMapEngine, Diagnosis};
use crate::class_weights::{LabelSet, WeightTable};
use crate::config::PipelineConfig;
use crate::error::{PipelineError, RejectionReason, Result};
use crate::inference::{ClassifierModel, SegmentationModel};
use crate::quality_gate::{AttemptCounter, GateAssessment, QualityGate, QualityReport};
use image::DynamicImage;
use log::{debug, info};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative cancellation flag, checked between stages
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            debug!("Run cancelled");
            Err(PipelineError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Terminal result of one capture attempt
#[derive(Debug, Clone)]
pub enum CaptureOutcome {
    Accepted {
        report: QualityReport,
        diagnosis: Diagnosis,
    },
    Rejected {
        reason: RejectionReason,
        /// Absent when segmentation failed
        report: Option<QualityReport>,
        /// Set on the rejection that reaches the guidance threshold
        guidance: bool,
    },
}

impl CaptureOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, CaptureOutcome::Accepted { .. })
    }

    pub fn report(&self) -> Option<&QualityReport> {
        match self {
            CaptureOutcome::Accepted { report, .. } => Some(report),
            CaptureOutcome::Rejected { report, .. } => report.as_ref(),
        }
    }
}

/// Read-only pipeline: models, weights and configuration. Shareable
/// across sessions.
pub struct CapturePipeline {
    config: PipelineConfig,
    gate: QualityGate,
    engine: ActivationMapEngine,
    segmenter: Box<dyn SegmentationModel>,
    classifier: Box<dyn ClassifierModel>,
}

impl CapturePipeline {
    pub fn new(
        config: PipelineConfig,
        segmenter: Box<dyn SegmentationModel>,
        classifier: Box<dyn ClassifierModel>,
        weights: Option<Arc<WeightTable>>,
        labels: LabelSet,
    ) -> Result<Self> {
        config.validate()?;
        let gate = QualityGate::new(config.gate.clone())?;
        let engine = ActivationMapEngine::new(weights, labels, config.diagnosis.clone())?;
        Ok(Self {
            config,
            gate,
            engine,
            segmenter,
            classifier,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run once against an explicit counter. A cancelled or failed run
    /// leaves the counter untouched.
    pub fn run(
        &self,
        image: &DynamicImage,
        counter: &mut AttemptCounter,
        cancel: &CancellationToken,
    ) -> Result<CaptureOutcome> {
        let assessment = self.gate.assess(image, self.segmenter.as_ref(), cancel)?;

        let report = match assessment {
            GateAssessment::Rejected { reason, report } => {
                let guidance = counter.record_rejection();
                info!(
                    "Capture rejected: {} ({} consecutive)",
                    reason.user_message(),
                    counter.consecutive_rejections()
                );
                if guidance {
                    info!("Showing capture guidance");
                }
                return Ok(CaptureOutcome::Rejected {
                    reason,
                    report,
                    guidance,
                });
            }
            GateAssessment::Accepted(report) => report,
        };

        cancel.check()?;
        let diagnosis = self.engine.diagnose(image, self.classifier.as_ref())?;
        cancel.check()?;

        counter.record_acceptance();
        info!(
            "Capture accepted: {} ({:.3})",
            diagnosis.predicted.label, diagnosis.predicted.probability
        );

        Ok(CaptureOutcome::Accepted { report, diagnosis })
    }

    pub fn session(self: &Arc<Self>) -> CaptureSession {
        CaptureSession::new(Arc::clone(self))
    }
}

/// One capture session; `run` takes `&mut self` so at most one run is in
/// flight.
pub struct CaptureSession {
    pipeline: Arc<CapturePipeline>,
    counter: AttemptCounter,
}

impl CaptureSession {
    pub fn new(pipeline: Arc<CapturePipeline>) -> Self {
        let counter = AttemptCounter::new(pipeline.config().gate.guidance_after);
        Self { pipeline, counter }
    }

    pub fn run(&mut self, image: &DynamicImage, cancel: &CancellationToken) -> Result<CaptureOutcome> {
        self.pipeline.run(image, &mut self.counter, cancel)
    }

    pub fn consecutive_rejections(&self) -> u32 {
        self.counter.consecutive_rejections()
    }

    pub fn config(&self) -> &PipelineConfig {
        self.pipeline.config()
    }

    /// Start over, e.g. when the user re-enters capture mode
    pub fn reset(&mut self) {
        self.counter.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::ClassifierOutput;
    use image::{GrayImage, Luma, Rgb, RgbImage};
    use ndarray::{Array4, ArrayD, IxDyn};

    fn lungs(input: &Array4<f32>) -> anyhow::Result<ArrayD<f32>> {
        let (_, _, h, w) = input.dim();
        Ok(ArrayD::from_shape_fn(IxDyn(&[1, 1, h, w]), |idx| {
            if idx[2] >= h / 4 && idx[2] < 3 * h / 4 && idx[3] >= w / 4 && idx[3] < 3 * w / 4 {
                1.0
            } else {
                0.0
            }
        }))
    }

    fn classifier(_: &Array4<f32>) -> anyhow::Result<ClassifierOutput> {
        let features = ArrayD::from_shape_fn(IxDyn(&[1, 2, 7, 7]), |idx| (idx[2] * 7 + idx[3]) as f32);
        let logits = ArrayD::from_shape_vec(IxDyn(&[2]), vec![0.2, 0.9])?;
        Ok(ClassifierOutput::new(features, logits))
    }

    fn pipeline() -> Arc<CapturePipeline> {
        let weights = WeightTable::from_flat(vec![1.0, 0.0, 0.0, 1.0], 2, 2).unwrap();
        let pipeline = CapturePipeline::new(
            PipelineConfig::default(),
            Box::new(lungs),
            Box::new(classifier),
            Some(Arc::new(weights)),
            LabelSet::new(["Effusion", "Pneumothorax"]).unwrap(),
        )
        .unwrap();
        Arc::new(pipeline)
    }

    fn sharp() -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_fn(64, 64, |x, y| {
            let v = if (x / 4 + y / 4) % 2 == 0 { 230 } else { 20 };
            Rgb([v, v, v])
        }))
    }

    fn blurry() -> DynamicImage {
        DynamicImage::ImageLuma8(GrayImage::from_pixel(64, 64, Luma([100])))
    }

    #[test]
    fn test_accepted_capture_is_diagnosed() {
        let mut session = pipeline().session();
        let outcome = session.run(&sharp(), &CancellationToken::new()).unwrap();

        match outcome {
            CaptureOutcome::Accepted { report, diagnosis } => {
                assert!((report.coverage - 0.25).abs() < 1e-6);
                assert_eq!(diagnosis.predicted.label, "Pneumothorax");
                assert_eq!(diagnosis.overlay.dimensions(), (64, 64));
                assert_eq!(diagnosis.activation_map.dim(), (7, 7));
            }
            other => panic!("expected acceptance, got {other:?}"),
        }
    }

    #[test]
    fn test_rejections_accumulate_until_accepted() {
        let mut session = pipeline().session();
        let cancel = CancellationToken::new();

        let mut guidance_count = 0;
        for _ in 0..7 {
            match session.run(&blurry(), &cancel).unwrap() {
                CaptureOutcome::Rejected {
                    reason, guidance, ..
                } => {
                    assert_eq!(reason, RejectionReason::RegionBlurry);
                    guidance_count += guidance as usize;
                }
                other => panic!("expected rejection, got {other:?}"),
            }
        }
        assert_eq!(guidance_count, 1);
        assert_eq!(session.consecutive_rejections(), 7);

        assert!(session.run(&sharp(), &cancel).unwrap().is_accepted());
        assert_eq!(session.consecutive_rejections(), 0);
    }

    #[test]
    fn test_cancelled_run_leaves_counter() {
        let mut session = pipeline().session();
        session.run(&blurry(), &CancellationToken::new()).unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            session.run(&blurry(), &cancel),
            Err(PipelineError::Cancelled)
        ));
        assert_eq!(session.consecutive_rejections(), 1);

        session.reset();
        assert_eq!(session.consecutive_rejections(), 0);
    }

    #[test]
    fn test_classifier_failure_is_an_error() {
        let failing = |_: &Array4<f32>| -> anyhow::Result<ClassifierOutput> {
            anyhow::bail!("session poisoned")
        };
        let pipeline = CapturePipeline::new(
            PipelineConfig::default(),
            Box::new(lungs),
            Box::new(failing),
            Some(Arc::new(WeightTable::from_flat(vec![1.0; 4], 2, 2).unwrap())),
            LabelSet::new(["A", "B"]).unwrap(),
        )
        .unwrap();

        let mut counter = AttemptCounter::default();
        let result = pipeline.run(&sharp(), &mut counter, &CancellationToken::new());
        assert!(matches!(result, Err(PipelineError::Inference(_))));
    }
}
