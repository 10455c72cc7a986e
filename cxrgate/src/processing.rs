//! Batch processing of capture files.
//!
//! A [`CaptureProcessor`] handles one decoded capture; [`run_batch`] does the
//! common work around it: input collection, per-file error policy, output
//! placement, metadata and the end-of-run summary.

use anyhow::{Context, Result};
use chrono::Utc;
use image::DynamicImage;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use crate::color_utils::symbols;
use crate::config::{BaseConfig, GateConfig};
use crate::error::RejectionReason;
use crate::image_input::{collect_captures, load_capture, InputPolicy};
use crate::inference::SegmentationModel;
use crate::mask_encoding::encode_mask;
use crate::metadata::{
    collect_env_vars, CaptureMetadata, DiagnosisSection, ExecutionContext, GateSection,
    SystemInfo,
};
use crate::output_manager::OutputManager;
use crate::pipeline::{CancellationToken, CaptureOutcome, CapturePipeline, CaptureSession};
use crate::quality_gate::{AttemptCounter, QualityGate, QualityReport, Verdict};

/// What one processed capture produced
#[derive(Debug, Clone)]
pub struct CaptureRecord {
    pub accepted: bool,
    pub gate: GateSection,
    pub diagnosis: Option<DiagnosisSection>,
}

impl CaptureRecord {
    pub fn summary(&self) -> String {
        match (&self.gate.reason, &self.diagnosis) {
            (_, Some(d)) => format!("accepted, {} ({:.3})", d.predicted, d.predicted_probability),
            (Some(reason), None) => format!("rejected: {reason}"),
            (None, None) => self.gate.verdict.clone(),
        }
    }
}

/// Counts for a whole batch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub processed: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub failed: usize,
}

pub trait CaptureProcessor {
    /// Tool name for logging ("gate", "diagnose")
    fn name(&self) -> &'static str;

    fn process(
        &mut self,
        image: &DynamicImage,
        output: &OutputManager,
    ) -> Result<CaptureRecord>;
}

/// Gate-only processor with its own attempt counter
pub struct GateProcessor<'a> {
    gate: QualityGate,
    segmenter: &'a dyn SegmentationModel,
    counter: AttemptCounter,
    save_mask: bool,
    cancel: CancellationToken,
}

impl<'a> GateProcessor<'a> {
    pub fn new(
        config: GateConfig,
        segmenter: &'a dyn SegmentationModel,
        save_mask: bool,
    ) -> Result<Self> {
        let counter = AttemptCounter::new(config.guidance_after);
        Ok(Self {
            gate: QualityGate::new(config)?,
            segmenter,
            counter,
            save_mask,
            cancel: CancellationToken::new(),
        })
    }
}

impl CaptureProcessor for GateProcessor<'_> {
    fn name(&self) -> &'static str {
        "gate"
    }

    fn process(&mut self, image: &DynamicImage, output: &OutputManager) -> Result<CaptureRecord> {
        let assessment = self.gate.assess(image, self.segmenter, &self.cancel)?;
        let verdict = assessment.verdict();
        let guidance = match verdict {
            Verdict::Accepted => {
                self.counter.record_acceptance();
                false
            }
            Verdict::Rejected(_) => self.counter.record_rejection(),
        };
        if guidance {
            log::warn!(
                "{}{} consecutive rejections, check framing and focus",
                symbols::warning(),
                self.counter.consecutive_rejections()
            );
        }

        let gate = gate_section(
            verdict.rejection(),
            assessment.report(),
            guidance,
            self.counter.consecutive_rejections(),
            self.gate.config(),
            self.save_mask,
            output,
        )?;

        Ok(CaptureRecord {
            accepted: verdict.is_accepted(),
            gate,
            diagnosis: None,
        })
    }
}

/// Full pipeline processor; all captures share one session
pub struct DiagnoseProcessor {
    session: CaptureSession,
    save_mask: bool,
    cancel: CancellationToken,
}

impl DiagnoseProcessor {
    pub fn new(pipeline: Arc<CapturePipeline>, save_mask: bool) -> Self {
        Self {
            session: pipeline.session(),
            save_mask,
            cancel: CancellationToken::new(),
        }
    }
}

impl CaptureProcessor for DiagnoseProcessor {
    fn name(&self) -> &'static str {
        "diagnose"
    }

    fn process(&mut self, image: &DynamicImage, output: &OutputManager) -> Result<CaptureRecord> {
        let gate_config = self.session.config().gate.clone();
        let diagnosis_options = self.session.config().diagnosis.clone();
        let outcome = self.session.run(image, &self.cancel)?;
        let consecutive = self.session.consecutive_rejections();

        match outcome {
            CaptureOutcome::Rejected {
                reason,
                report,
                guidance,
            } => {
                if guidance {
                    log::warn!(
                        "{}{} consecutive rejections, check framing and focus",
                        symbols::warning(),
                        consecutive
                    );
                }
                let gate = gate_section(
                    Some(reason),
                    report.as_ref(),
                    guidance,
                    consecutive,
                    &gate_config,
                    self.save_mask,
                    output,
                )?;
                Ok(CaptureRecord {
                    accepted: false,
                    gate,
                    diagnosis: None,
                })
            }
            CaptureOutcome::Accepted { report, diagnosis } => {
                let gate = gate_section(
                    None,
                    Some(&report),
                    false,
                    consecutive,
                    &gate_config,
                    self.save_mask,
                    output,
                )?;

                let overlay_path = output.main_output_path("cam", "png")?;
                diagnosis
                    .overlay
                    .save(&overlay_path)
                    .with_context(|| format!("Failed to save overlay: {}", overlay_path.display()))?;

                let section = DiagnosisSection {
                    predicted: diagnosis.predicted.label.clone(),
                    predicted_probability: diagnosis.predicted.probability,
                    overlay_path: Some(output.relative_to_metadata(&overlay_path)?),
                    probabilities: diagnosis.probability_map(),
                    config: Some(diagnosis_options),
                };

                for finding in diagnosis.top_findings(3) {
                    log::debug!("  {}: {:.3}", finding.label, finding.probability);
                }

                Ok(CaptureRecord {
                    accepted: true,
                    gate,
                    diagnosis: Some(section),
                })
            }
        }
    }
}

fn gate_section(
    rejection: Option<RejectionReason>,
    report: Option<&QualityReport>,
    guidance: bool,
    consecutive_rejections: u32,
    config: &GateConfig,
    save_mask: bool,
    output: &OutputManager,
) -> Result<GateSection> {
    let mut section = GateSection {
        verdict: if rejection.is_some() {
            "rejected".to_string()
        } else {
            "accepted".to_string()
        },
        reason: rejection.map(|r| reason_key(r).to_string()),
        message: rejection.map(|r| r.user_message().to_string()),
        guidance,
        consecutive_rejections,
        config: Some(config.clone()),
        ..Default::default()
    };

    if let Some(report) = report {
        section.coverage = Some(report.coverage);
        if let Some(scores) = &report.sharpness {
            section.gradient_energy = Some(scores.gradient_energy);
            section.laplacian_variance = Some(scores.laplacian_variance);
        }
        section.mask = Some(encode_mask(&report.mask, true)?);

        if save_mask {
            let mask_path = output.auxiliary_output_path("mask", "png")?;
            report
                .mask_original
                .save(&mask_path)
                .with_context(|| format!("Failed to save mask: {}", mask_path.display()))?;
            section.mask_path = Some(output.relative_to_metadata(&mask_path)?);
        }
    }

    Ok(section)
}

/// Stable snake_case key, as serialized
fn reason_key(reason: RejectionReason) -> &'static str {
    match reason {
        RejectionReason::SegmentationFailed => "segmentation_failed",
        RejectionReason::MaskUnreliable => "mask_unreliable",
        RejectionReason::RegionBlurry => "region_blurry",
    }
}

/// Process every capture named by `base.sources`
pub fn run_batch<P: CaptureProcessor>(
    base: &BaseConfig,
    processor: &mut P,
    system: SystemInfo,
) -> Result<BatchSummary> {
    let batch_start = Instant::now();
    let command_line: Vec<String> = std::env::args().collect();

    let policy = InputPolicy::from_strict_flag(base.strict);
    let captures = collect_captures(&base.sources, policy)?;
    if captures.is_empty() {
        log::warn!("{}No valid images found to process", symbols::warning());
        return Ok(BatchSummary::default());
    }
    log::info!(
        "{}Found {} image(s) for {}",
        symbols::resources_found(),
        captures.len(),
        processor.name()
    );

    let output_dir = base.output_dir.as_deref().map(Path::new);
    let mut summary = BatchSummary::default();

    for (index, path) in captures.iter().enumerate() {
        let started = Utc::now();
        let timer = Instant::now();
        let output = OutputManager::new(path, output_dir, base.skip_metadata);

        let result = load_capture(path).and_then(|image| processor.process(&image, &output));
        match result {
            Ok(record) => {
                let elapsed_ms = timer.elapsed().as_secs_f64() * 1000.0;
                summary.processed += 1;
                if record.accepted {
                    summary.accepted += 1;
                } else {
                    summary.rejected += 1;
                }
                log::info!(
                    "{}{} ({}/{}): {} in {:.1}ms",
                    symbols::completed_successfully(),
                    path.display(),
                    index + 1,
                    captures.len(),
                    record.summary(),
                    elapsed_ms
                );

                let execution = ExecutionContext {
                    timestamp: Some(started),
                    cxrgate_version: Some(env!("CARGO_PKG_VERSION").to_string()),
                    command_line: Some(command_line.clone()),
                    processing_time_ms: Some(elapsed_ms),
                    env_vars: collect_env_vars(),
                };
                let system = system.clone();
                output.update_metadata(move |metadata: &mut CaptureMetadata| {
                    // Gate-only runs keep an earlier diagnosis unless the capture now fails
                    if record.diagnosis.is_some() || !record.accepted {
                        metadata.diagnosis = record.diagnosis;
                    }
                    metadata.gate = Some(record.gate);
                    metadata.execution = Some(execution);
                    metadata.system = Some(system);
                })?;
            }
            Err(e) => {
                summary.failed += 1;
                if base.strict {
                    return Err(e.context(format!("Failed to process {}", path.display())));
                }
                log::warn!(
                    "{}Failed to process {} ({}/{}): {e:#}",
                    symbols::operation_failed(),
                    path.display(),
                    index + 1,
                    captures.len()
                );
            }
        }
    }

    log::info!(
        "{}Processed {} image(s) in {:.1}s: {} accepted, {} rejected",
        symbols::completed_successfully(),
        summary.processed,
        batch_start.elapsed().as_secs_f64(),
        summary.accepted,
        summary.rejected
    );
    if summary.failed > 0 {
        log::warn!(
            "{}{} of {} images failed to process",
            symbols::completed_partially_successfully(),
            summary.failed,
            captures.len()
        );
    }

    Ok(summary)
}
