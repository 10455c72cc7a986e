//! Configuration layer separating CLI arguments from pipeline configuration.
//!
//! - `GateConfig` / `DiagnosisOptions` / `PipelineConfig`: the numeric
//!   constants the pipeline runs with, loadable from TOML.
//! - `GlobalArgs`, `GateCommand`, `DiagnoseCommand`: clap argument structs.
//! - `GateRunConfig` / `DiagnoseRunConfig`: what a CLI invocation resolves to.

use crate::error::PipelineError;
use crate::sharpness::SharpnessOptions;
use anyhow::Context;
use clap::{Args, Parser, ValueEnum};
use clap_verbosity_flag::Verbosity;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Documented operating range for the segmentation cutoff
pub const CUTOFF_OPERATING_RANGE: (f32, f32) = (0.05, 0.2);

/// Quality gate constants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Probability at or above which a pixel counts as lung
    pub cutoff: f32,
    /// Half-width of the square used to pad the mask for edge analysis
    pub dilation_radius: u32,
    pub min_coverage: f64,
    pub max_coverage: f64,
    /// Tenengrad acceptance threshold
    pub gradient_threshold: f64,
    /// Laplacian variance acceptance threshold
    pub laplacian_threshold: f64,
    /// Sobel aperture (1, 3 or 5)
    pub sobel_kernel: u32,
    /// Longest edge for sharpness analysis, 0 keeps full resolution
    pub max_long_edge: u32,
    /// Consecutive rejections before the guidance signal fires
    pub guidance_after: u32,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            cutoff: 0.1,
            dilation_radius: 12,
            min_coverage: 0.05,
            max_coverage: 0.75,
            gradient_threshold: 3500.0,
            laplacian_threshold: 750.0,
            sobel_kernel: 3,
            max_long_edge: 0,
            guidance_after: 5,
        }
    }
}

impl GateConfig {
    pub fn validate(&self) -> Result<(), PipelineError> {
        if !(0.0..=1.0).contains(&self.cutoff) {
            return Err(PipelineError::InvalidParameter(format!(
                "cutoff must be within [0, 1], got {}",
                self.cutoff
            )));
        }
        if self.dilation_radius > u8::MAX as u32 {
            return Err(PipelineError::InvalidParameter(format!(
                "dilation radius must be at most {}, got {}",
                u8::MAX,
                self.dilation_radius
            )));
        }
        let coverage_ok = (0.0..=1.0).contains(&self.min_coverage)
            && (0.0..=1.0).contains(&self.max_coverage)
            && self.min_coverage <= self.max_coverage;
        if !coverage_ok {
            return Err(PipelineError::InvalidParameter(format!(
                "coverage bounds must satisfy 0 <= min <= max <= 1, got [{}, {}]",
                self.min_coverage, self.max_coverage
            )));
        }
        for (name, value) in [
            ("gradient threshold", self.gradient_threshold),
            ("laplacian threshold", self.laplacian_threshold),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(PipelineError::InvalidParameter(format!(
                    "{name} must be a non-negative number, got {value}"
                )));
            }
        }
        if self.guidance_after == 0 {
            return Err(PipelineError::InvalidParameter(
                "guidance_after must be at least 1".to_string(),
            ));
        }
        self.sharpness_options().validate()
    }

    pub fn sharpness_options(&self) -> SharpnessOptions {
        SharpnessOptions {
            kernel_size: self.sobel_kernel,
            max_long_edge: self.max_long_edge,
        }
    }

    /// Radius as the structuring-element size; `validate` guarantees it fits
    pub fn dilation_radius_u8(&self) -> u8 {
        self.dilation_radius.min(u8::MAX as u32) as u8
    }

    pub fn warn_if_outside_operating_range(&self) {
        let (lo, hi) = CUTOFF_OPERATING_RANGE;
        if self.cutoff < lo || self.cutoff > hi {
            log::warn!(
                "Segmentation cutoff {} is outside the tuned range [{lo}, {hi}]",
                self.cutoff
            );
        }
    }
}

/// How classifier scores are turned into probabilities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ScoreActivation {
    /// The network already ends in a sigmoid
    #[default]
    Identity,
    /// The network emits raw logits
    Sigmoid,
}

impl ScoreActivation {
    pub fn apply(&self, score: f32) -> f32 {
        let p = match self {
            ScoreActivation::Identity => score,
            ScoreActivation::Sigmoid => 1.0 / (1.0 + (-score).exp()),
        };
        p.clamp(0.0, 1.0)
    }
}

/// Activation-map engine options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagnosisOptions {
    /// Heatmap opacity over the original image
    pub alpha: f32,
    pub score_activation: ScoreActivation,
}

impl Default for DiagnosisOptions {
    fn default() -> Self {
        Self {
            alpha: 0.5,
            score_activation: ScoreActivation::Identity,
        }
    }
}

impl DiagnosisOptions {
    pub fn validate(&self) -> Result<(), PipelineError> {
        if !(0.0..=1.0).contains(&self.alpha) {
            return Err(PipelineError::InvalidParameter(format!(
                "overlay alpha must be within [0, 1], got {}",
                self.alpha
            )));
        }
        Ok(())
    }
}

/// Everything the pipeline needs besides the models and weights
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub gate: GateConfig,
    pub diagnosis: DiagnosisOptions,
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), PipelineError> {
        self.gate.validate()?;
        self.diagnosis.validate()
    }

    pub fn from_toml_str(text: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(text).context("Failed to parse pipeline config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_toml_str(&text)
    }
}

/// Parse probability value (must be between 0.0 and 1.0)
pub fn parse_probability(s: &str) -> Result<f32, String> {
    let val = s
        .parse::<f32>()
        .map_err(|_| format!("Invalid number: '{s}'"))?;
    if !(0.0..=1.0).contains(&val) {
        return Err(format!("Must be between 0.0 and 1.0, got {val}"));
    }
    Ok(val)
}

/// Parse Sobel aperture (1, 3 or 5)
pub fn parse_kernel_size(s: &str) -> Result<u32, String> {
    match s.trim() {
        "1" => Ok(1),
        "3" => Ok(3),
        "5" => Ok(5),
        other => Err(format!("Kernel size must be 1, 3 or 5, got '{other}'")),
    }
}

/// Global CLI arguments that apply to all commands
#[derive(Parser, Debug, Clone)]
pub struct GlobalArgs {
    /// Global output directory (overrides default placement next to input)
    #[arg(long, global = true)]
    pub output_dir: Option<String>,

    /// Create metadata output file(s)
    #[arg(long, global = true)]
    pub metadata: bool,

    /// Verbosity level (-q/--quiet, -v/-vv/-vvv for info/debug/trace)
    #[command(flatten)]
    pub verbosity: Verbosity,

    /// Use permissive mode for input validation (warn instead of error for unsupported files)
    #[arg(long, global = true)]
    pub permissive: bool,

    /// Device to use for inference (auto, cpu, coreml)
    #[arg(long, default_value = "auto", global = true)]
    pub device: String,

    /// Disable colored output (also respects NO_COLOR and CXRGATE_NO_COLOR env vars)
    #[arg(long, global = true)]
    pub no_color: bool,

    /// TOML file with [gate] and [diagnosis] sections; CLI flags override it
    #[arg(long, global = true)]
    pub config: Option<String>,
}

/// Quality gate arguments shared by `gate` and `diagnose`
#[derive(Args, Debug, Clone)]
pub struct GateArgs {
    /// Path(s) to input images or directories. Supports glob patterns like *.jpg
    #[arg(value_name = "IMAGES_OR_DIRS", required = true)]
    pub sources: Vec<String>,

    /// Lung segmentation ONNX model
    #[arg(long)]
    pub segmentation_model: String,

    /// Probability cutoff for the lung mask (0.0-1.0)
    #[arg(long, value_parser = parse_probability)]
    pub cutoff: Option<f32>,

    /// Mask dilation radius in pixels for the sharpness analysis
    #[arg(long)]
    pub dilation_radius: Option<u32>,

    /// Sobel kernel size for the gradient metric (1, 3 or 5)
    #[arg(long, value_parser = parse_kernel_size)]
    pub sobel_kernel: Option<u32>,

    /// Downscale before sharpness analysis so the longest edge is at most this (0 = off)
    #[arg(long)]
    pub max_long_edge: Option<u32>,

    /// Save the capture-resolution lung mask as a PNG
    #[arg(long)]
    pub save_mask: bool,
}

/// CLI command for the quality gate alone
#[derive(Parser, Debug, Clone)]
pub struct GateCommand {
    #[command(flatten)]
    pub gate: GateArgs,
}

/// CLI command for the full gate + classifier pipeline
#[derive(Parser, Debug, Clone)]
pub struct DiagnoseCommand {
    #[command(flatten)]
    pub gate: GateArgs,

    /// Multi-label classifier ONNX model
    #[arg(long)]
    pub classifier_model: String,

    /// Per-class weight table (little-endian f32, labels x channels)
    #[arg(long)]
    pub weights: String,

    /// Name of the classifier output holding the feature map (default: first output)
    #[arg(long)]
    pub features_output: Option<String>,

    /// Name of the classifier output holding the scores (default: second output)
    #[arg(long)]
    pub logits_output: Option<String>,

    /// Heatmap opacity over the original image (0.0-1.0)
    #[arg(long, value_parser = parse_probability)]
    pub alpha: Option<f32>,

    /// How to turn classifier scores into probabilities
    #[arg(long, value_enum)]
    pub score_activation: Option<ScoreActivation>,
}

/// Base configuration common to all commands
#[derive(Debug, Clone, Serialize)]
pub struct BaseConfig {
    /// Input sources (images or directories)
    pub sources: Vec<String>,
    /// Device for inference
    pub device: String,
    /// Optional output directory override
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<String>,
    /// Whether to skip metadata generation
    pub skip_metadata: bool,
    /// Fail if files are not found or are unsupported. Opposite of `--permissive`.
    pub strict: bool,
}

impl Default for BaseConfig {
    fn default() -> Self {
        Self {
            sources: Vec::new(),
            device: "auto".to_string(),
            output_dir: None,
            skip_metadata: true,
            strict: true,
        }
    }
}

impl From<&GlobalArgs> for BaseConfig {
    fn from(global: &GlobalArgs) -> Self {
        Self {
            sources: Vec::new(),
            device: global.device.clone(),
            output_dir: global.output_dir.clone(),
            skip_metadata: !global.metadata,
            strict: !global.permissive,
        }
    }
}

/// Internal configuration for `gate`
#[derive(Debug, Clone, Serialize)]
pub struct GateRunConfig {
    #[serde(skip)]
    pub base: BaseConfig,
    pub pipeline: PipelineConfig,
    pub segmentation_model: String,
    pub save_mask: bool,
}

/// Internal configuration for `diagnose`
#[derive(Debug, Clone, Serialize)]
pub struct DiagnoseRunConfig {
    #[serde(skip)]
    pub base: BaseConfig,
    pub pipeline: PipelineConfig,
    pub segmentation_model: String,
    pub classifier_model: String,
    pub weights_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub features_output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logits_output: Option<String>,
    pub save_mask: bool,
}

/// Start from the TOML file (if any) and apply CLI overrides
fn resolve_pipeline(global: &GlobalArgs, gate: &GateArgs) -> anyhow::Result<PipelineConfig> {
    let mut pipeline = match &global.config {
        Some(path) => PipelineConfig::from_toml_file(Path::new(path))?,
        None => PipelineConfig::default(),
    };

    if let Some(cutoff) = gate.cutoff {
        pipeline.gate.cutoff = cutoff;
    }
    if let Some(radius) = gate.dilation_radius {
        pipeline.gate.dilation_radius = radius;
    }
    if let Some(kernel) = gate.sobel_kernel {
        pipeline.gate.sobel_kernel = kernel;
    }
    if let Some(edge) = gate.max_long_edge {
        pipeline.gate.max_long_edge = edge;
    }
    Ok(pipeline)
}

impl GateRunConfig {
    pub fn from_args(global: &GlobalArgs, cmd: GateCommand) -> anyhow::Result<Self> {
        let pipeline = resolve_pipeline(global, &cmd.gate)?;
        pipeline.validate()?;

        let mut base = BaseConfig::from(global);
        base.sources = cmd.gate.sources;

        Ok(Self {
            base,
            pipeline,
            segmentation_model: cmd.gate.segmentation_model,
            save_mask: cmd.gate.save_mask,
        })
    }
}

impl DiagnoseRunConfig {
    pub fn from_args(global: &GlobalArgs, cmd: DiagnoseCommand) -> anyhow::Result<Self> {
        let mut pipeline = resolve_pipeline(global, &cmd.gate)?;
        if let Some(alpha) = cmd.alpha {
            pipeline.diagnosis.alpha = alpha;
        }
        if let Some(activation) = cmd.score_activation {
            pipeline.diagnosis.score_activation = activation;
        }
        pipeline.validate()?;

        let mut base = BaseConfig::from(global);
        base.sources = cmd.gate.sources;

        Ok(Self {
            base,
            pipeline,
            segmentation_model: cmd.gate.segmentation_model,
            classifier_model: cmd.classifier_model,
            weights_path: cmd.weights,
            features_output: cmd.features_output,
            logits_output: cmd.logits_output,
            save_mask: cmd.gate.save_mask,
        })
    }
}
