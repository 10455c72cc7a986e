use anyhow::{Context, Result};
use clap::Parser;
use env_logger::{Builder, Env};
use log::{error, info, Level};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use cxrgate::class_weights::{read_weight_table, LabelSet};
use cxrgate::color_utils::{self, symbols};
use cxrgate::config::{DiagnoseCommand, DiagnoseRunConfig, GateCommand, GateRunConfig, GlobalArgs};
use cxrgate::metadata::SystemInfo;
use cxrgate::onnx_session::{determine_optimal_device, OnnxClassifier, OnnxSegmenter};
use cxrgate::pipeline::CapturePipeline;
use cxrgate::processing::{run_batch, BatchSummary, DiagnoseProcessor, GateProcessor};

#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run the capture-quality gate on images
    Gate(GateCommand),

    /// Gate images, then classify accepted ones and render activation maps
    Diagnose(DiagnoseCommand),

    /// Show version information
    Version,
}

#[derive(Parser)]
#[command(name = "cxrgate")]
#[command(about = "Capture-quality gate and activation maps for chest radiograph photos")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

fn get_log_level_from_verbosity(
    verbosity: clap_verbosity_flag::Verbosity<clap_verbosity_flag::ErrorLevel>,
) -> log::LevelFilter {
    // -q is indistinguishable from the default through the filter alone
    if verbosity.is_silent() {
        return log::LevelFilter::Error;
    }
    match verbosity.log_level_filter() {
        log::LevelFilter::Off => log::LevelFilter::Off,
        log::LevelFilter::Error => log::LevelFilter::Warn,
        log::LevelFilter::Warn => log::LevelFilter::Info,
        log::LevelFilter::Info => log::LevelFilter::Debug,
        log::LevelFilter::Debug => log::LevelFilter::Trace,
        log::LevelFilter::Trace => log::LevelFilter::Trace,
    }
}

fn init_logger(global: &GlobalArgs) {
    let use_env = !global.verbosity.is_present() && std::env::var_os("RUST_LOG").is_some();

    let mut logger = if use_env {
        Builder::from_env(Env::default())
    } else {
        let mut b = Builder::new();
        b.filter_level(get_log_level_from_verbosity(global.verbosity.clone()));
        b
    };

    logger
        .format(|buf, record| {
            let level_str = match record.level() {
                Level::Error => color_utils::colors::error_level("ERROR"),
                Level::Warn => color_utils::colors::warning_level("WARN"),
                Level::Info => color_utils::colors::info_level("INFO"),
                Level::Debug => color_utils::colors::debug_level("DEBUG"),
                Level::Trace => color_utils::colors::trace_level("TRACE"),
            };
            writeln!(buf, "[{}] {}", level_str, record.args())
        })
        .init();
}

fn sources_description(sources: &[String]) -> String {
    match sources {
        [single] => single.clone(),
        many => format!("{} inputs", many.len()),
    }
}

fn model_name(path: &str) -> Option<String> {
    Path::new(path)
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
}

fn run_gate(global: &GlobalArgs, cmd: GateCommand) -> Result<BatchSummary> {
    let config = GateRunConfig::from_args(global, cmd)?;
    info!(
        "{}Quality gate: {} | cutoff: {} | device: {}",
        symbols::gate_start(),
        sources_description(&config.base.sources),
        config.pipeline.gate.cutoff,
        config.base.device
    );

    let device = determine_optimal_device(&config.base.device);
    let segmenter = OnnxSegmenter::load(Path::new(&config.segmentation_model), &device.device)?;

    let system = SystemInfo {
        device_requested: Some(config.base.device.clone()),
        device_selected: Some(device.device.clone()),
        device_selection_reason: Some(device.reason.clone()),
        execution_providers: segmenter.info.execution_providers.clone(),
        segmentation_model: model_name(&config.segmentation_model),
        classifier_model: None,
        model_load_time_ms: Some(segmenter.info.load_time_ms),
    };

    let mut processor = GateProcessor::new(config.pipeline.gate.clone(), &segmenter, config.save_mask)?;
    run_batch(&config.base, &mut processor, system)
}

fn run_diagnose(global: &GlobalArgs, cmd: DiagnoseCommand) -> Result<BatchSummary> {
    let config = DiagnoseRunConfig::from_args(global, cmd)?;
    info!(
        "{}Diagnosis: {} | cutoff: {} | alpha: {} | device: {}",
        symbols::diagnose_start(),
        sources_description(&config.base.sources),
        config.pipeline.gate.cutoff,
        config.pipeline.diagnosis.alpha,
        config.base.device
    );

    let labels = LabelSet::chest_xray14();
    let weights = read_weight_table(Path::new(&config.weights_path), &labels)?;

    let device = determine_optimal_device(&config.base.device);
    let segmenter = OnnxSegmenter::load(Path::new(&config.segmentation_model), &device.device)?;
    let classifier = OnnxClassifier::load(
        Path::new(&config.classifier_model),
        &device.device,
        config.features_output.as_deref(),
        config.logits_output.as_deref(),
    )?;

    let system = SystemInfo {
        device_requested: Some(config.base.device.clone()),
        device_selected: Some(device.device.clone()),
        device_selection_reason: Some(device.reason.clone()),
        execution_providers: classifier.info.execution_providers.clone(),
        segmentation_model: model_name(&config.segmentation_model),
        classifier_model: model_name(&config.classifier_model),
        model_load_time_ms: Some(segmenter.info.load_time_ms + classifier.info.load_time_ms),
    };

    let pipeline = CapturePipeline::new(
        config.pipeline.clone(),
        Box::new(segmenter),
        Box::new(classifier),
        Some(Arc::new(weights)),
        labels,
    )
    .context("Failed to build capture pipeline")?;

    let mut processor = DiagnoseProcessor::new(Arc::new(pipeline), config.save_mask);
    run_batch(&config.base, &mut processor, system)
}

fn main() {
    let cli = Cli::parse();
    color_utils::init_color_config(cli.global.no_color);
    init_logger(&cli.global);

    let result = match cli.command {
        Some(Commands::Gate(cmd)) => run_gate(&cli.global, cmd),
        Some(Commands::Diagnose(cmd)) => run_diagnose(&cli.global, cmd),
        Some(Commands::Version) => {
            println!("cxrgate v{}", env!("CARGO_PKG_VERSION"));
            println!("Repository: {}", env!("CARGO_PKG_REPOSITORY"));
            return;
        }
        None => {
            use clap::CommandFactory;
            if let Err(e) = Cli::command().print_help() {
                error!("Failed to print help: {e}");
            }
            return;
        }
    };

    if let Err(e) = result {
        error!("{}{e:#}", symbols::operation_failed());
        std::process::exit(1);
    }
}
