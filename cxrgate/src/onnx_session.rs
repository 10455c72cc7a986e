//! ONNX Runtime adapters for the segmentation and classifier networks.

use crate::color_utils::symbols;
use crate::inference::{ClassifierModel, ClassifierOutput, SegmentationModel};
use anyhow::{Context, Result};
use log::Level;
use ndarray::{Array4, ArrayD};
use ort::{
    execution_providers::{
        CPUExecutionProvider, CoreMLExecutionProvider, ExecutionProvider,
        ExecutionProviderDispatch,
    },
    logging::LogLevel,
    session::Session,
    value::Value,
};
use serde::Serialize;
use std::fs;
use std::path::Path;
use std::sync::Mutex;
use std::time::Instant;

fn log_level_from_ort(level: LogLevel) -> Level {
    match level {
        LogLevel::Verbose => Level::Trace,
        LogLevel::Info => Level::Trace,
        LogLevel::Warning => Level::Debug,
        LogLevel::Error => Level::Info,
        LogLevel::Fatal => Level::Error,
    }
}

fn ort_level_from_log(level: Level) -> LogLevel {
    match level {
        // ONNX info is closer to our trace
        Level::Trace => LogLevel::Verbose,
        Level::Debug => LogLevel::Warning,
        Level::Info => LogLevel::Error,
        Level::Warn => LogLevel::Error,
        Level::Error => LogLevel::Fatal,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub model_path: String,
    pub model_size_bytes: usize,
    pub execution_providers: Vec<String>,
    pub load_time_ms: f64,
}

#[derive(Debug, Clone)]
pub struct DeviceSelection {
    pub device: String,
    pub reason: String,
}

/// Resolve `auto` to a concrete device
pub fn determine_optimal_device(requested_device: &str) -> DeviceSelection {
    match requested_device {
        "auto" => match CoreMLExecutionProvider::default().is_available() {
            Ok(true) => DeviceSelection {
                device: "coreml".to_string(),
                reason: "Auto-selected CoreML (available)".to_string(),
            },
            _ => DeviceSelection {
                device: "cpu".to_string(),
                reason: "Auto-selected CPU (CoreML not available)".to_string(),
            },
        },
        other => DeviceSelection {
            device: other.to_string(),
            reason: format!("User explicitly chose {other}"),
        },
    }
}

fn execution_providers(device: &str) -> Vec<ExecutionProviderDispatch> {
    match device {
        "coreml" => match CoreMLExecutionProvider::default().is_available() {
            Ok(true) => vec![
                CoreMLExecutionProvider::default().build(),
                CPUExecutionProvider::default().build(),
            ],
            _ => {
                log::warn!(
                    "{}CoreML not available, falling back to CPU",
                    symbols::warning()
                );
                vec![CPUExecutionProvider::default().build()]
            }
        },
        "cpu" => vec![CPUExecutionProvider::default().build()],
        other => {
            log::warn!("{}Unknown device '{other}', using CPU", symbols::warning());
            vec![CPUExecutionProvider::default().build()]
        }
    }
}

/// Load a model file into a session on `device` (already resolved, not `auto`)
pub fn create_onnx_session(model_path: &Path, device: &str) -> Result<(Session, ModelInfo)> {
    let start = Instant::now();
    let bytes = fs::read(model_path)
        .with_context(|| format!("Failed to read model: {}", model_path.display()))?;

    let providers = execution_providers(device);
    let ep_names: Vec<String> = providers.iter().map(|ep| format!("{ep:?}")).collect();

    let ort_log_level = [
        Level::Trace,
        Level::Debug,
        Level::Info,
        Level::Warn,
        Level::Error,
    ]
    .into_iter()
    .find(|&lvl| log::log_enabled!(lvl))
    .map(ort_level_from_log)
    .unwrap_or(LogLevel::Fatal);

    let session = Session::builder()
        .map_err(|e| anyhow::anyhow!("Failed to create session builder: {}", e))?
        .with_logger(Box::new(|level, _, _, _, msg| {
            log::log!(log_level_from_ort(level), "[onnx] {msg}")
        }))
        .map_err(|e| anyhow::anyhow!("Failed to set logger: {}", e))?
        .with_log_level(ort_log_level)
        .map_err(|e| anyhow::anyhow!("Failed to set log level: {}", e))?
        .with_execution_providers(providers)
        .map_err(|e| anyhow::anyhow!("Failed to set execution providers: {}", e))?
        .commit_from_memory(&bytes)
        .map_err(|e| {
            anyhow::anyhow!("Failed to load model {}: {}", model_path.display(), e)
        })?;

    let info = ModelInfo {
        model_path: model_path.display().to_string(),
        model_size_bytes: bytes.len(),
        execution_providers: ep_names,
        load_time_ms: start.elapsed().as_secs_f64() * 1000.0,
    };
    log::debug!(
        "{}Execution providers registered: {}",
        symbols::system_setup(),
        info.execution_providers.join(" -> ")
    );
    log::info!(
        "{}Loaded {} in {:.1}ms",
        symbols::model_loaded(),
        info.model_path,
        info.load_time_ms
    );
    Ok((session, info))
}

fn run_session(
    session: &Mutex<Session>,
    input_name: &str,
    output_names: &[&str],
    input: &Array4<f32>,
) -> Result<Vec<ArrayD<f32>>> {
    let input_value = Value::from_array(input.clone())
        .map_err(|e| anyhow::anyhow!("Failed to create input value: {}", e))?;

    let mut session = session
        .lock()
        .map_err(|_| anyhow::anyhow!("ONNX session lock poisoned"))?;
    let outputs = session
        .run(ort::inputs![input_name => &input_value])
        .map_err(|e| anyhow::anyhow!("Failed to run inference: {}", e))?;

    output_names
        .iter()
        .map(|name| {
            let view = outputs[*name]
                .try_extract_array::<f32>()
                .map_err(|e| anyhow::anyhow!("Failed to extract output '{name}': {}", e))?;
            Ok(view.to_owned())
        })
        .collect()
}

/// Lung segmentation network; first input and first output are used
pub struct OnnxSegmenter {
    session: Mutex<Session>,
    input_name: String,
    output_name: String,
    pub info: ModelInfo,
}

impl OnnxSegmenter {
    pub fn load(model_path: &Path, device: &str) -> Result<Self> {
        let (session, info) = create_onnx_session(model_path, device)?;
        let input_name = session
            .inputs
            .first()
            .map(|i| i.name.clone())
            .context("Segmentation model has no inputs")?;
        let output_name = session
            .outputs
            .first()
            .map(|o| o.name.clone())
            .context("Segmentation model has no outputs")?;
        Ok(Self {
            session: Mutex::new(session),
            input_name,
            output_name,
            info,
        })
    }
}

impl SegmentationModel for OnnxSegmenter {
    fn infer_segmentation(&self, input: &Array4<f32>) -> Result<ArrayD<f32>> {
        let mut outputs = run_session(
            &self.session,
            &self.input_name,
            &[self.output_name.as_str()],
            input,
        )?;
        outputs
            .pop()
            .context("Segmentation model produced no output")
    }
}

/// Multi-label classifier exposing its final feature map and scores
pub struct OnnxClassifier {
    session: Mutex<Session>,
    input_name: String,
    features_output: Option<String>,
    logits_output: Option<String>,
    pub info: ModelInfo,
}

/// Requested name if the model has it; otherwise the output at `fallback`
/// when no name was requested
fn resolve_output(session: &Session, requested: Option<&str>, fallback: usize) -> Option<String> {
    match requested {
        Some(name) => {
            let found = session.outputs.iter().any(|o| o.name == name);
            if !found {
                log::warn!(
                    "{}Classifier has no output named '{name}'",
                    symbols::warning()
                );
            }
            found.then(|| name.to_string())
        }
        None => session.outputs.get(fallback).map(|o| o.name.clone()),
    }
}

impl OnnxClassifier {
    /// Without explicit names, output 0 is the feature map and output 1 the
    /// scores
    pub fn load(
        model_path: &Path,
        device: &str,
        features_output: Option<&str>,
        logits_output: Option<&str>,
    ) -> Result<Self> {
        let (session, info) = create_onnx_session(model_path, device)?;
        let input_name = session
            .inputs
            .first()
            .map(|i| i.name.clone())
            .context("Classifier model has no inputs")?;
        let features_output = resolve_output(&session, features_output, 0);
        let logits_output = resolve_output(&session, logits_output, 1);
        log::debug!(
            "Classifier outputs: features={features_output:?} logits={logits_output:?}"
        );
        Ok(Self {
            session: Mutex::new(session),
            input_name,
            features_output,
            logits_output,
            info,
        })
    }
}

impl ClassifierModel for OnnxClassifier {
    fn infer_classifier(&self, input: &Array4<f32>) -> Result<ClassifierOutput> {
        let names: Vec<&str> = [&self.features_output, &self.logits_output]
            .into_iter()
            .flatten()
            .map(String::as_str)
            .collect();
        let mut arrays = run_session(&self.session, &self.input_name, &names, input)?.into_iter();

        let features = self.features_output.as_ref().and_then(|_| arrays.next());
        let logits = self.logits_output.as_ref().and_then(|_| arrays.next());
        Ok(ClassifierOutput { features, logits })
    }
}
