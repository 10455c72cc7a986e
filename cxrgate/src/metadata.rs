//! Per-capture TOML metadata.
//!
//! One `<stem>.cxrgate.toml` per input. `gate` and `diagnose` each own their
//! sections; re-running a command replaces its sections and leaves the
//! others in place.

use crate::config::{DiagnosisOptions, GateConfig};
use crate::mask_encoding::MaskEntry;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const METADATA_EXTENSION: &str = "cxrgate.toml";

#[derive(Serialize, Deserialize, Default, Debug, Clone)]
pub struct CaptureMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gate: Option<GateSection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnosis: Option<DiagnosisSection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution: Option<ExecutionContext>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<SystemInfo>,
}

/// Quality gate outcome for one capture
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct GateSection {
    /// "accepted" or "rejected"
    pub verdict: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Short text the user is shown for a rejection
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub guidance: bool,
    pub consecutive_rejections: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coverage: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gradient_energy: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub laplacian_variance: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mask_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mask: Option<MaskEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<GateConfig>,
}

/// Classifier outcome for an accepted capture
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct DiagnosisSection {
    pub predicted: String,
    pub predicted_probability: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overlay_path: Option<String>,
    pub probabilities: BTreeMap<String, f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<DiagnosisOptions>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ExecutionContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cxrgate_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_line: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_time_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env_vars: Option<BTreeMap<String, String>>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct SystemInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_requested: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_selected: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_selection_reason: Option<String>,
    #[serde(default)]
    pub execution_providers: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub segmentation_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classifier_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_load_time_ms: Option<f64>,
}

/// Load existing metadata, or start fresh if missing or unreadable
pub fn load_or_create_metadata(path: &Path) -> Result<CaptureMetadata> {
    if !path.exists() {
        return Ok(CaptureMetadata::default());
    }
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read metadata: {}", path.display()))?;
    match toml::from_str::<CaptureMetadata>(&content) {
        Ok(metadata) => Ok(metadata),
        Err(e) => {
            warn!(
                "{}Dropping existing metadata from {}:\n{}",
                crate::color_utils::symbols::warning(),
                path.display(),
                crate::color_utils::colors::warning_level(&e.to_string())
            );
            Ok(CaptureMetadata::default())
        }
    }
}

pub fn save_metadata(metadata: &CaptureMetadata, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let content = toml::to_string_pretty(metadata).map_err(|e| {
        log::debug!("Metadata that failed to serialize: {metadata:#?}");
        anyhow::anyhow!("Failed to serialize metadata to TOML: {e}")
    })?;
    fs::write(path, content)
        .with_context(|| format!("Failed to write metadata: {}", path.display()))?;
    Ok(())
}

/// `<stem>.cxrgate.toml`, next to the input or under `output_dir`
pub fn metadata_path(input_path: &Path, output_dir: Option<&Path>) -> Result<PathBuf> {
    let stem = input_path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| anyhow::anyhow!("Invalid input filename: {}", input_path.display()))?;
    let filename = format!("{stem}.{METADATA_EXTENSION}");

    Ok(match output_dir {
        Some(dir) => dir.join(filename),
        None => input_path
            .parent()
            .unwrap_or(Path::new("."))
            .join(filename),
    })
}

/// `CXRGATE_*` environment variables that are set and non-empty
pub fn collect_env_vars() -> Option<BTreeMap<String, String>> {
    let vars: BTreeMap<String, String> = std::env::vars()
        .filter(|(key, value)| key.starts_with("CXRGATE_") && !value.is_empty())
        .collect();
    (!vars.is_empty()).then_some(vars)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> CaptureMetadata {
        CaptureMetadata {
            gate: Some(GateSection {
                verdict: "rejected".to_string(),
                reason: Some("mask_unreliable".to_string()),
                message: Some("retake".to_string()),
                guidance: false,
                consecutive_rejections: 2,
                coverage: Some(0.82),
                config: Some(GateConfig::default()),
                ..Default::default()
            }),
            execution: Some(ExecutionContext {
                timestamp: Some(Utc::now()),
                cxrgate_version: Some("0.1.0".to_string()),
                command_line: Some(vec!["cxrgate".to_string(), "gate".to_string()]),
                processing_time_ms: Some(42.5),
                env_vars: None,
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_save_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("cxr.cxrgate.toml");

        save_metadata(&sample(), &path).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("[gate]"));
        assert!(text.contains("verdict = \"rejected\""));

        let loaded = load_or_create_metadata(&path).unwrap();
        assert_eq!(loaded.gate, sample().gate);
        assert!(loaded.diagnosis.is_none());
    }

    #[test]
    fn test_diagnosis_section_serializes_probabilities() {
        let mut probabilities = BTreeMap::new();
        probabilities.insert("Cardiomegaly".to_string(), 0.75f32);
        probabilities.insert("Effusion".to_string(), 0.25f32);
        let metadata = CaptureMetadata {
            diagnosis: Some(DiagnosisSection {
                predicted: "Cardiomegaly".to_string(),
                predicted_probability: 0.75,
                overlay_path: Some("cxr_cam.png".to_string()),
                probabilities,
                config: Some(DiagnosisOptions::default()),
            }),
            ..Default::default()
        };

        let text = toml::to_string_pretty(&metadata).unwrap();
        let parsed: CaptureMetadata = toml::from_str(&text).unwrap();
        let diagnosis = parsed.diagnosis.unwrap();
        assert_eq!(diagnosis.probabilities["Effusion"], 0.25);
        assert_eq!(diagnosis.config, Some(DiagnosisOptions::default()));
    }

    #[test]
    fn test_corrupt_metadata_is_replaced() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.cxrgate.toml");
        fs::write(&path, "this is = = not toml").unwrap();
        let loaded = load_or_create_metadata(&path).unwrap();
        assert!(loaded.gate.is_none());
    }

    #[test]
    fn test_metadata_path() {
        let input = Path::new("/data/captures/cxr_001.jpg");
        assert_eq!(
            metadata_path(input, None).unwrap(),
            PathBuf::from("/data/captures/cxr_001.cxrgate.toml")
        );
        assert_eq!(
            metadata_path(input, Some(Path::new("/out"))).unwrap(),
            PathBuf::from("/out/cxr_001.cxrgate.toml")
        );
    }
}
