//! Finding labels and the per-class linear weights used to build
//! activation maps.

use crate::error::{PipelineError, Result};
use anyhow::Context;
use ndarray::{Array2, ArrayView1};
use std::path::Path;

/// ChestX-ray14 findings, in the classifier's output order
pub const CHEST_XRAY14_LABELS: [&str; 14] = [
    "Atelectasis",
    "Cardiomegaly",
    "Effusion",
    "Infiltration",
    "Mass",
    "Nodule",
    "Pneumonia",
    "Pneumothorax",
    "Consolidation",
    "Edema",
    "Emphysema",
    "Fibrosis",
    "Pleural_Thickening",
    "Hernia",
];

/// Ordered finding names. The order must match the classifier's output and
/// the weight table's rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelSet {
    labels: Vec<String>,
}

impl LabelSet {
    pub fn new<I, S>(labels: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let labels: Vec<String> = labels.into_iter().map(Into::into).collect();
        if labels.is_empty() {
            return Err(PipelineError::InvalidParameter(
                "label set must not be empty".to_string(),
            ));
        }
        Ok(Self { labels })
    }

    pub fn chest_xray14() -> Self {
        Self {
            labels: CHEST_XRAY14_LABELS.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.labels.get(index).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.labels.iter().map(String::as_str)
    }
}

impl Default for LabelSet {
    fn default() -> Self {
        Self::chest_xray14()
    }
}

/// `L x C` table, row `i` is the linear weight vector of label `i`.
/// Loaded once and shared read-only.
#[derive(Debug, Clone)]
pub struct WeightTable {
    weights: Array2<f32>,
}

impl WeightTable {
    pub fn from_flat(values: Vec<f32>, labels: usize, channels: usize) -> Result<Self> {
        if labels == 0 || channels == 0 {
            return Err(PipelineError::ShapeMismatch(format!(
                "weight table must be non-empty, got {labels}x{channels}"
            )));
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(PipelineError::NonFinite {
                stage: "weight table",
            });
        }
        let weights = Array2::from_shape_vec((labels, channels), values).map_err(|e| {
            PipelineError::ShapeMismatch(format!(
                "weight table does not hold {labels}x{channels} values: {e}"
            ))
        })?;
        Ok(Self { weights })
    }

    /// Decode little-endian `f32` values; the channel count is inferred
    pub fn from_le_bytes(bytes: &[u8], labels: usize) -> Result<Self> {
        if bytes.len() % 4 != 0 {
            return Err(PipelineError::ShapeMismatch(format!(
                "weight file length {} is not a multiple of 4",
                bytes.len()
            )));
        }
        let count = bytes.len() / 4;
        if labels == 0 || count % labels != 0 {
            return Err(PipelineError::ShapeMismatch(format!(
                "{count} weights cannot be split into {labels} rows"
            )));
        }
        let values: Vec<f32> = bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();
        Self::from_flat(values, labels, count / labels)
    }

    pub fn labels(&self) -> usize {
        self.weights.nrows()
    }

    pub fn channels(&self) -> usize {
        self.weights.ncols()
    }

    pub fn row(&self, label: usize) -> Option<ArrayView1<'_, f32>> {
        (label < self.labels()).then(|| self.weights.row(label))
    }
}

/// Read a weight table written as raw little-endian `f32`
pub fn read_weight_table(path: &Path, labels: &LabelSet) -> anyhow::Result<WeightTable> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read weight table: {}", path.display()))?;
    let table = WeightTable::from_le_bytes(&bytes, labels.len())
        .with_context(|| format!("Invalid weight table: {}", path.display()))?;
    log::debug!(
        "Loaded weight table {}x{} from {}",
        table.labels(),
        table.channels(),
        path.display()
    );
    Ok(table)
}
