//! Classifier scoring and class activation maps.
//!
//! The engine runs the classifier on a 224x224 tensor, turns the scores
//! into per-label probabilities, and for the top label builds
//! `cam[h, w] = relu(sum_c relu(f[c, h, w]) * weight[label][c])`, min-max
//! normalized to [0, 1]. The small map is only upsampled when rendering.

use crate::activation_overlay::render_overlay;
use crate::class_weights::{LabelSet, WeightTable};
use crate::config::DiagnosisOptions;
use crate::error::{PipelineError, Result};
use crate::inference::{ClassifierModel, ClassifierOutput};
use crate::preprocessing::{prepare, TensorSpec};
use image::{DynamicImage, RgbImage};
use log::debug;
use ndarray::{Array2, ArrayD, ArrayView1, ArrayView3, Axis, Ix3, Ix4};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Spread below which a map is treated as flat
const FLAT_EPSILON: f32 = 1e-12;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LabelScore {
    pub label: String,
    pub probability: f32,
}

/// Result of a diagnostic run on an accepted capture
#[derive(Debug, Clone)]
pub struct Diagnosis {
    /// Every configured label, in label order
    pub probabilities: Vec<LabelScore>,
    pub predicted: LabelScore,
    /// Normalized map at feature-map resolution
    pub activation_map: Array2<f32>,
    /// Colorized map blended over the capture, at capture resolution
    pub overlay: RgbImage,
}

impl Diagnosis {
    pub fn probability_map(&self) -> BTreeMap<String, f32> {
        self.probabilities
            .iter()
            .map(|s| (s.label.clone(), s.probability))
            .collect()
    }

    /// Highest-probability labels first
    pub fn top_findings(&self, k: usize) -> Vec<&LabelScore> {
        let mut sorted: Vec<&LabelScore> = self.probabilities.iter().collect();
        sorted.sort_by(|a, b| b.probability.total_cmp(&a.probability));
        sorted.truncate(k);
        sorted
    }
}

pub struct ActivationMapEngine {
    weights: Option<Arc<WeightTable>>,
    labels: LabelSet,
    options: DiagnosisOptions,
    spec: TensorSpec,
}

impl ActivationMapEngine {
    /// The weight table is optional so that a missing table surfaces as
    /// `WeightsUnavailable` at diagnosis time.
    pub fn new(
        weights: Option<Arc<WeightTable>>,
        labels: LabelSet,
        options: DiagnosisOptions,
    ) -> Result<Self> {
        options.validate()?;
        if let Some(table) = &weights {
            if table.labels() != labels.len() {
                return Err(PipelineError::ShapeMismatch(format!(
                    "weight table has {} rows but {} labels are configured",
                    table.labels(),
                    labels.len()
                )));
            }
        }
        Ok(Self {
            weights,
            labels,
            options,
            spec: TensorSpec::classifier(),
        })
    }

    pub fn labels(&self) -> &LabelSet {
        &self.labels
    }

    pub fn diagnose(
        &self,
        image: &DynamicImage,
        classifier: &dyn ClassifierModel,
    ) -> Result<Diagnosis> {
        let weights = self
            .weights
            .as_deref()
            .ok_or(PipelineError::WeightsUnavailable)?;

        let input = prepare(image, &self.spec)?;
        let output = classifier
            .infer_classifier(&input)
            .map_err(|e| PipelineError::Inference(format!("{e:#}")))?;
        self.diagnose_output(image, weights, output)
    }

    /// Everything after inference; split out so the numeric path can be
    /// driven with synthetic outputs.
    pub fn diagnose_output(
        &self,
        image: &DynamicImage,
        weights: &WeightTable,
        output: ClassifierOutput,
    ) -> Result<Diagnosis> {
        let ClassifierOutput { features, logits } = output;
        let features = features.ok_or(PipelineError::InferenceOutputMissing("features"))?;
        let logits = logits.ok_or(PipelineError::InferenceOutputMissing("logits"))?;

        let probabilities = self.score(&logits)?;
        let predicted_index = argmax(&probabilities);
        let predicted = probabilities[predicted_index].clone();
        debug!(
            "Predicted {} ({:.4}) at index {}",
            predicted.label, predicted.probability, predicted_index
        );

        let features = feature_view(&features)?;
        let row = weights.row(predicted_index).ok_or_else(|| {
            PipelineError::ShapeMismatch(format!(
                "no weight row for label index {predicted_index}"
            ))
        })?;
        let cam = class_activation_map(features, row)?;
        let activation_map = normalize_min_max(&cam);

        let overlay = render_overlay(image, &activation_map, self.options.alpha)?;

        Ok(Diagnosis {
            probabilities,
            predicted,
            activation_map,
            overlay,
        })
    }

    fn score(&self, logits: &ArrayD<f32>) -> Result<Vec<LabelScore>> {
        if logits.len() != self.labels.len() {
            return Err(PipelineError::ShapeMismatch(format!(
                "classifier returned {} scores for {} labels",
                logits.len(),
                self.labels.len()
            )));
        }
        if logits.iter().any(|v| !v.is_finite()) {
            return Err(PipelineError::NonFinite { stage: "classifier" });
        }

        Ok(self
            .labels
            .iter()
            .zip(logits.iter())
            .map(|(label, &score)| LabelScore {
                label: label.to_string(),
                probability: self.options.score_activation.apply(score),
            })
            .collect())
    }
}

/// Index of the highest probability; the first one wins ties
fn argmax(scores: &[LabelScore]) -> usize {
    let mut best = 0;
    for (i, s) in scores.iter().enumerate().skip(1) {
        if s.probability > scores[best].probability {
            best = i;
        }
    }
    best
}

/// Accept `[1, C, H, W]` or `[C, H, W]`
fn feature_view(features: &ArrayD<f32>) -> Result<ArrayView3<'_, f32>> {
    match features.ndim() {
        4 => {
            let view = features
                .view()
                .into_dimensionality::<Ix4>()
                .map_err(|e| PipelineError::ShapeMismatch(e.to_string()))?;
            if view.len_of(Axis(0)) != 1 {
                return Err(PipelineError::ShapeMismatch(format!(
                    "feature batch must be 1, got {}",
                    view.len_of(Axis(0))
                )));
            }
            Ok(view.index_axis_move(Axis(0), 0))
        }
        3 => features
            .view()
            .into_dimensionality::<Ix3>()
            .map_err(|e| PipelineError::ShapeMismatch(e.to_string())),
        _ => Err(PipelineError::ShapeMismatch(format!(
            "features must be [1, C, H, W], got {:?}",
            features.shape()
        ))),
    }
}

/// Weighted sum of rectified feature channels, rectified again.
/// `features` is `[C, H, W]`; `weights` has length C.
pub fn class_activation_map(
    features: ArrayView3<'_, f32>,
    weights: ArrayView1<'_, f32>,
) -> Result<Array2<f32>> {
    let (channels, height, width) = features.dim();
    if channels != weights.len() {
        return Err(PipelineError::ShapeMismatch(format!(
            "feature map has {channels} channels but the weight row has {}",
            weights.len()
        )));
    }
    if height == 0 || width == 0 {
        return Err(PipelineError::ShapeMismatch(
            "feature map has no spatial extent".to_string(),
        ));
    }
    if features.iter().any(|v| !v.is_finite()) {
        return Err(PipelineError::NonFinite { stage: "features" });
    }

    let mut cam = Array2::<f32>::zeros((height, width));
    for (channel, &w) in features.outer_iter().zip(weights.iter()) {
        if w == 0.0 {
            continue;
        }
        cam.zip_mut_with(&channel, |acc, &f| *acc += f.max(0.0) * w);
    }
    cam.mapv_inplace(|v| v.max(0.0));

    Ok(cam)
}

/// Rescale to [0, 1]; a flat map becomes all zeros
pub fn normalize_min_max(map: &Array2<f32>) -> Array2<f32> {
    let min = map.iter().copied().fold(f32::INFINITY, f32::min);
    let max = map.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let range = max - min;

    if !range.is_finite() || range <= FLAT_EPSILON {
        return Array2::zeros(map.dim());
    }
    map.mapv(|v| ((v - min) / range).clamp(0.0, 1.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use ndarray::{Array3, IxDyn};

    fn labels3() -> LabelSet {
        LabelSet::new(["A", "B", "C"]).unwrap()
    }

    fn engine(weights: Option<WeightTable>) -> ActivationMapEngine {
        ActivationMapEngine::new(weights.map(Arc::new), labels3(), DiagnosisOptions::default())
            .unwrap()
    }

    fn gray_image() -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(28, 21, Rgb([90, 90, 90])))
    }

    /// Two channels on a 2x2 grid: channel 0 lights the top-left cell,
    /// channel 1 the bottom-right.
    fn two_channel_features() -> ArrayD<f32> {
        let mut f = ArrayD::zeros(IxDyn(&[1, 2, 2, 2]));
        f[[0, 0, 0, 0]] = 3.0;
        f[[0, 1, 1, 1]] = 2.0;
        f
    }

    #[test]
    fn test_cam_relu_and_weighting() {
        let mut features = Array3::<f32>::zeros((2, 1, 3));
        features[[0, 0, 0]] = 2.0;
        features[[0, 0, 1]] = -5.0; // rectified away
        features[[1, 0, 2]] = 1.0;

        let cam = class_activation_map(features.view(), ArrayView1::from(&[1.5, -4.0])).unwrap();
        assert_eq!(cam[[0, 0]], 3.0);
        assert_eq!(cam[[0, 1]], 0.0);
        assert_eq!(cam[[0, 2]], 0.0); // negative weight, rectified
    }

    #[test]
    fn test_cam_channel_mismatch() {
        let features = Array3::<f32>::zeros((4, 2, 2));
        assert!(matches!(
            class_activation_map(features.view(), ArrayView1::from(&[1.0, 2.0])),
            Err(PipelineError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_normalize_min_max() {
        let map = ndarray::array![[1.0, 3.0], [2.0, 5.0]];
        let norm = normalize_min_max(&map);
        assert_eq!(norm[[0, 0]], 0.0);
        assert_eq!(norm[[1, 1]], 1.0);
        assert_eq!(norm[[0, 1]], 0.5);

        let flat = Array2::from_elem((7, 7), 4.2f32);
        assert!(normalize_min_max(&flat).iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_argmax_first_wins_ties() {
        let scores: Vec<LabelScore> = [0.2, 0.7, 0.7, 0.1]
            .iter()
            .enumerate()
            .map(|(i, p)| LabelScore {
                label: i.to_string(),
                probability: *p,
            })
            .collect();
        assert_eq!(argmax(&scores), 1);
    }

    #[test]
    fn test_diagnose_output_picks_class_row() {
        // Label B is predicted; its weights favour channel 1
        let weights = WeightTable::from_flat(vec![1.0, 0.0, 0.0, 1.0, 0.5, 0.5], 3, 2).unwrap();
        let engine = engine(Some(weights.clone()));
        let logits = ArrayD::from_shape_vec(IxDyn(&[1, 3]), vec![0.1, 0.8, 0.3]).unwrap();

        let diagnosis = engine
            .diagnose_output(
                &gray_image(),
                &weights,
                ClassifierOutput::new(two_channel_features(), logits),
            )
            .unwrap();

        assert_eq!(diagnosis.predicted.label, "B");
        assert_eq!(diagnosis.probabilities.len(), 3);
        assert_eq!(diagnosis.activation_map[[1, 1]], 1.0);
        assert_eq!(diagnosis.activation_map[[0, 0]], 0.0);
        assert_eq!(diagnosis.overlay.dimensions(), (28, 21));

        let map = diagnosis.probability_map();
        assert_eq!(map["A"], 0.1);
        assert_eq!(map["C"], 0.3);

        let top: Vec<&str> = diagnosis
            .top_findings(2)
            .iter()
            .map(|s| s.label.as_str())
            .collect();
        assert_eq!(top, vec!["B", "C"]);
    }

    #[test]
    fn test_missing_outputs() {
        let weights = WeightTable::from_flat(vec![1.0; 6], 3, 2).unwrap();
        let engine = engine(Some(weights.clone()));
        let logits = ArrayD::from_elem(IxDyn(&[3]), 0.5);

        let no_features = ClassifierOutput {
            features: None,
            logits: Some(logits),
        };
        assert!(matches!(
            engine.diagnose_output(&gray_image(), &weights, no_features),
            Err(PipelineError::InferenceOutputMissing("features"))
        ));

        let no_logits = ClassifierOutput {
            features: Some(two_channel_features()),
            logits: None,
        };
        assert!(matches!(
            engine.diagnose_output(&gray_image(), &weights, no_logits),
            Err(PipelineError::InferenceOutputMissing("logits"))
        ));
    }

    #[test]
    fn test_weights_unavailable() {
        let engine = engine(None);
        let classifier = |_: &ndarray::Array4<f32>| -> anyhow::Result<ClassifierOutput> {
            Ok(ClassifierOutput::default())
        };
        assert!(matches!(
            engine.diagnose(&gray_image(), &classifier),
            Err(PipelineError::WeightsUnavailable)
        ));
    }

    #[test]
    fn test_label_count_mismatch() {
        let weights = WeightTable::from_flat(vec![1.0; 4], 2, 2).unwrap();
        assert!(ActivationMapEngine::new(
            Some(Arc::new(weights)),
            labels3(),
            DiagnosisOptions::default()
        )
        .is_err());
    }

    #[test]
    fn test_sigmoid_scores() {
        let weights = WeightTable::from_flat(vec![1.0; 6], 3, 2).unwrap();
        let options = DiagnosisOptions {
            score_activation: crate::config::ScoreActivation::Sigmoid,
            ..Default::default()
        };
        let engine =
            ActivationMapEngine::new(Some(Arc::new(weights.clone())), labels3(), options).unwrap();
        let logits = ArrayD::from_shape_vec(IxDyn(&[3]), vec![0.0, -20.0, 20.0]).unwrap();

        let diagnosis = engine
            .diagnose_output(
                &gray_image(),
                &weights,
                ClassifierOutput::new(two_channel_features(), logits),
            )
            .unwrap();
        assert_eq!(diagnosis.probabilities[0].probability, 0.5);
        assert!(diagnosis.probabilities[1].probability < 1e-6);
        assert_eq!(diagnosis.predicted.label, "C");
    }
}
