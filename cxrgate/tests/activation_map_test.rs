use cxrgate::activation_map::{class_activation_map, normalize_min_max, ActivationMapEngine};
use cxrgate::class_weights::{LabelSet, WeightTable, CHEST_XRAY14_LABELS};
use cxrgate::config::{DiagnosisOptions, ScoreActivation};
use cxrgate::inference::ClassifierOutput;
use cxrgate::PipelineError;
use image::{DynamicImage, GrayImage, Luma};
use ndarray::{Array1, Array2, Array3, ArrayD, IxDyn};
use std::sync::Arc;

#[test]
fn test_normalized_map_spans_unit_interval() {
    let features = Array3::from_shape_fn((3, 5, 6), |(c, y, x)| {
        ((c + 1) as f32 * (x as f32 - y as f32)).sin()
    });
    let weights = Array1::from(vec![0.5, -0.25, 2.0]);

    let cam = class_activation_map(features.view(), weights.view()).unwrap();
    assert!(cam.iter().all(|&v| v >= 0.0));

    let normalized = normalize_min_max(&cam);
    let min = normalized.iter().copied().fold(f32::INFINITY, f32::min);
    let max = normalized.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    assert_eq!(min, 0.0);
    assert!((max - 1.0).abs() < 1e-6);
}

#[test]
fn test_constant_map_normalizes_to_zeros() {
    let normalized = normalize_min_max(&Array2::from_elem((4, 4), 0.37));
    assert!(normalized.iter().all(|&v| v == 0.0));

    // All-negative evidence is rectified away, leaving a flat map
    let features = Array3::from_elem((2, 3, 3), 1.0f32);
    let weights = Array1::from(vec![-1.0, -2.0]);
    let cam = class_activation_map(features.view(), weights.view()).unwrap();
    assert!(normalize_min_max(&cam).iter().all(|&v| v == 0.0));
}

#[test]
fn test_channel_count_must_match_weights() {
    let features = Array3::<f32>::zeros((4, 2, 2));
    let weights = Array1::from(vec![1.0, 1.0]);
    assert!(matches!(
        class_activation_map(features.view(), weights.view()),
        Err(PipelineError::ShapeMismatch(_))
    ));
}

fn capture() -> DynamicImage {
    DynamicImage::ImageLuma8(GrayImage::from_fn(40, 30, |x, _| Luma([(x * 6) as u8])))
}

fn build_engine(activation: ScoreActivation) -> (ActivationMapEngine, Arc<WeightTable>) {
    let channels = 4;
    let values: Vec<f32> = (0..CHEST_XRAY14_LABELS.len() * channels)
        .map(|i| if i % channels == i / channels % channels { 1.0 } else { 0.0 })
        .collect();
    let table = Arc::new(WeightTable::from_flat(values, CHEST_XRAY14_LABELS.len(), channels).unwrap());
    let options = DiagnosisOptions {
        alpha: 0.5,
        score_activation: activation,
    };
    let engine =
        ActivationMapEngine::new(Some(Arc::clone(&table)), LabelSet::chest_xray14(), options).unwrap();
    (engine, table)
}

fn features() -> ArrayD<f32> {
    ArrayD::from_shape_fn(IxDyn(&[1, 4, 7, 7]), |idx| (idx[1] + idx[2] * 7 + idx[3]) as f32)
}

#[test]
fn test_chest_xray14_diagnosis() {
    let (engine, table) = build_engine(ScoreActivation::Identity);
    let mut logits = vec![0.05f32; 14];
    logits[1] = 0.82; // Cardiomegaly
    logits[2] = 0.40;
    let output = ClassifierOutput::new(
        features(),
        ArrayD::from_shape_vec(IxDyn(&[1, 14]), logits).unwrap(),
    );

    let diagnosis = engine.diagnose_output(&capture(), &table, output).unwrap();
    assert_eq!(diagnosis.predicted.label, "Cardiomegaly");
    assert_eq!(diagnosis.probabilities.len(), 14);
    assert_eq!(diagnosis.overlay.dimensions(), (40, 30));
    assert_eq!(diagnosis.activation_map.dim(), (7, 7));

    let top: Vec<&str> = diagnosis
        .top_findings(2)
        .iter()
        .map(|s| s.label.as_str())
        .collect();
    assert_eq!(top, vec!["Cardiomegaly", "Effusion"]);
    assert_eq!(diagnosis.probability_map()["Hernia"], 0.05);
}

#[test]
fn test_scores_are_clamped_and_optionally_squashed() {
    let (engine, table) = build_engine(ScoreActivation::Identity);
    let mut logits = vec![-3.0f32; 14];
    logits[13] = 7.5;
    let output = ClassifierOutput::new(features(), ArrayD::from_shape_vec(IxDyn(&[14]), logits.clone()).unwrap());
    let diagnosis = engine.diagnose_output(&capture(), &table, output).unwrap();
    assert!(diagnosis
        .probabilities
        .iter()
        .all(|s| (0.0..=1.0).contains(&s.probability)));
    assert_eq!(diagnosis.predicted.label, "Hernia");
    assert_eq!(diagnosis.predicted.probability, 1.0);

    let (engine, table) = build_engine(ScoreActivation::Sigmoid);
    let output = ClassifierOutput::new(features(), ArrayD::from_shape_vec(IxDyn(&[14]), logits).unwrap());
    let diagnosis = engine.diagnose_output(&capture(), &table, output).unwrap();
    assert!(diagnosis.predicted.probability > 0.99 && diagnosis.predicted.probability < 1.0);
}

#[test]
fn test_missing_outputs_and_bad_shapes() {
    let (engine, table) = build_engine(ScoreActivation::Identity);
    let logits = ArrayD::from_elem(IxDyn(&[14]), 0.1f32);

    let missing_features = ClassifierOutput {
        features: None,
        logits: Some(logits.clone()),
    };
    assert!(matches!(
        engine.diagnose_output(&capture(), &table, missing_features),
        Err(PipelineError::InferenceOutputMissing("features"))
    ));

    let missing_logits = ClassifierOutput {
        features: Some(features()),
        logits: None,
    };
    assert!(matches!(
        engine.diagnose_output(&capture(), &table, missing_logits),
        Err(PipelineError::InferenceOutputMissing("logits"))
    ));

    let short_logits = ClassifierOutput::new(features(), ArrayD::from_elem(IxDyn(&[13]), 0.1f32));
    assert!(matches!(
        engine.diagnose_output(&capture(), &table, short_logits),
        Err(PipelineError::ShapeMismatch(_))
    ));

    let flat_features = ClassifierOutput::new(ArrayD::from_elem(IxDyn(&[4, 49]), 1.0f32), logits);
    assert!(matches!(
        engine.diagnose_output(&capture(), &table, flat_features),
        Err(PipelineError::ShapeMismatch(_))
    ));
}

#[test]
fn test_engine_rejects_mismatched_weight_table() {
    let table = WeightTable::from_flat(vec![1.0; 8], 2, 4).unwrap();
    let result = ActivationMapEngine::new(
        Some(Arc::new(table)),
        LabelSet::chest_xray14(),
        DiagnosisOptions::default(),
    );
    assert!(matches!(result, Err(PipelineError::ShapeMismatch(_))));
}
