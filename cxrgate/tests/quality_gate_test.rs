use cxrgate::config::GateConfig;
use cxrgate::error::RejectionReason;
use cxrgate::quality_gate::{decide, evaluate_coverage, AttemptCounter, QualityGate, Verdict};
use cxrgate::segmentation_mask::{self, coverage_of, resize_nearest, FOREGROUND};
use cxrgate::sharpness::SharpnessScores;
use cxrgate::{CancellationToken, SegmentationModel};
use image::{DynamicImage, GrayImage, Luma, Rgb, RgbImage};
use ndarray::{Array4, ArrayD, IxDyn};

fn scores(gradient_energy: f64, laplacian_variance: f64) -> SharpnessScores {
    SharpnessScores {
        gradient_energy,
        laplacian_variance,
    }
}

#[test]
fn test_decision_table() {
    let config = GateConfig::default();
    let cases = [
        (0.10, 4000.0, 500.0, Verdict::Accepted),
        (0.10, 1000.0, 900.0, Verdict::Accepted),
        (0.10, 1000.0, 100.0, Verdict::Rejected(RejectionReason::RegionBlurry)),
        (0.02, 9000.0, 9000.0, Verdict::Rejected(RejectionReason::MaskUnreliable)),
        (0.80, 9000.0, 9000.0, Verdict::Rejected(RejectionReason::MaskUnreliable)),
        (0.80, 0.0, 0.0, Verdict::Rejected(RejectionReason::MaskUnreliable)),
    ];

    for (coverage, grad, lap, expected) in cases {
        assert_eq!(
            decide(coverage, &scores(grad, lap), &config),
            expected,
            "coverage={coverage} grad={grad} lap={lap}"
        );
    }
}

#[test]
fn test_thresholds_and_bounds_are_inclusive() {
    let config = GateConfig::default();
    assert!(evaluate_coverage(0.05, &config).is_none());
    assert!(evaluate_coverage(0.75, &config).is_none());
    assert!(decide(0.3, &scores(3500.0, 0.0), &config).is_accepted());
    assert!(decide(0.3, &scores(0.0, 750.0), &config).is_accepted());
    assert!(!decide(0.3, &scores(3499.9, 749.9), &config).is_accepted());
}

#[test]
fn test_guidance_raised_once_per_streak() {
    let mut counter = AttemptCounter::new(5);
    let signals: Vec<bool> = (0..8).map(|_| counter.record_rejection()).collect();
    assert_eq!(signals.iter().filter(|&&s| s).count(), 1);
    assert!(signals[4]);
    assert_eq!(counter.consecutive_rejections(), 8);

    counter.record_acceptance();
    assert_eq!(counter.consecutive_rejections(), 0);
    let again: Vec<bool> = (0..5).map(|_| counter.record_rejection()).collect();
    assert_eq!(again, vec![false, false, false, false, true]);
}

#[test]
fn test_thresholding_is_idempotent() {
    let probs: Vec<f32> = (0..64).map(|i| i as f32 / 63.0).collect();
    let first = segmentation_mask::build(&probs, 8, 8, 0.1).unwrap();

    let as_probs: Vec<f32> = first
        .mask
        .pixels()
        .map(|p| if p[0] == FOREGROUND { 1.0 } else { 0.0 })
        .collect();
    let second = segmentation_mask::build(&as_probs, 8, 8, 0.1).unwrap();

    assert_eq!(first.mask, second.mask);
    assert_eq!(first.coverage, second.coverage);
}

#[test]
fn test_nearest_resize_keeps_mask_binary() {
    let mask = GrayImage::from_fn(17, 11, |x, y| {
        Luma([if (x * 3 + y) % 5 == 0 { FOREGROUND } else { 0 }])
    });
    for (w, h) in [(1, 1), (5, 40), (34, 22), (100, 3)] {
        let resized = resize_nearest(&mask, w, h);
        assert_eq!(resized.dimensions(), (w, h));
        assert!(resized.pixels().all(|p| p[0] == 0 || p[0] == FOREGROUND));
    }
    assert_eq!(coverage_of(&resize_nearest(&mask, 17, 11)), coverage_of(&mask));
}

/// Lung fields as a centered block covering a quarter of the frame
struct CenteredLungs;

impl SegmentationModel for CenteredLungs {
    fn infer_segmentation(&self, input: &Array4<f32>) -> anyhow::Result<ArrayD<f32>> {
        let (_, _, h, w) = input.dim();
        Ok(ArrayD::from_shape_fn(IxDyn(&[1, 1, h, w]), |idx| {
            let inside = (h / 4..3 * h / 4).contains(&idx[2]) && (w / 4..3 * w / 4).contains(&idx[3]);
            if inside {
                0.9
            } else {
                0.01
            }
        }))
    }
}

#[test]
fn test_gate_accepts_sharp_and_rejects_flat_captures() {
    let gate = QualityGate::new(GateConfig::default()).unwrap();
    let cancel = CancellationToken::new();

    let sharp = DynamicImage::ImageRgb8(RgbImage::from_fn(96, 80, |x, y| {
        let v = if (x / 3 + y / 3) % 2 == 0 { 240 } else { 10 };
        Rgb([v, v, v])
    }));
    let assessment = gate.assess(&sharp, &CenteredLungs, &cancel).unwrap();
    assert_eq!(assessment.verdict(), Verdict::Accepted);
    let report = assessment.report().unwrap();
    assert_eq!(report.mask_original.dimensions(), (96, 80));
    assert!((report.coverage - 0.25).abs() < 1e-6);

    let flat = DynamicImage::ImageLuma8(GrayImage::from_pixel(96, 80, Luma([128])));
    let assessment = gate.assess(&flat, &CenteredLungs, &cancel).unwrap();
    assert_eq!(
        assessment.verdict(),
        Verdict::Rejected(RejectionReason::RegionBlurry)
    );
}
