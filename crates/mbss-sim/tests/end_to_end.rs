//! End-to-End Separation Tests
//!
//! Two amplitude-modulated tones at distinct frequencies, mixed without
//! reverberation into four microphones through an explicit matrix, observed
//! by two blinkies. Verifies:
//! - Joint separation reaches more than 15 dB SDR on every source
//! - The convergence trace records one entry per observer call
//! - Blinky pre-emphasis keeps the separation intact
//! - The audio-only baseline runs on the same scene

use mbss_core::{separate, Algorithm, SeparationConfig, SeparationStatus};
use mbss_sim::{sinusoid, ConvergenceTrace, FreeFieldScene, RenderedScene, SceneConfig, Stft};
use ndarray::{array, Array2};
use std::f64::consts::PI;

const SAMPLE_RATE: f64 = 8000.0;
const LENGTH: usize = 8000;
const MIN_SDR_DB: f64 = 15.0;

// ═══════════════════════════════════════════════════════════════════════════════
// SCENE
// ═══════════════════════════════════════════════════════════════════════════════

/// Two sources, four microphones, two blinkies
fn two_tone_scene() -> FreeFieldScene {
    let s1 = sinusoid(1100.0, SAMPLE_RATE, LENGTH, |t| 0.55 + 0.45 * (2.0 * PI * 3.0 * t).sin());
    let s2 = sinusoid(2900.0, SAMPLE_RATE, LENGTH, |t| 0.55 + 0.45 * (2.0 * PI * 5.0 * t).cos());

    // Microphone mixing A (4 × 2), no reverberation
    let mixing: Array2<f64> = array![
        [1.0, 0.6],
        [0.7, 1.0],
        [0.4, 0.9],
        [0.9, 0.3],
    ];

    // Each blinky sits close to one source
    let blinky_gains: Array2<f64> = array![[1.0, 0.1], [0.2, 1.0]];

    FreeFieldScene::new(vec![s1, s2], mixing, blinky_gains).unwrap()
}

fn scene_config(pre_emphasis: bool) -> SceneConfig {
    SceneConfig {
        sample_rate: SAMPLE_RATE,
        frame_size: 16,
        hop: 8,
        snr_db: Some(60.0),
        pre_emphasis,
        ref_mic: 0,
        seed: 1,
    }
}

fn separation_config() -> SeparationConfig {
    SeparationConfig::new(2)
        .with_algorithm(Algorithm::BlinkIvaGauss)
        .with_iterations(50, 20)
        .with_sparse_reg(0.0)
        .with_seed(0)
}

fn render(pre_emphasis: bool) -> (RenderedScene, Stft) {
    let config = scene_config(pre_emphasis);
    let rendered = two_tone_scene().render(&config).unwrap();
    let stft = config.stft().unwrap();
    (rendered, stft)
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_scene_dimensions() {
    let (rendered, stft) = render(false);
    assert_eq!(stft.n_freq(), 9);
    assert_eq!(rendered.mixture.dim(), (999, 9, 4));
    assert_eq!(rendered.blinky_power.dim(), (999, 2));
    assert!(rendered.blinky_power.iter().all(|&u| u >= 0.0));
}

#[test]
fn test_blinkiva_separates_two_tones() {
    let (rendered, stft) = render(false);
    let mut config = separation_config();
    config.observer_interval = 10;

    let mut trace = ConvergenceTrace::new(&stft, &rendered.references);
    let result = separate(
        rendered.mixture.view(),
        rendered.blinky_power.view(),
        &config,
        None,
        Some(&mut trace),
    )
    .unwrap();

    assert_eq!(result.status, SeparationStatus::Completed);
    assert_eq!(result.iterations, 50);
    assert_eq!(result.output.dim(), (999, 9, 2));

    let metrics = rendered.evaluate(&stft, result.output.view()).unwrap();
    for (k, sdr) in metrics.sdr.iter().enumerate() {
        assert!(
            *sdr > MIN_SDR_DB,
            "source {} SDR {:.2} dB below {} dB (SIR {:?})",
            k,
            sdr,
            MIN_SDR_DB,
            metrics.sir
        );
    }

    let iterations: Vec<usize> = trace.entries().iter().map(|e| e.iteration).collect();
    assert_eq!(iterations, vec![10, 20, 30, 40, 50]);
    let last = trace.last().unwrap();
    assert_eq!(last.permutation, metrics.permutation);
    assert!(last.sdr.iter().all(|&sdr| sdr > MIN_SDR_DB));
}

#[test]
fn test_separation_improves_on_mixture() {
    let (rendered, stft) = render(false);

    let mut trace = ConvergenceTrace::new(&stft, &rendered.references);
    let unmixed = rendered.mixture.slice(ndarray::s![.., .., ..2]);
    let before = trace.record(0, unmixed).unwrap().clone();

    let result = separate(
        rendered.mixture.view(),
        rendered.blinky_power.view(),
        &separation_config(),
        None,
        None,
    )
    .unwrap();
    let after = rendered.evaluate(&stft, result.output.view()).unwrap();

    let mean_before = before.sdr.iter().sum::<f64>() / 2.0;
    assert!(after.mean_sdr() > mean_before + 10.0);
}

#[test]
fn test_pre_emphasis_keeps_separation() {
    let (rendered, stft) = render(true);
    let result = separate(
        rendered.mixture.view(),
        rendered.blinky_power.view(),
        &separation_config(),
        None,
        None,
    )
    .unwrap();

    let metrics = rendered.evaluate(&stft, result.output.view()).unwrap();
    assert!(metrics.min_sdr() > MIN_SDR_DB, "SDR {:?}", metrics.sdr);
}

#[test]
fn test_auxiva_baseline_runs() {
    let (rendered, stft) = render(false);
    let config = separation_config().with_algorithm(Algorithm::AuxIvaGauss);
    let result = separate(
        rendered.mixture.view(),
        rendered.blinky_power.view(),
        &config,
        None,
        None,
    )
    .unwrap();

    assert!(!result.is_aborted());
    let metrics = rendered.evaluate(&stft, result.output.view()).unwrap();
    assert!(metrics.sdr.iter().all(|v| v.is_finite()));
}
