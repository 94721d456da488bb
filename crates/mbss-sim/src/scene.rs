//! Free-field scenes
//!
//! Instantaneous mixing without reverberation: microphone `m` records
//! `Σ_k A[m, k] s_k + noise`, blinky `l` records `Σ_k G[l, k] s_k`. The
//! blinky reading handed to the separation is the per-frame STFT power of
//! that signal, optionally after pre-emphasis.

use ndarray::{Array2, Array3};
use num_complex::Complex64;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::metrics::{bss_eval, SeparationMetrics};
use crate::stft::Stft;
use crate::{SimError, SimResult};

/// Rendering parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SceneConfig {
    /// Sampling rate (Hz)
    pub sample_rate: f64,
    /// STFT frame size
    pub frame_size: usize,
    /// STFT hop
    pub hop: usize,
    /// Sensor noise SNR at the microphones in dB, relative to the total
    /// source power at the reference mic (None = noiseless)
    pub snr_db: Option<f64>,
    /// First difference of the blinky signals before power extraction
    pub pre_emphasis: bool,
    /// Reference microphone for the source images
    pub ref_mic: usize,
    /// Noise seed
    pub seed: u64,
}

impl Default for SceneConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000.0,
            frame_size: 512,
            hop: 256,
            snr_db: Some(60.0),
            pre_emphasis: false,
            ref_mic: 0,
            seed: 0,
        }
    }
}

impl SceneConfig {
    /// Build the matching STFT
    pub fn stft(&self) -> SimResult<Stft> {
        Stft::new(self.frame_size, self.hop)
    }
}

/// Dry sources with their mixing
#[derive(Debug, Clone)]
pub struct FreeFieldScene {
    /// Source signals, all of the same length
    pub sources: Vec<Vec<f64>>,
    /// Microphone mixing A (M × S)
    pub mixing: Array2<f64>,
    /// Blinky mixing G (L × S)
    pub blinky_gains: Array2<f64>,
}

/// Rendered scene, ready for separation
#[derive(Debug, Clone)]
pub struct RenderedScene {
    /// Microphone signals
    pub mics: Vec<Vec<f64>>,
    /// Source images at the reference microphone, `A[ref, k] s_k`
    pub references: Vec<Vec<f64>>,
    /// Blinky signals before power extraction
    pub blinky_signals: Vec<Vec<f64>>,
    /// Mixture STFT X (T × F × M)
    pub mixture: Array3<Complex64>,
    /// Blinky power U (T × L)
    pub blinky_power: Array2<f64>,
    /// Per-source activations, frame power of each dry source (T × S)
    pub source_power: Array2<f64>,
}

impl FreeFieldScene {
    /// Validate dimensions and lengths
    pub fn new(sources: Vec<Vec<f64>>, mixing: Array2<f64>, blinky_gains: Array2<f64>) -> SimResult<Self> {
        let n_src = sources.len();
        if n_src == 0 {
            return Err(SimError::ConfigError("scene has no sources".into()));
        }
        let len = sources[0].len();
        if let Some(bad) = sources.iter().find(|s| s.len() != len) {
            return Err(SimError::LengthMismatch {
                expected: len,
                got: bad.len(),
            });
        }
        if mixing.ncols() != n_src {
            return Err(SimError::LengthMismatch {
                expected: n_src,
                got: mixing.ncols(),
            });
        }
        if blinky_gains.ncols() != n_src {
            return Err(SimError::LengthMismatch {
                expected: n_src,
                got: blinky_gains.ncols(),
            });
        }
        Ok(Self {
            sources,
            mixing,
            blinky_gains,
        })
    }

    pub fn n_src(&self) -> usize {
        self.sources.len()
    }

    pub fn n_mics(&self) -> usize {
        self.mixing.nrows()
    }

    pub fn n_blinkies(&self) -> usize {
        self.blinky_gains.nrows()
    }

    fn mix(&self, gains: &Array2<f64>) -> Vec<Vec<f64>> {
        let len = self.sources[0].len();
        gains
            .outer_iter()
            .map(|row| {
                (0..len)
                    .map(|n| row.iter().zip(&self.sources).map(|(g, s)| g * s[n]).sum())
                    .collect()
            })
            .collect()
    }

    /// Mix, add noise and transform
    pub fn render(&self, config: &SceneConfig) -> SimResult<RenderedScene> {
        if config.ref_mic >= self.n_mics() {
            return Err(SimError::ConfigError(format!(
                "reference mic {} out of {} microphones",
                config.ref_mic,
                self.n_mics()
            )));
        }
        let stft = config.stft()?;

        let references: Vec<Vec<f64>> = self
            .sources
            .iter()
            .enumerate()
            .map(|(k, s)| s.iter().map(|x| self.mixing[[config.ref_mic, k]] * x).collect())
            .collect();

        let mut mics = self.mix(&self.mixing);
        if let Some(snr_db) = config.snr_db {
            let source_power: f64 = references.iter().map(|r| variance(r)).sum();
            let sigma = (10f64.powf(-snr_db / 10.0) * source_power).sqrt();
            // Uniform noise on [-a, a] has standard deviation a / √3
            let amplitude = sigma * 3f64.sqrt();
            let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
            for mic in &mut mics {
                for x in mic.iter_mut() {
                    *x += amplitude * (2.0 * rng.random::<f64>() - 1.0);
                }
            }
        }

        let mut blinky_signals = self.mix(&self.blinky_gains);
        if config.pre_emphasis {
            blinky_signals = blinky_signals.iter().map(|b| pre_emphasis(b)).collect();
        }

        let mixture = stft.analyze_multichannel(&mics)?;
        let blinky_power = frame_powers(&stft, &blinky_signals, mixture.dim().0)?;
        let source_power = frame_powers(&stft, &self.sources, mixture.dim().0)?;

        log::debug!(
            "Rendered scene: {} sources, {} mics, {} blinkies, {} frames",
            self.n_src(),
            self.n_mics(),
            self.n_blinkies(),
            mixture.dim().0
        );

        Ok(RenderedScene {
            mics,
            references,
            blinky_signals,
            mixture,
            blinky_power,
            source_power,
        })
    }
}

impl RenderedScene {
    /// Synthesize separated spectra (T × F × S) and score them
    pub fn evaluate(&self, stft: &Stft, separated: ndarray::ArrayView3<Complex64>) -> SimResult<SeparationMetrics> {
        let estimates = stft.synthesize_multichannel(separated)?;
        let skip = stft.frame_size();
        bss_eval(&self.references, &estimates, skip)
    }
}

/// Per-frame STFT power of each signal, as columns (T × C)
fn frame_powers(stft: &Stft, signals: &[Vec<f64>], n_frames: usize) -> SimResult<Array2<f64>> {
    let mut power = Array2::zeros((n_frames, signals.len()));
    for (c, signal) in signals.iter().enumerate() {
        for (t, p) in stft.frame_power(signal)?.into_iter().enumerate().take(n_frames) {
            power[[t, c]] = p;
        }
    }
    Ok(power)
}

fn variance(x: &[f64]) -> f64 {
    if x.is_empty() {
        return 0.0;
    }
    let mean = x.iter().sum::<f64>() / x.len() as f64;
    x.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / x.len() as f64
}

/// First difference `y[n] = x[n + 1] - x[n]`, last sample zero
///
/// Flattens the spectral tilt of the blinky signals before their power is
/// taken.
pub fn pre_emphasis(signal: &[f64]) -> Vec<f64> {
    let mut out: Vec<f64> = signal.windows(2).map(|w| w[1] - w[0]).collect();
    if !signal.is_empty() {
        out.push(0.0);
    }
    out
}

/// Amplitude-modulated sinusoid `env(t) · sin(2π f t)`
pub fn sinusoid(freq: f64, sample_rate: f64, len: usize, envelope: impl Fn(f64) -> f64) -> Vec<f64> {
    (0..len)
        .map(|i| {
            let t = i as f64 / sample_rate;
            envelope(t) * (2.0 * std::f64::consts::PI * freq * t).sin()
        })
        .collect()
}
