//! STFT analysis and synthesis
//!
//! Frames start at sample 0 and advance by `hop`; a signal of length `n`
//! yields `(n - N) / hop + 1` frames. The synthesis window is derived from
//! the analysis window so that overlap-add restores every sample covered by
//! `N / hop` full frames.

use std::sync::Arc;

use ndarray::{Array2, Array3, ArrayView2, ArrayView3, Axis};
use num_complex::Complex64;
use realfft::{ComplexToReal, RealFftPlanner, RealToComplex};

use crate::{SimError, SimResult};

/// Periodic Hann window
pub fn hann(size: usize) -> Vec<f64> {
    (0..size)
        .map(|i| 0.5 * (1.0 - (2.0 * std::f64::consts::PI * i as f64 / size as f64).cos()))
        .collect()
}

/// Synthesis window for perfect reconstruction with `analysis` at `hop`
///
/// `ws[n] = wa[n] / Σ_i wa[(n mod hop) + i·hop]²`
pub fn synthesis_window(analysis: &[f64], hop: usize) -> SimResult<Vec<f64>> {
    let size = analysis.len();
    if hop == 0 || hop > size {
        return Err(SimError::ConfigError(format!(
            "hop must lie in 1..={}, got {}",
            size, hop
        )));
    }

    let norm: Vec<f64> = (0..hop)
        .map(|p| (p..size).step_by(hop).map(|n| analysis[n] * analysis[n]).sum())
        .collect();
    if norm.iter().any(|&v| v <= 0.0) {
        return Err(SimError::ConfigError(
            "analysis window has no energy at some hop offset".into(),
        ));
    }

    Ok(analysis
        .iter()
        .enumerate()
        .map(|(n, &w)| w / norm[n % hop])
        .collect())
}

/// Short-time Fourier transform pair
pub struct Stft {
    frame_size: usize,
    hop: usize,
    forward: Arc<dyn RealToComplex<f64>>,
    inverse: Arc<dyn ComplexToReal<f64>>,
    analysis: Vec<f64>,
    synthesis: Vec<f64>,
}

impl Stft {
    /// Hann-windowed STFT with `frame_size` samples per frame
    pub fn new(frame_size: usize, hop: usize) -> SimResult<Self> {
        if frame_size < 2 || frame_size % 2 != 0 {
            return Err(SimError::ConfigError(format!(
                "frame size must be even and >= 2, got {}",
                frame_size
            )));
        }

        let analysis = hann(frame_size);
        let synthesis = synthesis_window(&analysis, hop)?;

        let mut planner = RealFftPlanner::<f64>::new();
        let forward = planner.plan_fft_forward(frame_size);
        let inverse = planner.plan_fft_inverse(frame_size);

        Ok(Self {
            frame_size,
            hop,
            forward,
            inverse,
            analysis,
            synthesis,
        })
    }

    /// Half-overlap STFT, the usual setting
    pub fn half_overlap(frame_size: usize) -> SimResult<Self> {
        Self::new(frame_size, frame_size / 2)
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn hop(&self) -> usize {
        self.hop
    }

    /// Number of frequency bins, N/2 + 1
    pub fn n_freq(&self) -> usize {
        self.frame_size / 2 + 1
    }

    /// Number of frames for a signal of `len` samples
    pub fn n_frames(&self, len: usize) -> usize {
        if len < self.frame_size {
            0
        } else {
            (len - self.frame_size) / self.hop + 1
        }
    }

    /// Length of the overlap-add output for `n_frames` frames
    pub fn output_len(&self, n_frames: usize) -> usize {
        if n_frames == 0 {
            0
        } else {
            (n_frames - 1) * self.hop + self.frame_size
        }
    }

    pub fn analysis_window(&self) -> &[f64] {
        &self.analysis
    }

    pub fn synthesis_window(&self) -> &[f64] {
        &self.synthesis
    }

    /// Spectra of one signal (T × F)
    pub fn analyze(&self, signal: &[f64]) -> SimResult<Array2<Complex64>> {
        let n_frames = self.n_frames(signal.len());
        let mut spectra = Array2::zeros((n_frames, self.n_freq()));
        let mut input = vec![0.0f64; self.frame_size];
        let mut spectrum = vec![Complex64::new(0.0, 0.0); self.n_freq()];

        for (t, mut row) in spectra.outer_iter_mut().enumerate() {
            let start = t * self.hop;
            for (i, x) in input.iter_mut().enumerate() {
                *x = signal[start + i] * self.analysis[i];
            }
            self.forward
                .process(&mut input, &mut spectrum)
                .map_err(|e| SimError::FftError(e.to_string()))?;
            for (y, &z) in row.iter_mut().zip(spectrum.iter()) {
                *y = z;
            }
        }
        Ok(spectra)
    }

    /// Spectra of equal-length channels (T × F × M)
    pub fn analyze_multichannel(&self, channels: &[Vec<f64>]) -> SimResult<Array3<Complex64>> {
        let len = channels.first().map(Vec::len).unwrap_or(0);
        let n_frames = self.n_frames(len);
        let mut out = Array3::zeros((n_frames, self.n_freq(), channels.len()));

        for (m, channel) in channels.iter().enumerate() {
            if channel.len() != len {
                return Err(SimError::LengthMismatch {
                    expected: len,
                    got: channel.len(),
                });
            }
            let spectra = self.analyze(channel)?;
            out.index_axis_mut(Axis(2), m).assign(&spectra);
        }
        Ok(out)
    }

    /// Per-frame power `Σ_f |X[t, f]|²`
    pub fn frame_power(&self, signal: &[f64]) -> SimResult<Vec<f64>> {
        let spectra = self.analyze(signal)?;
        Ok(spectra
            .outer_iter()
            .map(|row| row.iter().map(|z| z.norm_sqr()).sum())
            .collect())
    }

    /// Overlap-add synthesis of one channel (T × F)
    pub fn synthesize(&self, spectra: ArrayView2<Complex64>) -> SimResult<Vec<f64>> {
        let (n_frames, n_freq) = spectra.dim();
        if n_freq != self.n_freq() {
            return Err(SimError::LengthMismatch {
                expected: self.n_freq(),
                got: n_freq,
            });
        }

        let mut output = vec![0.0f64; self.output_len(n_frames)];
        let mut spectrum = vec![Complex64::new(0.0, 0.0); n_freq];
        let mut frame = vec![0.0f64; self.frame_size];
        let scale = 1.0 / self.frame_size as f64;

        for (t, row) in spectra.outer_iter().enumerate() {
            spectrum.iter_mut().zip(row.iter()).for_each(|(s, &z)| *s = z);
            // The real inverse needs purely real DC and Nyquist bins
            spectrum[0].im = 0.0;
            spectrum[n_freq - 1].im = 0.0;

            self.inverse
                .process(&mut spectrum, &mut frame)
                .map_err(|e| SimError::FftError(e.to_string()))?;

            let start = t * self.hop;
            for (i, &x) in frame.iter().enumerate() {
                output[start + i] += x * scale * self.synthesis[i];
            }
        }
        Ok(output)
    }

    /// Overlap-add synthesis of every channel along the last axis (T × F × C)
    pub fn synthesize_multichannel(&self, spectra: ArrayView3<Complex64>) -> SimResult<Vec<Vec<f64>>> {
        spectra
            .axis_iter(Axis(2))
            .map(|channel| self.synthesize(channel))
            .collect()
    }
}
