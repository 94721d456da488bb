//! Source power models
//!
//! Every source is modelled as a zero-mean complex Gaussian whose variance is
//! constant across frequency and varies over time frames. The variance of
//! source `k` at frame `t` is the activation `R[t, k]`. A model decides how the
//! activations are re-estimated from the audio-derived power
//! `P[t, k] = Σ_f |Y[t, f, k]|²` between two demixing updates.
//!
//! - [`BlinkyNmf`]: joint Itakura-Saito factorization of audio and blinky power
//! - [`GaussPower`]: closed-form audio-only estimate `R = P / F`

mod gauss;
mod nmf;

pub use gauss::GaussPower;
pub use nmf::BlinkyNmf;

use ndarray::{Array1, Array2, ArrayView2, Axis};
use rand::Rng;

/// Re-estimation strategy for the source activations
pub trait SourcePowerModel: Send + Sync {
    /// Model name for logs
    fn name(&self) -> &'static str;

    /// Update activations (and gains) from the current audio power `P` (T × n_src)
    fn update(&self, state: &mut PowerState, audio_power: ArrayView2<f64>, n_freq: usize);

    /// Cost minimized by [`SourcePowerModel::update`]
    fn cost(&self, state: &PowerState, audio_power: ArrayView2<f64>, n_freq: usize) -> f64;
}

/// Nonnegative power-model factors
///
/// `activations` is T × K, `gains` is K × L. The first `n_src` columns of the
/// activations are the source variances; further columns only explain blinky power.
#[derive(Debug, Clone, PartialEq)]
pub struct PowerState {
    /// Activations R (T × K)
    pub activations: Array2<f64>,
    /// Gains G (K × L)
    pub gains: Array2<f64>,
    n_src: usize,
}

impl PowerState {
    /// Create state from explicit factors
    pub fn new(activations: Array2<f64>, gains: Array2<f64>, n_src: usize) -> Self {
        debug_assert!(activations.ncols() >= n_src);
        debug_assert_eq!(activations.ncols(), gains.nrows());
        Self {
            activations,
            gains,
            n_src,
        }
    }

    /// Uniform random factors in `[floor, 1)`
    ///
    /// Activations are drawn first (row-major), then gains, so a given seed
    /// always produces the same pair.
    pub fn random<R: Rng>(
        rng: &mut R,
        n_frames: usize,
        n_components: usize,
        n_src: usize,
        n_blinkies: usize,
        floor: f64,
    ) -> Self {
        let activations =
            Array2::from_shape_simple_fn((n_frames, n_components), || rng.random::<f64>().max(floor));
        let gains = Self::random_gains(rng, n_components, n_blinkies, floor);
        Self::new(activations, gains, n_src)
    }

    /// Caller-supplied activations with random gains
    pub fn with_activations<R: Rng>(
        rng: &mut R,
        activations: Array2<f64>,
        n_src: usize,
        n_blinkies: usize,
        floor: f64,
    ) -> Self {
        let activations = activations.mapv(|r| r.max(floor));
        let gains = Self::random_gains(rng, activations.ncols(), n_blinkies, floor);
        Self::new(activations, gains, n_src)
    }

    fn random_gains<R: Rng>(rng: &mut R, n_components: usize, n_blinkies: usize, floor: f64) -> Array2<f64> {
        Array2::from_shape_simple_fn((n_components, n_blinkies), || rng.random::<f64>().max(floor))
    }

    /// Number of sources
    pub fn n_src(&self) -> usize {
        self.n_src
    }

    /// Number of latent components
    pub fn n_components(&self) -> usize {
        self.activations.ncols()
    }

    /// Model of the blinky power, R·G (T × L)
    pub fn blinky_estimate(&self) -> Array2<f64> {
        self.activations.dot(&self.gains)
    }

    /// Reciprocal source variances (T × n_src), the auxiliary weights
    pub fn inverse_source_variance(&self) -> Array2<f64> {
        self.activations
            .slice(ndarray::s![.., ..self.n_src])
            .mapv(|r| 1.0 / r)
    }

    /// Rescale every component to unit mean activation
    ///
    /// Gains absorb the inverse factor so R·G is unchanged. Returns the factor
    /// applied to each activation column.
    pub fn normalize(&mut self) -> Array1<f64> {
        let means = self
            .activations
            .mean_axis(Axis(0))
            .unwrap_or_else(|| Array1::ones(self.n_components()));

        let factors = means.mapv(|m| if m > 0.0 && m.is_finite() { 1.0 / m } else { 1.0 });

        for (mut column, &factor) in self.activations.axis_iter_mut(Axis(1)).zip(factors.iter()) {
            column *= factor;
        }
        for (mut row, &factor) in self.gains.axis_iter_mut(Axis(0)).zip(factors.iter()) {
            row /= factor;
        }

        factors
    }

    /// All entries finite
    pub fn is_finite(&self) -> bool {
        self.activations.iter().all(|v| v.is_finite()) && self.gains.iter().all(|v| v.is_finite())
    }

    /// All entries nonnegative
    pub fn is_nonnegative(&self) -> bool {
        self.activations.iter().all(|&v| v >= 0.0) && self.gains.iter().all(|&v| v >= 0.0)
    }
}

/// Audio part of the cost: Σ_{t,k} F·ln R + P / R over the source columns
pub(crate) fn audio_cost(state: &PowerState, audio_power: ArrayView2<f64>, n_freq: usize) -> f64 {
    let f = n_freq as f64;
    let mut cost = 0.0;
    for ((t, k), &p) in audio_power.indexed_iter() {
        let r = state.activations[[t, k]];
        cost += f * r.ln() + p / r;
    }
    cost
}
