//! Joint iteration driver
//!
//! One outer iteration runs, in order:
//!
//! 1. audio power `P` from the current separated output
//! 2. `n_nmf_sub_iter` power-model passes
//! 3. auxiliary covariances and demixing rows for every bin (parallel over bins)
//! 4. unit-mean rescaling of the activations, mirrored on the demixing rows
//! 5. new separated output, optional cost record, optional observer call
//!
//! Step 3 finishes for all bins before step 4 starts. A numerical failure
//! anywhere in 1-5 restores the state from before the iteration and ends
//! the run with [`SeparationStatus::Aborted`].

use std::fmt;

use nalgebra::DMatrix;
use ndarray::{Array2, Array3, ArrayView2, ArrayView3, Axis, Zip};
use num_complex::Complex64;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::{Algorithm, ProjectionBack, SeparationConfig};
use crate::covariance::{mixture_covariance, regularize};
use crate::demix::BinDemixer;
use crate::error::{NumericalFailure, SeparationError, SeparationResult};
use crate::observer::IterationObserver;
use crate::power::{audio_cost, BlinkyNmf, GaussPower, PowerState, SourcePowerModel};
use crate::projection::project_back;

// ═══════════════════════════════════════════════════════════════════════════════
// RESULT TYPES
// ═══════════════════════════════════════════════════════════════════════════════

/// How the iteration loop ended
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum SeparationStatus {
    /// All `n_iter` iterations ran
    Completed,
    /// Cost plateau reached at this iteration
    Converged { iteration: usize },
    /// Irrecoverable numerical failure during this iteration; the output
    /// reflects the state after the previous one
    Aborted {
        iteration: usize,
        failure: NumericalFailure,
    },
}

/// Cost after one outer iteration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CostEntry {
    pub iteration: usize,
    /// `−2T Σ_f ln|det Ŵ_f|` plus the audio term
    pub demixing: f64,
    /// Audio and blinky terms of the power model
    pub power_model: f64,
    /// `−2T Σ_f ln|det Ŵ_f|` plus the power-model cost
    pub total: f64,
}

/// Estimated model parameters
#[derive(Debug, Clone)]
pub struct SeparationModel {
    /// Target demixing rows (F × S × M)
    pub demixing: Array3<Complex64>,
    /// Gains G (K × L)
    pub gains: Array2<f64>,
    /// Activations R (T × K)
    pub activations: Array2<f64>,
}

/// Separation output
#[derive(Debug, Clone)]
pub struct Separation {
    /// Separated spectra Y (T × F × S)
    pub output: Array3<Complex64>,
    /// Model parameters, when requested
    pub model: Option<SeparationModel>,
    /// Outer iterations completed
    pub iterations: usize,
    pub status: SeparationStatus,
    /// Diagonal loadings applied to rank-deficient covariances
    pub degeneracies: usize,
    /// Per-iteration cost, when tracked
    pub cost_trace: Vec<CostEntry>,
}

impl Separation {
    /// Whether the run stopped on a numerical failure
    pub fn is_aborted(&self) -> bool {
        matches!(self.status, SeparationStatus::Aborted { .. })
    }

    /// Last recorded total cost
    pub fn final_cost(&self) -> Option<f64> {
        self.cost_trace.last().map(|entry| entry.total)
    }
}

/// Driver lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Initializing,
    AudioPowerUpdate,
    NmfUpdate,
    DemixingUpdate,
    CallbackInvocation,
    Converged,
    Terminated,
}

impl fmt::Display for DriverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DriverState::Initializing => "initializing",
            DriverState::AudioPowerUpdate => "audio-power-update",
            DriverState::NmfUpdate => "nmf-update",
            DriverState::DemixingUpdate => "demixing-update",
            DriverState::CallbackInvocation => "callback-invocation",
            DriverState::Converged => "converged",
            DriverState::Terminated => "terminated",
        };
        write!(f, "{}", name)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ENTRY POINT
// ═══════════════════════════════════════════════════════════════════════════════

/// Separate `n_src` sources from a multichannel STFT
///
/// - `mixture`: X (T × F × M)
/// - `blinky`: U (T × L), ignored by [`Algorithm::AuxIvaGauss`]
/// - `initial_activations`: optional R0 (T × K, K ≥ n_src), replaces the
///   random activation start
/// - `observer`: called after every `observer_interval`-th iteration
///
/// Configuration errors are returned before any computation. Numerical
/// failures during the iterations are not errors: the result carries
/// [`SeparationStatus::Aborted`] and the last valid estimate.
pub fn separate(
    mixture: ArrayView3<Complex64>,
    blinky: ArrayView2<f64>,
    config: &SeparationConfig,
    initial_activations: Option<ArrayView2<f64>>,
    observer: Option<&mut dyn IterationObserver>,
) -> SeparationResult<Separation> {
    config.validate()?;
    validate_inputs(mixture, blinky, config, initial_activations)?;

    let (n_frames, n_freq, n_mics) = mixture.dim();
    log::info!(
        "Separating {} sources with {}: {} frames, {} bins, {} mics, {} blinkies",
        config.n_src,
        config.algorithm.name(),
        n_frames,
        n_freq,
        n_mics,
        blinky.ncols()
    );

    let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
    let floor = config.power_floor;

    match config.algorithm {
        Algorithm::AuxIvaGauss => {
            let power = match initial_activations {
                Some(r0) => PowerState::with_activations(
                    &mut rng,
                    r0.slice(ndarray::s![.., ..config.n_src]).to_owned(),
                    config.n_src,
                    0,
                    floor,
                ),
                None => PowerState::random(&mut rng, n_frames, config.n_src, config.n_src, 0, floor),
            };
            Driver::new(mixture, config, GaussPower::new(floor), power).run(observer)
        }
        Algorithm::BlinkIvaGauss => {
            let n_blinkies = blinky.ncols();
            let power = match initial_activations {
                Some(r0) => PowerState::with_activations(&mut rng, r0.to_owned(), config.n_src, n_blinkies, floor),
                None => PowerState::random(
                    &mut rng,
                    n_frames,
                    config.n_components(),
                    config.n_src,
                    n_blinkies,
                    floor,
                ),
            };
            let model = BlinkyNmf::new(blinky.to_owned(), config.n_nmf_sub_iter, config.sparse_reg, floor);
            Driver::new(mixture, config, model, power).run(observer)
        }
    }
}

/// Reject malformed inputs before any computation
fn validate_inputs(
    mixture: ArrayView3<Complex64>,
    blinky: ArrayView2<f64>,
    config: &SeparationConfig,
    initial_activations: Option<ArrayView2<f64>>,
) -> SeparationResult<()> {
    let (n_frames, n_freq, n_mics) = mixture.dim();
    if n_frames == 0 {
        return Err(SeparationError::EmptyInput("mixture has no frames"));
    }
    if n_freq == 0 {
        return Err(SeparationError::EmptyInput("mixture has no frequency bins"));
    }
    if n_mics == 0 {
        return Err(SeparationError::EmptyInput("mixture has no microphones"));
    }
    if config.n_src > n_mics {
        return Err(SeparationError::Underdetermined {
            n_src: config.n_src,
            n_mics,
        });
    }
    if config.ref_mic >= n_mics {
        return Err(SeparationError::InvalidParameter {
            name: "ref_mic",
            reason: format!("must be below the microphone count {}, got {}", n_mics, config.ref_mic),
        });
    }
    if !mixture.iter().all(|z| z.re.is_finite() && z.im.is_finite()) {
        return Err(SeparationError::NonFiniteInput("mixture"));
    }

    if config.algorithm.uses_blinkies() {
        if blinky.nrows() != n_frames {
            return Err(SeparationError::ShapeMismatch {
                what: "blinky",
                expected: format!("{} frames", n_frames),
                got: format!("{} frames", blinky.nrows()),
            });
        }
        check_power("blinky", blinky)?;
    }

    if let Some(r0) = initial_activations {
        if r0.nrows() != n_frames {
            return Err(SeparationError::ShapeMismatch {
                what: "initial activations",
                expected: format!("{} frames", n_frames),
                got: format!("{} frames", r0.nrows()),
            });
        }
        if r0.ncols() < config.n_src {
            return Err(SeparationError::ShapeMismatch {
                what: "initial activations",
                expected: format!("at least {} components", config.n_src),
                got: format!("{} components", r0.ncols()),
            });
        }
        check_power("initial activations", r0)?;
    }

    Ok(())
}

fn check_power(what: &'static str, values: ArrayView2<f64>) -> SeparationResult<()> {
    if !values.iter().all(|v| v.is_finite()) {
        return Err(SeparationError::NonFiniteInput(what));
    }
    if let Some((index, &value)) = values.indexed_iter().find(|(_, v)| **v < 0.0) {
        return Err(SeparationError::NegativePower { what, index, value });
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════════
// DRIVER
// ═══════════════════════════════════════════════════════════════════════════════

struct Driver<'m, 'c, P: SourcePowerModel> {
    config: &'c SeparationConfig,
    mixture: ArrayView3<'m, Complex64>,
    /// Mixture per bin (T × M)
    bins: Vec<Array2<Complex64>>,
    demixers: Vec<BinDemixer>,
    /// Separated output per bin (T × S)
    separated: Vec<Array2<Complex64>>,
    power: PowerState,
    model: P,
    state: DriverState,
    degeneracies: usize,
    cost_trace: Vec<CostEntry>,
}

/// Everything an iteration may modify
type Snapshot = (Vec<BinDemixer>, Vec<Array2<Complex64>>, PowerState);

impl<'m, 'c, P: SourcePowerModel> Driver<'m, 'c, P> {
    fn new(mixture: ArrayView3<'m, Complex64>, config: &'c SeparationConfig, model: P, power: PowerState) -> Self {
        let n_freq = mixture.len_of(Axis(1));
        let bins: Vec<Array2<Complex64>> = (0..n_freq)
            .map(|f| mixture.index_axis(Axis(1), f).to_owned())
            .collect();

        let condition_floor = config.condition_floor;
        let (demixers, loaded): (Vec<BinDemixer>, Vec<bool>) = bins
            .par_iter()
            .enumerate()
            .map(|(bin, frames)| {
                let mut cov = mixture_covariance(frames.view());
                let loaded = regularize(&mut cov, condition_floor);
                (BinDemixer::new(bin, cov, config.n_src), loaded)
            })
            .unzip();

        let degeneracies = loaded.iter().filter(|&&l| l).count();
        if degeneracies > 0 {
            log::debug!("{} of {} mixture covariances loaded", degeneracies, n_freq);
        }

        let mut driver = Self {
            config,
            mixture,
            bins,
            demixers,
            separated: Vec::new(),
            power,
            model,
            state: DriverState::Initializing,
            degeneracies,
            cost_trace: Vec::new(),
        };
        driver.separated = driver.demix_all();
        driver
    }

    fn transition(&mut self, next: DriverState) {
        log::trace!("{} -> {}", self.state, next);
        self.state = next;
    }

    fn n_frames(&self) -> usize {
        self.mixture.len_of(Axis(0))
    }

    fn n_freq(&self) -> usize {
        self.bins.len()
    }

    fn snapshot(&self) -> Snapshot {
        (self.demixers.clone(), self.separated.clone(), self.power.clone())
    }

    fn restore(&mut self, snapshot: Snapshot) {
        (self.demixers, self.separated, self.power) = snapshot;
    }

    fn run(mut self, mut observer: Option<&mut dyn IterationObserver>) -> SeparationResult<Separation> {
        let config = self.config;
        let needs_cost = config.track_cost || config.stop_tolerance.is_some();
        let mut status = SeparationStatus::Completed;
        let mut completed = 0;
        let mut previous_total: Option<f64> = None;

        for iteration in 1..=config.n_iter {
            let snapshot = self.snapshot();
            let outcome = self.step().and_then(|()| {
                if needs_cost {
                    self.cost_entry(iteration).map(Some)
                } else {
                    Ok(None)
                }
            });

            let cost = match outcome {
                Ok(cost) => cost,
                Err(failure) => {
                    log::warn!("Aborting at iteration {}: {}", iteration, failure);
                    self.restore(snapshot);
                    status = SeparationStatus::Aborted { iteration, failure };
                    break;
                }
            };
            completed = iteration;

            let mut converged = false;
            if let Some(entry) = cost {
                log::debug!(
                    "iteration {}: cost {:.6e} (demixing {:.6e}, power model {:.6e})",
                    iteration,
                    entry.total,
                    entry.demixing,
                    entry.power_model
                );
                if let (Some(tol), Some(previous)) = (config.stop_tolerance, previous_total) {
                    let change = (previous - entry.total).abs() / previous.abs().max(f64::MIN_POSITIVE);
                    converged = change < tol;
                }
                previous_total = Some(entry.total);
                if config.track_cost {
                    self.cost_trace.push(entry);
                }
            } else {
                log::debug!("iteration {} done", iteration);
            }

            if config.observer_interval > 0 && iteration % config.observer_interval == 0 {
                if let Some(obs) = observer.as_deref_mut() {
                    self.transition(DriverState::CallbackInvocation);
                    let snapshot = self.projected_output();
                    obs.on_iteration(iteration, snapshot.view())
                        .map_err(|source| SeparationError::Observer { iteration, source })?;
                }
            }

            if converged {
                status = SeparationStatus::Converged { iteration };
                break;
            }
        }

        match status {
            SeparationStatus::Converged { .. } => self.transition(DriverState::Converged),
            _ => self.transition(DriverState::Terminated),
        }
        Ok(self.finish(status, completed))
    }

    /// One outer iteration
    fn step(&mut self) -> Result<(), NumericalFailure> {
        let n_freq = self.n_freq();

        self.transition(DriverState::AudioPowerUpdate);
        let audio_power = self.audio_power();

        self.transition(DriverState::NmfUpdate);
        self.model.update(&mut self.power, audio_power.view(), n_freq);
        if !self.power.is_finite() {
            return Err(NumericalFailure::NonFinite("power model"));
        }

        self.transition(DriverState::DemixingUpdate);
        let inverse_variance = self.power.inverse_source_variance();
        let condition_floor = self.config.condition_floor;
        let loaded = self
            .demixers
            .par_iter_mut()
            .zip(self.bins.par_iter())
            .enumerate()
            .map(|(bin, (demixer, frames))| {
                demixer.update(bin, frames.view(), inverse_variance.view(), condition_floor)
            })
            .collect::<Result<Vec<usize>, NumericalFailure>>()?;
        self.degeneracies += loaded.iter().sum::<usize>();

        let factors = self.power.normalize();
        let row_scale: Vec<f64> = factors.iter().take(self.config.n_src).map(|f| f.sqrt()).collect();
        for demixer in &mut self.demixers {
            demixer.scale_rows(&row_scale);
        }
        if !self.demixers.iter().all(BinDemixer::is_finite) {
            return Err(NumericalFailure::NonFinite("demixing matrices"));
        }

        self.separated = self.demix_all();
        if !self
            .separated
            .iter()
            .all(|y| y.iter().all(|z| z.re.is_finite() && z.im.is_finite()))
        {
            return Err(NumericalFailure::NonFinite("separated output"));
        }
        Ok(())
    }

    fn demix_all(&self) -> Vec<Array2<Complex64>> {
        self.demixers
            .par_iter()
            .zip(self.bins.par_iter())
            .map(|(demixer, frames)| demixer.demix(frames.view()))
            .collect()
    }

    /// P[t, k] = Σ_f |Y[t, f, k]|²
    fn audio_power(&self) -> Array2<f64> {
        let mut power = Array2::zeros((self.n_frames(), self.config.n_src));
        for y in &self.separated {
            Zip::from(&mut power).and(y).for_each(|p, z| *p += z.norm_sqr());
        }
        power
    }

    fn cost_entry(&self, iteration: usize) -> Result<CostEntry, NumericalFailure> {
        let mut log_det = 0.0;
        for demixer in &self.demixers {
            log_det += demixer
                .log_abs_det()
                .ok_or(NumericalFailure::NonFinite("demixing determinant"))?;
        }
        let det_term = -2.0 * self.n_frames() as f64 * log_det;

        let audio_power = self.audio_power();
        let n_freq = self.n_freq();
        let demixing = det_term + audio_cost(&self.power, audio_power.view(), n_freq);
        let power_model = self.model.cost(&self.power, audio_power.view(), n_freq);
        let total = det_term + power_model;

        if !total.is_finite() {
            return Err(NumericalFailure::NonFinite("cost"));
        }
        Ok(CostEntry {
            iteration,
            demixing,
            power_model,
            total,
        })
    }

    /// Separated output (T × F × S) before projection back
    fn stacked_output(&self) -> Array3<Complex64> {
        let mut output = Array3::zeros((self.n_frames(), self.n_freq(), self.config.n_src));
        for (f, y) in self.separated.iter().enumerate() {
            output.index_axis_mut(Axis(1), f).assign(y);
        }
        output
    }

    fn projected_output(&self) -> Array3<Complex64> {
        let raw = self.stacked_output();
        let matrices: Vec<DMatrix<Complex64>> = match self.config.projection_back {
            ProjectionBack::MinimalDistortion => self.demixers.iter().map(|d| d.matrix().clone()).collect(),
            _ => Vec::new(),
        };
        project_back(
            raw.view(),
            self.mixture,
            &matrices,
            self.config.projection_back,
            self.config.ref_mic,
        )
    }

    fn finish(self, status: SeparationStatus, iterations: usize) -> Separation {
        let output = self.projected_output();

        let model = self.config.return_model.then(|| {
            let n_mics = self.mixture.len_of(Axis(2));
            let mut demixing = Array3::zeros((self.n_freq(), self.config.n_src, n_mics));
            for (f, demixer) in self.demixers.iter().enumerate() {
                let targets = demixer.targets();
                for k in 0..self.config.n_src {
                    for m in 0..n_mics {
                        demixing[[f, k, m]] = targets[(k, m)];
                    }
                }
            }
            SeparationModel {
                demixing,
                gains: self.power.gains.clone(),
                activations: self.power.activations.clone(),
            }
        });

        log::info!(
            "{} finished after {} iterations ({:?}, {} degeneracies recovered, model {})",
            self.config.algorithm.name(),
            iterations,
            status,
            self.degeneracies,
            self.model.name()
        );

        Separation {
            output,
            model,
            iterations,
            status,
            degeneracies: self.degeneracies,
            cost_trace: self.cost_trace,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    fn tiny_mixture(n_mics: usize) -> Array3<Complex64> {
        Array3::from_shape_fn((6, 3, n_mics), |(t, f, m)| {
            Complex64::new(((t * 7 + f * 3 + m * 5) % 11) as f64 - 5.0, ((t + 2 * m + f) % 5) as f64 - 2.0)
        })
    }

    #[test]
    fn test_underdetermined_rejected() {
        let x = tiny_mixture(2);
        let u = Array2::<f64>::ones((6, 1));
        let result = separate(x.view(), u.view(), &SeparationConfig::new(3), None, None);
        assert!(matches!(
            result,
            Err(SeparationError::Underdetermined { n_src: 3, n_mics: 2 })
        ));
    }

    #[test]
    fn test_blinky_frames_must_match() {
        let x = tiny_mixture(2);
        let u = Array2::<f64>::ones((5, 1));
        let result = separate(x.view(), u.view(), &SeparationConfig::new(2), None, None);
        assert!(matches!(
            result,
            Err(SeparationError::ShapeMismatch { what: "blinky", .. })
        ));
    }

    #[test]
    fn test_negative_blinky_rejected() {
        let x = tiny_mixture(2);
        let mut u = Array2::<f64>::ones((6, 2));
        u[[4, 1]] = -0.5;
        let result = separate(x.view(), u.view(), &SeparationConfig::new(2), None, None);
        match result {
            Err(SeparationError::NegativePower { what, index, value }) => {
                assert_eq!(what, "blinky");
                assert_eq!(index, (4, 1));
                assert_eq!(value, -0.5);
            }
            other => panic!("unexpected result: {:?}", other.map(|s| s.iterations)),
        }
    }

    #[test]
    fn test_auxiva_ignores_blinky_shape() {
        let x = tiny_mixture(2);
        let u = Array2::<f64>::from_elem((1, 1), -1.0);
        let config = SeparationConfig::fast(2)
            .with_algorithm(Algorithm::AuxIvaGauss)
            .with_model();
        let result = separate(x.view(), u.view(), &config, None, None).unwrap();
        let model = result.model.unwrap();
        assert_eq!(model.gains.dim(), (2, 0));
        assert_eq!(model.activations.dim(), (6, 2));
    }

    #[test]
    fn test_short_initial_activations_rejected() {
        let x = tiny_mixture(3);
        let u = Array2::<f64>::ones((6, 1));
        let r0 = Array2::<f64>::ones((6, 1));
        let result = separate(x.view(), u.view(), &SeparationConfig::new(2), Some(r0.view()), None);
        assert!(matches!(
            result,
            Err(SeparationError::ShapeMismatch { what: "initial activations", .. })
        ));
    }

    #[test]
    fn test_nan_mixture_rejected() {
        let mut x = tiny_mixture(2);
        x[[0, 0, 0]] = Complex64::new(f64::NAN, 0.0);
        let u = Array2::<f64>::ones((6, 1));
        let result = separate(x.view(), u.view(), &SeparationConfig::new(2), None, None);
        assert!(matches!(result, Err(SeparationError::NonFiniteInput("mixture"))));
    }

    #[test]
    fn test_zero_iterations_return_initial_estimate() {
        let x = tiny_mixture(2);
        let u = Array2::<f64>::ones((6, 1));
        let config = SeparationConfig::new(2)
            .with_iterations(0, 0)
            .with_projection_back(ProjectionBack::Disabled);
        let result = separate(x.view(), u.view(), &config, None, None).unwrap();
        assert_eq!(result.iterations, 0);
        assert_eq!(result.status, SeparationStatus::Completed);
        assert_eq!(result.output, x);
    }

    #[test]
    fn test_cost_trace_records_every_iteration() {
        let x = tiny_mixture(3);
        let u = Array2::from_shape_fn((6, 2), |(t, l)| 1.0 + ((t + l) % 3) as f64);
        let mut config = SeparationConfig::fast(2);
        config.track_cost = true;
        let result = separate(x.view(), u.view(), &config, None, None).unwrap();

        assert_eq!(result.cost_trace.len(), result.iterations);
        for (i, entry) in result.cost_trace.iter().enumerate() {
            assert_eq!(entry.iteration, i + 1);
            assert!(entry.total.is_finite());
        }
        assert_eq!(result.final_cost(), result.cost_trace.last().map(|e| e.total));
    }

    /// Config owned by a shorter scope than the mixture view
    fn separate_with_local_config(mixture: ArrayView3<'_, Complex64>) -> Separation {
        let config = SeparationConfig::fast(2).with_algorithm(Algorithm::AuxIvaGauss);
        let blinky = Array2::<f64>::zeros((0, 0));
        separate(mixture, blinky.view(), &config, None, None).unwrap()
    }

    #[test]
    fn test_config_scope_shorter_than_mixture() {
        let x = tiny_mixture(2);
        let result = separate_with_local_config(x.view());
        assert_eq!(result.output.dim(), (6, 3, 2));
        assert!(!result.is_aborted());
    }

    #[test]
    fn test_state_names() {
        assert_eq!(DriverState::NmfUpdate.to_string(), "nmf-update");
        assert_eq!(DriverState::CallbackInvocation.to_string(), "callback-invocation");
    }
}
