//! Joint audio/blinky power factorization
//!
//! Itakura-Saito NMF of the blinky power `U ≈ R·G`, coupled to the audio
//! through the source columns of `R`. The cost is
//!
//! ```text
//! C(R, G) = Σ_{t,k<S} F·ln R + P / R
//!         + Σ_{t,l active} ln Û + U / Û        (Û = R·G)
//!         + sparse_reg · Σ R
//! ```
//!
//! and both factors are updated with the exponent-1/2 multiplicative rule of
//! the majorization-minimization derivation, which never increases `C`.
//! A blinky column that is identically zero is inactive: it carries no
//! information about the sources and is left out of every sum.

use ndarray::{Array2, ArrayView2, Zip};

use super::{audio_cost, PowerState, SourcePowerModel};

/// Blinky-informed power model
#[derive(Debug, Clone)]
pub struct BlinkyNmf {
    /// Blinky power U (T × L)
    blinky: Array2<f64>,
    /// Per-blinky weight: 1 for informative channels, 0 for degenerate ones
    weights: Vec<f64>,
    /// Multiplicative passes per call to `update`
    n_sub_iter: usize,
    /// L1 penalty on the activations
    sparse_reg: f64,
    /// Floor applied after each pass
    floor: f64,
}

impl BlinkyNmf {
    /// Create model over the blinky readings (T × L)
    pub fn new(blinky: Array2<f64>, n_sub_iter: usize, sparse_reg: f64, floor: f64) -> Self {
        let weights: Vec<f64> = blinky
            .columns()
            .into_iter()
            .map(|col| if col.iter().any(|&u| u > 0.0) { 1.0 } else { 0.0 })
            .collect();

        let inactive = weights.iter().filter(|&&w| w == 0.0).count();
        if inactive > 0 {
            log::debug!("{} of {} blinky channels carry no power and are ignored", inactive, weights.len());
        }

        Self {
            blinky,
            weights,
            n_sub_iter,
            sparse_reg,
            floor,
        }
    }

    /// Number of informative blinky channels
    pub fn active_blinkies(&self) -> usize {
        self.weights.iter().filter(|&&w| w > 0.0).count()
    }

    /// `(A ⊙ U / Û², A / Û)`, the two blinky gradient terms
    fn blinky_ratios(&self, estimate: &Array2<f64>) -> (Array2<f64>, Array2<f64>) {
        let mut numer = Array2::zeros(estimate.raw_dim());
        let mut denom = Array2::zeros(estimate.raw_dim());

        Zip::indexed(&mut numer)
            .and(&mut denom)
            .and(estimate)
            .and(&self.blinky)
            .for_each(|(_, l), n, d, &u_hat, &u| {
                let a = self.weights[l];
                if a > 0.0 {
                    *n = a * u / (u_hat * u_hat);
                    *d = a / u_hat;
                }
            });

        (numer, denom)
    }

    /// One multiplicative pass over the activations
    pub fn update_activations(&self, state: &mut PowerState, audio_power: ArrayView2<f64>, n_freq: usize) {
        let f = n_freq as f64;
        let n_src = state.n_src();
        let estimate = state.blinky_estimate();
        let (numer_b, denom_b) = self.blinky_ratios(&estimate);
        let gains_t = state.gains.t();
        let numer = numer_b.dot(&gains_t);
        let denom = denom_b.dot(&gains_t);

        let floor = self.floor;
        let sparse_reg = self.sparse_reg;
        Zip::indexed(&mut state.activations)
            .and(&numer)
            .and(&denom)
            .for_each(|(t, k), r, &nb, &db| {
                let (mut num, mut den) = (nb, db + sparse_reg);
                if k < n_src {
                    let p = audio_power[[t, k]];
                    num += p / (*r * *r);
                    den += f / *r;
                }
                if den > 0.0 {
                    *r = (*r * (num / den).sqrt()).max(floor);
                }
            });
    }

    /// One multiplicative pass over the gains
    pub fn update_gains(&self, state: &mut PowerState) {
        if self.blinky.ncols() == 0 {
            return;
        }

        let estimate = state.blinky_estimate();
        let (numer_b, denom_b) = self.blinky_ratios(&estimate);
        let activations_t = state.activations.t();
        let numer = activations_t.dot(&numer_b);
        let denom = activations_t.dot(&denom_b);

        let floor = self.floor;
        Zip::indexed(&mut state.gains)
            .and(&numer)
            .and(&denom)
            .for_each(|(_, l), g, &num, &den| {
                if self.weights[l] > 0.0 && den > 0.0 {
                    *g = (*g * (num / den).sqrt()).max(floor);
                }
            });
    }

    /// Blinky part of the cost, including the sparsity penalty
    fn blinky_cost(&self, state: &PowerState) -> f64 {
        let estimate = state.blinky_estimate();
        let mut cost = 0.0;
        for (((_, l), &u_hat), &u) in estimate.indexed_iter().zip(self.blinky.iter()) {
            let a = self.weights[l];
            if a > 0.0 {
                cost += a * (u_hat.ln() + u / u_hat);
            }
        }
        cost + self.sparse_reg * state.activations.sum()
    }
}

impl SourcePowerModel for BlinkyNmf {
    fn name(&self) -> &'static str {
        "blinky-nmf"
    }

    fn update(&self, state: &mut PowerState, audio_power: ArrayView2<f64>, n_freq: usize) {
        for _ in 0..self.n_sub_iter {
            self.update_activations(state, audio_power, n_freq);
            self.update_gains(state);
        }
    }

    fn cost(&self, state: &PowerState, audio_power: ArrayView2<f64>, n_freq: usize) -> f64 {
        audio_cost(state, audio_power, n_freq) + self.blinky_cost(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::Array2;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    const FLOOR: f64 = 1e-15;

    /// Ground-truth factors and the power they generate
    fn synthetic(rng: &mut ChaCha8Rng, t: usize, s: usize, l: usize, n_freq: usize) -> (Array2<f64>, Array2<f64>) {
        let r_true = Array2::from_shape_simple_fn((t, s), || 0.1 + rng.random::<f64>());
        let g_true = Array2::from_shape_simple_fn((s, l), || 0.1 + rng.random::<f64>());
        let blinky = r_true.dot(&g_true);
        let audio = r_true.mapv(|r| r * n_freq as f64);
        (blinky, audio)
    }

    #[test]
    fn test_cost_never_increases() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let (blinky, audio) = synthetic(&mut rng, 40, 2, 3, 16);
        let model = BlinkyNmf::new(blinky, 1, 0.0, FLOOR);
        let mut state = PowerState::random(&mut rng, 40, 2, 2, 3, FLOOR);

        let mut previous = model.cost(&state, audio.view(), 16);
        for _ in 0..50 {
            model.update(&mut state, audio.view(), 16);
            let current = model.cost(&state, audio.view(), 16);
            assert!(
                current <= previous + 1e-9 * previous.abs(),
                "cost increased from {} to {}",
                previous,
                current
            );
            previous = current;
        }
    }

    #[test]
    fn test_cost_never_increases_with_background_components() {
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let (blinky, audio) = synthetic(&mut rng, 30, 2, 4, 8);
        let model = BlinkyNmf::new(blinky, 1, 0.0, FLOOR);
        let mut state = PowerState::random(&mut rng, 30, 4, 2, 4, FLOOR);

        let mut previous = model.cost(&state, audio.view(), 8);
        for _ in 0..30 {
            model.update_activations(&mut state, audio.view(), 8);
            let after_r = model.cost(&state, audio.view(), 8);
            assert!(after_r <= previous + 1e-9 * previous.abs());

            model.update_gains(&mut state);
            let after_g = model.cost(&state, audio.view(), 8);
            assert!(after_g <= after_r + 1e-9 * after_r.abs());
            previous = after_g;
        }
    }

    #[test]
    fn test_factors_stay_nonnegative() {
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let (blinky, audio) = synthetic(&mut rng, 25, 3, 2, 4);
        let model = BlinkyNmf::new(blinky, 1, 0.5, FLOOR);
        let mut state = PowerState::random(&mut rng, 25, 3, 3, 2, FLOOR);

        for _ in 0..40 {
            model.update(&mut state, audio.view(), 4);
            assert!(state.is_nonnegative());
            assert!(state.activations.iter().all(|&r| r >= FLOOR));
            assert!(state.gains.iter().all(|&g| g >= FLOOR));
        }
    }

    #[test]
    fn test_audio_only_converges_to_closed_form() {
        let mut rng = ChaCha8Rng::seed_from_u64(9);
        let audio = Array2::from_shape_simple_fn((12, 2), || 1.0 + 10.0 * rng.random::<f64>());
        let model = BlinkyNmf::new(Array2::zeros((12, 0)), 200, 0.0, FLOOR);
        let mut state = PowerState::random(&mut rng, 12, 2, 2, 0, FLOOR);

        model.update(&mut state, audio.view(), 5);

        for (r, p) in state.activations.iter().zip(audio.iter()) {
            assert_relative_eq!(*r, p / 5.0, max_relative = 1e-6);
        }
    }

    #[test]
    fn test_silent_blinky_is_ignored() {
        let mut rng = ChaCha8Rng::seed_from_u64(21);
        let (mut blinky, audio) = synthetic(&mut rng, 20, 2, 3, 6);
        blinky.column_mut(1).fill(0.0);
        let model = BlinkyNmf::new(blinky, 10, 0.0, FLOOR);
        assert_eq!(model.active_blinkies(), 2);

        let mut state = PowerState::random(&mut rng, 20, 2, 2, 3, FLOOR);
        let silent_gains = state.gains.column(1).to_owned();

        for _ in 0..20 {
            model.update(&mut state, audio.view(), 6);
            assert!(state.is_finite());
        }
        assert_eq!(state.gains.column(1), silent_gains);
        assert!(model.cost(&state, audio.view(), 6).is_finite());
    }

    #[test]
    fn test_blinky_cost_by_hand() {
        let state = PowerState::new(
            ndarray::array![[1.0, 2.0], [3.0, 1.0]],
            ndarray::array![[1.0, 0.5], [2.0, 1.0]],
            2,
        );
        // Second blinky is silent and drops out; Û[:, 0] = [5, 5]
        let model = BlinkyNmf::new(ndarray::array![[2.0, 0.0], [4.0, 0.0]], 1, 0.5, FLOOR);

        let expected = (5f64.ln() + 0.4) + (5f64.ln() + 0.8) + 0.5 * 7.0;
        assert_relative_eq!(model.blinky_cost(&state), expected, epsilon = 1e-12);
    }

    #[test]
    fn test_sparsity_shrinks_activations() {
        let mut rng = ChaCha8Rng::seed_from_u64(4);
        let (blinky, audio) = synthetic(&mut rng, 30, 2, 2, 4);
        let init = PowerState::random(&mut rng, 30, 2, 2, 2, FLOOR);

        let mut dense = init.clone();
        BlinkyNmf::new(blinky.clone(), 50, 0.0, FLOOR).update(&mut dense, audio.view(), 4);
        let mut sparse = init;
        BlinkyNmf::new(blinky, 50, 5.0, FLOOR).update(&mut sparse, audio.view(), 4);

        assert!(sparse.activations.sum() < dense.activations.sum());
    }
}
