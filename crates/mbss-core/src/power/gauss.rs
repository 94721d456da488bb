//! Audio-only source power

use ndarray::{ArrayView2, Zip, s};

use super::{audio_cost, PowerState, SourcePowerModel};

/// Closed-form time-varying Gaussian variance, `R = max(P / F, floor)`
///
/// Minimizes the audio cost exactly in one step. Gains and blinky readings
/// play no part.
#[derive(Debug, Clone, Copy)]
pub struct GaussPower {
    floor: f64,
}

impl GaussPower {
    pub fn new(floor: f64) -> Self {
        Self { floor }
    }
}

impl SourcePowerModel for GaussPower {
    fn name(&self) -> &'static str {
        "gauss"
    }

    fn update(&self, state: &mut PowerState, audio_power: ArrayView2<f64>, n_freq: usize) {
        let f = n_freq as f64;
        let floor = self.floor;
        let n_src = state.n_src();
        Zip::from(state.activations.slice_mut(s![.., ..n_src]))
            .and(&audio_power)
            .for_each(|r, &p| *r = (p / f).max(floor));
    }

    fn cost(&self, state: &PowerState, audio_power: ArrayView2<f64>, n_freq: usize) -> f64 {
        audio_cost(state, audio_power, n_freq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::{array, Array2};

    #[test]
    fn test_variance_is_mean_power() {
        let model = GaussPower::new(1e-15);
        let mut state = PowerState::new(Array2::ones((2, 2)), Array2::zeros((2, 0)), 2);
        let power = array![[8.0, 4.0], [0.0, 2.0]];

        model.update(&mut state, power.view(), 4);

        assert_relative_eq!(state.activations[[0, 0]], 2.0);
        assert_relative_eq!(state.activations[[0, 1]], 1.0);
        assert_relative_eq!(state.activations[[1, 0]], 1e-15);
        assert_relative_eq!(state.activations[[1, 1]], 0.5);
    }

    #[test]
    fn test_update_minimizes_cost() {
        let model = GaussPower::new(1e-15);
        let power = array![[3.0, 1.0], [5.0, 7.0]];
        let mut state = PowerState::new(array![[0.2, 9.0], [1.0, 1.0]], Array2::zeros((2, 0)), 2);
        let before = model.cost(&state, power.view(), 2);

        model.update(&mut state, power.view(), 2);
        let optimum = model.cost(&state, power.view(), 2);
        assert!(optimum < before);

        let mut perturbed = state.clone();
        perturbed.activations[[0, 0]] *= 1.1;
        assert!(model.cost(&perturbed, power.view(), 2) > optimum);
    }
}
