//! Weighted spatial covariances
//!
//! For a frequency bin with frames `x_t` (length M) and nonnegative weights
//! `w_t`, the weighted covariance is
//!
//! ```text
//! V = (1/T) Σ_t w_t · x_t x_tᴴ
//! ```
//!
//! With `w_t = 1 / R[t, k]` this is the auxiliary covariance of source `k`;
//! with unit weights it is the plain mixture covariance. Results are
//! symmetrized to exact Hermitian form and diagonally loaded when they are
//! numerically rank deficient.

use nalgebra::{DMatrix, SymmetricEigen};
use ndarray::{ArrayView1, ArrayView2};
use num_complex::Complex64;

/// Smallest diagonal loading ever applied
pub const MIN_LOADING: f64 = 1e-12;

/// `(1/T) Σ_t w_t x_t x_tᴴ` over the frames of one bin (T × M)
pub fn weighted_covariance(frames: ArrayView2<Complex64>, weights: ArrayView1<f64>) -> DMatrix<Complex64> {
    let (n_frames, n_mics) = frames.dim();
    debug_assert_eq!(weights.len(), n_frames);

    let mut cov = DMatrix::<Complex64>::zeros(n_mics, n_mics);
    if n_frames == 0 {
        return cov;
    }

    for (x, &w) in frames.outer_iter().zip(weights.iter()) {
        for i in 0..n_mics {
            let xi = x[i] * w;
            for j in i..n_mics {
                cov[(i, j)] += xi * x[j].conj();
            }
        }
    }

    // Fill the lower triangle from the upper one
    for i in 0..n_mics {
        cov[(i, i)].im = 0.0;
        for j in (i + 1)..n_mics {
            cov[(j, i)] = cov[(i, j)].conj();
        }
    }

    cov / Complex64::new(n_frames as f64, 0.0)
}

/// Unweighted mixture covariance `(1/T) Σ_t x_t x_tᴴ`
pub fn mixture_covariance(frames: ArrayView2<Complex64>) -> DMatrix<Complex64> {
    let weights = ndarray::Array1::ones(frames.nrows());
    weighted_covariance(frames, weights.view())
}

/// Diagonally load a Hermitian matrix whose condition is too poor to invert
///
/// Loading is applied when the smallest eigenvalue falls below
/// `condition_floor · λ_max` or when `λ_max` is not positive. Returns whether
/// loading was applied.
pub fn regularize(cov: &mut DMatrix<Complex64>, condition_floor: f64) -> bool {
    let n = cov.nrows();
    if n == 0 {
        return false;
    }

    let (lambda_min, lambda_max) = match SymmetricEigen::try_new(cov.clone(), f64::EPSILON, 1000) {
        Some(eig) => eig
            .eigenvalues
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &l| (lo.min(l), hi.max(l))),
        None => {
            // No eigendecomposition: load relative to the largest diagonal entry
            let diag_max = (0..n).map(|i| cov[(i, i)].re).fold(0.0_f64, f64::max);
            (0.0, diag_max)
        }
    };

    if lambda_max > 0.0 && lambda_min > condition_floor * lambda_max {
        return false;
    }

    let target = (condition_floor * lambda_max.max(0.0)).max(MIN_LOADING);
    let load = target + (-lambda_min).max(0.0);
    for i in 0..n {
        cov[(i, i)].re += load;
    }
    true
}

/// Build and regularize the auxiliary covariance for one source
///
/// Returns the covariance and whether it had to be loaded.
pub fn source_covariance(
    frames: ArrayView2<Complex64>,
    inverse_variance: ArrayView1<f64>,
    condition_floor: f64,
) -> (DMatrix<Complex64>, bool) {
    let mut cov = weighted_covariance(frames, inverse_variance);
    let loaded = regularize(&mut cov, condition_floor);
    (cov, loaded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::{array, Array1, Array2};

    fn c(re: f64, im: f64) -> Complex64 {
        Complex64::new(re, im)
    }

    fn test_frames() -> Array2<Complex64> {
        array![
            [c(1.0, 0.5), c(-0.3, 0.2), c(0.7, -1.1)],
            [c(0.2, -0.4), c(1.5, 0.0), c(-0.6, 0.3)],
            [c(-1.0, 0.1), c(0.4, 0.9), c(0.2, 0.2)],
            [c(0.3, 0.3), c(-0.8, -0.5), c(1.2, 0.4)],
        ]
    }

    #[test]
    fn test_covariance_is_exactly_hermitian() {
        let frames = test_frames();
        let weights = array![0.5, 2.0, 1.0, 3.0];
        let cov = weighted_covariance(frames.view(), weights.view());

        assert_eq!(cov, cov.adjoint());
        for i in 0..3 {
            assert_eq!(cov[(i, i)].im, 0.0);
            assert!(cov[(i, i)].re > 0.0);
        }
    }

    #[test]
    fn test_covariance_matches_definition() {
        let frames = test_frames();
        let weights = array![0.5, 2.0, 1.0, 3.0];
        let cov = weighted_covariance(frames.view(), weights.view());

        let mut expected = c(0.0, 0.0);
        for t in 0..4 {
            expected += frames[[t, 0]] * frames[[t, 2]].conj() * weights[t];
        }
        expected /= 4.0;
        assert_relative_eq!(cov[(0, 2)].re, expected.re, epsilon = 1e-12);
        assert_relative_eq!(cov[(0, 2)].im, expected.im, epsilon = 1e-12);
    }

    #[test]
    fn test_unit_weights_give_mixture_covariance() {
        let frames = test_frames();
        let ones = Array1::ones(4);
        assert_eq!(
            mixture_covariance(frames.view()),
            weighted_covariance(frames.view(), ones.view())
        );
    }

    #[test]
    fn test_well_conditioned_is_untouched() {
        let frames = test_frames();
        let mut cov = mixture_covariance(frames.view());
        let before = cov.clone();
        assert!(!regularize(&mut cov, 1e-12));
        assert_eq!(cov, before);
    }

    #[test]
    fn test_rank_deficient_is_loaded() {
        // Every frame on the same direction: rank one
        let frames = Array2::from_shape_fn((16, 3), |(t, m)| c((t + 1) as f64, 0.0) * c(1.0, m as f64));
        let mut cov = mixture_covariance(frames.view());
        assert!(regularize(&mut cov, 1e-6));

        let eig = SymmetricEigen::new(cov);
        let lo = eig.eigenvalues.iter().cloned().fold(f64::INFINITY, f64::min);
        let hi = eig.eigenvalues.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        assert!(lo > 0.0);
        assert!(lo >= 1e-6 * hi * 0.5);
    }

    #[test]
    fn test_zero_matrix_is_loaded() {
        let mut cov = DMatrix::<Complex64>::zeros(2, 2);
        assert!(regularize(&mut cov, 1e-12));
        assert_relative_eq!(cov[(0, 0)].re, MIN_LOADING);
        assert_relative_eq!(cov[(1, 1)].re, MIN_LOADING);
        assert!(cov.clone().try_inverse().is_some());
    }
}
