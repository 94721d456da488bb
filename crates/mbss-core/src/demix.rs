//! Per-bin demixing matrices
//!
//! Each frequency bin owns a square M × M working matrix Ŵ. Its first S rows
//! are the target demixing rows, `y = W·x`. When there are more microphones
//! than sources the remaining M − S rows are background rows `[J, −I]`, kept
//! orthogonal to the targets under the mixture covariance `C`:
//!
//! ```text
//! W C [J, −I]ᴴ = 0   ⇒   J = ((W C)[:, :S]⁻¹ (W C)[:, S:])ᴴ
//! ```
//!
//! Target rows are refined by iterative projection against the auxiliary
//! covariance `V_k`, then scaled so that `w_kᴴ V_k w_k = 1`.

use nalgebra::{DMatrix, DVector};
use ndarray::{Array2, ArrayView2};
use num_complex::Complex64;

use crate::covariance::source_covariance;
use crate::error::NumericalFailure;

/// Demixing state of one frequency bin
#[derive(Debug, Clone)]
pub struct BinDemixer {
    /// Working matrix Ŵ (M × M)
    matrix: DMatrix<Complex64>,
    /// Mixture covariance C, regularized
    mix_cov: DMatrix<Complex64>,
    n_src: usize,
}

impl BinDemixer {
    /// Start from the identity on the first `n_src` microphones
    ///
    /// Background rows are derived from `mix_cov`, which should already be
    /// regularized. If that fails they stay `[0, −I]`.
    pub fn new(bin: usize, mix_cov: DMatrix<Complex64>, n_src: usize) -> Self {
        let n_mics = mix_cov.nrows();
        debug_assert!(n_src <= n_mics);

        let mut matrix = DMatrix::identity(n_mics, n_mics);
        for i in n_src..n_mics {
            matrix[(i, i)] = Complex64::new(-1.0, 0.0);
        }

        let mut demixer = Self { matrix, mix_cov, n_src };
        if let Err(err) = demixer.update_background(bin) {
            log::debug!("{}: background rows left uncorrelated", err);
        }
        demixer
    }

    /// Number of microphones
    pub fn n_mics(&self) -> usize {
        self.matrix.nrows()
    }

    pub fn n_src(&self) -> usize {
        self.n_src
    }

    /// Full working matrix Ŵ
    pub fn matrix(&self) -> &DMatrix<Complex64> {
        &self.matrix
    }

    /// Target rows W (S × M)
    pub fn targets(&self) -> DMatrix<Complex64> {
        self.matrix.rows(0, self.n_src).into_owned()
    }

    /// Recompute the background block `[J, −I]` from the current targets
    fn update_background(&mut self, bin: usize) -> Result<(), NumericalFailure> {
        let (s, m) = (self.n_src, self.n_mics());
        if s == m {
            return Ok(());
        }

        let wc = self.targets() * &self.mix_cov;
        let t1 = wc.columns(0, s).into_owned();
        let t2 = wc.columns(s, m - s).into_owned();
        let j = t1
            .lu()
            .solve(&t2)
            .ok_or(NumericalFailure::SingularBackground { bin })?
            .adjoint();

        let minus_one = Complex64::new(-1.0, 0.0);
        for r in 0..(m - s) {
            for c in 0..s {
                self.matrix[(s + r, c)] = j[(r, c)];
            }
            for c in 0..(m - s) {
                self.matrix[(s + r, s + c)] = if r == c { minus_one } else { Complex64::new(0.0, 0.0) };
            }
        }
        Ok(())
    }

    /// Iterative projection update of target row `k` against covariance `v`
    pub fn update_row(&mut self, bin: usize, k: usize, v: &DMatrix<Complex64>) -> Result<(), NumericalFailure> {
        let failure = NumericalFailure::SingularDemixing { bin, source_index: k };

        let mut e_k = DVector::<Complex64>::zeros(self.n_mics());
        e_k[k] = Complex64::new(1.0, 0.0);

        let a = (&self.matrix * v).lu().solve(&e_k).ok_or_else(|| failure.clone())?;
        let a = normalize_row(a, v).ok_or(failure)?;

        for m in 0..self.n_mics() {
            self.matrix[(k, m)] = a[m].conj();
        }
        Ok(())
    }

    /// One full pass over the target rows
    ///
    /// `frames` is the bin's mixture (T × M), `inverse_variance` the
    /// reciprocal source variances (T × S). Returns how many auxiliary
    /// covariances needed diagonal loading.
    pub fn update(
        &mut self,
        bin: usize,
        frames: ArrayView2<Complex64>,
        inverse_variance: ArrayView2<f64>,
        condition_floor: f64,
    ) -> Result<usize, NumericalFailure> {
        let mut loaded = 0;
        for k in 0..self.n_src {
            let (v, was_loaded) = source_covariance(frames, inverse_variance.column(k), condition_floor);
            if was_loaded {
                log::debug!("bin {}: auxiliary covariance of source {} loaded", bin, k);
                loaded += 1;
            }
            self.update_row(bin, k, &v)?;
            self.update_background(bin)?;
        }
        Ok(loaded)
    }

    /// Multiply each target row by the matching factor
    pub fn scale_rows(&mut self, factors: &[f64]) {
        for (k, &f) in factors.iter().take(self.n_src).enumerate() {
            let f = Complex64::new(f, 0.0);
            for m in 0..self.n_mics() {
                self.matrix[(k, m)] *= f;
            }
        }
    }

    /// Separated frames `y_t = W x_t` (T × S)
    pub fn demix(&self, frames: ArrayView2<Complex64>) -> Array2<Complex64> {
        let (n_frames, n_mics) = frames.dim();
        let mut out = Array2::zeros((n_frames, self.n_src));
        for (mut y, x) in out.outer_iter_mut().zip(frames.outer_iter()) {
            for k in 0..self.n_src {
                let mut acc = Complex64::new(0.0, 0.0);
                for m in 0..n_mics {
                    acc += self.matrix[(k, m)] * x[m];
                }
                y[k] = acc;
            }
        }
        out
    }

    /// `ln |det Ŵ|`, `None` when Ŵ is singular
    pub fn log_abs_det(&self) -> Option<f64> {
        let lu = self.matrix.clone().lu();
        let mut total = 0.0;
        for d in lu.u().diagonal().iter() {
            let magnitude = d.norm();
            if magnitude == 0.0 || !magnitude.is_finite() {
                return None;
            }
            total += magnitude.ln();
        }
        Some(total)
    }

    /// Ŵ⁻¹, the implied mixing matrix
    pub fn inverse(&self) -> Option<DMatrix<Complex64>> {
        self.matrix.clone().try_inverse()
    }

    /// `w_kᴴ V w_k` for target row `k`
    pub fn row_energy(&self, k: usize, v: &DMatrix<Complex64>) -> f64 {
        let w = self.matrix.row(k).adjoint();
        quadratic_form(&w, v)
    }

    /// All entries finite
    pub fn is_finite(&self) -> bool {
        self.matrix.iter().all(|z| z.re.is_finite() && z.im.is_finite())
    }
}

/// `aᴴ V a`, real for Hermitian V
fn quadratic_form(a: &DVector<Complex64>, v: &DMatrix<Complex64>) -> f64 {
    (a.adjoint() * v * a)[(0, 0)].re
}

/// Scale `a` to unit `V`-norm
fn normalize_row(a: DVector<Complex64>, v: &DMatrix<Complex64>) -> Option<DVector<Complex64>> {
    let energy = quadratic_form(&a, v);
    if !energy.is_finite() || energy <= 0.0 {
        return None;
    }
    Some(a / Complex64::new(energy.sqrt(), 0.0))
}
