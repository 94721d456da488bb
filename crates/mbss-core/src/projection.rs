//! Projection back
//!
//! Fixes the per-bin complex scale of each separated source by referring it
//! to a reference microphone. Pure post-processing: nothing computed here
//! feeds back into the iteration.

use nalgebra::DMatrix;
use ndarray::{Array3, ArrayView1, ArrayView2, ArrayView3, Axis};
use num_complex::Complex64;
use rayon::prelude::*;

use crate::config::ProjectionBack;

/// Least-squares scales `c_k = Σ_t conj(y_k) x_ref / Σ_t |y_k|²`
///
/// A silent output keeps unit scale.
pub fn least_squares_scales(separated: ArrayView2<Complex64>, reference: ArrayView1<Complex64>) -> Vec<Complex64> {
    separated
        .columns()
        .into_iter()
        .map(|y| {
            let mut num = Complex64::new(0.0, 0.0);
            let mut den = 0.0;
            for (&yt, &xt) in y.iter().zip(reference.iter()) {
                num += yt.conj() * xt;
                den += yt.norm_sqr();
            }
            if den > 0.0 { num / den } else { Complex64::new(1.0, 0.0) }
        })
        .collect()
}

/// Minimal-distortion scales `(Ŵ⁻¹)[ref_mic, k]`, `None` when Ŵ is singular
pub fn minimal_distortion_scales(
    demixing: &DMatrix<Complex64>,
    n_src: usize,
    ref_mic: usize,
) -> Option<Vec<Complex64>> {
    let inverse = demixing.clone().try_inverse()?;
    let scales: Vec<Complex64> = (0..n_src).map(|k| inverse[(ref_mic, k)]).collect();
    scales
        .iter()
        .all(|z| z.re.is_finite() && z.im.is_finite())
        .then_some(scales)
}

/// Rescale separated spectra (T × F × S) against the mixture (T × F × M)
///
/// `demixing` holds the full working matrix of every bin and is only read
/// for [`ProjectionBack::MinimalDistortion`].
pub fn project_back(
    separated: ArrayView3<Complex64>,
    mixture: ArrayView3<Complex64>,
    demixing: &[DMatrix<Complex64>],
    mode: ProjectionBack,
    ref_mic: usize,
) -> Array3<Complex64> {
    let mut output = separated.to_owned();
    if mode == ProjectionBack::Disabled {
        return output;
    }

    let n_src = separated.len_of(Axis(2));
    let scales: Vec<Vec<Complex64>> = (0..separated.len_of(Axis(1)))
        .into_par_iter()
        .map(|f| {
            let y = separated.index_axis(Axis(1), f);
            let x_ref = mixture.slice(ndarray::s![.., f, ref_mic]);
            let minimal = match mode {
                ProjectionBack::MinimalDistortion => demixing
                    .get(f)
                    .and_then(|w| minimal_distortion_scales(w, n_src, ref_mic)),
                _ => None,
            };
            minimal.unwrap_or_else(|| least_squares_scales(y, x_ref))
        })
        .collect();

    for (f, bin_scales) in scales.iter().enumerate() {
        let mut bin = output.index_axis_mut(Axis(1), f);
        for (mut column, &c) in bin.axis_iter_mut(Axis(1)).zip(bin_scales.iter()) {
            column.mapv_inplace(|y| y * c);
        }
    }
    output
}
