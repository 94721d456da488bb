//! Separation quality metrics
//!
//! Time-domain decomposition of each estimate `ŝ` against the reference
//! images `s_1..s_n`:
//!
//! ```text
//! s_target = <ŝ, s_i> / ||s_i||² · s_i
//! e_interf = P_S ŝ − s_target      (P_S: projection on span{s_1..s_n})
//! e_artif  = ŝ − P_S ŝ
//! ```
//!
//! SDR, SIR and SAR are the usual energy ratios of these parts. The
//! estimate-to-reference assignment maximizes the mean SIR.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::{SimError, SimResult};

/// Metrics per reference source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeparationMetrics {
    /// Signal-to-distortion ratio (dB)
    pub sdr: Vec<f64>,
    /// Signal-to-interference ratio (dB)
    pub sir: Vec<f64>,
    /// Signal-to-artifact ratio (dB)
    pub sar: Vec<f64>,
    /// Estimate index assigned to each reference
    pub permutation: Vec<usize>,
}

impl SeparationMetrics {
    pub fn mean_sdr(&self) -> f64 {
        mean(&self.sdr)
    }

    pub fn mean_sir(&self) -> f64 {
        mean(&self.sir)
    }

    /// Smallest SDR over the sources
    pub fn min_sdr(&self) -> f64 {
        self.sdr.iter().cloned().fold(f64::INFINITY, f64::min)
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// Energy ratio in dB
fn ratio_db(num: f64, den: f64) -> f64 {
    10.0 * (num.max(f64::MIN_POSITIVE) / den.max(f64::MIN_POSITIVE)).log10()
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// (SDR, SIR, SAR) of every estimate against every reference
struct PairMetrics {
    sdr: DMatrix<f64>,
    sir: DMatrix<f64>,
    sar: DMatrix<f64>,
}

fn pair_metrics(references: &[&[f64]], estimates: &[&[f64]]) -> SimResult<PairMetrics> {
    let n = references.len();
    let gram = DMatrix::from_fn(n, n, |i, j| dot(references[i], references[j]));
    let gram_lu = gram.lu();

    let mut sdr = DMatrix::zeros(n, estimates.len());
    let mut sir = DMatrix::zeros(n, estimates.len());
    let mut sar = DMatrix::zeros(n, estimates.len());

    for (j, estimate) in estimates.iter().enumerate() {
        let b = DVector::from_fn(n, |i, _| dot(estimate, references[i]));
        let coeffs = gram_lu.solve(&b).ok_or(SimError::DegenerateReference)?;

        let projection: Vec<f64> = (0..estimate.len())
            .map(|t| (0..n).map(|i| coeffs[i] * references[i][t]).sum())
            .collect();

        for (i, reference) in references.iter().enumerate() {
            let energy = dot(reference, reference);
            if energy <= 0.0 {
                return Err(SimError::DegenerateReference);
            }
            let scale = b[i] / energy;

            let mut target = 0.0;
            let mut interf = 0.0;
            let mut artif = 0.0;
            let mut distortion = 0.0;
            let mut target_interf = 0.0;
            for t in 0..estimate.len() {
                let s_target = scale * reference[t];
                let e_interf = projection[t] - s_target;
                let e_artif = estimate[t] - projection[t];
                target += s_target * s_target;
                interf += e_interf * e_interf;
                artif += e_artif * e_artif;
                distortion += (e_interf + e_artif) * (e_interf + e_artif);
                target_interf += projection[t] * projection[t];
            }

            sdr[(i, j)] = ratio_db(target, distortion);
            sir[(i, j)] = ratio_db(target, interf);
            sar[(i, j)] = ratio_db(target_interf, artif);
        }
    }

    Ok(PairMetrics { sdr, sir, sar })
}

/// All permutations of `0..n`
fn permutations(n: usize) -> Vec<Vec<usize>> {
    fn extend(prefix: &mut Vec<usize>, used: &mut [bool], out: &mut Vec<Vec<usize>>) {
        if prefix.len() == used.len() {
            out.push(prefix.clone());
            return;
        }
        for k in 0..used.len() {
            if !used[k] {
                used[k] = true;
                prefix.push(k);
                extend(prefix, used, out);
                prefix.pop();
                used[k] = false;
            }
        }
    }

    let mut out = Vec::new();
    extend(&mut Vec::with_capacity(n), &mut vec![false; n], &mut out);
    out
}

/// Permutation-invariant SDR / SIR / SAR
///
/// `skip` samples are dropped at both ends, where overlap-add does not
/// reconstruct fully. Signals are truncated to the shortest length.
pub fn bss_eval(references: &[Vec<f64>], estimates: &[Vec<f64>], skip: usize) -> SimResult<SeparationMetrics> {
    if references.is_empty() {
        return Err(SimError::ConfigError("no reference signals".into()));
    }
    if estimates.len() != references.len() {
        return Err(SimError::LengthMismatch {
            expected: references.len(),
            got: estimates.len(),
        });
    }

    let len = references
        .iter()
        .chain(estimates.iter())
        .map(Vec::len)
        .min()
        .unwrap_or(0);
    if len <= 2 * skip {
        return Err(SimError::ConfigError(format!(
            "signals of {} samples are too short to skip {} at each end",
            len, skip
        )));
    }
    let window = skip..(len - skip);

    let refs: Vec<&[f64]> = references.iter().map(|r| &r[window.clone()]).collect();
    let ests: Vec<&[f64]> = estimates.iter().map(|e| &e[window.clone()]).collect();
    let pairs = pair_metrics(&refs, &ests)?;

    let n = references.len();
    let mut best: Option<(f64, Vec<usize>)> = None;
    for perm in permutations(n) {
        let score = (0..n).map(|i| pairs.sir[(i, perm[i])]).sum::<f64>() / n as f64;
        if best.as_ref().map_or(true, |(s, _)| score > *s) {
            best = Some((score, perm));
        }
    }
    let permutation = best.map(|(_, p)| p).unwrap_or_else(|| (0..n).collect());

    Ok(SeparationMetrics {
        sdr: (0..n).map(|i| pairs.sdr[(i, permutation[i])]).collect(),
        sir: (0..n).map(|i| pairs.sir[(i, permutation[i])]).collect(),
        sar: (0..n).map(|i| pairs.sar[(i, permutation[i])]).collect(),
        permutation,
    })
}
