//! Convergence trace observer

use std::path::Path;

use mbss_core::{Complex64, IterationObserver};
use ndarray::ArrayView3;
use serde::{Deserialize, Serialize};

use crate::metrics::bss_eval;
use crate::stft::Stft;
use crate::SimResult;

/// Metrics recorded at one observer call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEntry {
    pub iteration: usize,
    pub sdr: Vec<f64>,
    pub sir: Vec<f64>,
    pub permutation: Vec<usize>,
}

/// Append-only record of SDR/SIR across iterations
///
/// Each observed estimate is synthesized with the given STFT and scored
/// against the reference images.
pub struct ConvergenceTrace<'a> {
    stft: &'a Stft,
    references: &'a [Vec<f64>],
    entries: Vec<TraceEntry>,
}

impl<'a> ConvergenceTrace<'a> {
    pub fn new(stft: &'a Stft, references: &'a [Vec<f64>]) -> Self {
        Self {
            stft,
            references,
            entries: Vec::new(),
        }
    }

    /// Score separated spectra (T × F × S) and append the result
    pub fn record(&mut self, iteration: usize, separated: ArrayView3<Complex64>) -> SimResult<&TraceEntry> {
        let estimates = self.stft.synthesize_multichannel(separated)?;
        let metrics = bss_eval(self.references, &estimates, self.stft.frame_size())?;

        log::debug!(
            "iteration {}: SDR {:?} dB, SIR {:?} dB",
            iteration,
            metrics.sdr,
            metrics.sir
        );

        self.entries.push(TraceEntry {
            iteration,
            sdr: metrics.sdr,
            sir: metrics.sir,
            permutation: metrics.permutation,
        });
        Ok(&self.entries[self.entries.len() - 1])
    }

    pub fn entries(&self) -> &[TraceEntry] {
        &self.entries
    }

    pub fn last(&self) -> Option<&TraceEntry> {
        self.entries.last()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn to_json(&self) -> SimResult<String> {
        Ok(serde_json::to_string_pretty(&self.entries)?)
    }

    /// Write the entries as pretty JSON
    pub fn save(&self, path: impl AsRef<Path>) -> SimResult<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }
}

impl IterationObserver for ConvergenceTrace<'_> {
    fn on_iteration(&mut self, iteration: usize, separated: ArrayView3<'_, Complex64>) -> anyhow::Result<()> {
        self.record(iteration, separated)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::{sinusoid, FreeFieldScene, SceneConfig};
    use approx::assert_relative_eq;
    use ndarray::{array, s};

    #[test]
    fn test_records_in_call_order() {
        let scene = FreeFieldScene::new(
            vec![
                sinusoid(1000.0, 8000.0, 1600, |_| 1.0),
                sinusoid(3000.0, 8000.0, 1600, |_| 0.5),
            ],
            array![[1.0, 0.5], [0.3, 1.0]],
            array![[1.0, 0.0], [0.0, 1.0]],
        )
        .unwrap();
        let config = SceneConfig {
            sample_rate: 8000.0,
            frame_size: 16,
            hop: 8,
            snr_db: None,
            ..Default::default()
        };
        let rendered = scene.render(&config).unwrap();
        let stft = config.stft().unwrap();

        let mut trace = ConvergenceTrace::new(&stft, &rendered.references);
        let oracle = stft.analyze_multichannel(&rendered.references).unwrap();
        trace.on_iteration(1, rendered.mixture.slice(s![.., .., ..2])).unwrap();
        trace.on_iteration(3, oracle.view()).unwrap();

        assert_eq!(trace.len(), 2);
        assert_eq!(trace.entries()[0].iteration, 1);
        assert_eq!(trace.last().unwrap().iteration, 3);
        // Spectra of the reference images reconstruct them exactly
        assert!(trace.last().unwrap().sdr.iter().all(|&sdr| sdr > 100.0));

        let json = trace.to_json().unwrap();
        let parsed: Vec<TraceEntry> = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.len(), 2);
        for (a, b) in parsed.iter().zip(trace.entries()) {
            assert_eq!(a.iteration, b.iteration);
            assert_eq!(a.permutation, b.permutation);
            for (x, y) in a.sir.iter().zip(&b.sir) {
                assert_relative_eq!(*x, *y, max_relative = 1e-12);
            }
        }
    }
}
