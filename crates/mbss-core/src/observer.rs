//! Iteration observer

use ndarray::ArrayView3;
use num_complex::Complex64;

/// Read-only hook invoked after completed outer iterations
///
/// `separated` is the current estimate (T × F × S) with projection back
/// applied. It reflects a fully completed iteration; no partially updated
/// bin is ever visible. Returning an error stops the separation and the
/// error is handed back to the caller.
pub trait IterationObserver {
    fn on_iteration(&mut self, iteration: usize, separated: ArrayView3<'_, Complex64>) -> anyhow::Result<()>;
}

impl<F> IterationObserver for F
where
    F: FnMut(usize, ArrayView3<'_, Complex64>) -> anyhow::Result<()>,
{
    fn on_iteration(&mut self, iteration: usize, separated: ArrayView3<'_, Complex64>) -> anyhow::Result<()> {
        self(iteration, separated)
    }
}

/// Observer that only counts invocations
#[derive(Debug, Default, Clone)]
pub struct IterationCounter {
    /// Iteration index of every call, in order
    pub iterations: Vec<usize>,
}

impl IterationObserver for IterationCounter {
    fn on_iteration(&mut self, iteration: usize, _separated: ArrayView3<'_, Complex64>) -> anyhow::Result<()> {
        self.iterations.push(iteration);
        Ok(())
    }
}
