//! Error types for the separation core

use serde::Serialize;
use thiserror::Error;

/// Separation error types
///
/// Everything except [`SeparationError::Observer`] is a configuration error and
/// is raised before any computation starts.
#[derive(Error, Debug)]
pub enum SeparationError {
    /// More sources requested than microphones available
    #[error("Underdetermined mixture: {n_src} sources requested from {n_mics} microphones")]
    Underdetermined { n_src: usize, n_mics: usize },

    /// Tensor dimensions disagree
    #[error("Shape mismatch for {what}: expected {expected}, got {got}")]
    ShapeMismatch {
        what: &'static str,
        expected: String,
        got: String,
    },

    /// Power readings must be nonnegative
    #[error("Negative power in {what} at {index:?}: {value}")]
    NegativePower {
        what: &'static str,
        index: (usize, usize),
        value: f64,
    },

    /// NaN or infinity in an input tensor
    #[error("Non-finite value in {0}")]
    NonFiniteInput(&'static str),

    /// Parameter out of range
    #[error("Invalid parameter {name}: {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    /// Zero frames, bins or sources
    #[error("Empty input: {0}")]
    EmptyInput(&'static str),

    /// The iteration observer failed
    #[error("Iteration observer failed at iteration {iteration}")]
    Observer {
        iteration: usize,
        #[source]
        source: anyhow::Error,
    },
}

/// Result type for separation operations
pub type SeparationResult<T> = Result<T, SeparationError>;

/// Irrecoverable numerical failure inside the iteration loop
///
/// Not an error for the caller: the driver stops, restores the last valid
/// state and reports this through [`crate::SeparationStatus::Aborted`].
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
pub enum NumericalFailure {
    /// Demixing solve failed even after diagonal loading
    #[error("singular demixing system in bin {bin} for source {source_index}")]
    SingularDemixing { bin: usize, source_index: usize },

    /// Background subspace could not be made orthogonal to the targets
    #[error("singular orthogonality constraint in bin {bin}")]
    SingularBackground { bin: usize },

    /// NaN or infinity appeared in the state
    #[error("non-finite values in {0}")]
    NonFinite(&'static str),
}
