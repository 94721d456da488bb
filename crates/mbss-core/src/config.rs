//! Separation configuration

use serde::{Deserialize, Serialize};

use crate::error::{SeparationError, SeparationResult};

/// Floor applied to activations and gains after every multiplicative update
pub const DEFAULT_POWER_FLOOR: f64 = 1e-15;

/// Relative eigenvalue threshold below which a weighted covariance is loaded
pub const DEFAULT_CONDITION_FLOOR: f64 = 1e-12;

/// Separation algorithm
///
/// Closed set of estimators sharing the same input/output contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Algorithm {
    /// Time-varying Gaussian IVA, source power estimated from the audio only
    #[serde(rename = "auxiva-gauss")]
    AuxIvaGauss,
    /// Joint IVA with a nonnegative power model fed by blinky readings
    #[default]
    #[serde(rename = "blinkiva-gauss")]
    BlinkIvaGauss,
}

impl Algorithm {
    /// Short name used in logs and reports
    pub fn name(&self) -> &'static str {
        match self {
            Algorithm::AuxIvaGauss => "auxiva-gauss",
            Algorithm::BlinkIvaGauss => "blinkiva-gauss",
        }
    }

    /// Whether blinky readings take part in the estimate
    pub fn uses_blinkies(&self) -> bool {
        matches!(self, Algorithm::BlinkIvaGauss)
    }
}

/// Scale fixing applied to the separated output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ProjectionBack {
    /// Raw demixed output
    Disabled,
    /// Scale by the output's contribution to the reference mic, from the inverse demixing matrix
    #[default]
    MinimalDistortion,
    /// Least-squares fit of each output to the reference mic
    LeastSquares,
}

/// Separation configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeparationConfig {
    /// Estimator variant
    pub algorithm: Algorithm,

    /// Number of sources to extract (must not exceed the microphone count)
    pub n_src: usize,

    /// Outer iterations
    pub n_iter: usize,

    /// Multiplicative power-model passes per outer iteration
    pub n_nmf_sub_iter: usize,

    /// L1 penalty on activations (0 disables)
    pub sparse_reg: f64,

    /// Latent components beyond one per source, explaining blinky power only
    pub background_components: usize,

    /// Seed for the driver-owned random state
    pub seed: u64,

    /// Scale fixing for observer snapshots and the final output
    pub projection_back: ProjectionBack,

    /// Reference microphone for projection back
    pub ref_mic: usize,

    /// Observer period in outer iterations (0 disables the observer)
    pub observer_interval: usize,

    /// Return demixing matrices and power-model factors
    pub return_model: bool,

    /// Record the cost after every outer iteration
    pub track_cost: bool,

    /// Stop when the relative change of the total cost drops below this value
    pub stop_tolerance: Option<f64>,

    /// Floor for activations and gains
    pub power_floor: f64,

    /// Relative eigenvalue threshold for diagonal loading
    pub condition_floor: f64,
}

impl Default for SeparationConfig {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::BlinkIvaGauss,
            n_src: 2,
            n_iter: 20,
            n_nmf_sub_iter: 20,
            sparse_reg: 0.0,
            background_components: 0,
            seed: 0,
            projection_back: ProjectionBack::MinimalDistortion,
            ref_mic: 0,
            observer_interval: 1,
            return_model: false,
            track_cost: false,
            stop_tolerance: None,
            power_floor: DEFAULT_POWER_FLOOR,
            condition_floor: DEFAULT_CONDITION_FLOOR,
        }
    }
}

impl SeparationConfig {
    /// Create configuration for `n_src` sources with default parameters
    pub fn new(n_src: usize) -> Self {
        Self {
            n_src,
            ..Default::default()
        }
    }

    /// Few iterations, for previews and smoke tests
    pub fn fast(n_src: usize) -> Self {
        Self {
            n_src,
            n_iter: 10,
            n_nmf_sub_iter: 5,
            ..Default::default()
        }
    }

    /// Long run matching the published experiments
    pub fn thorough(n_src: usize) -> Self {
        Self {
            n_src,
            n_iter: 51,
            n_nmf_sub_iter: 100,
            track_cost: true,
            ..Default::default()
        }
    }

    /// Select the estimator variant
    pub fn with_algorithm(mut self, algorithm: Algorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    /// Set outer and inner iteration counts
    pub fn with_iterations(mut self, n_iter: usize, n_nmf_sub_iter: usize) -> Self {
        self.n_iter = n_iter;
        self.n_nmf_sub_iter = n_nmf_sub_iter;
        self
    }

    /// Set the activation sparsity penalty
    pub fn with_sparse_reg(mut self, sparse_reg: f64) -> Self {
        self.sparse_reg = sparse_reg;
        self
    }

    /// Set the seed
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Set the projection back rule
    pub fn with_projection_back(mut self, projection_back: ProjectionBack) -> Self {
        self.projection_back = projection_back;
        self
    }

    /// Return demixing matrices and power-model factors with the output
    pub fn with_model(mut self) -> Self {
        self.return_model = true;
        self
    }

    /// Number of latent power components for a given source count
    pub fn n_components(&self) -> usize {
        self.n_src + self.background_components
    }

    /// Check parameter ranges that do not depend on the input tensors
    pub fn validate(&self) -> SeparationResult<()> {
        if self.n_src == 0 {
            return Err(SeparationError::InvalidParameter {
                name: "n_src",
                reason: "at least one source is required".into(),
            });
        }
        if !self.sparse_reg.is_finite() || self.sparse_reg < 0.0 {
            return Err(SeparationError::InvalidParameter {
                name: "sparse_reg",
                reason: format!("must be finite and >= 0, got {}", self.sparse_reg),
            });
        }
        if !self.power_floor.is_finite() || self.power_floor <= 0.0 {
            return Err(SeparationError::InvalidParameter {
                name: "power_floor",
                reason: format!("must be finite and > 0, got {}", self.power_floor),
            });
        }
        if !self.condition_floor.is_finite() || self.condition_floor <= 0.0 || self.condition_floor >= 1.0 {
            return Err(SeparationError::InvalidParameter {
                name: "condition_floor",
                reason: format!("must lie in (0, 1), got {}", self.condition_floor),
            });
        }
        if let Some(tol) = self.stop_tolerance {
            if !tol.is_finite() || tol <= 0.0 {
                return Err(SeparationError::InvalidParameter {
                    name: "stop_tolerance",
                    reason: format!("must be finite and > 0, got {}", tol),
                });
            }
        }
        Ok(())
    }
}
