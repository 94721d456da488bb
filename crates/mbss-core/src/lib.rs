//! Multi-modal blind source separation
//!
//! Joint estimation of demixing matrices and source powers from a
//! microphone array STFT and the power readings of blinky sensors
//! (low-rate sound-to-light power meters placed near the sources).
//!
//! ## Estimators
//! - Blinky-informed IVA: Itakura-Saito NMF of the blinky power shares its
//!   activations with the time-varying Gaussian source model
//! - Time-varying Gaussian AuxIVA: audio-only baseline, same driver
//!
//! ## Pipeline per outer iteration
//! - Audio power of the current separated output
//! - Power-model passes ([`power`])
//! - Auxiliary covariances ([`covariance`]) and iterative projection
//!   ([`demix`]) for every frequency bin in parallel
//! - Projection back ([`projection`]) for observers and the final output
//!
//! ```no_run
//! use mbss_core::{separate, SeparationConfig};
//! use ndarray::{Array2, Array3};
//! use mbss_core::Complex64;
//!
//! let mixture = Array3::<Complex64>::zeros((100, 257, 4));
//! let blinky = Array2::<f64>::zeros((100, 2));
//! let result = separate(mixture.view(), blinky.view(), &SeparationConfig::new(2), None, None)?;
//! assert_eq!(result.output.dim(), (100, 257, 2));
//! # Ok::<(), mbss_core::SeparationError>(())
//! ```

pub mod config;
pub mod covariance;
pub mod demix;
pub mod driver;
pub mod observer;
pub mod power;
pub mod projection;

mod error;

pub use config::{Algorithm, ProjectionBack, SeparationConfig};
pub use driver::{separate, CostEntry, DriverState, Separation, SeparationModel, SeparationStatus};
pub use error::{NumericalFailure, SeparationError, SeparationResult};
pub use observer::{IterationCounter, IterationObserver};
pub use power::{BlinkyNmf, GaussPower, PowerState, SourcePowerModel};

pub use num_complex::Complex64;
