//! # mbss-sim
//!
//! Collaborators for exercising the separation core end to end.
//!
//! ## Features
//!
//! - **STFT**: Hann analysis with a matched synthesis window for perfect
//!   reconstruction at any hop that covers the frame
//! - **Free-field scenes**: instantaneous microphone mixing, sensor noise at a
//!   given SNR, blinky power with optional pre-emphasis
//! - **Metrics**: permutation-invariant SDR / SIR / SAR against reference images
//! - **Convergence trace**: observer recording the metrics after each callback
//!
//! ## Example
//!
//! ```rust,ignore
//! use mbss_sim::{FreeFieldScene, SceneConfig, ConvergenceTrace};
//!
//! let scene_config = SceneConfig::default();
//! let rendered = scene.render(&scene_config)?;
//! let stft = scene_config.stft()?;
//! let mut trace = ConvergenceTrace::new(&stft, &rendered.references);
//! let result = mbss_core::separate(rendered.mixture.view(), rendered.blinky_power.view(),
//!     &config, None, Some(&mut trace))?;
//! ```

pub mod metrics;
pub mod scene;
pub mod stft;
pub mod trace;

pub use metrics::{bss_eval, SeparationMetrics};
pub use scene::{pre_emphasis, sinusoid, FreeFieldScene, RenderedScene, SceneConfig};
pub use stft::Stft;
pub use trace::{ConvergenceTrace, TraceEntry};

use thiserror::Error;

/// Errors raised by the simulation helpers
#[derive(Error, Debug)]
pub enum SimError {
    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    #[error("Length mismatch: expected {expected}, got {got}")]
    LengthMismatch { expected: usize, got: usize },

    #[error("FFT error: {0}")]
    FftError(String),

    #[error("Degenerate reference signals")]
    DegenerateReference,

    #[error("Separation failed: {0}")]
    Separation(#[from] mbss_core::SeparationError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type SimResult<T> = std::result::Result<T, SimError>;
