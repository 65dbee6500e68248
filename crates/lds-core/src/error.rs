//! Error types for LDS estimation

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Which part of the input made a fit degenerate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DegenerateDimension {
    /// Fewer than two (observed) time steps.
    Time,
    /// Observation column `i` of `y` has zero variance.
    Observation(usize),
    /// Latent state dimension `i` has zero smoothed second moment.
    State(usize),
    /// Control column `j` of `u` is identically zero.
    Control(usize),
    /// Exogenous column `j` of `v` is identically zero.
    Exogenous(usize),
}

impl fmt::Display for DegenerateDimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Time => write!(f, "fewer than 2 time steps"),
            Self::Observation(i) => write!(f, "observation dimension {i} has zero variance"),
            Self::State(i) => write!(f, "state dimension {i} has zero variance"),
            Self::Control(j) => write!(f, "control input {j} is identically zero"),
            Self::Exogenous(j) => write!(f, "exogenous input {j} is identically zero"),
        }
    }
}

/// LDS estimation error type
#[derive(Error, Debug)]
pub enum Error {
    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Input shapes inconsistent with the model dimensions
    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),

    /// Input cannot support parameter estimation
    #[error("Degenerate input: {0}")]
    DegenerateInput(DegenerateDimension),

    /// Innovation covariance `S_t` is not positive-definite
    #[error("Innovation covariance not positive-definite at t={t}")]
    SingularInnovationCovariance {
        /// 1-based time step of the failed update.
        t: usize,
    },

    /// Predicted covariance `P_{t|t-1}` could not be inverted for the smoother gain
    #[error("Predicted covariance not positive-definite at t={t}")]
    SingularPredictedCovariance {
        /// 1-based time step of the failed gain.
        t: usize,
    },

    /// Computation error
    #[error("Computation error: {0}")]
    Computation(String),

    /// A training run was aborted
    #[error("EM failed at iteration {iteration}: {source}")]
    Failed {
        /// 1-based EM iteration at which the run was aborted.
        iteration: usize,
        /// The condition that triggered the failure.
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Whether a diagonal jitter on Q/R may cure this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::SingularInnovationCovariance { .. } | Error::SingularPredictedCovariance { .. }
        )
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
