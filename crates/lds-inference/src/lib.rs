//! # lds-inference
//!
//! Maximum-likelihood estimation of linear dynamical systems by EM.
//!
//! This crate provides:
//! - Kalman filtering with exact Gaussian log-likelihood
//! - Rauch–Tung–Striebel smoothing (the E-step sufficient statistics)
//! - Closed-form M-step re-estimation of `A, B, C, D, Q, R, mu0, Sigma0`
//! - The EM training loop, multi-start restarts and a seeded simulator
//!
//! ## Model
//!
//! ```text
//! x_t = A x_{t-1} + B u_t + w_t,   w_t ~ N(0, Q)
//! y_t = C x_t     + D v_t + e_t,   e_t ~ N(0, R)
//! x_0 ~ N(mu0, Sigma0)
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

/// EM training loop (`learn_lds`).
pub mod em;
/// Kalman filter forward pass.
pub mod filter;
/// Covariance helpers: eigenvalue floors and checks.
pub mod linalg;
/// Parameter set and observation container.
pub mod model;
/// Closed-form M-step.
pub mod mstep;
/// Parallel multi-start EM.
pub mod restart;
/// Seeded simulation from a parameter set.
pub mod simulate;
/// RTS smoother and E-step.
pub mod smoother;

pub use em::{
    CancelToken, EmConfig, EmTrainer, FitRecord, FitStatus, InitialGuess, TrainerState,
    em_iteration, learn_lds,
};
pub use filter::{FilterConfig, FilterOutput, FilterStep, kalman_filter, log_likelihood};
pub use lds_core::{DegenerateDimension, Error, Result};
pub use model::{LdsData, Theta};
pub use mstep::{MStepConfig, m_step};
pub use restart::{MultiStartFit, StartOutcome, learn_lds_multistart, perturbed_initial_guesses};
pub use simulate::{SimulatedLds, simulate};
pub use smoother::{SmootherOutput, e_step, rts_smoother};
