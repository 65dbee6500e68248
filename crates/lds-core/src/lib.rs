//! # lds-core
//!
//! Shared error types for linear dynamical system (LDS) estimation.
//!
//! Numerical code lives in `lds-inference`; this crate only defines the
//! failure vocabulary that every stage (filter, smoother, M-step, trainer)
//! reports through.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Error type and degenerate-dimension descriptor.
pub mod error;

pub use error::{DegenerateDimension, Error, Result};
