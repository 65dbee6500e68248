//! EM training loop ("learnLDS") for linear dynamical systems.
//!
//! Each iteration runs the E-step (Kalman filter + RTS smoother) under the
//! current parameters, records the log-likelihood, and replaces the parameters
//! with the M-step output. The trainer only ever holds the latest `Theta` and
//! the log-likelihood trace.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use lds_core::{Error, Result};
use serde::{Deserialize, Serialize};

use crate::filter::FilterConfig;
use crate::linalg::min_eigenvalue;
use crate::model::{LdsData, Theta};
use crate::mstep::{MStepConfig, m_step};
use crate::smoother::e_step;

/// EM configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmConfig {
    /// Maximum EM iterations.
    pub max_iter: usize,
    /// Relative tolerance on log-likelihood improvement.
    pub tol: f64,
    /// Diagonal jitter added to Q/R when an E-step hits a singular covariance.
    pub jitter: f64,
    /// Relative decrease in log-likelihood tolerated as rounding noise.
    pub decrease_tol: f64,
    /// Consecutive decreasing iterations after which the run fails.
    pub max_consecutive_decreases: usize,
    /// Kalman filter settings.
    pub filter: FilterConfig,
    /// M-step settings.
    pub mstep: MStepConfig,
}

impl Default for EmConfig {
    fn default() -> Self {
        Self {
            max_iter: 100,
            tol: 1e-6,
            jitter: 1e-6,
            decrease_tol: 1e-6,
            max_consecutive_decreases: 2,
            filter: FilterConfig::default(),
            mstep: MStepConfig::default(),
        }
    }
}

impl EmConfig {
    fn validate(&self) -> Result<()> {
        if self.max_iter == 0 {
            return Err(Error::Validation("max_iter must be > 0".to_string()));
        }
        if !self.tol.is_finite() || self.tol <= 0.0 {
            return Err(Error::Validation("tol must be finite and > 0".to_string()));
        }
        if !self.jitter.is_finite() || self.jitter <= 0.0 {
            return Err(Error::Validation("jitter must be finite and > 0".to_string()));
        }
        if !self.decrease_tol.is_finite() || self.decrease_tol < 0.0 {
            return Err(Error::Validation("decrease_tol must be finite and >= 0".to_string()));
        }
        if self.max_consecutive_decreases == 0 {
            return Err(Error::Validation("max_consecutive_decreases must be > 0".to_string()));
        }
        self.filter.validate()?;
        self.mstep.validate()
    }
}

/// Where the first `Theta` comes from.
#[derive(Debug, Clone)]
pub enum InitialGuess {
    /// Caller-supplied parameters; validated and regularized if needed.
    Provided(Theta),
    /// Data-driven guess, see [`Theta::heuristic`].
    Heuristic {
        /// Latent state dimension.
        n_state: usize,
    },
}

/// Why a successful run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FitStatus {
    /// Relative log-likelihood improvement fell below `tol`.
    Converged,
    /// Iteration budget exhausted (or the run was cancelled).
    MaxIterationsReached,
}

/// Lifecycle of one training run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainerState {
    /// Validating inputs and building the initial parameters.
    Initializing,
    /// Running EM iterations.
    Iterating,
    /// Stopped on the tolerance.
    Converged,
    /// Stopped on the iteration budget or a cancellation request.
    MaxIterationsReached,
    /// Aborted; no usable parameters.
    Failed,
}

/// Output of a completed training run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitRecord {
    /// Parameters after the last M-step.
    pub theta: Theta,
    /// Log-likelihood of the parameters entering each iteration.
    pub loglik_trace: Vec<f64>,
    /// Number of completed EM iterations.
    pub n_iter: usize,
    /// Terminal status.
    pub status: FitStatus,
    /// Shorthand for `status == FitStatus::Converged`.
    pub converged: bool,
    /// Whether the run stopped early on a cancellation request.
    pub cancelled: bool,
}

impl FitRecord {
    /// Last recorded log-likelihood (`-inf` if no iteration ran).
    pub fn final_loglik(&self) -> f64 {
        self.loglik_trace.last().copied().unwrap_or(f64::NEG_INFINITY)
    }
}

/// Cooperative stop flag, checked between EM iterations.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// A fresh, un-cancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask every run holding a clone of this token to stop.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Whether `cancel` has been called.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Decision after observing one more log-likelihood.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Continue,
    Converged,
    Diverged,
}

/// Tracks the log-likelihood trace for convergence and stability.
#[derive(Debug, Clone)]
struct ConvergenceMonitor {
    tol: f64,
    decrease_tol: f64,
    max_consecutive_decreases: usize,
    prev: Option<f64>,
    consecutive_decreases: usize,
}

impl ConvergenceMonitor {
    fn new(cfg: &EmConfig) -> Self {
        Self {
            tol: cfg.tol,
            decrease_tol: cfg.decrease_tol,
            max_consecutive_decreases: cfg.max_consecutive_decreases,
            prev: None,
            consecutive_decreases: 0,
        }
    }

    fn observe(&mut self, ll: f64) -> Verdict {
        let Some(prev) = self.prev.replace(ll) else {
            return Verdict::Continue;
        };
        let rel = (ll - prev) / prev.abs().max(f64::EPSILON);
        if rel < -self.decrease_tol {
            self.consecutive_decreases += 1;
            log::warn!(
                "EM log-likelihood decreased: {prev:.6} -> {ll:.6} (rel {rel:.3e}, {} in a row)",
                self.consecutive_decreases
            );
            if self.consecutive_decreases >= self.max_consecutive_decreases {
                return Verdict::Diverged;
            }
            return Verdict::Continue;
        }
        self.consecutive_decreases = 0;
        if rel < self.tol { Verdict::Converged } else { Verdict::Continue }
    }
}

/// One EM iteration: E-step under `theta` (with a single jitter retry), then M-step.
///
/// Returns the new parameters and the log-likelihood of the parameters the
/// E-step actually used.
pub fn em_iteration(data: &LdsData<'_>, theta: &Theta, cfg: &EmConfig) -> Result<(Theta, f64)> {
    let es = match e_step(data, theta, &cfg.filter) {
        Ok(es) => es,
        Err(e) if e.is_recoverable() => {
            log::warn!("E-step failed ({e}); retrying with jitter {:.1e} on Q/R", cfg.jitter);
            e_step(data, &theta.with_jitter(cfg.jitter), &cfg.filter)?
        }
        Err(e) => return Err(e),
    };
    let next = m_step(data, &es, &cfg.mstep)?;
    Ok((next, es.log_likelihood))
}

fn transition(state: &mut TrainerState, next: TrainerState) {
    log::debug!("EM trainer: {state:?} -> {next:?}");
    *state = next;
}

/// EM trainer for linear dynamical systems.
#[derive(Debug)]
pub struct EmTrainer {
    config: EmConfig,
    cancel: Option<CancelToken>,
    state: TrainerState,
}

impl EmTrainer {
    /// Create a new trainer with the given configuration.
    pub fn new(config: EmConfig) -> Self {
        Self { config, cancel: None, state: TrainerState::Initializing }
    }

    /// Stop after the current iteration once `token` is cancelled.
    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TrainerState {
        self.state
    }

    /// Run EM to convergence, the iteration budget, or cancellation.
    pub fn fit(&mut self, data: &LdsData<'_>, init: InitialGuess) -> Result<FitRecord> {
        transition(&mut self.state, TrainerState::Initializing);
        let mut theta = match self.initialize(data, init) {
            Ok(theta) => theta,
            Err(e) => {
                transition(&mut self.state, TrainerState::Failed);
                return Err(e);
            }
        };

        transition(&mut self.state, TrainerState::Iterating);
        let cfg = &self.config;
        let mut monitor = ConvergenceMonitor::new(cfg);
        let mut trace = Vec::with_capacity(cfg.max_iter);
        let mut status = FitStatus::MaxIterationsReached;
        let mut cancelled = false;

        for iter in 1..=cfg.max_iter {
            if self.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
                log::info!("EM cancelled before iteration {iter}");
                cancelled = true;
                break;
            }

            let (next, ll) = match em_iteration(data, &theta, cfg) {
                Ok(step) => step,
                Err(e) => {
                    transition(&mut self.state, TrainerState::Failed);
                    return Err(Error::Failed { iteration: iter, source: Box::new(e) });
                }
            };
            log::debug!("EM iter {iter}: loglik={ll:.6}");
            trace.push(ll);
            theta = next;

            match monitor.observe(ll) {
                Verdict::Continue => {}
                Verdict::Converged => {
                    status = FitStatus::Converged;
                    break;
                }
                Verdict::Diverged => {
                    transition(&mut self.state, TrainerState::Failed);
                    return Err(Error::Failed {
                        iteration: iter,
                        source: Box::new(Error::Computation(format!(
                            "log-likelihood decreased on {} consecutive iterations",
                            cfg.max_consecutive_decreases
                        ))),
                    });
                }
            }
        }

        let terminal = match status {
            FitStatus::Converged => TrainerState::Converged,
            FitStatus::MaxIterationsReached => TrainerState::MaxIterationsReached,
        };
        transition(&mut self.state, terminal);
        log::info!(
            "EM finished: {:?} after {} iterations (loglik={:.6})",
            status,
            trace.len(),
            trace.last().copied().unwrap_or(f64::NAN)
        );

        Ok(FitRecord {
            theta,
            n_iter: trace.len(),
            loglik_trace: trace,
            status,
            converged: status == FitStatus::Converged,
            cancelled,
        })
    }

    fn initialize(&self, data: &LdsData<'_>, init: InitialGuess) -> Result<Theta> {
        self.config.validate()?;
        data.check_degenerate(self.config.mstep.min_variance)?;

        let theta = match init {
            InitialGuess::Provided(theta) => theta,
            InitialGuess::Heuristic { n_state } => Theta::heuristic(data, n_state)?,
        };
        theta.validate()?;
        theta.check_against(data)?;

        let floor = self.config.mstep.min_eigenvalue;
        let covs = [&theta.q, &theta.r, &theta.sigma0];
        if covs.iter().any(|m| min_eigenvalue(m) < floor) {
            log::warn!("initial Q/R/Sigma0 has eigenvalues below {floor:.1e}; regularizing");
            return theta.regularized(floor);
        }
        Ok(theta)
    }
}

/// Fit an LDS by EM: the "learnLDS" entry point.
pub fn learn_lds(data: &LdsData<'_>, init: InitialGuess, cfg: EmConfig) -> Result<FitRecord> {
    EmTrainer::new(cfg).fit(data, init)
}
