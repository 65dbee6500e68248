//! Rauch–Tung–Striebel smoother and the EM E-step.

use lds_core::{Error, Result};
use nalgebra::{DMatrix, DVector};

use crate::filter::{FilterConfig, FilterOutput, kalman_filter};
use crate::linalg::{cholesky_checked, floor_eigenvalues, min_eigenvalue, solve_right, symmetrize};
use crate::model::{LdsData, Theta};

/// Smoothed moments of the latent trajectory: the sufficient statistics of the M-step.
#[derive(Debug, Clone)]
pub struct SmootherOutput {
    /// Parameters the moments were computed under.
    pub theta: Theta,
    /// Log-likelihood of `theta` on the data.
    pub log_likelihood: f64,
    /// Smoothed means `m_{t|T}` for `t = 0..=T`.
    pub smoothed_means: Vec<DVector<f64>>,
    /// Smoothed covariances `P_{t|T}` for `t = 0..=T`.
    pub smoothed_covs: Vec<DMatrix<f64>>,
    /// Lag-one covariances `Cov(x_t, x_{t-1} | y_{1..T})` for `t = 1..=T`,
    /// stored at index `t - 1`.
    pub lag_one_covs: Vec<DMatrix<f64>>,
}

impl SmootherOutput {
    /// Number of observation steps `T`.
    pub fn len(&self) -> usize {
        self.lag_one_covs.len()
    }

    /// True when the smoother covers no observation step.
    pub fn is_empty(&self) -> bool {
        self.lag_one_covs.is_empty()
    }

    /// `Cov(x_t, x_{t-1} | y_{1..T})` for 1-based `t`.
    pub fn lag_one(&self, t: usize) -> &DMatrix<f64> {
        &self.lag_one_covs[t - 1]
    }

    /// Check that the moments cover `t_max` steps of a `theta.n_state()`-dimensional state.
    pub(crate) fn check_shape(&self, t_max: usize) -> Result<()> {
        let n = self.theta.n_state();
        if self.lag_one_covs.len() != t_max
            || self.smoothed_means.len() != t_max + 1
            || self.smoothed_covs.len() != t_max + 1
        {
            return Err(Error::DimensionMismatch(format!(
                "smoother output has {} means, {} covariances, {} lag-one terms; T={t_max}",
                self.smoothed_means.len(),
                self.smoothed_covs.len(),
                self.lag_one_covs.len()
            )));
        }
        if let Some(t) = self.smoothed_means.iter().position(|m| m.len() != n) {
            return Err(Error::DimensionMismatch(format!(
                "smoothed mean at t={t} has length {}, n_state={n}",
                self.smoothed_means[t].len()
            )));
        }
        if let Some(t) = self.smoothed_covs.iter().position(|p| p.shape() != (n, n)) {
            return Err(Error::DimensionMismatch(format!(
                "smoothed covariance at t={t} is not {n}x{n}"
            )));
        }
        if let Some(t) = self.lag_one_covs.iter().position(|p| p.shape() != (n, n)) {
            return Err(Error::DimensionMismatch(format!(
                "lag-one covariance at t={} is not {n}x{n}",
                t + 1
            )));
        }
        Ok(())
    }

    /// `E[x_t x_t^T | y_{1..T}]`.
    pub(crate) fn second_moment(&self, t: usize) -> DMatrix<f64> {
        let m = &self.smoothed_means[t];
        &self.smoothed_covs[t] + m * m.transpose()
    }

    /// `E[x_t x_{t-1}^T | y_{1..T}]` for `t >= 1`.
    pub(crate) fn cross_moment(&self, t: usize) -> DMatrix<f64> {
        self.lag_one(t) + &self.smoothed_means[t] * self.smoothed_means[t - 1].transpose()
    }
}

/// Run RTS smoothing given a completed Kalman filter pass.
///
/// The backward pass walks the same `T + 1` arena the filter produced.
pub fn rts_smoother(
    theta: &Theta,
    fr: &FilterOutput,
    cfg: &FilterConfig,
) -> Result<SmootherOutput> {
    let t_max = fr.len();
    if t_max == 0 {
        return Err(Error::Validation("filter output must cover at least one step".to_string()));
    }
    theta.validate()?;
    let n = theta.n_state();
    fr.check_state_dim(n)?;
    let a_t = theta.a.transpose();

    let last = &fr.steps[t_max];
    let mut smoothed_means = vec![DVector::<f64>::zeros(n); t_max + 1];
    let mut smoothed_covs = vec![DMatrix::<f64>::zeros(n, n); t_max + 1];
    let mut lag_one_covs = vec![DMatrix::<f64>::zeros(n, n); t_max];
    smoothed_means[t_max] = last.filtered_mean.clone();
    smoothed_covs[t_max] = last.filtered_cov.clone();

    for t in (1..=t_max).rev() {
        let prev = &fr.steps[t - 1];
        let cur = &fr.steps[t];

        // J = P_{t-1|t-1} A^T (P_{t|t-1})^{-1}
        let chol = cholesky_checked(&cur.predicted_cov, cfg.pd_tol)
            .ok_or(Error::SingularPredictedCovariance { t })?;
        let j = solve_right(&chol, &(&prev.filtered_cov * &a_t));

        // m_{t-1|T} = m_{t-1|t-1} + J (m_{t|T} - m_{t|t-1})
        let dm = &smoothed_means[t] - &cur.predicted_mean;
        smoothed_means[t - 1] = &prev.filtered_mean + &j * dm;

        // P_{t-1|T} = P_{t-1|t-1} + J (P_{t|T} - P_{t|t-1}) J^T
        let dp = &smoothed_covs[t] - &cur.predicted_cov;
        // Rounding can leave P_{t-1|T} slightly indefinite; clip it back to PSD.
        let p = symmetrize(&(&prev.filtered_cov + &j * dp * j.transpose()));
        if p.iter().any(|v| !v.is_finite()) {
            return Err(Error::Computation(format!(
                "RTS smoother produced non-finite covariance at t={}",
                t - 1
            )));
        }
        smoothed_covs[t - 1] =
            if min_eigenvalue(&p) < 0.0 { floor_eigenvalues(&p, 0.0)? } else { p };

        // Cov(x_t, x_{t-1}) = P_{t|T} J^T
        lag_one_covs[t - 1] = &smoothed_covs[t] * j.transpose();
    }

    if smoothed_covs.iter().any(|p| p.iter().any(|v| !v.is_finite())) {
        return Err(Error::Computation("RTS smoother produced non-finite covariance".to_string()));
    }

    Ok(SmootherOutput {
        theta: theta.clone(),
        log_likelihood: fr.log_likelihood,
        smoothed_means,
        smoothed_covs,
        lag_one_covs,
    })
}

/// E-step: filter forward, smooth backward.
pub fn e_step(data: &LdsData<'_>, theta: &Theta, cfg: &FilterConfig) -> Result<SmootherOutput> {
    let fr = kalman_filter(data, theta, cfg)?;
    rts_smoother(theta, &fr, cfg)
}
