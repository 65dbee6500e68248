//! Forward Kalman filter for a linear dynamical system with inputs.

use lds_core::{Error, Result};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::linalg::{LN_2PI, cholesky_checked, log_det, solve_right, symmetrize};
use crate::model::{LdsData, Theta};

/// Filter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Minimum squared Cholesky pivot of the innovation covariance, relative
    /// to its largest diagonal entry.
    pub pd_tol: f64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self { pd_tol: 1e-12 }
    }
}

impl FilterConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        if !self.pd_tol.is_finite() || self.pd_tol < 0.0 {
            return Err(Error::Validation("pd_tol must be finite and >= 0".to_string()));
        }
        Ok(())
    }
}

/// One slot of the filter arena.
///
/// At `t = 0` both the predicted and the filtered distribution equal the
/// prior `(mu0, Sigma0)`.
#[derive(Debug, Clone)]
pub struct FilterStep {
    /// Prior mean `m_{t|t-1}`.
    pub predicted_mean: DVector<f64>,
    /// Prior covariance `P_{t|t-1}`.
    pub predicted_cov: DMatrix<f64>,
    /// Posterior mean `m_{t|t}`.
    pub filtered_mean: DVector<f64>,
    /// Posterior covariance `P_{t|t}`.
    pub filtered_cov: DMatrix<f64>,
}

/// Kalman filter output.
#[derive(Debug, Clone)]
pub struct FilterOutput {
    /// Total log-likelihood `log p(y_1..y_T)` over observed steps.
    pub log_likelihood: f64,
    /// Per-step records for `t = 0..=T` (length `T + 1`).
    pub steps: Vec<FilterStep>,
}

impl FilterOutput {
    /// Number of observation steps `T`.
    pub fn len(&self) -> usize {
        self.steps.len().saturating_sub(1)
    }

    /// True when no observation step was filtered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check that every step holds an `n`-dimensional state.
    pub(crate) fn check_state_dim(&self, n: usize) -> Result<()> {
        for (t, step) in self.steps.iter().enumerate() {
            let ok = step.predicted_mean.len() == n
                && step.filtered_mean.len() == n
                && step.predicted_cov.shape() == (n, n)
                && step.filtered_cov.shape() == (n, n);
            if !ok {
                return Err(Error::DimensionMismatch(format!(
                    "filter step t={t} does not match n_state={n}"
                )));
            }
        }
        Ok(())
    }
}

/// Run Kalman filtering over the full series.
///
/// Missing rows of `y` skip the update and contribute nothing to the
/// log-likelihood.
pub fn kalman_filter(
    data: &LdsData<'_>,
    theta: &Theta,
    cfg: &FilterConfig,
) -> Result<FilterOutput> {
    cfg.validate()?;
    theta.validate()?;
    theta.check_against(data)?;

    let n = theta.n_state();
    let p = theta.n_obs();
    let t_max = data.len();
    let identity = DMatrix::<f64>::identity(n, n);
    let c_t = theta.c.transpose();
    let a_t = theta.a.transpose();

    let mut steps = Vec::with_capacity(t_max + 1);
    steps.push(FilterStep {
        predicted_mean: theta.mu0.clone(),
        predicted_cov: theta.sigma0.clone(),
        filtered_mean: theta.mu0.clone(),
        filtered_cov: theta.sigma0.clone(),
    });

    let mut loglik = 0.0f64;

    for t in 1..=t_max {
        let prev = &steps[t - 1];

        // Predict: (A m + B u_t, A P A^T + Q)
        let m_pred = &theta.a * &prev.filtered_mean + theta.control_term(&data.u(t));
        let p_pred = symmetrize(&(&theta.a * &prev.filtered_cov * &a_t + &theta.q));

        if !data.is_observed(t) {
            steps.push(FilterStep {
                predicted_mean: m_pred.clone(),
                predicted_cov: p_pred.clone(),
                filtered_mean: m_pred,
                filtered_cov: p_pred,
            });
            continue;
        }

        // Innovation: e = y - C m_pred - D v_t, S = C P_pred C^T + R
        let resid = data.y(t) - &theta.c * &m_pred - theta.exogenous_term(&data.v(t));
        let s = symmetrize(&(&theta.c * &p_pred * &c_t + &theta.r));
        let chol = cholesky_checked(&s, cfg.pd_tol)
            .ok_or(Error::SingularInnovationCovariance { t })?;

        // quad = e^T S^{-1} e
        let quad = resid.dot(&chol.solve(&resid));
        loglik += -0.5 * ((p as f64) * LN_2PI + log_det(&chol) + quad);

        // Kalman gain: K = P_pred C^T S^{-1}
        let k = solve_right(&chol, &(&p_pred * &c_t));
        let m_filt = &m_pred + &k * &resid;

        // Joseph form: (I - K C) P_pred (I - K C)^T + K R K^T
        let i_minus_kc = &identity - &k * &theta.c;
        let p_filt = symmetrize(
            &(&i_minus_kc * &p_pred * i_minus_kc.transpose() + &k * &theta.r * k.transpose()),
        );

        steps.push(FilterStep {
            predicted_mean: m_pred,
            predicted_cov: p_pred,
            filtered_mean: m_filt,
            filtered_cov: p_filt,
        });
    }

    if !loglik.is_finite() {
        return Err(Error::Computation(
            "Kalman filter produced non-finite log-likelihood".to_string(),
        ));
    }

    Ok(FilterOutput { log_likelihood: loglik, steps })
}

/// Log-likelihood of `theta` on `data`.
pub fn log_likelihood(data: &LdsData<'_>, theta: &Theta, cfg: &FilterConfig) -> Result<f64> {
    Ok(kalman_filter(data, theta, cfg)?.log_likelihood)
}
