//! Closed-form M-step for linear-Gaussian state space models.
//!
//! Both blocks of the model are linear regressions on smoothed moments:
//!
//! - transition: `x_t` on `z_t = [x_{t-1}; u_t]`, giving `[A B]` and `Q`
//! - observation: `y_t` on `w_t = [x_t; v_t]`, giving `[C D]` and `R`
//!
//! With `S_zz = sum E[z z^T]`, `S_xz = sum E[x z^T]`, `S_xx = sum E[x x^T]`:
//! `[A B] = S_xz S_zz^{-1}` and
//! `Q = (S_xx - L S_xz^T - S_xz L^T + L S_zz L^T) / T` for coefficients `L`.
//! The general residual form stays valid when `L` is held fixed.

use lds_core::{DegenerateDimension, Error, Result};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::linalg::{cholesky_checked, floor_eigenvalues, solve_right};
use crate::model::{LdsData, Theta};
use crate::smoother::SmootherOutput;

/// Pivot tolerance for the regression normal equations.
const REGRESSION_PD_TOL: f64 = 1e-14;

/// M-step configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MStepConfig {
    /// Whether to update `A` and `B`.
    pub estimate_transition: bool,
    /// Whether to update `C` and `D`.
    pub estimate_observation: bool,
    /// Whether to update `Q`.
    pub estimate_q: bool,
    /// Whether to update `R`.
    pub estimate_r: bool,
    /// Whether to update `mu0` and `Sigma0`.
    pub estimate_initial: bool,
    /// Eigenvalue floor applied to every produced covariance.
    pub min_eigenvalue: f64,
    /// Relative variance below which a dimension counts as constant.
    pub min_variance: f64,
}

impl Default for MStepConfig {
    fn default() -> Self {
        Self {
            estimate_transition: true,
            estimate_observation: true,
            estimate_q: true,
            estimate_r: true,
            estimate_initial: true,
            min_eigenvalue: 1e-9,
            min_variance: 1e-12,
        }
    }
}

impl MStepConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        if !self.min_eigenvalue.is_finite() || self.min_eigenvalue <= 0.0 {
            return Err(Error::Validation("min_eigenvalue must be finite and > 0".to_string()));
        }
        if !self.min_variance.is_finite() || self.min_variance < 0.0 {
            return Err(Error::Validation("min_variance must be finite and >= 0".to_string()));
        }
        Ok(())
    }
}

/// Accumulated regression moments for one block of the model.
#[derive(Debug, Clone)]
struct RegressionMoments {
    /// `sum E[z z^T]`
    s_zz: DMatrix<f64>,
    /// `sum E[target z^T]`
    s_tz: DMatrix<f64>,
    /// `sum E[target target^T]`
    s_tt: DMatrix<f64>,
    /// Number of terms.
    count: usize,
}

impl RegressionMoments {
    fn zeros(n_target: usize, n_regressor: usize) -> Self {
        Self {
            s_zz: DMatrix::zeros(n_regressor, n_regressor),
            s_tz: DMatrix::zeros(n_target, n_regressor),
            s_tt: DMatrix::zeros(n_target, n_target),
            count: 0,
        }
    }

    /// Least-squares coefficients `S_tz S_zz^{-1}`.
    fn coefficients(&self, block: &str) -> Result<DMatrix<f64>> {
        let chol = cholesky_checked(&self.s_zz, REGRESSION_PD_TOL).ok_or_else(|| {
            Error::Computation(format!("{block} regression is singular (collinear regressors)"))
        })?;
        Ok(solve_right(&chol, &self.s_tz))
    }

    /// Expected residual covariance for coefficients `l`.
    fn residual_cov(&self, l: &DMatrix<f64>) -> DMatrix<f64> {
        let lt = l.transpose();
        let sum = &self.s_tt - l * self.s_tz.transpose() - &self.s_tz * &lt + l * &self.s_zz * &lt;
        sum / self.count as f64
    }
}

/// Stack two vectors.
fn stack(top: &DVector<f64>, bottom: &DVector<f64>) -> DVector<f64> {
    DVector::from_iterator(top.len() + bottom.len(), top.iter().chain(bottom.iter()).copied())
}

/// Side-by-side `[left right]`.
fn hstack(left: &DMatrix<f64>, right: &DMatrix<f64>) -> DMatrix<f64> {
    let rows = left.nrows();
    let mut out = DMatrix::zeros(rows, left.ncols() + right.ncols());
    out.columns_mut(0, left.ncols()).copy_from(left);
    out.columns_mut(left.ncols(), right.ncols()).copy_from(right);
    out
}

fn transition_moments(data: &LdsData<'_>, es: &SmootherOutput) -> RegressionMoments {
    let n = es.theta.n_state();
    let mut mom = RegressionMoments::zeros(n, n + data.n_control());
    for t in 1..=data.len() {
        let z = stack(&es.smoothed_means[t - 1], &data.u(t));
        mom.s_zz += &z * z.transpose();
        let mut state_block = mom.s_zz.view_mut((0, 0), (n, n));
        state_block += &es.smoothed_covs[t - 1];

        mom.s_tz += &es.smoothed_means[t] * z.transpose();
        let mut lag_block = mom.s_tz.view_mut((0, 0), (n, n));
        lag_block += es.lag_one(t);

        mom.s_tt += es.second_moment(t);
        mom.count += 1;
    }
    mom
}

fn observation_moments(data: &LdsData<'_>, es: &SmootherOutput) -> RegressionMoments {
    let n = es.theta.n_state();
    let mut mom = RegressionMoments::zeros(data.n_obs(), n + data.n_exogenous());
    for t in (1..=data.len()).filter(|&t| data.is_observed(t)) {
        let y = data.y(t);
        let w = stack(&es.smoothed_means[t], &data.v(t));
        mom.s_zz += &w * w.transpose();
        let mut state_block = mom.s_zz.view_mut((0, 0), (n, n));
        state_block += &es.smoothed_covs[t];

        mom.s_tz += &y * w.transpose();
        mom.s_tt += &y * y.transpose();
        mom.count += 1;
    }
    mom
}

/// Reject latent dimensions whose smoothed trajectory carries no variance.
fn check_state_variance(es: &SmootherOutput, min_variance: f64) -> Result<()> {
    let n = es.theta.n_state();
    let count = es.smoothed_means.len() as f64;
    for i in 0..n {
        let mean = es.smoothed_means.iter().map(|m| m[i]).sum::<f64>() / count;
        let var = es
            .smoothed_means
            .iter()
            .zip(es.smoothed_covs.iter())
            .map(|(m, p)| p[(i, i)] + (m[i] - mean) * (m[i] - mean))
            .sum::<f64>()
            / count;
        if !var.is_finite() || var <= min_variance * (1.0 + mean * mean) {
            return Err(Error::DegenerateInput(DegenerateDimension::State(i)));
        }
    }
    Ok(())
}

/// Run the M-step: maximize the expected complete-data log-likelihood.
///
/// Parameter blocks switched off in `cfg` are carried over from `es.theta`.
pub fn m_step(data: &LdsData<'_>, es: &SmootherOutput, cfg: &MStepConfig) -> Result<Theta> {
    cfg.validate()?;
    if data.len() < 2 {
        return Err(Error::DegenerateInput(DegenerateDimension::Time));
    }
    es.check_shape(data.len())?;
    let cur = &es.theta;
    cur.check_against(data)?;
    data.check_degenerate(cfg.min_variance)?;
    check_state_variance(es, cfg.min_variance)?;

    let n = cur.n_state();
    let floor = cfg.min_eigenvalue;

    // Transition block.
    let trans = transition_moments(data, es);
    let lambda = if cfg.estimate_transition {
        trans.coefficients("transition")?
    } else {
        hstack(&cur.a, &cur.b)
    };
    let q = if cfg.estimate_q {
        floor_eigenvalues(&trans.residual_cov(&lambda), floor)?
    } else {
        cur.q.clone()
    };

    // Observation block.
    let obs = observation_moments(data, es);
    let gamma = if cfg.estimate_observation {
        obs.coefficients("observation")?
    } else {
        hstack(&cur.c, &cur.d)
    };
    let r = if cfg.estimate_r {
        floor_eigenvalues(&obs.residual_cov(&gamma), floor)?
    } else {
        cur.r.clone()
    };

    let (mu0, sigma0) = if cfg.estimate_initial {
        (es.smoothed_means[0].clone(), floor_eigenvalues(&es.smoothed_covs[0], floor)?)
    } else {
        (cur.mu0.clone(), cur.sigma0.clone())
    };

    Theta::new(
        lambda.columns(0, n).into_owned(),
        lambda.columns(n, cur.n_control()).into_owned(),
        gamma.columns(0, n).into_owned(),
        gamma.columns(n, cur.n_exogenous()).into_owned(),
        q,
        r,
        mu0,
        sigma0,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{FilterConfig, log_likelihood};
    use crate::linalg::min_eigenvalue;
    use crate::smoother::e_step;
    use approx::assert_relative_eq;

    const Y5: [f64; 5] = [1.0, 0.95, 1.02, 0.88, 0.91];

    fn scalar_setup() -> (DMatrix<f64>, Theta) {
        let y = DMatrix::from_column_slice(5, 1, &Y5);
        let theta = Theta::scalar(0.9, 1.0, 0.1, 0.1, 0.0, 1.0).unwrap();
        (y, theta)
    }

    #[test]
    fn test_scalar_updates_match_moment_ratios() {
        let (y, theta) = scalar_setup();
        let data = LdsData::outputs_only(&y).unwrap();
        let es = e_step(&data, &theta, &FilterConfig::default()).unwrap();
        let next = m_step(&data, &es, &MStepConfig::default()).unwrap();

        let mut num_a = 0.0;
        let mut den_a = 0.0;
        let mut num_c = 0.0;
        let mut den_c = 0.0;
        for t in 1..=5 {
            num_a += es.cross_moment(t)[(0, 0)];
            den_a += es.second_moment(t - 1)[(0, 0)];
            num_c += Y5[t - 1] * es.smoothed_means[t][0];
            den_c += es.second_moment(t)[(0, 0)];
        }
        assert_relative_eq!(next.a[(0, 0)], num_a / den_a, epsilon = 1e-10);
        assert_relative_eq!(next.c[(0, 0)], num_c / den_c, epsilon = 1e-10);
        assert_relative_eq!(next.mu0[0], es.smoothed_means[0][0], epsilon = 0.0);
        assert!(next.q[(0, 0)] >= 1e-9);
        assert!(next.r[(0, 0)] >= 1e-9);
    }

    #[test]
    fn test_one_em_step_does_not_decrease_likelihood() {
        let (y, theta) = scalar_setup();
        let data = LdsData::outputs_only(&y).unwrap();
        let cfg = FilterConfig::default();
        let es = e_step(&data, &theta, &cfg).unwrap();
        let next = m_step(&data, &es, &MStepConfig::default()).unwrap();
        let ll_next = log_likelihood(&data, &next, &cfg).unwrap();
        assert!(ll_next >= es.log_likelihood - 1e-9, "{} < {}", ll_next, es.log_likelihood);
    }

    #[test]
    fn test_inputs_are_estimated_jointly() {
        let t_max = 40;
        let u = DMatrix::from_fn(t_max, 1, |t, _| ((t as f64) * 0.7).sin());
        let v =
            DMatrix::from_fn(t_max, 2, |t, j| if j == 0 { 1.0 } else { (t as f64 * 0.3).cos() });
        let y = DMatrix::from_fn(t_max, 2, |t, j| {
            (t as f64 * 0.2 + j as f64).sin() + 0.5 * v[(t, 1)] + 0.3 * u[(t, 0)]
        });
        let data = LdsData::new(&y, Some(&u), Some(&v)).unwrap();
        let theta = Theta::heuristic(&data, 1).unwrap();
        let cfg = FilterConfig::default();
        let es = e_step(&data, &theta, &cfg).unwrap();
        let next = m_step(&data, &es, &MStepConfig::default()).unwrap();

        assert_eq!(next.b.shape(), (1, 1));
        assert_eq!(next.d.shape(), (2, 2));
        assert!(next.b.iter().chain(next.d.iter()).all(|v| v.is_finite()));
        assert!(min_eigenvalue(&next.q) >= 1e-9 * (1.0 - 1e-6));
        assert!(min_eigenvalue(&next.r) >= 1e-9 * (1.0 - 1e-6));

        let ll_next = log_likelihood(&data, &next, &cfg).unwrap();
        assert!(ll_next >= es.log_likelihood - 1e-8);
    }

    #[test]
    fn test_fixed_blocks_are_carried_over() {
        let (y, theta) = scalar_setup();
        let data = LdsData::outputs_only(&y).unwrap();
        let es = e_step(&data, &theta, &FilterConfig::default()).unwrap();
        let cfg = MStepConfig {
            estimate_transition: false,
            estimate_q: false,
            estimate_initial: false,
            ..MStepConfig::default()
        };
        let next = m_step(&data, &es, &cfg).unwrap();
        assert_eq!(next.a, theta.a);
        assert_eq!(next.q, theta.q);
        assert_eq!(next.mu0, theta.mu0);
        assert_eq!(next.sigma0, theta.sigma0);
        assert_ne!(next.c, theta.c);
    }

    #[test]
    fn test_constant_observation_is_degenerate() {
        let y = DMatrix::from_element(6, 1, 2.0);
        let data = LdsData::outputs_only(&y).unwrap();
        let theta = Theta::scalar(0.9, 1.0, 0.1, 0.1, 0.0, 1.0).unwrap();
        let es = e_step(&data, &theta, &FilterConfig::default()).unwrap();
        let err = m_step(&data, &es, &MStepConfig::default()).unwrap_err();
        assert!(
            matches!(err, Error::DegenerateInput(DegenerateDimension::Observation(0))),
            "{err}"
        );
    }

    #[test]
    fn test_zero_variance_state_is_degenerate() {
        let y = DMatrix::from_column_slice(3, 1, &[1.0, 2.0, 0.5]);
        let data = LdsData::outputs_only(&y).unwrap();
        let theta = Theta::without_inputs(
            DMatrix::from_row_slice(2, 2, &[0.9, 0.0, 0.0, 0.0]),
            DMatrix::from_row_slice(1, 2, &[1.0, 0.0]),
            DMatrix::from_row_slice(2, 2, &[0.1, 0.0, 0.0, 0.0]),
            DMatrix::from_element(1, 1, 0.1),
            DVector::zeros(2),
            DMatrix::from_row_slice(2, 2, &[1.0, 0.0, 0.0, 0.0]),
        )
        .unwrap();
        let cov = DMatrix::from_row_slice(2, 2, &[0.5, 0.0, 0.0, 0.0]);
        let es = SmootherOutput {
            theta,
            log_likelihood: -1.0,
            smoothed_means: (0..4).map(|t| DVector::from_row_slice(&[t as f64, 0.0])).collect(),
            smoothed_covs: vec![cov.clone(); 4],
            lag_one_covs: vec![cov * 0.5; 3],
        };
        let err = m_step(&data, &es, &MStepConfig::default()).unwrap_err();
        assert!(matches!(err, Error::DegenerateInput(DegenerateDimension::State(1))), "{err}");
    }

    #[test]
    fn test_smoother_length_mismatch() {
        let (y, theta) = scalar_setup();
        let data = LdsData::outputs_only(&y).unwrap();
        let mut es = e_step(&data, &theta, &FilterConfig::default()).unwrap();
        es.lag_one_covs.pop();
        es.smoothed_means.pop();
        es.smoothed_covs.pop();
        let err = m_step(&data, &es, &MStepConfig::default()).unwrap_err();
        assert!(matches!(err, Error::DimensionMismatch(_)), "{err}");
    }

    #[test]
    fn test_malformed_smoother_output_is_rejected() {
        let (y, theta) = scalar_setup();
        let data = LdsData::outputs_only(&y).unwrap();
        let es = e_step(&data, &theta, &FilterConfig::default()).unwrap();

        let mut short_covs = es.clone();
        short_covs.smoothed_covs.pop();
        let err = m_step(&data, &short_covs, &MStepConfig::default()).unwrap_err();
        assert!(matches!(err, Error::DimensionMismatch(_)), "{err}");

        let mut wide_means = es.clone();
        wide_means.smoothed_means = vec![DVector::from_element(2, 0.5); 6];
        let err = m_step(&data, &wide_means, &MStepConfig::default()).unwrap_err();
        assert!(matches!(err, Error::DimensionMismatch(_)), "{err}");

        let mut wide_lag = es;
        wide_lag.lag_one_covs[0] = DMatrix::identity(2, 2);
        let err = m_step(&data, &wide_lag, &MStepConfig::default()).unwrap_err();
        assert!(matches!(err, Error::DimensionMismatch(_)), "{err}");
    }
}
