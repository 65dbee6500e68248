//! Model parameters and observed data for a linear dynamical system.
//!
//! State:
//! `x_t = A x_{t-1} + B u_t + w_t`,  `w_t ~ N(0, Q)`
//!
//! Observation:
//! `y_t = C x_t + D v_t + e_t`,      `e_t ~ N(0, R)`
//!
//! Initial prior:
//! `x_0 ~ N(mu0, Sigma0)`
//!
//! Time steps with observations run over `t = 1..T`; `t = 0` is the prior.

use lds_core::{DegenerateDimension, Error, Result};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::linalg::{floor_eigenvalues, is_symmetric, min_eigenvalue};

/// Relative tolerance used when checking symmetry / PSD of caller-supplied covariances.
const SYMMETRY_TOL: f64 = 1e-8;

/// Parameter bundle `theta` of a linear dynamical system.
///
/// Control (`B`) and exogenous (`D`) matrices may have zero columns when the
/// corresponding input is absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Theta {
    /// State transition matrix `A` (n x n).
    pub a: DMatrix<f64>,
    /// Control-input matrix `B` (n x m).
    pub b: DMatrix<f64>,
    /// Observation matrix `C` (p x n).
    pub c: DMatrix<f64>,
    /// Exogenous-input matrix `D` (p x q).
    pub d: DMatrix<f64>,
    /// Process noise covariance `Q` (n x n).
    pub q: DMatrix<f64>,
    /// Observation noise covariance `R` (p x p).
    pub r: DMatrix<f64>,
    /// Initial state mean `mu0` (n).
    pub mu0: DVector<f64>,
    /// Initial state covariance `Sigma0` (n x n).
    pub sigma0: DMatrix<f64>,
}

impl Theta {
    /// Create a new parameter bundle and validate dimensions and covariances.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        a: DMatrix<f64>,
        b: DMatrix<f64>,
        c: DMatrix<f64>,
        d: DMatrix<f64>,
        q: DMatrix<f64>,
        r: DMatrix<f64>,
        mu0: DVector<f64>,
        sigma0: DMatrix<f64>,
    ) -> Result<Self> {
        let theta = Self { a, b, c, d, q, r, mu0, sigma0 };
        theta.validate()?;
        Ok(theta)
    }

    /// Model without control or exogenous inputs.
    pub fn without_inputs(
        a: DMatrix<f64>,
        c: DMatrix<f64>,
        q: DMatrix<f64>,
        r: DMatrix<f64>,
        mu0: DVector<f64>,
        sigma0: DMatrix<f64>,
    ) -> Result<Self> {
        let n = a.nrows();
        let p = c.nrows();
        Self::new(a, DMatrix::zeros(n, 0), c, DMatrix::zeros(p, 0), q, r, mu0, sigma0)
    }

    /// Scalar model: 1D state, 1D observation, no inputs.
    pub fn scalar(a: f64, c: f64, q: f64, r: f64, mu0: f64, sigma0: f64) -> Result<Self> {
        Self::without_inputs(
            DMatrix::from_element(1, 1, a),
            DMatrix::from_element(1, 1, c),
            DMatrix::from_element(1, 1, q),
            DMatrix::from_element(1, 1, r),
            DVector::from_element(1, mu0),
            DMatrix::from_element(1, 1, sigma0),
        )
    }

    /// Number of latent state dimensions `n`.
    pub fn n_state(&self) -> usize {
        self.a.nrows()
    }

    /// Number of observation dimensions `p`.
    pub fn n_obs(&self) -> usize {
        self.c.nrows()
    }

    /// Number of control inputs `m`.
    pub fn n_control(&self) -> usize {
        self.b.ncols()
    }

    /// Number of exogenous inputs `q`.
    pub fn n_exogenous(&self) -> usize {
        self.d.ncols()
    }

    /// `B u_t`, zero when there is no control input.
    pub(crate) fn control_term(&self, u_t: &DVector<f64>) -> DVector<f64> {
        if u_t.is_empty() { DVector::zeros(self.n_state()) } else { &self.b * u_t }
    }

    /// `D v_t`, zero when there is no exogenous input.
    pub(crate) fn exogenous_term(&self, v_t: &DVector<f64>) -> DVector<f64> {
        if v_t.is_empty() { DVector::zeros(self.n_obs()) } else { &self.d * v_t }
    }

    /// Check dimension consistency, finiteness and covariance symmetry / PSD.
    pub fn validate(&self) -> Result<()> {
        let n = self.a.nrows();
        if n == 0 || self.a.ncols() != n {
            return Err(Error::DimensionMismatch("A must be square with n_state>0".to_string()));
        }
        if self.b.nrows() != n {
            return Err(Error::DimensionMismatch("B must have n_state rows".to_string()));
        }
        let p = self.c.nrows();
        if p == 0 || self.c.ncols() != n {
            return Err(Error::DimensionMismatch(
                "C must be n_obs x n_state with n_obs>0".to_string(),
            ));
        }
        if self.d.nrows() != p {
            return Err(Error::DimensionMismatch("D must have n_obs rows".to_string()));
        }
        if self.q.nrows() != n || self.q.ncols() != n {
            return Err(Error::DimensionMismatch("Q must be n_state x n_state".to_string()));
        }
        if self.r.nrows() != p || self.r.ncols() != p {
            return Err(Error::DimensionMismatch("R must be n_obs x n_obs".to_string()));
        }
        if self.mu0.len() != n {
            return Err(Error::DimensionMismatch("mu0 must have length n_state".to_string()));
        }
        if self.sigma0.nrows() != n || self.sigma0.ncols() != n {
            return Err(Error::DimensionMismatch("Sigma0 must be n_state x n_state".to_string()));
        }

        if self.a.iter().any(|v| !v.is_finite())
            || self.b.iter().any(|v| !v.is_finite())
            || self.c.iter().any(|v| !v.is_finite())
            || self.d.iter().any(|v| !v.is_finite())
            || self.q.iter().any(|v| !v.is_finite())
            || self.r.iter().any(|v| !v.is_finite())
            || self.mu0.iter().any(|v| !v.is_finite())
            || self.sigma0.iter().any(|v| !v.is_finite())
        {
            return Err(Error::Validation("theta matrices/vectors must be finite".to_string()));
        }

        for (name, cov) in [("Q", &self.q), ("R", &self.r), ("Sigma0", &self.sigma0)] {
            if !is_symmetric(cov, SYMMETRY_TOL) {
                return Err(Error::Validation(format!("{name} must be symmetric")));
            }
            let scale = cov.amax().max(1.0);
            if min_eigenvalue(cov) < -SYMMETRY_TOL * scale {
                return Err(Error::Validation(format!("{name} must be positive semi-definite")));
            }
        }
        Ok(())
    }

    /// Copy with every eigenvalue of Q, R and Sigma0 lifted to at least `floor`.
    pub fn regularized(&self, floor: f64) -> Result<Self> {
        Ok(Self {
            q: floor_eigenvalues(&self.q, floor)?,
            r: floor_eigenvalues(&self.r, floor)?,
            sigma0: floor_eigenvalues(&self.sigma0, floor)?,
            ..self.clone()
        })
    }

    /// Copy with `jitter * I` added to Q and R.
    pub fn with_jitter(&self, jitter: f64) -> Self {
        let n = self.n_state();
        let p = self.n_obs();
        Self {
            q: &self.q + DMatrix::<f64>::identity(n, n) * jitter,
            r: &self.r + DMatrix::<f64>::identity(p, p) * jitter,
            ..self.clone()
        }
    }

    /// Data-driven starting point for EM.
    ///
    /// `C` spans the leading principal directions of `y` (scaled by the square
    /// root of their variance), `A = 0.5 I`, `B = 0`, `D = 0`, `Q = I`,
    /// `R = diag(var(y)) / 2`, `mu0 = 0`, `Sigma0 = I`.
    pub fn heuristic(data: &LdsData<'_>, n_state: usize) -> Result<Self> {
        if n_state == 0 {
            return Err(Error::Validation("n_state must be > 0".to_string()));
        }
        let p = data.n_obs();
        let (mean, cov) = data.observation_moments()?;
        debug_assert_eq!(mean.len(), p);

        let eig = cov.clone().symmetric_eigen();
        let mut order: Vec<usize> = (0..p).collect();
        order.sort_by(|&i, &j| eig.eigenvalues[j].total_cmp(&eig.eigenvalues[i]));

        let mut c = DMatrix::<f64>::zeros(p, n_state);
        for (k, &idx) in order.iter().take(n_state).enumerate() {
            let scale = eig.eigenvalues[idx].max(0.0).sqrt();
            c.set_column(k, &(eig.eigenvectors.column(idx) * scale));
        }

        let mut r = DMatrix::<f64>::zeros(p, p);
        for i in 0..p {
            r[(i, i)] = 0.5 * cov[(i, i)];
        }

        Self::new(
            DMatrix::identity(n_state, n_state) * 0.5,
            DMatrix::zeros(n_state, data.n_control()),
            c,
            DMatrix::zeros(p, data.n_exogenous()),
            DMatrix::identity(n_state, n_state),
            r,
            DVector::zeros(n_state),
            DMatrix::identity(n_state, n_state),
        )
    }

    /// Check that this theta matches the shapes of `data`.
    pub fn check_against(&self, data: &LdsData<'_>) -> Result<()> {
        if self.n_obs() != data.n_obs() {
            return Err(Error::DimensionMismatch(format!(
                "theta has n_obs={}, y has {} columns",
                self.n_obs(),
                data.n_obs()
            )));
        }
        if self.n_control() != data.n_control() {
            return Err(Error::DimensionMismatch(format!(
                "theta has n_control={}, u has {} columns",
                self.n_control(),
                data.n_control()
            )));
        }
        if self.n_exogenous() != data.n_exogenous() {
            return Err(Error::DimensionMismatch(format!(
                "theta has n_exogenous={}, v has {} columns",
                self.n_exogenous(),
                data.n_exogenous()
            )));
        }
        Ok(())
    }
}

/// Observed series borrowed from the caller: `y` (T x p), `u` (T x m), `v` (T x q).
///
/// Rows are time steps `t = 1..T` (row `t - 1`). A row of `y` holding any NaN is
/// treated as a missing observation.
#[derive(Debug, Clone, Copy)]
pub struct LdsData<'a> {
    y: &'a DMatrix<f64>,
    u: Option<&'a DMatrix<f64>>,
    v: Option<&'a DMatrix<f64>>,
}

impl<'a> LdsData<'a> {
    /// Validate and wrap the series. Inputs with zero columns count as absent.
    pub fn new(
        y: &'a DMatrix<f64>,
        u: Option<&'a DMatrix<f64>>,
        v: Option<&'a DMatrix<f64>>,
    ) -> Result<Self> {
        let t_max = y.nrows();
        if y.ncols() == 0 {
            return Err(Error::DimensionMismatch("y must have at least one column".to_string()));
        }
        if y.iter().any(|x| x.is_infinite()) {
            return Err(Error::Validation(
                "y must be finite or NaN (NaN means missing)".to_string(),
            ));
        }

        let u = u.filter(|m| m.ncols() > 0);
        let v = v.filter(|m| m.ncols() > 0);
        for (name, input) in [("u", u), ("v", v)] {
            let Some(input) = input else { continue };
            if input.nrows() != t_max {
                return Err(Error::DimensionMismatch(format!(
                    "{name} has {} rows, y has {}",
                    input.nrows(),
                    t_max
                )));
            }
            if input.iter().any(|x| !x.is_finite()) {
                return Err(Error::Validation(format!("{name} must be finite")));
            }
        }

        let data = Self { y, u, v };
        if data.n_observed() < 2 {
            return Err(Error::DegenerateInput(DegenerateDimension::Time));
        }
        Ok(data)
    }

    /// Output-only series (no control or exogenous inputs).
    pub fn outputs_only(y: &'a DMatrix<f64>) -> Result<Self> {
        Self::new(y, None, None)
    }

    /// Number of time steps `T`.
    pub fn len(&self) -> usize {
        self.y.nrows()
    }

    /// Always false for validated data (`T >= 2`).
    pub fn is_empty(&self) -> bool {
        self.y.nrows() == 0
    }

    /// Observation dimension `p`.
    pub fn n_obs(&self) -> usize {
        self.y.ncols()
    }

    /// Control dimension `m` (0 if absent).
    pub fn n_control(&self) -> usize {
        self.u.map_or(0, |u| u.ncols())
    }

    /// Exogenous dimension `q` (0 if absent).
    pub fn n_exogenous(&self) -> usize {
        self.v.map_or(0, |v| v.ncols())
    }

    /// Whether `y_t` (1-based) is observed.
    pub fn is_observed(&self, t: usize) -> bool {
        self.y.row(t - 1).iter().all(|x| !x.is_nan())
    }

    /// Number of observed time steps.
    pub fn n_observed(&self) -> usize {
        (1..=self.len()).filter(|&t| self.is_observed(t)).count()
    }

    /// Observation `y_t` (1-based).
    pub fn y(&self, t: usize) -> DVector<f64> {
        self.y.row(t - 1).transpose()
    }

    /// Control input `u_t` (1-based); zero-length when absent.
    pub fn u(&self, t: usize) -> DVector<f64> {
        match self.u {
            Some(u) => u.row(t - 1).transpose(),
            None => DVector::zeros(0),
        }
    }

    /// Exogenous input `v_t` (1-based); zero-length when absent.
    pub fn v(&self, t: usize) -> DVector<f64> {
        match self.v {
            Some(v) => v.row(t - 1).transpose(),
            None => DVector::zeros(0),
        }
    }

    /// Sample mean and covariance of `y` over observed steps.
    pub(crate) fn observation_moments(&self) -> Result<(DVector<f64>, DMatrix<f64>)> {
        let p = self.n_obs();
        let observed: Vec<usize> = (1..=self.len()).filter(|&t| self.is_observed(t)).collect();
        let count = observed.len();
        if count < 2 {
            return Err(Error::DegenerateInput(DegenerateDimension::Time));
        }

        let mut mean = DVector::<f64>::zeros(p);
        for &t in &observed {
            mean += self.y(t);
        }
        mean /= count as f64;

        let mut cov = DMatrix::<f64>::zeros(p, p);
        for &t in &observed {
            let d = self.y(t) - &mean;
            cov += &d * d.transpose();
        }
        cov /= (count - 1) as f64;
        Ok((mean, cov))
    }

    /// Reject zero-variance observation columns and all-zero input columns.
    pub(crate) fn check_degenerate(&self, min_variance: f64) -> Result<()> {
        let (mean, cov) = self.observation_moments()?;
        for i in 0..self.n_obs() {
            if cov[(i, i)] <= min_variance * (1.0 + mean[i] * mean[i]) {
                return Err(Error::DegenerateInput(DegenerateDimension::Observation(i)));
            }
        }
        if let Some(u) = self.u {
            for j in 0..u.ncols() {
                if u.column(j).iter().all(|&x| x == 0.0) {
                    return Err(Error::DegenerateInput(DegenerateDimension::Control(j)));
                }
            }
        }
        if let Some(v) = self.v {
            for j in 0..v.ncols() {
                if v.column(j).iter().all(|&x| x == 0.0) {
                    return Err(Error::DegenerateInput(DegenerateDimension::Exogenous(j)));
                }
            }
        }
        Ok(())
    }
}
