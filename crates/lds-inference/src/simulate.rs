//! Simulation utilities for linear dynamical systems.
//!
//! Generates a latent trajectory and corresponding observations:
//! - x_0 ~ N(mu0, Sigma0)
//! - x_t = A x_{t-1} + B u_t + w_t, w_t ~ N(0, Q)
//! - y_t = C x_t     + D v_t + e_t, e_t ~ N(0, R)

use lds_core::{Error, Result};
use nalgebra::{DMatrix, DVector};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, StandardNormal};

use crate::model::Theta;

/// Simulation output. Rows are time steps, in the layout [`crate::LdsData`] expects.
#[derive(Debug, Clone)]
pub struct SimulatedLds {
    /// Initial state draw `x_0`.
    pub x0: DVector<f64>,
    /// Latent states `x_1..x_T` (`T x n_state`).
    pub states: DMatrix<f64>,
    /// Observations `y_1..y_T` (`T x n_obs`).
    pub observations: DMatrix<f64>,
}

/// Lower factor `L` with `L L^T = cov`; semi-definite covariances fall back to
/// the eigen square root.
fn noise_factor(cov: &DMatrix<f64>, name: &str) -> Result<DMatrix<f64>> {
    if let Some(chol) = cov.clone().cholesky() {
        return Ok(chol.l());
    }
    let eig = cov.clone().symmetric_eigen();
    let scale = cov.amax().max(1.0);
    if eig.eigenvalues.iter().any(|&l| !l.is_finite() || l < -1e-10 * scale) {
        return Err(Error::Computation(format!("{name} is not positive semi-definite")));
    }
    let sqrt = eig.eigenvalues.map(|l| l.max(0.0).sqrt());
    Ok(&eig.eigenvectors * DMatrix::from_diagonal(&sqrt))
}

fn sample_mvn_zero(rng: &mut StdRng, factor: &DMatrix<f64>) -> DVector<f64> {
    let z = DVector::<f64>::from_fn(factor.ncols(), |_, _| StandardNormal.sample(rng));
    factor * z
}

fn check_input(input: Option<&DMatrix<f64>>, width: usize, t_max: usize, name: &str) -> Result<()> {
    match input {
        None if width == 0 => Ok(()),
        None => Err(Error::DimensionMismatch(format!("theta expects {width} {name} columns"))),
        Some(m) if m.ncols() != width => Err(Error::DimensionMismatch(format!(
            "{name} has {} columns, theta expects {width}",
            m.ncols()
        ))),
        Some(m) if m.nrows() != t_max => Err(Error::DimensionMismatch(format!(
            "{name} has {} rows, expected t_max={t_max}",
            m.nrows()
        ))),
        Some(_) => Ok(()),
    }
}

fn row(input: Option<&DMatrix<f64>>, t: usize) -> DVector<f64> {
    input.map(|m| m.row(t).transpose()).unwrap_or_else(|| DVector::zeros(0))
}

/// Simulate `t_max` steps from `theta`, driven by optional inputs `u` (`T x m`)
/// and `v` (`T x q`). The same seed always yields the same series.
pub fn simulate(
    theta: &Theta,
    u: Option<&DMatrix<f64>>,
    v: Option<&DMatrix<f64>>,
    t_max: usize,
    seed: u64,
) -> Result<SimulatedLds> {
    if t_max == 0 {
        return Err(Error::Validation("t_max must be > 0".to_string()));
    }
    theta.validate()?;
    let u = u.filter(|m| m.ncols() > 0);
    let v = v.filter(|m| m.ncols() > 0);
    check_input(u, theta.n_control(), t_max, "u")?;
    check_input(v, theta.n_exogenous(), t_max, "v")?;

    let l0 = noise_factor(&theta.sigma0, "Sigma0")?;
    let lq = noise_factor(&theta.q, "Q")?;
    let lr = noise_factor(&theta.r, "R")?;

    let mut rng = StdRng::seed_from_u64(seed);
    let x0 = &theta.mu0 + sample_mvn_zero(&mut rng, &l0);

    let mut states = DMatrix::<f64>::zeros(t_max, theta.n_state());
    let mut observations = DMatrix::<f64>::zeros(t_max, theta.n_obs());

    let mut x = x0.clone();
    for t in 0..t_max {
        // State evolution
        x = &theta.a * x + theta.control_term(&row(u, t)) + sample_mvn_zero(&mut rng, &lq);

        // Observation
        let y = &theta.c * &x + theta.exogenous_term(&row(v, t)) + sample_mvn_zero(&mut rng, &lr);

        states.set_row(t, &x.transpose());
        observations.set_row(t, &y.transpose());
    }

    Ok(SimulatedLds { x0, states, observations })
}
