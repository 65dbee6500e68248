//! Small linear-algebra layer shared by the filter, smoother and M-step.
//!
//! Every covariance that leaves one of those stages goes through here, so the
//! stability rules (symmetry, decomposition-based solves, eigenvalue floor) are
//! applied the same way everywhere.

use lds_core::{Error, Result};
use nalgebra::{Cholesky, DMatrix, Dyn};

/// Natural log of `2*pi` as an f64 constant.
///
/// We keep this as a literal because `ln()` is not a `const fn` on stable Rust.
pub(crate) const LN_2PI: f64 = 1.837_877_066_409_345_3;

#[inline]
pub(crate) fn symmetrize(p: &DMatrix<f64>) -> DMatrix<f64> {
    0.5 * (p + p.transpose())
}

/// Cholesky factorization that also rejects nearly singular matrices.
///
/// A factor is accepted only if every squared pivot `L_ii^2` exceeds
/// `pd_tol * max_i |M_ii|`. Returns `None` otherwise.
pub(crate) fn cholesky_checked(m: &DMatrix<f64>, pd_tol: f64) -> Option<Cholesky<f64, Dyn>> {
    let scale = m.diagonal().iter().fold(0.0f64, |acc, d| acc.max(d.abs()));
    if !scale.is_finite() || scale <= 0.0 {
        return None;
    }
    let chol = symmetrize(m).cholesky()?;
    let l = chol.l_dirty();
    for i in 0..l.nrows() {
        let d = l[(i, i)];
        if !d.is_finite() || d * d <= pd_tol * scale {
            return None;
        }
    }
    Some(chol)
}

/// `log|M|` from its Cholesky factor: `2 * sum(log(diag(L)))`.
pub(crate) fn log_det(chol: &Cholesky<f64, Dyn>) -> f64 {
    let l = chol.l_dirty();
    (0..l.nrows()).map(|i| 2.0 * l[(i, i)].ln()).sum()
}

/// Right division `B M^{-1}` for symmetric positive-definite `M`.
///
/// Solves `M X = B^T` and transposes, which never forms `M^{-1}`.
pub(crate) fn solve_right(chol: &Cholesky<f64, Dyn>, b: &DMatrix<f64>) -> DMatrix<f64> {
    chol.solve(&b.transpose()).transpose()
}

/// Smallest eigenvalue of the symmetric part of `m`.
pub fn min_eigenvalue(m: &DMatrix<f64>) -> f64 {
    if m.nrows() == 0 {
        return f64::INFINITY;
    }
    symmetrize(m).symmetric_eigenvalues().min()
}

/// Symmetrize `m` and lift its spectrum so that every eigenvalue is at least `floor`.
///
/// The lift adds `(floor - lambda_min) * I`, so eigenvectors are untouched.
pub fn floor_eigenvalues(m: &DMatrix<f64>, floor: f64) -> Result<DMatrix<f64>> {
    if m.iter().any(|v| !v.is_finite()) {
        return Err(Error::Computation("covariance has non-finite entries".to_string()));
    }
    let mut s = symmetrize(m);
    let lambda_min = min_eigenvalue(&s);
    if !lambda_min.is_finite() {
        return Err(Error::Computation("eigendecomposition failed".to_string()));
    }
    if lambda_min < floor {
        let n = s.nrows();
        s += DMatrix::<f64>::identity(n, n) * (floor - lambda_min);
    }
    Ok(s)
}

/// Whether `m` is square and symmetric up to `tol` relative to its largest entry.
pub(crate) fn is_symmetric(m: &DMatrix<f64>, tol: f64) -> bool {
    if m.nrows() != m.ncols() {
        return false;
    }
    let scale = m.amax().max(1.0);
    let n = m.nrows();
    for i in 0..n {
        for j in (i + 1)..n {
            if (m[(i, j)] - m[(j, i)]).abs() > tol * scale {
                return false;
            }
        }
    }
    true
}
