//! Multi-start EM.
//!
//! EM only finds a local optimum, so several independent runs from different
//! starting points are fitted in parallel and the best one is kept.

use lds_core::{Error, Result};
use nalgebra::DMatrix;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, StandardNormal};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::em::{EmConfig, FitRecord, InitialGuess, learn_lds};
use crate::model::{LdsData, Theta};

/// How one start ended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StartOutcome {
    /// EM completed.
    Fitted {
        /// Last recorded log-likelihood.
        final_loglik: f64,
        /// Completed iterations.
        n_iter: usize,
        /// Whether the tolerance was met.
        converged: bool,
    },
    /// EM errored; the message of the error.
    Failed(String),
}

/// Result of [`learn_lds_multistart`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiStartFit {
    /// Fit with the highest final log-likelihood.
    pub best: FitRecord,
    /// Index of `best` among the starts.
    pub best_index: usize,
    /// Per-start summary, in input order.
    pub outcomes: Vec<StartOutcome>,
}

/// Run EM from every initial guess in parallel and keep the best fit.
///
/// Individual starts may fail; the call only errors when all of them do, in
/// which case the first start's error is returned.
pub fn learn_lds_multistart(
    data: &LdsData<'_>,
    inits: Vec<InitialGuess>,
    cfg: &EmConfig,
) -> Result<MultiStartFit> {
    if inits.is_empty() {
        return Err(Error::Validation("at least one initial guess is required".to_string()));
    }

    let fits: Vec<Result<FitRecord>> =
        inits.into_par_iter().map(|init| learn_lds(data, init, cfg.clone())).collect();

    let outcomes: Vec<StartOutcome> = fits
        .iter()
        .map(|fit| match fit {
            Ok(f) => StartOutcome::Fitted {
                final_loglik: f.final_loglik(),
                n_iter: f.n_iter,
                converged: f.converged,
            },
            Err(e) => StartOutcome::Failed(e.to_string()),
        })
        .collect();

    let best_index = fits
        .iter()
        .enumerate()
        .filter_map(|(i, fit)| fit.as_ref().ok().map(|f| (i, f.final_loglik())))
        .filter(|(_, ll)| ll.is_finite())
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(i, _)| i);

    let Some(best_index) = best_index else {
        log::warn!("all {} EM starts failed", fits.len());
        return match fits.into_iter().next() {
            Some(Err(e)) => Err(e),
            _ => Err(Error::Computation("no EM start produced a finite likelihood".to_string())),
        };
    };

    let n_failed = outcomes.iter().filter(|o| matches!(o, StartOutcome::Failed(_))).count();
    if n_failed > 0 {
        log::warn!("{n_failed} of {} EM starts failed", outcomes.len());
    }

    let best = match fits.into_iter().nth(best_index) {
        Some(Ok(f)) => f,
        _ => return Err(Error::Computation("best EM start disappeared".to_string())),
    };
    log::info!("multi-start EM: best start {best_index} with loglik={:.6}", best.final_loglik());

    Ok(MultiStartFit { best, best_index, outcomes })
}

/// Random starting points around the data-driven guess.
///
/// Start `k` uses seed `seed + k`. The first start is the unperturbed
/// heuristic; the others add Gaussian noise to `A`, `B`, `C` and `D`.
/// `A` is shrunk to Frobenius norm at most 0.95 so every start is stable.
pub fn perturbed_initial_guesses(
    data: &LdsData<'_>,
    n_state: usize,
    n_starts: usize,
    seed: u64,
) -> Result<Vec<InitialGuess>> {
    let base = Theta::heuristic(data, n_state)?;
    let c_scale = base.c.amax().max(1e-3);
    let mut inits = Vec::with_capacity(n_starts);

    for k in 0..n_starts {
        if k == 0 {
            inits.push(InitialGuess::Provided(base.clone()));
            continue;
        }
        let mut rng = StdRng::seed_from_u64(seed.wrapping_add(k as u64));
        let mut noise = |m: &DMatrix<f64>, sd: f64| {
            DMatrix::<f64>::from_fn(m.nrows(), m.ncols(), |_, _| {
                let z: f64 = StandardNormal.sample(&mut rng);
                sd * z
            })
        };

        let mut a = &base.a + noise(&base.a, 0.2);
        let norm = a.norm();
        if norm >= 0.95 {
            a *= 0.95 / norm;
        }
        let b = noise(&base.b, 0.1);
        let c = &base.c + noise(&base.c, 0.3 * c_scale);
        let d = noise(&base.d, 0.1);

        let theta = Theta::new(
            a,
            b,
            c,
            d,
            base.q.clone(),
            base.r.clone(),
            base.mu0.clone(),
            base.sigma0.clone(),
        )?;
        inits.push(InitialGuess::Provided(theta));
    }
    Ok(inits)
}
