use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use lds_inference::em::{EmConfig, InitialGuess, learn_lds};
use lds_inference::model::{LdsData, Theta};
use lds_inference::simulate::simulate;
use nalgebra::{DMatrix, DVector};
use std::hint::black_box;

// Tiny tolerance so every run does exactly `max_iter` iterations.
const TOL: f64 = 1e-300;

fn make_decoupled_theta(dim: usize, phi: f64, q: f64, r: f64) -> Theta {
    Theta::without_inputs(
        DMatrix::<f64>::identity(dim, dim) * phi,
        DMatrix::<f64>::identity(dim, dim),
        DMatrix::<f64>::identity(dim, dim) * q,
        DMatrix::<f64>::identity(dim, dim) * r,
        DVector::<f64>::zeros(dim),
        DMatrix::<f64>::identity(dim, dim),
    )
    .unwrap()
}

fn cfg(max_iter: usize) -> EmConfig {
    EmConfig { max_iter, tol: TOL, max_consecutive_decreases: usize::MAX, ..EmConfig::default() }
}

fn bench_em_ar1_n_scaling(c: &mut Criterion) {
    let truth = make_decoupled_theta(1, 0.9, 0.1, 0.2);
    let init = make_decoupled_theta(1, 0.5, 0.5, 0.5);

    // Per-iteration (max_iter=1) and "total" time (max_iter=5).
    let mut group = c.benchmark_group("lds/em/ar1_d=1/n_scaling");
    for n in [100usize, 1_000, 10_000] {
        let ys = simulate(&truth, None, None, n, 789).unwrap().observations;
        let data = LdsData::outputs_only(&ys).unwrap();

        for iters in [1usize, 5] {
            group.bench_with_input(
                BenchmarkId::new(format!("iters={}", iters), n),
                &data,
                |b, data| {
                    b.iter(|| {
                        let init = InitialGuess::Provided(init.clone());
                        let fit = learn_lds(black_box(data), init, cfg(iters)).unwrap();
                        black_box(fit.n_iter);
                    });
                },
            );
        }
    }
    group.finish();
}

fn bench_em_dim_scaling(c: &mut Criterion) {
    let n = 1_000usize;
    let mut group = c.benchmark_group("lds/em/ar1_n=1000/dim_scaling");

    for dim in [1usize, 4, 16] {
        let truth = make_decoupled_theta(dim, 0.9, 0.1, 0.2);
        let init = make_decoupled_theta(dim, 0.5, 0.5, 0.5);
        let ys = simulate(&truth, None, None, n, 101112).unwrap().observations;
        let data = LdsData::outputs_only(&ys).unwrap();

        for iters in [1usize, 5] {
            group.bench_with_input(
                BenchmarkId::new(format!("iters={}", iters), dim),
                &data,
                |b, data| {
                    b.iter(|| {
                        let init = InitialGuess::Provided(init.clone());
                        let fit = learn_lds(black_box(data), init, cfg(iters)).unwrap();
                        black_box(fit.n_iter);
                    });
                },
            );
        }
    }
    group.finish();
}

fn bench_em_with_inputs(c: &mut Criterion) {
    let n = 1_000usize;
    let truth = Theta::new(
        DMatrix::from_element(1, 1, 0.8),
        DMatrix::from_element(1, 1, 0.5),
        DMatrix::from_column_slice(2, 1, &[1.0, 0.5]),
        DMatrix::from_column_slice(2, 1, &[0.3, -0.2]),
        DMatrix::from_element(1, 1, 0.2),
        DMatrix::identity(2, 2) * 0.1,
        DVector::zeros(1),
        DMatrix::identity(1, 1),
    )
    .unwrap();
    let u = DMatrix::from_fn(n, 1, |t, _| (t as f64 * 0.05).sin());
    let v = DMatrix::from_fn(n, 1, |t, _| (t as f64 * 0.03).cos());
    let ys = simulate(&truth, Some(&u), Some(&v), n, 7).unwrap().observations;
    let data = LdsData::new(&ys, Some(&u), Some(&v)).unwrap();

    c.bench_function("lds/em/inputs_n=1000/iters=5", |b| {
        b.iter(|| {
            let init = InitialGuess::Heuristic { n_state: 1 };
            let fit = learn_lds(black_box(&data), init, cfg(5)).unwrap();
            black_box(fit.n_iter);
        });
    });
}

criterion_group!(benches, bench_em_ar1_n_scaling, bench_em_dim_scaling, bench_em_with_inputs);
criterion_main!(benches);
