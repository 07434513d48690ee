// ========================================================================================
//
// Benchmark of the REML fit and the knot sweep.
//
// Measures the random-effects fit with and without spline moderators as the number of
// studies grows, and the parallel knot-count sweep on a fixed dataset.
//
// ========================================================================================

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use ironmeta::data::{Outcome, OutcomeData};
use ironmeta::estimate::{RemlOptions, fit_random_effects, fit_spline_meta_regression};
use ironmeta::sensitivity::sweep_knots;
use ndarray::Array1;

// --- Benchmark Tuning Parameters ---

/// Study counts on the x-axis of the fit benchmarks.
const STUDY_COUNTS: [usize; 4] = [13, 50, 200, 800];
/// Knot counts evaluated by the sweep benchmark.
const SWEEP_KNOTS: [usize; 6] = [3, 4, 5, 6, 7, 8];
const GRID_POINTS: usize = 100;

/// Deterministic heterogeneous studies with a declining, curved moderator effect.
fn synthetic_studies(num_studies: usize) -> OutcomeData {
    let moderator = Array1::from_shape_fn(num_studies, |i| 10.0 + 55.0 * i as f64 / num_studies as f64);
    let yi = Array1::from_shape_fn(num_studies, |i| {
        let x = moderator[i];
        3.0 - 0.09 * x + 0.0008 * x * x + 0.4 * (1.7 * i as f64).sin()
    });
    let sei = Array1::from_shape_fn(num_studies, |i| 0.3 + 0.15 * (0.9 * i as f64).cos().abs());
    OutcomeData {
        outcome: Outcome::Ferritin,
        ids: (0..num_studies).map(|i| format!("B{i:04}")).collect(),
        yi,
        sei,
        moderator,
    }
}

fn benchmark_reml_fit(c: &mut Criterion) {
    let options = RemlOptions::default();
    let mut group = c.benchmark_group("reml_fit");

    for &k in &STUDY_COUNTS {
        let data = synthetic_studies(k);
        group.throughput(Throughput::Elements(k as u64));

        group.bench_with_input(BenchmarkId::new("pooled", k), &data, |b, data| {
            b.iter(|| {
                fit_random_effects(
                    black_box(data.yi.view()),
                    black_box(data.sei.view()),
                    None,
                    &options,
                )
                .unwrap()
            });
        });

        group.bench_with_input(BenchmarkId::new("spline_k4", k), &data, |b, data| {
            b.iter(|| fit_spline_meta_regression(black_box(data), 4, &options).unwrap());
        });
    }

    group.finish();
}

fn benchmark_knot_sweep(c: &mut Criterion) {
    let options = RemlOptions::default();
    let data = synthetic_studies(200);

    c.bench_function("knot_sweep_200_studies", |b| {
        b.iter(|| {
            let report = sweep_knots(black_box(&data), &SWEEP_KNOTS, GRID_POINTS, &options);
            assert_eq!(report.len(), SWEEP_KNOTS.len());
            report
        });
    });
}

criterion_group!(benches, benchmark_reml_fit, benchmark_knot_sweep);
criterion_main!(benches);
