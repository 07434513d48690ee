//! Sensitivity of the spline meta-regression to the knot count.
//!
//! Each requested K is an independent run of basis construction, REML fit and
//! prediction on the same grid. Runs execute on the global rayon pool and share
//! nothing but read-only inputs; results are keyed by K, so completion order has
//! no effect on the report.

use crate::data::OutcomeData;
use crate::estimate::{EstimationError, RemlOptions, fit_spline_meta_regression};
use crate::predict::{PredictionCurve, PredictionError, evaluation_grid};
use ndarray::Array1;
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// Why a single K of the sweep produced no curve.
#[derive(Error, Debug)]
pub enum SweepError {
    #[error(transparent)]
    Estimation(#[from] EstimationError),
    #[error(transparent)]
    Prediction(#[from] PredictionError),
}

/// Outcome of a sweep: one entry per distinct requested K.
#[derive(Debug)]
pub struct SensitivityReport {
    pub grid: Array1<f64>,
    pub results: BTreeMap<usize, Result<PredictionCurve, SweepError>>,
}

impl SensitivityReport {
    /// Successful curves in ascending K.
    pub fn curves(&self) -> impl Iterator<Item = (usize, &PredictionCurve)> {
        self.results
            .iter()
            .filter_map(|(&k, result)| result.as_ref().ok().map(|curve| (k, curve)))
    }

    /// Failed knot counts with their errors, in ascending K.
    pub fn failures(&self) -> impl Iterator<Item = (usize, &SweepError)> {
        self.results
            .iter()
            .filter_map(|(&k, result)| result.as_ref().err().map(|err| (k, err)))
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

/// Fits the spline meta-regression once per knot count and predicts every fit on
/// the same dense grid over the observed moderator range.
///
/// A failure for one K is recorded under that K and does not affect the others.
pub fn sweep_knots(
    data: &OutcomeData,
    knot_counts: &[usize],
    grid_points: usize,
    options: &RemlOptions,
) -> SensitivityReport {
    let grid = moderator_grid(data, grid_points);
    let unique: BTreeSet<usize> = knot_counts.iter().copied().collect();

    log::info!(
        "Sensitivity sweep for {}: K in {:?} on {} grid points",
        data.outcome,
        unique,
        grid.len()
    );

    let results: BTreeMap<usize, Result<PredictionCurve, SweepError>> = unique
        .into_par_iter()
        .map(|k| {
            let result = fit_spline_meta_regression(data, k, options)
                .map_err(SweepError::from)
                .and_then(|model| model.predict(grid.view()).map_err(SweepError::from));
            (k, result)
        })
        .collect();

    for (k, result) in &results {
        if let Err(e) = result {
            log::warn!("Sensitivity sweep for {} failed at K = {k}: {e}", data.outcome);
        }
    }

    SensitivityReport { grid, results }
}

fn moderator_grid(data: &OutcomeData, grid_points: usize) -> Array1<f64> {
    if data.is_empty() {
        return Array1::zeros(0);
    }
    let min = data.moderator.iter().copied().fold(f64::INFINITY, f64::min);
    let max = data.moderator.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    evaluation_grid(min, max, grid_points)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::basis::BasisError;
    use crate::data::Outcome;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn vo2max_data() -> OutcomeData {
        OutcomeData {
            outcome: Outcome::Vo2max,
            ids: ["S01", "S03", "S04", "S06", "S07", "S08", "S10", "S11", "S12", "S13"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            yi: array![2.07, 1.64, 1.40, 0.77, 0.33, 0.44, -0.16, -0.50, -0.08, -0.59],
            sei: array![0.48, 0.46, 0.44, 0.40, 0.38, 0.39, 0.37, 0.36, 0.35, 0.34],
            moderator: array![11.0, 15.0, 17.2, 21.5, 24.0, 27.0, 35.5, 41.0, 48.0, 62.0],
        }
    }

    #[test]
    fn sweep_has_one_entry_per_distinct_k() {
        let data = vo2max_data();
        let report = sweep_knots(&data, &[5, 3, 4, 3], 20, &RemlOptions::default());
        assert_eq!(report.results.keys().copied().collect::<Vec<_>>(), vec![3, 4, 5]);
        assert_eq!(report.curves().count(), 3);
        assert_eq!(report.failures().count(), 0);
        for (k, curve) in report.curves() {
            assert_eq!(curve.num_knots, k);
            assert_eq!(curve.len(), 20);
        }
        assert_abs_diff_eq!(report.grid[0], 11.0, epsilon = 1e-12);
        assert_abs_diff_eq!(report.grid[19], 62.0, epsilon = 1e-12);
    }

    #[test]
    fn failing_k_does_not_affect_others() {
        let data = vo2max_data();
        // Ten distinct moderator values allow at most nine knots.
        let report = sweep_knots(&data, &[2, 3, 10], 10, &RemlOptions::default());
        assert_eq!(report.len(), 3);
        assert_eq!(report.curves().map(|(k, _)| k).collect::<Vec<_>>(), vec![3]);

        let failed: Vec<usize> = report.failures().map(|(k, _)| k).collect();
        assert_eq!(failed, vec![2, 10]);
        for (_, err) in report.failures() {
            assert!(matches!(
                err,
                SweepError::Estimation(EstimationError::Basis(BasisError::InvalidKnotCount { .. }))
            ));
        }
    }

    #[test]
    fn sweep_matches_a_single_sequential_fit() {
        let data = vo2max_data();
        let report = sweep_knots(&data, &[3, 4], 15, &RemlOptions::default());
        let model = fit_spline_meta_regression(&data, 4, &RemlOptions::default()).unwrap();
        let direct = model.predict(report.grid.view()).unwrap();
        let swept = report.results[&4].as_ref().unwrap();
        assert_eq!(swept, &direct);
    }
}
