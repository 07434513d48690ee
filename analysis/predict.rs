use crate::basis::{BasisError, SplineBasis};
use crate::model::{RandomEffectsFit, SplineMetaRegression};
use ndarray::{Array1, Array2, ArrayView1, s};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Predicted effect at one moderator value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PredictionPoint {
    pub moderator: f64,
    pub estimate: f64,
    pub se: f64,
    pub ci_lower: f64,
    pub ci_upper: f64,
}

/// Predictions of one fitted spline meta-regression, in the order the moderator
/// values were supplied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionCurve {
    pub num_knots: usize,
    pub points: Vec<PredictionPoint>,
}

impl PredictionCurve {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn estimates(&self) -> Array1<f64> {
        self.points.iter().map(|p| p.estimate).collect()
    }
}

#[derive(Error, Debug)]
pub enum PredictionError {
    #[error(
        "The fit has {fit_columns} coefficients, but the spline basis yields {basis_columns} design columns (intercept included)."
    )]
    DesignMismatch {
        fit_columns: usize,
        basis_columns: usize,
    },
    #[error("Underlying basis function generation failed during prediction: {0}")]
    Basis(#[from] BasisError),
}

/// `n` evenly spaced values from `min` to `max`, both ends included.
pub fn evaluation_grid(min: f64, max: f64, n: usize) -> Array1<f64> {
    match n {
        0 => Array1::zeros(0),
        1 => Array1::from_elem(1, min),
        _ => Array1::linspace(min, max, n),
    }
}

/// Predicts the effect at each of `values` from a fitted meta-regression on `basis`.
///
/// This never refits: it projects the values through the stored knots and
/// constraint transform, then applies the fitted coefficients and their covariance.
pub fn predict_curve(
    fit: &RandomEffectsFit,
    basis: &SplineBasis,
    values: ArrayView1<f64>,
) -> Result<PredictionCurve, PredictionError> {
    // --- 1. Validate Inputs ---
    let expected = basis.num_columns() + 1;
    if fit.coefficients.len() != expected {
        return Err(PredictionError::DesignMismatch {
            fit_columns: fit.coefficients.len(),
            basis_columns: expected,
        });
    }

    // --- 2. Reconstruct the Design ---
    let projected = basis.project(values)?;
    let mut design = Array2::<f64>::ones((values.len(), expected));
    design.slice_mut(s![.., 1..]).assign(&projected);

    // --- 3. Linear Predictor and its Variance ---
    let beta = fit.beta();
    let estimates = design.dot(&beta);
    let variances = (&design.dot(&fit.covariance) * &design).sum_axis(ndarray::Axis(1));

    let points = values
        .iter()
        .zip(estimates.iter().zip(variances.iter()))
        .map(|(&moderator, (&estimate, &variance))| {
            // Round-off can leave a tiny negative variance for rows in the span of
            // the intercept alone.
            let se = variance.max(0.0).sqrt();
            PredictionPoint {
                moderator,
                estimate,
                se,
                ci_lower: estimate - fit.z_crit * se,
                ci_upper: estimate + fit.z_crit * se,
            }
        })
        .collect();

    Ok(PredictionCurve {
        num_knots: basis.num_knots(),
        points,
    })
}

impl SplineMetaRegression {
    pub fn predict(&self, values: ArrayView1<f64>) -> Result<PredictionCurve, PredictionError> {
        predict_curve(&self.fit, &self.basis, values)
    }

    /// Predictions on `n` evenly spaced points over the training moderator range.
    pub fn predict_grid(&self, n: usize) -> Result<PredictionCurve, PredictionError> {
        let knots = &self.basis.knots;
        // The boundary knots are the observed minimum and maximum.
        let grid = evaluation_grid(knots[0], knots[knots.len() - 1], n);
        self.predict(grid.view())
    }
}
