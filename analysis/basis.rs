//! # Cubic Regression Spline Basis
//!
//! Builds the moderator design for the spline meta-regression. The basis is the
//! value-at-knot parameterisation of a natural cubic spline: coefficient `j` is the
//! value of the curve at knot `j`, and the second derivatives at the knots are a
//! fixed linear map `F+` of those values (zero at the two boundary knots).
//!
//! A sum-to-zero constraint is absorbed into the basis so that it carries no constant
//! component; the meta-regression already has an intercept. Everything needed to
//! evaluate the constrained basis at new moderator values is stored in
//! [`SplineBasis`], so prediction curves use exactly the training-time knots and
//! constraint transform.

use crate::faer_ndarray::{FaerCholesky, FaerQr};
use faer::Side;
use itertools::Itertools;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, s};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The smallest knot count a cubic regression spline supports.
pub const MIN_KNOTS: usize = 3;

/// A comprehensive error type for all operations within the basis module.
#[derive(Error, Debug)]
pub enum BasisError {
    #[error(
        "Invalid knot count {requested}: a cubic regression spline on this moderator needs between {min} and {max} knots."
    )]
    InvalidKnotCount {
        requested: usize,
        min: usize,
        max: usize,
    },

    #[error("Moderator values must be finite; found {0}.")]
    NonFiniteValue(f64),

    #[error("Linear algebra failure while building the spline basis: {0}")]
    Linalg(#[from] crate::faer_ndarray::FaerLinalgError),
}

/// A cubic regression spline basis with an absorbed sum-to-zero constraint.
///
/// `design` has one row per training value and `K - 1` columns. `second_derivative_map`
/// is `F+` (K x K) and `z_transform` is `Z` (K x (K-1)), so the constrained basis at any
/// point is `b(x) Z` where `b(x)` is the unconstrained row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplineBasis {
    pub knots: Array1<f64>,
    pub second_derivative_map: Array2<f64>,
    pub z_transform: Array2<f64>,
    pub design: Array2<f64>,
}

impl SplineBasis {
    /// Number of knots `K`.
    pub fn num_knots(&self) -> usize {
        self.knots.len()
    }

    /// Number of columns of the constrained basis (`K - 1`).
    pub fn num_columns(&self) -> usize {
        self.z_transform.ncols()
    }

    /// Projects new moderator values into the constrained basis space.
    ///
    /// Values outside the knot range are extrapolated linearly from the end knots.
    pub fn project(&self, values: ArrayView1<f64>) -> Result<Array2<f64>, BasisError> {
        if let Some(&bad) = values.iter().find(|v| !v.is_finite()) {
            return Err(BasisError::NonFiniteValue(bad));
        }
        let raw = internal::evaluate_basis(
            values,
            self.knots.view(),
            self.second_derivative_map.view(),
        );
        Ok(raw.dot(&self.z_transform))
    }
}

/// Builds the constrained cubic regression spline basis for `moderator` with `num_knots` knots.
///
/// Knots are spread evenly through the sorted distinct moderator values. `num_knots`
/// must lie in `[3, distinct - 1]`.
pub fn build_spline_basis(
    moderator: ArrayView1<f64>,
    num_knots: usize,
) -> Result<SplineBasis, BasisError> {
    if let Some(&bad) = moderator.iter().find(|v| !v.is_finite()) {
        return Err(BasisError::NonFiniteValue(bad));
    }

    let distinct = distinct_sorted(moderator);
    let max_knots = distinct.len().saturating_sub(1);
    if num_knots < MIN_KNOTS || num_knots > max_knots {
        return Err(BasisError::InvalidKnotCount {
            requested: num_knots,
            min: MIN_KNOTS,
            max: max_knots,
        });
    }

    let knots = internal::place_knots(&distinct, num_knots);
    let second_derivative_map = internal::second_derivative_map(knots.view())?;
    let unconstrained =
        internal::evaluate_basis(moderator, knots.view(), second_derivative_map.view());
    let (design, z_transform) = apply_sum_to_zero_constraint(unconstrained.view());

    log::debug!(
        "Built cubic regression spline: {} knots at {:?}, {} constrained columns",
        num_knots,
        knots.to_vec(),
        design.ncols()
    );

    Ok(SplineBasis {
        knots,
        second_derivative_map,
        z_transform,
        design,
    })
}

/// Applies a sum-to-zero constraint to a basis matrix for model identifiability.
///
/// The constraint vector is `c = B' 1`. Its QR decomposition gives an orthogonal `Q`
/// whose first column is proportional to `c`; the remaining columns span the null
/// space of `c'` and form the transform `Z`. Returns `(B Z, Z)`.
pub fn apply_sum_to_zero_constraint(basis_matrix: ArrayView2<f64>) -> (Array2<f64>, Array2<f64>) {
    let n_basis = basis_matrix.ncols();
    let constraint_vec = basis_matrix.sum_axis(Axis(0));
    let c = constraint_vec
        .into_shape_with_order((n_basis, 1))
        .expect("a length-k vector always reshapes to k x 1");

    let (q, _) = c.qr();
    let z_transform = q.slice(s![.., 1..]).to_owned();
    let constrained_basis = basis_matrix.dot(&z_transform);
    (constrained_basis, z_transform)
}

fn distinct_sorted(values: ArrayView1<f64>) -> Vec<f64> {
    values
        .iter()
        .copied()
        .sorted_by(f64::total_cmp)
        .dedup()
        .collect()
}

/// Internal module for implementation details not exposed in the public API.
mod internal {
    use super::*;

    /// Places `num_knots` knots evenly through the sorted distinct values, interpolating
    /// between neighbouring values. The end knots are the data extremes.
    pub(super) fn place_knots(distinct: &[f64], num_knots: usize) -> Array1<f64> {
        let n = distinct.len();
        let mut knots = Array1::zeros(num_knots);
        knots[0] = distinct[0];
        knots[num_knots - 1] = distinct[n - 1];

        let delta = (n as f64 - 1.0) / (num_knots as f64 - 1.0);
        for j in 1..num_knots - 1 {
            let position = delta * j as f64;
            let lower = position.floor() as usize;
            let fraction = position - lower as f64;
            let upper = (lower + 1).min(n - 1);
            knots[j] = distinct[lower] * (1.0 - fraction) + distinct[upper] * fraction;
        }
        knots
    }

    /// Computes `F+`, the map from knot values to knot second derivatives, for a
    /// natural cubic spline: `F+ = [0; B^-1 D; 0]`.
    pub(super) fn second_derivative_map(
        knots: ArrayView1<f64>,
    ) -> Result<Array2<f64>, BasisError> {
        let k = knots.len();
        let h: Vec<f64> = knots.windows(2).into_iter().map(|w| w[1] - w[0]).collect();

        let mut d = Array2::<f64>::zeros((k - 2, k));
        let mut b = Array2::<f64>::zeros((k - 2, k - 2));
        for i in 0..k - 2 {
            d[(i, i)] = 1.0 / h[i];
            d[(i, i + 1)] = -1.0 / h[i] - 1.0 / h[i + 1];
            d[(i, i + 2)] = 1.0 / h[i + 1];
            b[(i, i)] = (h[i] + h[i + 1]) / 3.0;
            if i + 1 < k - 2 {
                b[(i, i + 1)] = h[i + 1] / 6.0;
                b[(i + 1, i)] = h[i + 1] / 6.0;
            }
        }

        // B is symmetric and strictly diagonally dominant, hence positive definite.
        let f = b.cholesky(Side::Lower)?.solve_mat(&d);

        let mut f_plus = Array2::<f64>::zeros((k, k));
        f_plus.slice_mut(s![1..k - 1, ..]).assign(&f);
        Ok(f_plus)
    }

    /// Evaluates the unconstrained basis (one column per knot) at each value.
    pub(super) fn evaluate_basis(
        values: ArrayView1<f64>,
        knots: ArrayView1<f64>,
        f_plus: ArrayView2<f64>,
    ) -> Array2<f64> {
        let mut basis = Array2::zeros((values.len(), knots.len()));
        for (i, &x) in values.iter().enumerate() {
            basis
                .row_mut(i)
                .assign(&evaluate_at_point(x, knots, f_plus));
        }
        basis
    }

    /// Evaluates all basis functions at `x`.
    pub(super) fn evaluate_at_point(
        x: f64,
        knots: ArrayView1<f64>,
        f_plus: ArrayView2<f64>,
    ) -> Array1<f64> {
        let k = knots.len();
        let mut row = Array1::zeros(k);

        if x < knots[0] {
            // f(x) = f(x_1) + (x - x_1) f'(x_1)
            let h = knots[1] - knots[0];
            let dx = x - knots[0];
            row[0] += 1.0 - dx / h;
            row[1] += dx / h;
            row.scaled_add(-dx * h / 3.0, &f_plus.row(0));
            row.scaled_add(-dx * h / 6.0, &f_plus.row(1));
            return row;
        }
        if x > knots[k - 1] {
            // f(x) = f(x_k) + (x - x_k) f'(x_k)
            let h = knots[k - 1] - knots[k - 2];
            let dx = x - knots[k - 1];
            row[k - 2] -= dx / h;
            row[k - 1] += 1.0 + dx / h;
            row.scaled_add(dx * h / 6.0, &f_plus.row(k - 2));
            row.scaled_add(dx * h / 3.0, &f_plus.row(k - 1));
            return row;
        }

        let mut j = 0;
        while j < k - 2 && x > knots[j + 1] {
            j += 1;
        }
        let h = knots[j + 1] - knots[j];
        let right = knots[j + 1] - x;
        let left = x - knots[j];

        let c_minus = (right.powi(3) / h - h * right) / 6.0;
        let c_plus = (left.powi(3) / h - h * left) / 6.0;
        row.scaled_add(c_minus, &f_plus.row(j));
        row.scaled_add(c_plus, &f_plus.row(j + 1));
        row[j] += right / h;
        row[j + 1] += left / h;
        row
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array, array};

    fn moderator() -> Array1<f64> {
        array![11.0, 13.5, 15.0, 17.2, 19.0, 21.5, 24.0, 27.0, 31.0, 35.5, 41.0, 48.0, 62.0]
    }

    #[test]
    fn test_knot_placement_spans_distinct_values() {
        let distinct = vec![1.0, 2.0, 4.0, 8.0, 16.0];
        let knots = internal::place_knots(&distinct, 3);
        assert_eq!(knots, array![1.0, 4.0, 16.0]);

        // delta = 4/3: positions 1.333 and 2.667 between distinct values.
        let knots = internal::place_knots(&distinct, 4);
        assert_abs_diff_eq!(knots[1], 2.0 + (4.0 - 2.0) / 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(knots[2], 4.0 + (8.0 - 4.0) * 2.0 / 3.0, epsilon = 1e-12);
        assert_eq!(knots[3], 16.0);
    }

    #[test]
    fn test_knot_placement_ignores_duplicates() {
        let x = array![5.0, 1.0, 5.0, 3.0, 9.0, 1.0, 7.0];
        let basis = build_spline_basis(x.view(), 3).unwrap();
        assert_eq!(basis.knots, array![1.0, 5.0, 9.0]);
    }

    #[test]
    fn test_unconstrained_basis_interpolates_at_knots() {
        let knots = array![0.0, 1.0, 3.0, 6.0];
        let f_plus = internal::second_derivative_map(knots.view()).unwrap();
        for (j, &knot) in knots.iter().enumerate() {
            let row = internal::evaluate_at_point(knot, knots.view(), f_plus.view());
            for (c, &value) in row.iter().enumerate() {
                let expected = if c == j { 1.0 } else { 0.0 };
                assert_abs_diff_eq!(value, expected, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn test_unconstrained_basis_reproduces_linear_functions() {
        // A natural cubic spline through points on a line is that line, including
        // the linear extrapolation beyond the boundary knots.
        let knots = array![0.0, 2.0, 3.0, 7.0, 10.0];
        let f_plus = internal::second_derivative_map(knots.view()).unwrap();
        let coefficients = knots.mapv(|k| 2.0 * k - 1.0);
        for &x in &[-3.0, 0.5, 2.5, 5.0, 9.9, 14.0] {
            let row = internal::evaluate_at_point(x, knots.view(), f_plus.view());
            assert_abs_diff_eq!(row.dot(&coefficients), 2.0 * x - 1.0, epsilon = 1e-10);
        }
    }

    #[test]
    fn test_unconstrained_rows_sum_to_one() {
        let knots = array![0.0, 1.0, 4.0, 5.0, 9.0];
        let f_plus = internal::second_derivative_map(knots.view()).unwrap();
        let values = Array::linspace(-2.0, 11.0, 53);
        let basis = internal::evaluate_basis(values.view(), knots.view(), f_plus.view());
        for &sum in basis.sum_axis(Axis(1)).iter() {
            assert_abs_diff_eq!(sum, 1.0, epsilon = 1e-10);
        }
    }

    #[test]
    fn test_constrained_basis_columns_sum_to_zero() {
        let x = moderator();
        for k in 3..=8 {
            let basis = build_spline_basis(x.view(), k).unwrap();
            assert_eq!(basis.design.dim(), (x.len(), k - 1));
            for &col_sum in basis.design.sum_axis(Axis(0)).iter() {
                assert!(col_sum.abs() < 1e-6, "column sum {col_sum} for k = {k}");
            }
        }
    }

    #[test]
    fn test_constraint_transform_is_orthonormal() {
        let basis = build_spline_basis(moderator().view(), 5).unwrap();
        let ztz = basis.z_transform.t().dot(&basis.z_transform);
        for i in 0..ztz.nrows() {
            for j in 0..ztz.ncols() {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert_abs_diff_eq!(ztz[(i, j)], expected, epsilon = 1e-10);
            }
        }
    }

    #[test]
    fn test_projection_of_training_values_matches_design() {
        let x = moderator();
        let basis = build_spline_basis(x.view(), 4).unwrap();
        let projected = basis.project(x.view()).unwrap();
        for (a, b) in projected.iter().zip(basis.design.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_projection_outside_training_range_is_linear() {
        let basis = build_spline_basis(moderator().view(), 4).unwrap();
        let below = array![0.0, 2.0, 4.0];
        let rows = basis.project(below.view()).unwrap();
        // Equal spacing in x gives equal increments in every column.
        for c in 0..rows.ncols() {
            let first = rows[(1, c)] - rows[(0, c)];
            let second = rows[(2, c)] - rows[(1, c)];
            assert_abs_diff_eq!(first, second, epsilon = 1e-10);
        }
    }

    #[test]
    fn test_invalid_knot_counts_rejected() {
        let x = moderator();
        match build_spline_basis(x.view(), 2).unwrap_err() {
            BasisError::InvalidKnotCount { requested, min, max } => {
                assert_eq!(requested, 2);
                assert_eq!(min, 3);
                assert_eq!(max, 12);
            }
            other => panic!("Expected InvalidKnotCount, got {other:?}"),
        }

        assert!(build_spline_basis(x.view(), 12).is_ok());
        assert!(matches!(
            build_spline_basis(x.view(), 13),
            Err(BasisError::InvalidKnotCount { requested: 13, .. })
        ));

        // Three distinct values allow at most two knots, which is below the minimum.
        let few = array![1.0, 2.0, 2.0, 3.0];
        assert!(matches!(
            build_spline_basis(few.view(), 3),
            Err(BasisError::InvalidKnotCount { max: 2, .. })
        ));
    }

    #[test]
    fn test_non_finite_moderator_rejected() {
        let x = array![1.0, 2.0, f64::NAN, 4.0, 5.0];
        assert!(matches!(
            build_spline_basis(x.view(), 3),
            Err(BasisError::NonFiniteValue(_))
        ));
    }
}
