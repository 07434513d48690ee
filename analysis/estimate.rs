//! # Random-Effects Estimation via Restricted Maximum Likelihood
//!
//! Fits the random-effects meta-regression
//!
//! ```text
//! y_i = x_i' beta + u_i + e_i,   e_i ~ N(0, s_i^2),   u_i ~ N(0, tau^2)
//! ```
//!
//! where the sampling variances `s_i^2` are known and the between-study variance
//! `tau^2` is estimated by maximising the restricted log-likelihood. The
//! estimation is a single loop:
//!
//! 1.  **Start:** the Hedges (OLS residual) estimate of `tau^2`, truncated at zero.
//! 2.  **Fisher scoring:** with `W = diag(1 / (s_i^2 + tau^2))` and
//!     `P = W - W X (X'WX)^-1 X'W`, each step adds
//!     `(y'PPy - tr P) / tr(PP)` to `tau^2`. Proposals below zero are truncated
//!     to zero; a fit whose final `tau^2` came from truncation is flagged.
//! 3.  **Generalised least squares:** `beta = (X'WX)^-1 X'Wy` at the final `tau^2`,
//!     with `(X'WX)^-1` as its covariance.
//!
//! The moderator columns never include the intercept; it is always prepended here.

use crate::basis::{self, build_spline_basis};
use crate::data::OutcomeData;
use crate::faer_ndarray::{FaerCholesky, FaerEigh, FaerLinalgError};
use crate::model::{
    Coefficient, Heterogeneity, OmnibusTest, RandomEffectsFit, SplineMetaRegression,
};
use faer::Side;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, s};
use statrs::distribution::{ChiSquared, ContinuousCDF, Normal};
use thiserror::Error;

/// Smallest acceptable ratio of the extreme eigenvalues of the column-scaled `X'X`.
const RANK_TOLERANCE: f64 = 1e-10;

/// A comprehensive error type for the model estimation process.
#[derive(Error, Debug)]
pub enum EstimationError {
    #[error("Insufficient data for a random-effects fit: {0}")]
    InsufficientData(String),

    #[error(
        "The REML iteration did not converge within {max_iterations} iterations. Last change in tau^2 was {last_change:.6e}."
    )]
    NonConvergence {
        max_iterations: usize,
        last_change: f64,
    },

    #[error("Invalid estimator input: {0}")]
    InvalidInput(String),

    #[error("Confidence level must lie strictly between 0 and 1, got {0}.")]
    InvalidConfidenceLevel(f64),

    #[error("Underlying spline basis construction failed: {0}")]
    Basis(#[from] basis::BasisError),

    #[error("A linear system solve failed: {0}")]
    Linalg(#[from] FaerLinalgError),

    #[error("Reference distribution could not be constructed: {0}")]
    Distribution(String),
}

/// Numerical settings of the REML fit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RemlOptions {
    pub tolerance: f64,
    pub max_iterations: usize,
    pub confidence_level: f64,
}

impl Default for RemlOptions {
    fn default() -> Self {
        Self {
            tolerance: 1e-8,
            max_iterations: 100,
            confidence_level: 0.95,
        }
    }
}

impl From<&crate::model::AnalysisConfig> for RemlOptions {
    fn from(config: &crate::model::AnalysisConfig) -> Self {
        Self {
            tolerance: config.reml_tolerance,
            max_iterations: config.reml_max_iterations,
            confidence_level: config.confidence_level,
        }
    }
}

/// Fits a random-effects model by REML.
///
/// `moderators`, when given, has one row per study and one column per moderator;
/// the intercept is added here. Coefficient names are `intrcpt` and `mod1..modm`.
pub fn fit_random_effects(
    yi: ArrayView1<f64>,
    sei: ArrayView1<f64>,
    moderators: Option<ArrayView2<f64>>,
    options: &RemlOptions,
) -> Result<RandomEffectsFit, EstimationError> {
    let names = match moderators {
        Some(mods) => internal::default_names(mods.ncols()),
        None => internal::default_names(0),
    };
    fit_random_effects_named(yi, sei, moderators, &names, options)
}

/// Same as [`fit_random_effects`] with caller-chosen coefficient names
/// (intercept first).
pub fn fit_random_effects_named(
    yi: ArrayView1<f64>,
    sei: ArrayView1<f64>,
    moderators: Option<ArrayView2<f64>>,
    names: &[String],
    options: &RemlOptions,
) -> Result<RandomEffectsFit, EstimationError> {
    if !(options.confidence_level > 0.0 && options.confidence_level < 1.0) {
        return Err(EstimationError::InvalidConfidenceLevel(
            options.confidence_level,
        ));
    }
    let design = internal::build_design(yi, sei, moderators)?;
    if names.len() != design.ncols() {
        return Err(EstimationError::InvalidInput(format!(
            "{} coefficient names supplied for {} design columns",
            names.len(),
            design.ncols()
        )));
    }
    internal::check_rank(design.view())?;

    let state = internal::RemlState::new(yi, sei, design);
    let (tau2, iterations, tau2_truncated) = state.solve_tau2(options)?;
    if tau2_truncated {
        log::warn!(
            "REML update for tau^2 was negative and has been truncated to zero ({} studies, {} coefficients).",
            state.num_studies(),
            state.num_coefficients()
        );
    }
    log::debug!("REML converged after {iterations} iterations: tau^2 = {tau2:.6e}");

    state.finalize(tau2, iterations, tau2_truncated, names, options.confidence_level)
}

/// Builds the constrained cubic regression spline basis of the moderator and fits
/// the spline meta-regression on it.
pub fn fit_spline_meta_regression(
    data: &OutcomeData,
    num_knots: usize,
    options: &RemlOptions,
) -> Result<SplineMetaRegression, EstimationError> {
    let basis = build_spline_basis(data.moderator.view(), num_knots)?;
    let mut names = vec!["intrcpt".to_string()];
    names.extend((1..=basis.num_columns()).map(|j| format!("s(ferritin).{j}")));

    let fit = fit_random_effects_named(
        data.yi.view(),
        data.sei.view(),
        Some(basis.design.view()),
        &names,
        options,
    )?;
    if let Some(test) = &fit.omnibus {
        log::info!(
            "{} spline meta-regression (K = {num_knots}): QM({}) = {:.3}, p = {:.3e}, tau^2 = {:.4}",
            data.outcome,
            test.df,
            test.qm,
            test.p_value,
            fit.tau2
        );
    }
    Ok(SplineMetaRegression { basis, fit })
}

/// Internal module for estimation details not exposed in the public API.
mod internal {
    use super::*;

    pub(super) fn default_names(num_moderators: usize) -> Vec<String> {
        std::iter::once("intrcpt".to_string())
            .chain((1..=num_moderators).map(|j| format!("mod{j}")))
            .collect()
    }

    /// Validates the inputs and returns `[1 | moderators]`.
    pub(super) fn build_design(
        yi: ArrayView1<f64>,
        sei: ArrayView1<f64>,
        moderators: Option<ArrayView2<f64>>,
    ) -> Result<Array2<f64>, EstimationError> {
        let k = yi.len();
        if sei.len() != k {
            return Err(EstimationError::InvalidInput(format!(
                "{k} effect sizes but {} standard errors",
                sei.len()
            )));
        }
        if k < 2 {
            return Err(EstimationError::InsufficientData(format!(
                "{k} studies supplied; at least 2 are required"
            )));
        }
        if yi.iter().any(|v| !v.is_finite()) {
            return Err(EstimationError::InvalidInput(
                "effect sizes must be finite".to_string(),
            ));
        }
        if sei.iter().any(|&s| !(s.is_finite() && s > 0.0)) {
            return Err(EstimationError::InvalidInput(
                "standard errors must be finite and strictly positive".to_string(),
            ));
        }

        let num_mods = moderators.map_or(0, |m| m.ncols());
        let mut design = Array2::<f64>::ones((k, 1 + num_mods));
        if let Some(mods) = moderators {
            if mods.nrows() != k {
                return Err(EstimationError::InvalidInput(format!(
                    "moderator matrix has {} rows for {k} studies",
                    mods.nrows()
                )));
            }
            if mods.iter().any(|v| !v.is_finite()) {
                return Err(EstimationError::InvalidInput(
                    "moderator values must be finite".to_string(),
                ));
            }
            design.slice_mut(s![.., 1..]).assign(&mods);
        }

        let p = design.ncols();
        if k <= p {
            return Err(EstimationError::InsufficientData(format!(
                "{k} studies cannot support {p} coefficients plus tau^2"
            )));
        }
        Ok(design)
    }

    /// Rejects designs whose columns are linearly dependent.
    pub(super) fn check_rank(design: ArrayView2<f64>) -> Result<(), EstimationError> {
        let gram = design.t().dot(&design);
        let scale = gram.diag().mapv(f64::sqrt);
        if scale.iter().any(|&d| d <= f64::EPSILON) {
            return Err(EstimationError::InsufficientData(
                "design matrix has an all-zero column".to_string(),
            ));
        }
        let scaled = Array2::from_shape_fn(gram.dim(), |(i, j)| {
            gram[(i, j)] / (scale[i] * scale[j])
        });
        let (eigenvalues, _) = scaled.eigh(Side::Lower)?;
        let max_eig = eigenvalues.iter().copied().fold(f64::MIN, f64::max);
        let min_eig = eigenvalues.iter().copied().fold(f64::MAX, f64::min);
        if min_eig <= RANK_TOLERANCE * max_eig {
            return Err(EstimationError::InsufficientData(format!(
                "design matrix is rank-deficient (eigenvalue ratio {:.3e})",
                min_eig / max_eig
            )));
        }
        Ok(())
    }

    /// The weighted quantities at one value of tau^2.
    pub(super) struct WeightedSystem {
        pub weights: Array1<f64>,
        /// Inverse of `X'WX`, the coefficient covariance.
        pub covariance: Array2<f64>,
        pub log_det_xtwx: f64,
        /// The REML projection `P = W - W X (X'WX)^-1 X'W`.
        pub projection: Array2<f64>,
    }

    pub(super) struct RemlState<'a> {
        y: ArrayView1<'a, f64>,
        variances: Array1<f64>,
        design: Array2<f64>,
    }

    impl<'a> RemlState<'a> {
        pub(super) fn new(y: ArrayView1<'a, f64>, sei: ArrayView1<f64>, design: Array2<f64>) -> Self {
            Self {
                y,
                variances: sei.mapv(|s| s * s),
                design,
            }
        }

        pub(super) fn num_studies(&self) -> usize {
            self.design.nrows()
        }

        pub(super) fn num_coefficients(&self) -> usize {
            self.design.ncols()
        }

        pub(super) fn system(&self, tau2: f64) -> Result<WeightedSystem, EstimationError> {
            let weights = self.variances.mapv(|v| 1.0 / (v + tau2));
            let wx = &self.design * &weights.view().insert_axis(Axis(1));
            let xtwx = self.design.t().dot(&wx);
            let factor = xtwx.cholesky(Side::Lower)?;
            let covariance = factor.inverse(xtwx.nrows());

            let mut projection = -wx.dot(&covariance).dot(&wx.t());
            for (i, &w) in weights.iter().enumerate() {
                projection[(i, i)] += w;
            }

            Ok(WeightedSystem {
                weights,
                covariance,
                log_det_xtwx: factor.log_determinant(),
                projection,
            })
        }

        /// Hedges estimator from the OLS residuals, truncated at zero.
        pub(super) fn initial_tau2(&self) -> Result<f64, EstimationError> {
            let k = self.num_studies();
            let p = self.num_coefficients();
            let xtx = self.design.t().dot(&self.design);
            let xtx_inv = xtx.cholesky(Side::Lower)?.inverse(p);
            let hat = self.design.dot(&xtx_inv).dot(&self.design.t());
            let residuals = &self.y - &hat.dot(&self.y);
            let rss = residuals.dot(&residuals);
            let expected: f64 = self
                .variances
                .iter()
                .zip(hat.diag().iter())
                .map(|(&v, &h)| v * (1.0 - h))
                .sum();
            Ok(((rss - expected) / (k - p) as f64).max(0.0))
        }

        /// Runs Fisher scoring on tau^2. Returns `(tau2, iterations, truncated)`.
        pub(super) fn solve_tau2(
            &self,
            options: &RemlOptions,
        ) -> Result<(f64, usize, bool), EstimationError> {
            let mut tau2 = self.initial_tau2()?;
            let mut last_change = f64::INFINITY;

            for iteration in 1..=options.max_iterations {
                let system = self.system(tau2)?;
                let p = &system.projection;
                let py = p.dot(&self.y);
                let ypp_y = py.dot(&py);
                let trace_p = p.diag().sum();
                let trace_pp = (p * p).sum();

                let raw = tau2 + (ypp_y - trace_p) / trace_pp;
                let truncated = raw < 0.0;
                let proposal = raw.max(0.0);
                last_change = (proposal - tau2).abs();
                let converged = last_change <= options.tolerance * tau2.max(1.0);

                log::debug!(
                    "REML iteration {iteration}: tau^2 {tau2:.8e} -> {proposal:.8e} (change {last_change:.3e})"
                );

                tau2 = proposal;
                if converged {
                    return Ok((tau2, iteration, truncated));
                }
            }

            Err(EstimationError::NonConvergence {
                max_iterations: options.max_iterations,
                last_change,
            })
        }

        /// Computes coefficients, inference and diagnostics at the final tau^2.
        pub(super) fn finalize(
            &self,
            tau2: f64,
            iterations: usize,
            tau2_truncated: bool,
            names: &[String],
            confidence_level: f64,
        ) -> Result<RandomEffectsFit, EstimationError> {
            let k = self.num_studies();
            let p = self.num_coefficients();
            let normal = Normal::new(0.0, 1.0)
                .map_err(|e| EstimationError::Distribution(e.to_string()))?;
            let z_crit = normal.inverse_cdf(1.0 - (1.0 - confidence_level) / 2.0);

            let system = self.system(tau2)?;
            let wy = &system.weights * &self.y;
            let beta = system.covariance.dot(&self.design.t().dot(&wy));

            let coefficients = names
                .iter()
                .enumerate()
                .map(|(j, name)| {
                    let estimate = beta[j];
                    let std_error = system.covariance[(j, j)].sqrt();
                    let z_value = estimate / std_error;
                    Coefficient {
                        name: name.clone(),
                        estimate,
                        std_error,
                        z_value,
                        p_value: 2.0 * normal.sf(z_value.abs()),
                        ci_lower: estimate - z_crit * std_error,
                        ci_upper: estimate + z_crit * std_error,
                    }
                })
                .collect();

            let omnibus = if p > 1 {
                Some(omnibus_test(beta.view(), system.covariance.view())?)
            } else {
                None
            };

            let heterogeneity = self.heterogeneity(tau2)?;

            let py = system.projection.dot(&self.y);
            let xtx = self.design.t().dot(&self.design);
            let log_det_xtx = xtx.cholesky(Side::Lower)?.log_determinant();
            let log_likelihood = -0.5
                * ((k - p) as f64 * (2.0 * std::f64::consts::PI).ln()
                    + self.variances.mapv(|v| (v + tau2).ln()).sum()
                    + system.log_det_xtwx
                    - log_det_xtx
                    + self.y.dot(&py));

            let fitted = self.design.dot(&beta);

            Ok(RandomEffectsFit {
                coefficients,
                covariance: system.covariance,
                tau2,
                tau2_truncated,
                heterogeneity,
                omnibus,
                log_likelihood,
                iterations,
                confidence_level,
                z_crit,
                design: self.design.clone(),
                fitted,
                weights: system.weights,
            })
        }

        /// `Q_E`, I^2 and H^2 from the fixed-effects projection (`tau^2 = 0`).
        fn heterogeneity(&self, tau2: f64) -> Result<Heterogeneity, EstimationError> {
            let k = self.num_studies();
            let p = self.num_coefficients();
            let df = k - p;
            let fixed = self.system(0.0)?;
            let q_e = self.y.dot(&fixed.projection.dot(&self.y));
            let chi2 = ChiSquared::new(df as f64)
                .map_err(|e| EstimationError::Distribution(e.to_string()))?;

            let typical_variance = df as f64 / fixed.projection.diag().sum();
            Ok(Heterogeneity {
                q_e,
                df,
                p_value: chi2.sf(q_e),
                i2: 100.0 * tau2 / (tau2 + typical_variance),
                h2: (tau2 + typical_variance) / typical_variance,
            })
        }
    }

    /// Wald chi-square test that all non-intercept coefficients are zero.
    pub(super) fn omnibus_test(
        beta: ArrayView1<f64>,
        covariance: ArrayView2<f64>,
    ) -> Result<OmnibusTest, EstimationError> {
        let df = beta.len() - 1;
        let b = beta.slice(s![1..]).to_owned();
        let block = covariance.slice(s![1.., 1..]).to_owned();
        let qm = b.dot(&block.cholesky(Side::Lower)?.solve_vec(&b));
        let chi2 = ChiSquared::new(df as f64)
            .map_err(|e| EstimationError::Distribution(e.to_string()))?;
        Ok(OmnibusTest {
            qm,
            df,
            p_value: chi2.sf(qm),
        })
    }
}
