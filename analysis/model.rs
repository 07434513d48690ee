use crate::basis::SplineBasis;
use crate::data::{Outcome, PairingPolicy};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

// --- Public Data Structures ---
// The configuration is the human-editable TOML input of an analysis run. The fit
// structures are the in-memory results every downstream step reads from.

/// Analysis settings. Every field has a default so a partial TOML file is valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Coverage of Normal-based confidence intervals, in `(0, 1)`.
    pub confidence_level: f64,
    /// Relative convergence tolerance of the REML iteration on tau^2.
    pub reml_tolerance: f64,
    /// Iteration budget of the REML iteration.
    pub reml_max_iterations: usize,
    /// Number of points on the dense prediction grid.
    pub grid_points: usize,
    pub ferritin_knots: usize,
    pub vo2max_knots: usize,
    /// Knot counts evaluated by the sensitivity sweep.
    pub sensitivity_knots: Vec<usize>,
    /// Optional initial-ferritin cut-off (ng/mL) for the stratified analysis.
    pub subgroup_threshold: Option<f64>,
    /// Reject, rather than flag, rows with a half-missing VO2max pair.
    pub strict_pairing: bool,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            confidence_level: 0.95,
            reml_tolerance: 1e-8,
            reml_max_iterations: 100,
            grid_points: 100,
            ferritin_knots: 4,
            vo2max_knots: 3,
            sensitivity_knots: vec![3, 4, 5],
            subgroup_threshold: None,
            strict_pairing: false,
        }
    }
}

/// Custom error type for configuration loading and saving.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read or write config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse TOML config file: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Failed to serialize config to TOML format: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl AnalysisConfig {
    /// Loads a config from a TOML file and validates it.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let toml_string = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&toml_string)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let toml_string = toml::to_string_pretty(self)?;
        fs::write(path, toml_string)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.confidence_level > 0.0 && self.confidence_level < 1.0) {
            return Err(ConfigError::Invalid(format!(
                "confidence_level must lie strictly between 0 and 1, got {}",
                self.confidence_level
            )));
        }
        if !(self.reml_tolerance > 0.0 && self.reml_tolerance.is_finite()) {
            return Err(ConfigError::Invalid(format!(
                "reml_tolerance must be positive, got {}",
                self.reml_tolerance
            )));
        }
        if self.reml_max_iterations == 0 {
            return Err(ConfigError::Invalid(
                "reml_max_iterations must be at least 1".to_string(),
            ));
        }
        if self.grid_points < 2 {
            return Err(ConfigError::Invalid(format!(
                "grid_points must be at least 2, got {}",
                self.grid_points
            )));
        }
        if let Some(threshold) = self.subgroup_threshold {
            if !threshold.is_finite() {
                return Err(ConfigError::Invalid(
                    "subgroup_threshold must be finite".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// The spline knot count used for the primary meta-regression of `outcome`.
    pub fn knots_for(&self, outcome: Outcome) -> usize {
        match outcome {
            Outcome::Ferritin => self.ferritin_knots,
            Outcome::Vo2max => self.vo2max_knots,
        }
    }

    pub fn pairing_policy(&self) -> PairingPolicy {
        if self.strict_pairing {
            PairingPolicy::Strict
        } else {
            PairingPolicy::Flag
        }
    }
}

/// One regression coefficient with its Wald inference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Coefficient {
    pub name: String,
    pub estimate: f64,
    pub std_error: f64,
    pub z_value: f64,
    pub p_value: f64,
    pub ci_lower: f64,
    pub ci_upper: f64,
}

/// Residual heterogeneity statistics.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Heterogeneity {
    /// Cochran's Q for residual heterogeneity (`Q_E`).
    pub q_e: f64,
    pub df: usize,
    pub p_value: f64,
    /// Percentage of residual variability attributable to tau^2.
    pub i2: f64,
    pub h2: f64,
}

/// Wald test that every moderator coefficient is zero (QM).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OmnibusTest {
    pub qm: f64,
    pub df: usize,
    pub p_value: f64,
}

/// Result of a random-effects fit, with or without moderators.
#[derive(Debug, Clone)]
pub struct RandomEffectsFit {
    /// Intercept first, then one entry per moderator column.
    pub coefficients: Vec<Coefficient>,
    /// `(X' W X)^-1` at the final tau^2.
    pub covariance: Array2<f64>,
    pub tau2: f64,
    /// Whether the final tau^2 is zero because a negative REML update was truncated.
    pub tau2_truncated: bool,
    pub heterogeneity: Heterogeneity,
    /// Present only when moderators were supplied.
    pub omnibus: Option<OmnibusTest>,
    pub log_likelihood: f64,
    pub iterations: usize,
    pub confidence_level: f64,
    /// Critical value of the standard Normal for `confidence_level`.
    pub z_crit: f64,
    /// Full design, intercept column included.
    pub design: Array2<f64>,
    pub fitted: Array1<f64>,
    /// Random-effects weights `1 / (s_i^2 + tau^2)`.
    pub weights: Array1<f64>,
}

impl RandomEffectsFit {
    pub fn beta(&self) -> Array1<f64> {
        self.coefficients.iter().map(|c| c.estimate).collect()
    }

    /// The intercept, which is the pooled effect of an intercept-only model.
    pub fn pooled(&self) -> &Coefficient {
        &self.coefficients[0]
    }

    pub fn num_studies(&self) -> usize {
        self.design.nrows()
    }

    /// Weight of each study as a percentage of the total.
    pub fn weight_percentages(&self) -> Array1<f64> {
        let total = self.weights.sum();
        self.weights.mapv(|w| 100.0 * w / total)
    }

    /// Interval for the true effect of a new study: `mu +/- z sqrt(se^2 + tau^2)`.
    /// Only meaningful for intercept-only fits.
    pub fn prediction_interval(&self) -> (f64, f64) {
        let pooled = self.pooled();
        let half_width = self.z_crit * (pooled.std_error.powi(2) + self.tau2).sqrt();
        (pooled.estimate - half_width, pooled.estimate + half_width)
    }
}

/// A spline meta-regression: the basis used to build the moderators plus the fit.
#[derive(Debug, Clone)]
pub struct SplineMetaRegression {
    pub basis: SplineBasis,
    pub fit: RandomEffectsFit,
}

impl SplineMetaRegression {
    pub fn num_knots(&self) -> usize {
        self.basis.num_knots()
    }
}
