//! # Per-Outcome Analysis Pipeline
//!
//! Orchestrates one analysis branch end to end: the unconditional pooled fit, the
//! spline meta-regression at the configured knot count with its prediction curve,
//! the optional subgroup analysis and the knot-count sensitivity sweep. Every stage
//! reads the same immutable `OutcomeData`; nothing is cached between branches.

use crate::data::{DataError, Outcome, OutcomeData, StudyTable};
use crate::estimate::{EstimationError, RemlOptions, fit_random_effects, fit_spline_meta_regression};
use crate::model::{AnalysisConfig, ConfigError, RandomEffectsFit, SplineMetaRegression};
use crate::predict::{PredictionCurve, PredictionError};
use crate::report::ReportError;
use crate::sensitivity::{SensitivityReport, sweep_knots};
use crate::subgroup::{SubgroupAnalysis, analyze_subgroups};
use serde::Serialize;
use thiserror::Error;

/// Every failure an analysis run can end with.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Data error: {0}")]
    Data(#[from] DataError),
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Estimation error for {outcome}: {source}")]
    Estimation {
        outcome: Outcome,
        #[source]
        source: EstimationError,
    },
    #[error("Prediction error: {0}")]
    Prediction(#[from] PredictionError),
    #[error("Report error: {0}")]
    Report(#[from] ReportError),
}

impl PipelineError {
    pub fn estimation(outcome: Outcome) -> impl FnOnce(EstimationError) -> Self {
        move |source| PipelineError::Estimation { outcome, source }
    }
}

/// One row of the forest table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ForestRow {
    pub id: String,
    pub effect: f64,
    pub std_error: f64,
    pub ci_lower: f64,
    pub ci_upper: f64,
    /// Random-effects weight as a percentage of the total.
    pub weight_percent: f64,
}

/// One study of the bubble plot of effect against moderator.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BubbleRow {
    pub id: String,
    pub moderator: f64,
    pub effect: f64,
    pub std_error: f64,
    /// `1 / s_i`, so more precise studies are drawn larger.
    pub marker_size: f64,
}

/// Everything computed for one outcome.
#[derive(Debug)]
pub struct OutcomeReport {
    pub outcome: Outcome,
    pub pooled: RandomEffectsFit,
    pub forest: Vec<ForestRow>,
    pub spline: SplineMetaRegression,
    pub curve: PredictionCurve,
    pub bubble: Vec<BubbleRow>,
    pub subgroups: Option<SubgroupAnalysis>,
    pub sensitivity: SensitivityReport,
}

impl OutcomeReport {
    pub fn num_studies(&self) -> usize {
        self.forest.len()
    }
}

/// Runs the unconditional random-effects model and builds the forest rows.
pub fn pooled_analysis(
    data: &OutcomeData,
    options: &RemlOptions,
) -> Result<(RandomEffectsFit, Vec<ForestRow>), EstimationError> {
    let fit = fit_random_effects(data.yi.view(), data.sei.view(), None, options)?;
    let pooled = fit.pooled();
    log::info!(
        "{} pooled estimate over {} studies: {:.3} [{:.3}, {:.3}], tau^2 = {:.4}, I^2 = {:.1}%",
        data.outcome,
        data.len(),
        pooled.estimate,
        pooled.ci_lower,
        pooled.ci_upper,
        fit.tau2,
        fit.heterogeneity.i2
    );
    let forest = forest_rows(data, &fit);
    Ok((fit, forest))
}

pub fn forest_rows(data: &OutcomeData, fit: &RandomEffectsFit) -> Vec<ForestRow> {
    let weights = fit.weight_percentages();
    (0..data.len())
        .map(|i| ForestRow {
            id: data.ids[i].clone(),
            effect: data.yi[i],
            std_error: data.sei[i],
            ci_lower: data.yi[i] - fit.z_crit * data.sei[i],
            ci_upper: data.yi[i] + fit.z_crit * data.sei[i],
            weight_percent: weights[i],
        })
        .collect()
}

pub fn bubble_rows(data: &OutcomeData) -> Vec<BubbleRow> {
    (0..data.len())
        .map(|i| BubbleRow {
            id: data.ids[i].clone(),
            moderator: data.moderator[i],
            effect: data.yi[i],
            std_error: data.sei[i],
            marker_size: 1.0 / data.sei[i],
        })
        .collect()
}

/// Runs every stage of the analysis of `outcome`.
pub fn analyze_outcome(
    table: &StudyTable,
    outcome: Outcome,
    config: &AnalysisConfig,
) -> Result<OutcomeReport, PipelineError> {
    let options = RemlOptions::from(config);
    let data = table.outcome_data(outcome);
    log::info!("Analyzing {outcome}: {} studies", data.len());

    // --- Stage 1: Unconditional Random-Effects Model ---
    let (pooled, forest) =
        pooled_analysis(&data, &options).map_err(PipelineError::estimation(outcome))?;

    // --- Stage 2: Spline Meta-Regression and Prediction Curve ---
    let num_knots = config.knots_for(outcome);
    let spline = fit_spline_meta_regression(&data, num_knots, &options)
        .map_err(PipelineError::estimation(outcome))?;
    let curve = spline.predict_grid(config.grid_points)?;
    let bubble = bubble_rows(&data);

    // --- Stage 3: Optional Subgroup Analysis ---
    let subgroups = config
        .subgroup_threshold
        .map(|threshold| analyze_subgroups(&data, threshold, &options))
        .transpose()
        .map_err(PipelineError::estimation(outcome))?;

    // --- Stage 4: Sensitivity Sweep ---
    let sensitivity = sweep_knots(&data, &config.sensitivity_knots, config.grid_points, &options);

    Ok(OutcomeReport {
        outcome,
        pooled,
        forest,
        spline,
        curve,
        bubble,
        subgroups,
        sensitivity,
    })
}

/// Analyzes both outcomes in order.
pub fn analyze_all(
    table: &StudyTable,
    config: &AnalysisConfig,
) -> Result<Vec<OutcomeReport>, PipelineError> {
    Outcome::ALL
        .iter()
        .map(|&outcome| analyze_outcome(table, outcome, config))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::basis::BasisError;
    use crate::data::{PairingPolicy, StudyRecord};
    use approx::assert_abs_diff_eq;

    fn table() -> StudyTable {
        let rows = [
            ("A", 2.1, 0.40, Some(1.2), Some(0.45), 12.0),
            ("B", 1.6, 0.35, None, None, 15.0),
            ("C", 1.9, 0.38, Some(0.9), Some(0.40), 18.0),
            ("D", 0.9, 0.30, Some(0.4), Some(0.35), 25.0),
            ("E", 1.2, 0.33, Some(0.1), Some(0.38), 31.0),
            ("F", 0.3, 0.28, Some(-0.2), Some(0.33), 40.0),
            ("G", 0.6, 0.31, Some(0.2), Some(0.36), 52.0),
        ];
        let records = rows
            .iter()
            .map(|&(id, fe, fse, ve, vse, init)| StudyRecord {
                id: id.to_string(),
                ferritin_effect_size_smd: fe,
                ferritin_std_error_smd: fse,
                vo2max_effect_size: ve,
                vo2max_std_error: vse,
                initial_ferritin_ng_ml: init,
            })
            .collect();
        StudyTable::from_records(records, PairingPolicy::Flag).unwrap()
    }

    #[test]
    fn forest_weights_sum_to_one_hundred() {
        let table = table();
        let data = table.outcome_data(Outcome::Ferritin);
        let (fit, forest) = pooled_analysis(&data, &RemlOptions::default()).unwrap();
        assert_eq!(forest.len(), 7);
        let total: f64 = forest.iter().map(|r| r.weight_percent).sum();
        assert_abs_diff_eq!(total, 100.0, epsilon = 1e-9);
        assert_abs_diff_eq!(
            forest[0].ci_upper - forest[0].ci_lower,
            2.0 * fit.z_crit * 0.40,
            epsilon = 1e-12
        );
    }

    #[test]
    fn bubble_marker_scales_with_precision() {
        let table = table();
        let rows = bubble_rows(&table.outcome_data(Outcome::Vo2max));
        assert_eq!(rows.len(), 6);
        assert_eq!(rows[1].id, "C");
        assert_abs_diff_eq!(rows[1].marker_size, 1.0 / 0.40, epsilon = 1e-12);
    }

    #[test]
    fn outcome_report_covers_every_stage() {
        let table = table();
        let config = AnalysisConfig {
            ferritin_knots: 3,
            sensitivity_knots: vec![3, 4],
            grid_points: 11,
            subgroup_threshold: Some(20.0),
            ..AnalysisConfig::default()
        };
        let report = analyze_outcome(&table, Outcome::Ferritin, &config).unwrap();
        assert_eq!(report.num_studies(), 7);
        assert_eq!(report.spline.num_knots(), 3);
        assert_eq!(report.curve.len(), 11);
        assert_eq!(report.bubble.len(), 7);
        assert_eq!(report.sensitivity.len(), 2);
        let subgroups = report.subgroups.unwrap();
        assert_eq!(subgroups.below.ids.len(), 3);
        assert_eq!(subgroups.at_or_above.ids.len(), 4);
    }

    #[test]
    fn invalid_knot_count_is_reported_with_outcome() {
        let table = table();
        let config = AnalysisConfig {
            vo2max_knots: 6,
            ..AnalysisConfig::default()
        };
        let err = analyze_outcome(&table, Outcome::Vo2max, &config).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Estimation {
                outcome: Outcome::Vo2max,
                source: EstimationError::Basis(BasisError::InvalidKnotCount { max: 5, .. })
            }
        ));
    }
}
