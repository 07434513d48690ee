//! Writes the numeric artifacts of an analysis run.
//!
//! Per outcome: `<outcome>_forest.tsv`, `<outcome>_bubble.tsv`, `<outcome>_curve.tsv`
//! and `<outcome>_sensitivity.tsv` (long format, one block of rows per K). A single
//! `summary.toml` collects the headline statistics of every outcome.

use crate::pipeline::OutcomeReport;
use crate::predict::PredictionPoint;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("Failed to write report file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to write TSV table: {0}")]
    Csv(#[from] csv::Error),
    #[error("Failed to serialize summary to TOML format: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

/// Headline statistics of one outcome, as written to `summary.toml`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutcomeSummary {
    pub outcome: String,
    pub num_studies: usize,
    pub pooled_estimate: f64,
    pub pooled_std_error: f64,
    pub pooled_p_value: f64,
    pub ci_lower: f64,
    pub ci_upper: f64,
    pub prediction_lower: f64,
    pub prediction_upper: f64,
    pub tau2: f64,
    pub tau2_truncated: bool,
    pub i2: f64,
    pub h2: f64,
    pub q_e: f64,
    pub q_e_df: usize,
    pub q_e_p_value: f64,
    pub spline_knots: usize,
    pub spline_tau2: f64,
    pub spline_tau2_truncated: bool,
    pub qm: f64,
    pub qm_df: usize,
    pub qm_p_value: f64,
    pub subgroups: Option<SubgroupSummary>,
    pub sensitivity_failures: Vec<SweepFailure>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubgroupSummary {
    pub threshold: f64,
    pub below_studies: usize,
    pub below_estimate: f64,
    pub at_or_above_studies: usize,
    pub at_or_above_estimate: f64,
    pub qm: f64,
    pub p_value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SweepFailure {
    pub knots: usize,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Summary {
    pub flagged_studies: Vec<String>,
    pub outcomes: Vec<OutcomeSummary>,
}

#[derive(Serialize)]
struct SensitivityRow {
    knots: usize,
    moderator: f64,
    estimate: f64,
    se: f64,
    ci_lower: f64,
    ci_upper: f64,
}

impl SensitivityRow {
    fn new(knots: usize, point: &PredictionPoint) -> Self {
        Self {
            knots,
            moderator: point.moderator,
            estimate: point.estimate,
            se: point.se,
            ci_lower: point.ci_lower,
            ci_upper: point.ci_upper,
        }
    }
}

impl OutcomeSummary {
    pub fn from_report(report: &OutcomeReport) -> Self {
        let pooled = report.pooled.pooled();
        let (prediction_lower, prediction_upper) = report.pooled.prediction_interval();
        let heterogeneity = &report.pooled.heterogeneity;
        let spline_fit = &report.spline.fit;
        let (qm, qm_df, qm_p_value) = spline_fit
            .omnibus
            .map_or((f64::NAN, 0, f64::NAN), |t| (t.qm, t.df, t.p_value));

        OutcomeSummary {
            outcome: report.outcome.label().to_string(),
            num_studies: report.num_studies(),
            pooled_estimate: pooled.estimate,
            pooled_std_error: pooled.std_error,
            pooled_p_value: pooled.p_value,
            ci_lower: pooled.ci_lower,
            ci_upper: pooled.ci_upper,
            prediction_lower,
            prediction_upper,
            tau2: report.pooled.tau2,
            tau2_truncated: report.pooled.tau2_truncated,
            i2: heterogeneity.i2,
            h2: heterogeneity.h2,
            q_e: heterogeneity.q_e,
            q_e_df: heterogeneity.df,
            q_e_p_value: heterogeneity.p_value,
            spline_knots: report.spline.num_knots(),
            spline_tau2: spline_fit.tau2,
            spline_tau2_truncated: spline_fit.tau2_truncated,
            qm,
            qm_df,
            qm_p_value,
            subgroups: report.subgroups.as_ref().map(|s| SubgroupSummary {
                threshold: s.threshold,
                below_studies: s.below.ids.len(),
                below_estimate: s.below.fit.pooled().estimate,
                at_or_above_studies: s.at_or_above.ids.len(),
                at_or_above_estimate: s.at_or_above.fit.pooled().estimate,
                qm: s.difference.qm,
                p_value: s.difference.p_value,
            }),
            sensitivity_failures: report
                .sensitivity
                .failures()
                .map(|(knots, err)| SweepFailure {
                    knots,
                    error: err.to_string(),
                })
                .collect(),
        }
    }
}

fn tsv_writer(path: &Path) -> Result<csv::Writer<fs::File>, ReportError> {
    Ok(csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_path(path)?)
}

fn write_rows<T: Serialize>(path: &Path, rows: impl IntoIterator<Item = T>) -> Result<(), ReportError> {
    let mut writer = tsv_writer(path)?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

/// Writes the four TSV tables of one outcome and returns their paths.
pub fn write_outcome_tables(
    report: &OutcomeReport,
    out_dir: &Path,
) -> Result<Vec<PathBuf>, ReportError> {
    let label = report.outcome.label();
    let forest = out_dir.join(format!("{label}_forest.tsv"));
    let bubble = out_dir.join(format!("{label}_bubble.tsv"));
    let curve = out_dir.join(format!("{label}_curve.tsv"));
    let sensitivity = out_dir.join(format!("{label}_sensitivity.tsv"));

    write_rows(&forest, &report.forest)?;
    write_rows(&bubble, &report.bubble)?;
    write_rows(&curve, &report.curve.points)?;
    write_rows(
        &sensitivity,
        report.sensitivity.curves().flat_map(|(knots, curve)| {
            curve
                .points
                .iter()
                .map(move |point| SensitivityRow::new(knots, point))
        }),
    )?;

    Ok(vec![forest, bubble, curve, sensitivity])
}

/// Writes every table plus `summary.toml` into `out_dir`, creating it if needed.
pub fn write_report(
    reports: &[OutcomeReport],
    flagged: &[String],
    out_dir: impl AsRef<Path>,
) -> Result<Vec<PathBuf>, ReportError> {
    let out_dir = out_dir.as_ref();
    fs::create_dir_all(out_dir)?;

    let mut written = Vec::new();
    for report in reports {
        written.extend(write_outcome_tables(report, out_dir)?);
    }

    let summary = Summary {
        flagged_studies: flagged.to_vec(),
        outcomes: reports.iter().map(OutcomeSummary::from_report).collect(),
    };
    let summary_path = out_dir.join("summary.toml");
    fs::write(&summary_path, toml::to_string_pretty(&summary)?)?;
    written.push(summary_path);

    log::info!("Wrote {} report files to '{}'", written.len(), out_dir.display());
    Ok(written)
}
