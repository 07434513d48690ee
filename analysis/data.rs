//! # Study Table Loading and Validation
//!
//! This module is the exclusive entry point for the study-level data. It reads the
//! CSV table of published studies, enforces the record invariants the estimator
//! relies on, and exposes per-outcome `ndarray` views for the statistical core.
//!
//! - Fixed Schema: Column names are not configurable. The header must contain `id`,
//!   `ferritin_effect_size_smd`, `ferritin_std_error_smd`, `vo2max_effect_size`,
//!   `vo2max_std_error` and `initial_ferritin_ng_ml`.
//! - Paired Outcomes: The VO2max effect and its standard error are either both
//!   present or both empty. A row that breaks the pairing is flagged and excluded
//!   from VO2max analyses, or rejected outright when strict pairing is requested.
//! - Immutable Table: A `StudyTable` is loaded once and only ever read afterwards.

use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use thiserror::Error;

/// One published study.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudyRecord {
    pub id: String,
    pub ferritin_effect_size_smd: f64,
    pub ferritin_std_error_smd: f64,
    pub vo2max_effect_size: Option<f64>,
    pub vo2max_std_error: Option<f64>,
    pub initial_ferritin_ng_ml: f64,
}

/// The outcome an analysis branch is run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Ferritin,
    Vo2max,
}

impl Outcome {
    pub const ALL: [Outcome; 2] = [Outcome::Ferritin, Outcome::Vo2max];

    /// Short label used in file names and log lines.
    pub fn label(self) -> &'static str {
        match self {
            Outcome::Ferritin => "ferritin",
            Outcome::Vo2max => "vo2max",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Per-outcome arrays handed to the estimator, in table order.
#[derive(Debug, Clone)]
pub struct OutcomeData {
    pub outcome: Outcome,
    pub ids: Vec<String>,
    /// Effect sizes `y_i`.
    pub yi: Array1<f64>,
    /// Standard errors `s_i`.
    pub sei: Array1<f64>,
    /// Initial serum ferritin (ng/mL) of each study.
    pub moderator: Array1<f64>,
}

impl OutcomeData {
    pub fn len(&self) -> usize {
        self.yi.len()
    }

    pub fn is_empty(&self) -> bool {
        self.yi.is_empty()
    }
}

/// Ordered, immutable collection of studies with unique ids.
#[derive(Debug, Clone)]
pub struct StudyTable {
    records: Vec<StudyRecord>,
    flagged: Vec<String>,
}

/// A comprehensive error type for all data loading and validation failures.
#[derive(Error, Debug)]
pub enum DataError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse the study CSV: {0}")]
    Csv(#[from] csv::Error),

    #[error("Malformed record at data row {row} (study '{id}'): {reason}")]
    MalformedRecord {
        row: usize,
        id: String,
        reason: String,
    },

    #[error("Study id '{0}' appears more than once. Study ids must be unique.")]
    DuplicateId(String),

    #[error("The study table contains no data rows.")]
    Empty,
}

/// Controls how a row with exactly one VO2max column present is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingPolicy {
    /// Keep the row for ferritin analyses, drop its VO2max pair and record the id.
    Flag,
    /// Fail the load with `DataError::MalformedRecord`.
    Strict,
}

impl StudyTable {
    /// Builds a table from already-parsed records, enforcing every record invariant.
    pub fn from_records(
        records: Vec<StudyRecord>,
        policy: PairingPolicy,
    ) -> Result<Self, DataError> {
        if records.is_empty() {
            return Err(DataError::Empty);
        }

        let mut seen = HashSet::with_capacity(records.len());
        let mut flagged = Vec::new();
        let mut accepted = Vec::with_capacity(records.len());

        for (index, mut record) in records.into_iter().enumerate() {
            let row = index + 1;
            if !seen.insert(record.id.clone()) {
                return Err(DataError::DuplicateId(record.id));
            }
            internal::validate_required(&record, row)?;

            match (record.vo2max_effect_size, record.vo2max_std_error) {
                (Some(effect), Some(se)) => {
                    internal::validate_pair(&record.id, row, effect, se)?;
                }
                (None, None) => {}
                _ => {
                    let reason =
                        "exactly one of vo2max_effect_size / vo2max_std_error is missing";
                    match policy {
                        PairingPolicy::Strict => {
                            return Err(DataError::MalformedRecord {
                                row,
                                id: record.id,
                                reason: reason.to_string(),
                            });
                        }
                        PairingPolicy::Flag => {
                            log::warn!(
                                "Study '{}' (row {row}): {reason}; excluded from VO2max analyses.",
                                record.id
                            );
                            record.vo2max_effect_size = None;
                            record.vo2max_std_error = None;
                            flagged.push(record.id.clone());
                        }
                    }
                }
            }
            accepted.push(record);
        }

        Ok(Self {
            records: accepted,
            flagged,
        })
    }

    pub fn records(&self) -> &[StudyRecord] {
        &self.records
    }

    /// Ids of rows whose VO2max pair was malformed and dropped.
    pub fn flagged(&self) -> &[String] {
        &self.flagged
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Extracts the studies that report `outcome`, preserving table order.
    pub fn outcome_data(&self, outcome: Outcome) -> OutcomeData {
        let rows: Vec<(&StudyRecord, f64, f64)> = self
            .records
            .iter()
            .filter_map(|record| match outcome {
                Outcome::Ferritin => Some((
                    record,
                    record.ferritin_effect_size_smd,
                    record.ferritin_std_error_smd,
                )),
                Outcome::Vo2max => match (record.vo2max_effect_size, record.vo2max_std_error) {
                    (Some(effect), Some(se)) => Some((record, effect, se)),
                    _ => None,
                },
            })
            .collect();

        OutcomeData {
            outcome,
            ids: rows.iter().map(|(record, _, _)| record.id.clone()).collect(),
            yi: rows.iter().map(|&(_, effect, _)| effect).collect(),
            sei: rows.iter().map(|&(_, _, se)| se).collect(),
            moderator: rows
                .iter()
                .map(|(record, _, _)| record.initial_ferritin_ng_ml)
                .collect(),
        }
    }
}

/// Loads and validates the study table from a CSV file.
pub fn load_study_table(
    path: impl AsRef<Path>,
    policy: PairingPolicy,
) -> Result<StudyTable, DataError> {
    let path = path.as_ref();
    log::info!("Loading study table from '{}'", path.display());

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(path)?;
    let records = reader
        .deserialize::<StudyRecord>()
        .collect::<Result<Vec<_>, _>>()?;

    let table = StudyTable::from_records(records, policy)?;
    log::info!(
        "Loaded {} studies ({} with VO2max, {} flagged)",
        table.len(),
        table.outcome_data(Outcome::Vo2max).len(),
        table.flagged().len()
    );
    Ok(table)
}

/// Internal module for record-level checks.
mod internal {
    use super::*;

    fn malformed(id: &str, row: usize, reason: String) -> DataError {
        DataError::MalformedRecord {
            row,
            id: id.to_string(),
            reason,
        }
    }

    fn check_standard_error(id: &str, row: usize, column: &str, se: f64) -> Result<(), DataError> {
        if !se.is_finite() || se <= 0.0 {
            return Err(malformed(
                id,
                row,
                format!("{column} must be a finite, strictly positive number (found {se})"),
            ));
        }
        Ok(())
    }

    fn check_finite(id: &str, row: usize, column: &str, value: f64) -> Result<(), DataError> {
        if !value.is_finite() {
            return Err(malformed(
                id,
                row,
                format!("{column} must be finite (found {value})"),
            ));
        }
        Ok(())
    }

    pub(super) fn validate_required(record: &StudyRecord, row: usize) -> Result<(), DataError> {
        if record.id.is_empty() {
            return Err(malformed(&record.id, row, "empty study id".to_string()));
        }
        check_finite(
            &record.id,
            row,
            "ferritin_effect_size_smd",
            record.ferritin_effect_size_smd,
        )?;
        check_standard_error(
            &record.id,
            row,
            "ferritin_std_error_smd",
            record.ferritin_std_error_smd,
        )?;
        check_finite(
            &record.id,
            row,
            "initial_ferritin_ng_ml",
            record.initial_ferritin_ng_ml,
        )
    }

    pub(super) fn validate_pair(id: &str, row: usize, effect: f64, se: f64) -> Result<(), DataError> {
        check_finite(id, row, "vo2max_effect_size", effect)?;
        check_standard_error(id, row, "vo2max_std_error", se)
    }
}
