use approx::assert_abs_diff_eq;
use ironmeta::basis::BasisError;
use ironmeta::data::{Outcome, PairingPolicy, StudyTable, load_study_table};
use ironmeta::estimate::{EstimationError, RemlOptions, fit_random_effects, fit_spline_meta_regression};
use ironmeta::model::AnalysisConfig;
use ironmeta::pipeline::{analyze_all, analyze_outcome};
use ironmeta::predict::evaluation_grid;
use ironmeta::report::write_report;
use ironmeta::sensitivity::sweep_knots;
use tempfile::tempdir;

const STUDIES: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/data/iron_studies.csv");

fn studies() -> StudyTable {
    load_study_table(STUDIES, PairingPolicy::Flag).expect("bundled study table loads")
}

#[test]
fn bundled_table_has_thirteen_studies_and_ten_with_vo2max() {
    let table = studies();
    assert_eq!(table.len(), 13);
    assert!(table.flagged().is_empty());
    assert_eq!(table.outcome_data(Outcome::Ferritin).len(), 13);

    let vo2max = table.outcome_data(Outcome::Vo2max);
    assert_eq!(vo2max.len(), 10);
    assert!(!vo2max.ids.iter().any(|id| id == "S02" || id == "S05" || id == "S09"));
}

#[test]
fn pooled_ferritin_effect_is_positive_and_significant() {
    let data = studies().outcome_data(Outcome::Ferritin);
    let fit = fit_random_effects(data.yi.view(), data.sei.view(), None, &RemlOptions::default())
        .unwrap();
    let pooled = fit.pooled();

    assert_abs_diff_eq!(pooled.estimate, 1.27, epsilon = 0.01);
    assert!(pooled.ci_lower > 0.0, "CI {:?}", (pooled.ci_lower, pooled.ci_upper));
    assert!(pooled.p_value < 0.001);
    assert!(fit.tau2 > 0.0);
    assert!(!fit.tau2_truncated);
    assert!(fit.heterogeneity.i2 > 75.0);
}

#[test]
fn pooled_vo2max_effect_interval_includes_zero() {
    let data = studies().outcome_data(Outcome::Vo2max);
    assert_eq!(data.len(), 10);
    let fit = fit_random_effects(data.yi.view(), data.sei.view(), None, &RemlOptions::default())
        .unwrap();
    let pooled = fit.pooled();

    assert_abs_diff_eq!(pooled.estimate, 0.49, epsilon = 0.01);
    assert!(pooled.ci_lower < 0.0 && pooled.ci_upper > 0.0);
    assert_eq!(fit.heterogeneity.df, 9);
}

#[test]
fn ferritin_spline_with_four_knots_detects_moderation() {
    let data = studies().outcome_data(Outcome::Ferritin);
    let model = fit_spline_meta_regression(&data, 4, &RemlOptions::default()).unwrap();
    let test = model.fit.omnibus.expect("moderators give an omnibus test");

    assert_eq!(test.df, 3);
    assert!(test.p_value < 0.001, "QMp = {}", test.p_value);
    // The moderator explains much of the heterogeneity.
    let pooled = fit_random_effects(data.yi.view(), data.sei.view(), None, &RemlOptions::default())
        .unwrap();
    assert!(model.fit.tau2 < pooled.tau2);
}

#[test]
fn vo2max_spline_with_three_knots_detects_moderation() {
    let data = studies().outcome_data(Outcome::Vo2max);
    let model = fit_spline_meta_regression(&data, 3, &RemlOptions::default()).unwrap();
    let test = model.fit.omnibus.expect("moderators give an omnibus test");

    assert_eq!(test.df, 2);
    assert!(test.p_value < 0.05, "QMp = {}", test.p_value);
    // The spline absorbs all between-study variance here.
    assert_eq!(model.fit.tau2, 0.0);
    assert!(model.fit.tau2_truncated);
}

#[test]
fn predicted_ferritin_effect_declines_with_initial_ferritin() {
    let data = studies().outcome_data(Outcome::Ferritin);
    let model = fit_spline_meta_regression(&data, 4, &RemlOptions::default()).unwrap();
    let curve = model.predict(evaluation_grid(11.0, 62.0, 2).view()).unwrap();
    assert!(curve.points[0].estimate > curve.points[1].estimate);
    assert!(curve.points[0].ci_lower > 0.0);
}

#[test]
fn knot_count_bounds_follow_distinct_moderator_values() {
    let table = studies();
    let options = RemlOptions::default();

    let ferritin = table.outcome_data(Outcome::Ferritin);
    for k in [2, 13] {
        let err = fit_spline_meta_regression(&ferritin, k, &options).unwrap_err();
        assert!(
            matches!(
                err,
                EstimationError::Basis(BasisError::InvalidKnotCount { min: 3, max: 12, .. })
            ),
            "K = {k}: {err:?}"
        );
    }

    let vo2max = table.outcome_data(Outcome::Vo2max);
    let err = fit_spline_meta_regression(&vo2max, 10, &options).unwrap_err();
    assert!(matches!(
        err,
        EstimationError::Basis(BasisError::InvalidKnotCount { requested: 10, max: 9, .. })
    ));
}

#[test]
fn sweep_reports_every_requested_knot_count() {
    let data = studies().outcome_data(Outcome::Ferritin);
    let report = sweep_knots(&data, &[3, 4, 5, 6], 50, &RemlOptions::default());
    assert_eq!(report.len(), 4);
    assert_eq!(report.failures().count(), 0);
    for (k, curve) in report.curves() {
        assert_eq!(curve.num_knots, k);
        assert_eq!(curve.len(), 50);
    }
}

#[test]
fn full_analysis_writes_every_report_file() {
    let table = studies();
    let config = AnalysisConfig {
        subgroup_threshold: Some(20.0),
        ..AnalysisConfig::default()
    };
    let reports = analyze_all(&table, &config).unwrap();
    assert_eq!(reports.len(), 2);
    assert_eq!(reports[0].outcome, Outcome::Ferritin);
    assert_eq!(reports[1].num_studies(), 10);

    let dir = tempdir().unwrap();
    write_report(&reports, table.flagged(), dir.path()).unwrap();
    for outcome in ["ferritin", "vo2max"] {
        for table in ["forest", "bubble", "curve", "sensitivity"] {
            let path = dir.path().join(format!("{outcome}_{table}.tsv"));
            assert!(path.exists(), "{} missing", path.display());
        }
    }
    let summary = std::fs::read_to_string(dir.path().join("summary.toml")).unwrap();
    assert!(summary.contains("outcome = \"vo2max\""));
}

#[test]
fn subgroup_analysis_splits_low_and_high_ferritin() {
    let table = studies();
    let config = AnalysisConfig {
        subgroup_threshold: Some(20.0),
        ..AnalysisConfig::default()
    };
    let report = analyze_outcome(&table, Outcome::Ferritin, &config).unwrap();
    let subgroups = report.subgroups.expect("threshold configured");
    assert_eq!(subgroups.below.ids.len(), 5);
    assert_eq!(subgroups.at_or_above.ids.len(), 8);
    assert!(subgroups.below.fit.pooled().estimate > subgroups.at_or_above.fit.pooled().estimate);
    assert_eq!(subgroups.difference.df, 1);
}
