use std::fs;
use std::process::Command;

use tempfile::tempdir;

const STUDIES: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/data/iron_studies.csv");

#[test]
fn analyze_writes_report_directory() {
    let tmp = tempdir().expect("temporary directory");
    let out_dir = tmp.path().join("results");

    let exe = env!("CARGO_BIN_EXE_ironmeta");
    let output = Command::new(exe)
        .args([
            "analyze",
            STUDIES,
            "--out-dir",
            out_dir.to_str().expect("path str"),
        ])
        .output()
        .expect("run ironmeta cli");

    assert!(output.status.success(), "CLI exited with {:?}", output.status);
    for name in [
        "ferritin_forest.tsv",
        "ferritin_curve.tsv",
        "vo2max_sensitivity.tsv",
        "summary.toml",
        "config.toml",
    ] {
        assert!(out_dir.join(name).exists(), "{name} missing");
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("ferritin: pooled SMD"), "{stdout}");
}

#[test]
fn invalid_knot_count_exits_with_error() {
    let exe = env!("CARGO_BIN_EXE_ironmeta");
    let output = Command::new(exe)
        .args(["regress", STUDIES, "--outcome", "vo2max", "--knots", "10"])
        .output()
        .expect("run ironmeta cli");

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Error:"), "{stderr}");
    assert!(stderr.contains("Invalid knot count 10"), "{stderr}");
}

#[test]
fn strict_pairing_rejects_half_missing_vo2max() {
    let tmp = tempdir().expect("temporary directory");
    let path = tmp.path().join("studies.csv");
    let data = "id,ferritin_effect_size_smd,ferritin_std_error_smd,vo2max_effect_size,vo2max_std_error,initial_ferritin_ng_ml\n\
A,1.5,0.4,0.8,0.3,12.0\n\
B,0.9,0.35,0.4,,25.0\n\
C,0.2,0.3,-0.1,0.32,40.0\n";
    fs::write(&path, data).expect("write study table");

    let exe = env!("CARGO_BIN_EXE_ironmeta");
    let path_str = path.to_str().expect("path str");

    let flagged = Command::new(exe)
        .args(["pool", path_str, "--outcome", "ferritin"])
        .output()
        .expect("run ironmeta cli");
    assert!(flagged.status.success());
    assert!(String::from_utf8_lossy(&flagged.stdout).contains("Flagged study 'B'"));

    let strict = Command::new(exe)
        .args(["pool", path_str, "--strict-pairing"])
        .output()
        .expect("run ironmeta cli");
    assert!(!strict.status.success());
    assert!(String::from_utf8_lossy(&strict.stderr).contains("Malformed record at data row 2"));
}
