//! Smoke tests -- verify the binary runs and the subcommands wire up.

use assert_cmd::Command;
use predicates::prelude::*;

fn sensorguard() -> Command {
    let mut cmd = Command::cargo_bin("sensorguard").unwrap();
    cmd.env_remove("SENSORGUARD_CONFIG").env_remove("RUST_LOG");
    cmd
}

#[test]
fn test_cli_help() {
    sensorguard()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Unsupervised anomaly detection"));
}

#[test]
fn test_cli_version() {
    sensorguard()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("sensorguard"));
}

#[test]
fn test_subcommands_exist() {
    for sub in ["init-db", "simulate", "detect", "watch", "anomalies", "runs"] {
        sensorguard().args([sub, "--help"]).assert().success();
    }
}

#[test]
fn test_bad_contamination_is_rejected() {
    let dir = tempfile::TempDir::new().unwrap();
    let db = dir.path().join("s.db");
    sensorguard()
        .arg("--db")
        .arg(&db)
        .args(["detect", "--contamination", "0.9"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("contamination"));
}

#[test]
fn test_simulate_detect_list() {
    let dir = tempfile::TempDir::new().unwrap();
    let db = dir.path().join("s.db");

    sensorguard().arg("--db").arg(&db).arg("init-db").assert().success();

    sensorguard()
        .arg("--db")
        .arg(&db)
        .args(["simulate", "--history-hours", "2", "--seed", "5"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Wrote 144 readings"));

    let model = dir.path().join("model.json");
    sensorguard()
        .arg("--db")
        .arg(&db)
        .args(["detect", "--json", "--save-model"])
        .arg(&model)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"run_id\"").and(predicate::str::contains("\"total\": 144")));
    assert!(model.exists());

    sensorguard()
        .arg("--db")
        .arg(&db)
        .args(["detect", "--json", "--model"])
        .arg(&model)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"total\": 144"));

    sensorguard()
        .arg("--db")
        .arg(&db)
        .args(["anomalies", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::starts_with("["));

    sensorguard()
        .arg("--db")
        .arg(&db)
        .arg("runs")
        .assert()
        .success()
        .stdout(predicate::str::contains("Run"));
}

#[test]
fn test_broken_model_file_is_rejected() {
    let dir = tempfile::TempDir::new().unwrap();
    let db = dir.path().join("s.db");
    let model = dir.path().join("model.json");
    std::fs::write(&model, r#"{"created_at":"2026-01-01T00:00:00Z","scaling":{},"model":{}}"#).unwrap();

    sensorguard()
        .arg("--db")
        .arg(&db)
        .args(["detect", "--model"])
        .arg(&model)
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to load model"));
}
