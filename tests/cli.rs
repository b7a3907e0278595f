//! CLI integration tests.

use assert_cmd::Command;
use predicates::prelude::*;

fn volley() -> Command {
    Command::cargo_bin("volley").unwrap()
}

#[test]
fn test_validate_accepts_good_config() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("volley.toml");
    std::fs::write(
        &config,
        r#"
        [dispatch]
        concurrency = 2

        [worker]
        launch = "worker-bin --slot {slot}"

        [suites]
        names = ["alpha"]

        [execution]
        type = "local"
        "#,
    )
    .unwrap();

    volley()
        .arg("--config")
        .arg(&config)
        .arg("validate")
        .assert()
        .success();
}

#[test]
fn test_validate_rejects_missing_config() {
    volley()
        .arg("--config")
        .arg("/nonexistent/volley.toml")
        .arg("validate")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to load config"));
}

#[test]
fn test_validate_rejects_bad_config() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("volley.toml");
    std::fs::write(&config, "this is not toml at all [").unwrap();

    volley()
        .arg("--config")
        .arg(&config)
        .arg("validate")
        .assert()
        .failure();
}

#[test]
fn test_init_writes_starter_config() {
    let dir = tempfile::tempdir().unwrap();

    volley()
        .current_dir(dir.path())
        .arg("init")
        .arg("--execution")
        .arg("local")
        .assert()
        .success()
        .stdout(predicate::str::contains("Created volley.toml"));

    let written = std::fs::read_to_string(dir.path().join("volley.toml")).unwrap();
    assert!(written.contains("[dispatch]"));
    assert!(written.contains("{slot}"));

    // The starter config must itself validate.
    volley()
        .current_dir(dir.path())
        .arg("validate")
        .assert()
        .success();
}

#[test]
fn test_init_refuses_to_overwrite() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("volley.toml"), "# existing").unwrap();

    volley()
        .current_dir(dir.path())
        .arg("init")
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));
}
