use assert_cmd::Command;
use predicates::prelude::*;
use std::path::PathBuf;
use tempfile::TempDir;

fn filestate(db: &PathBuf) -> Command {
    let mut cmd = Command::cargo_bin("filestate").unwrap();
    cmd.env("FILESTATE_DB", db).env_remove("RUST_LOG");
    cmd
}

fn temp_db() -> (TempDir, PathBuf) {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("state.db");
    (dir, db)
}

#[test]
fn test_modules_lists_reference_modules() {
    let (_dir, db) = temp_db();
    filestate(&db)
        .arg("modules")
        .assert()
        .success()
        .stdout(predicate::str::contains("plot"))
        .stdout(predicate::str::contains("analysis"))
        .stdout(predicate::str::contains("annotations"));
}

#[test]
fn test_set_then_show_round_trip() {
    let (_dir, db) = temp_db();
    filestate(&db)
        .args([
            "set",
            "/data/rec1.edf",
            "plot",
            r#"{"chunkStart":0,"chunkSize":4096,"selectedChannels":["C3","C4"],"zoom":2.0,"amplitude":1.0}"#,
        ])
        .assert()
        .success();

    let output = filestate(&db)
        .args(["show", "/data/rec1.edf", "--json"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let state: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(state["modules"]["plot"]["chunkSize"], 4096);
    assert_eq!(state["modules"]["plot"]["selectedChannels"][1], "C4");
    assert_eq!(state["metadata"]["accessCount"], 1);
    assert!(state["modules"]["annotations"].is_object());
}

#[test]
fn test_files_lists_tracked_paths() {
    let (_dir, db) = temp_db();
    filestate(&db)
        .args(["set", "/data/a.edf", "analysis", r#"{"selectedVariants":["single_timeseries"]}"#])
        .assert()
        .success();
    filestate(&db)
        .args(["show", "/data/b.edf"])
        .assert()
        .success();

    let output = filestate(&db).args(["files", "--json"]).output().unwrap();
    let rows: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let paths: Vec<&str> = rows
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["path"].as_str().unwrap())
        .collect();
    assert_eq!(paths, vec!["/data/a.edf", "/data/b.edf"]);
}

#[test]
fn test_unknown_module_is_rejected() {
    let (_dir, db) = temp_db();
    filestate(&db)
        .args(["set", "/data/rec1.edf", "unknown_module", "{}"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown module"));
}

#[test]
fn test_invalid_state_is_rejected() {
    let (_dir, db) = temp_db();
    filestate(&db)
        .args([
            "set",
            "/data/rec1.edf",
            "plot",
            r#"{"chunkStart":0,"chunkSize":0,"selectedChannels":[],"zoom":1.0,"amplitude":1.0}"#,
        ])
        .assert()
        .failure();
    filestate(&db)
        .args(["set", "/data/rec1.edf", "plot", "not json"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("valid JSON"));
}

#[test]
fn test_clear_removes_file() {
    let (_dir, db) = temp_db();
    filestate(&db)
        .args(["show", "/data/rec1.edf"])
        .assert()
        .success();
    filestate(&db)
        .args(["clear", "/data/rec1.edf"])
        .assert()
        .success();
    filestate(&db)
        .arg("files")
        .assert()
        .success()
        .stdout(predicate::str::contains("/data/rec1.edf").not());
}
