//! Run-context resolution.

use sjs_core::{LaunchStamp, RunContext, SjsError, RUNNING_MARKER};
use tempfile::TempDir;

fn stamp() -> LaunchStamp {
    LaunchStamp {
        host: "n042".into(),
        timestamp: "2024_03_07__09_05_01".into(),
    }
}

#[test]
fn missing_marker_is_run_not_found() {
    let dir = TempDir::new().unwrap();
    let err = RunContext::resolve(dir.path(), &stamp()).unwrap_err();
    assert!(matches!(err, SjsError::RunNotFound { .. }));
    assert!(err.to_string().contains(RUNNING_MARKER));
}

#[test]
fn empty_marker_uses_marker_directory() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join(RUNNING_MARKER), "\n").unwrap();

    let ctx = RunContext::resolve(dir.path(), &stamp()).unwrap();
    assert_eq!(ctx.working_dir, dir.path());
    assert_eq!(ctx.host, "n042");
}

#[test]
fn marker_content_names_working_dir() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join(RUNNING_MARKER), "run-7\n").unwrap();

    let ctx = RunContext::resolve(dir.path(), &stamp()).unwrap();
    assert_eq!(ctx.working_dir, dir.path().join("run-7"));
    assert_eq!(
        ctx.env_record_path(),
        dir.path()
            .join("run-7/env_records/n042_2024_03_07__09_05_01.yaml")
    );
    assert_eq!(
        ctx.reference_env_record_path(),
        dir.path().join("run-7/env_records/env_record_start.yaml")
    );
}

#[test]
fn absolute_marker_content_wins() {
    let dir = TempDir::new().unwrap();
    let elsewhere = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join(RUNNING_MARKER),
        elsewhere.path().display().to_string(),
    )
    .unwrap();

    let ctx = RunContext::resolve(dir.path(), &stamp()).unwrap();
    assert_eq!(ctx.working_dir, elsewhere.path());
}
