//! Integration tests for the run and check commands.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::io::Write;

use lockstep::{
    commands::run::{run_config, PipelineStatus},
    config::Config,
    Error,
};
use tempfile::NamedTempFile;

fn write_config(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

fn statuses(reports: &[lockstep::commands::run::PipelineReport]) -> Vec<(String, PipelineStatus)> {
    reports
        .iter()
        .map(|r| (r.pipeline.clone(), r.status))
        .collect()
}

#[test]
fn test_load_reads_file() {
    let file = write_config(
        r#"
[[pipelines]]
name = "p"
hold_ms = 1
lock = { resource = "db1" }
"#,
    );
    let config = Config::load(file.path()).unwrap();
    assert_eq!(config.pipelines[0].name, "p");
}

#[test]
fn test_load_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let result = Config::load(&dir.path().join("absent.toml"));
    assert!(matches!(result, Err(Error::Read { .. })));
}

#[test]
fn test_load_malformed_toml() {
    let file = write_config("[[pipelines]\nname = ");
    assert!(matches!(Config::load(file.path()), Err(Error::Parse(_))));
}

#[tokio::test]
async fn test_contending_pipelines_both_succeed() {
    let config = Config::parse(
        r#"
[[resources]]
name = "db1"

[[pipelines]]
name = "first"
hold_ms = 30
lock = { resource = "db1" }

[[pipelines]]
name = "second"
hold_ms = 1
lock = { resource = "db1" }
"#,
    )
    .unwrap();

    let reports = run_config(&config).await.unwrap();
    assert_eq!(
        statuses(&reports),
        vec![
            ("first".to_string(), PipelineStatus::Succeeded),
            ("second".to_string(), PipelineStatus::Succeeded),
        ]
    );
}

#[tokio::test]
async fn test_skip_if_locked_reports_skipped() {
    let config = Config::parse(
        r#"
[[pipelines]]
name = "holder"
hold_ms = 50
lock = { resource = "db1" }

[[pipelines]]
name = "skipper"
hold_ms = 1
lock = { resource = "db1", skip_if_locked = true }
"#,
    )
    .unwrap();

    let reports = run_config(&config).await.unwrap();
    assert_eq!(reports[0].status, PipelineStatus::Succeeded);
    assert_eq!(reports[1].status, PipelineStatus::Skipped);
}

#[cfg(unix)]
#[tokio::test]
async fn test_command_sees_lock_variable_and_env() {
    let config = Config::parse(
        r#"
[[resources]]
name = "n1"
labels = ["node"]

[[resources]]
name = "n2"
labels = ["node"]

[[pipelines]]
name = "build"
command = "printf '%s/%s' \"$NODES\" \"$MODE\""
env = { MODE = "fast" }
lock = { label = "node", quantity = 2, variable = "NODES" }
"#,
    )
    .unwrap();

    let reports = run_config(&config).await.unwrap();
    assert_eq!(reports[0].status, PipelineStatus::Succeeded);
    assert_eq!(reports[0].output, Some(serde_json::json!("n1,n2/fast")));
}

#[cfg(unix)]
#[tokio::test]
async fn test_failing_command_reports_failure() {
    let config = Config::parse(
        r#"
[[pipelines]]
name = "broken"
command = "exit 1"
lock = { resource = "db1" }
"#,
    )
    .unwrap();

    let reports = run_config(&config).await.unwrap();
    assert_eq!(reports[0].status, PipelineStatus::Failed);
    assert!(reports[0].error.as_deref().unwrap().contains("exit"));
}

#[cfg(unix)]
#[tokio::test]
async fn test_no_release_exit_code_keeps_lock_and_succeeds() {
    let config = Config::parse(
        r#"
[[pipelines]]
name = "handover"
command = "exit 3"
no_release_exit_code = 3
lock = { resource = "db1" }

[[pipelines]]
name = "next"
hold_ms = 1
lock = { resource = "db1", skip_if_locked = true }
"#,
    )
    .unwrap();

    let reports = run_config(&config).await.unwrap();
    assert_eq!(reports[0].status, PipelineStatus::Succeeded);
    assert_eq!(reports[1].status, PipelineStatus::Skipped);
}

#[cfg(unix)]
#[tokio::test]
async fn test_timeout_fails_pipeline_and_frees_lock() {
    let config = Config::parse(
        r#"
[[pipelines]]
name = "slow"
command = "sleep 5"
timeout_secs = 1
lock = { resource = "db1" }

[[pipelines]]
name = "after"
hold_ms = 1
lock = { resource = "db1" }
"#,
    )
    .unwrap();

    let reports = run_config(&config).await.unwrap();
    assert_eq!(reports[0].status, PipelineStatus::Failed);
    assert!(reports[0].error.as_deref().unwrap().contains("timed out"));
    assert_eq!(reports[1].status, PipelineStatus::Succeeded);
}
