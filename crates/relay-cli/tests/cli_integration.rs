//! Integration tests for the relay-cli commands.
//!
//! These exercise the same code paths as the binary: a real config file, a
//! temp-file SQLite database and a shell worker command.

use std::path::Path;

use relay_cli::commands::{self, workflow, GlobalOptions};
use relay_core::models::InstanceStatus;
use relay_core::workflow::ResolutionContext;
use relay_core::StartOptions;
use tempfile::TempDir;

const OK_WORKER: &str = r#"cat > /dev/null; echo '{"status":"success","output":"ok"}'"#;

const PIPELINE: &str = r#"
id: pipeline
name: Pipeline
policy:
  max_retries: 1
steps:
  - kind: action
    id: plan
    agent: planner
    task: plan
    produces: plan
  - kind: phase
    id: build-phase
    label: Build
  - kind: action
    id: build
    agent: planner
    task: plan
    requires: [plan]
"#;

fn setup() -> TempDir {
    let dir = tempfile::tempdir().expect("tempdir");
    let root = dir.path();
    for sub in ["catalog/core/agents", "catalog/core/tasks", "workflows"] {
        std::fs::create_dir_all(root.join(sub)).unwrap();
    }
    std::fs::write(root.join("catalog/core/agents/planner.md"), "Plans work.\n").unwrap();
    std::fs::write(root.join("catalog/core/tasks/plan.md"), "Make a plan.\n").unwrap();
    std::fs::write(root.join("workflows/pipeline.yaml"), PIPELINE).unwrap();
    std::fs::write(
        root.join("relay.yaml"),
        format!(
            "catalog_root: {}\nworkflow_dirs:\n  - {}\n",
            root.join("catalog").display(),
            root.join("workflows").display()
        ),
    )
    .unwrap();
    dir
}

fn options(root: &Path, worker: Option<&str>) -> GlobalOptions {
    GlobalOptions {
        db: root.join("relay.db").to_string_lossy().to_string(),
        config: Some(root.join("relay.yaml").to_string_lossy().to_string()),
        worker_cmd: worker.map(String::from),
        worker_url: None,
    }
}

fn error_kind(rendered: &str) -> String {
    let value: serde_json::Value = serde_json::from_str(rendered).expect("error is JSON");
    value["error"]["kind"].as_str().unwrap_or_default().to_string()
}

fn start_opts(instance_id: &str) -> StartOptions {
    StartOptions {
        workflow: "pipeline".into(),
        instance_id: Some(instance_id.into()),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_start_continue_and_status_with_shell_worker() {
    let dir = setup();
    let opts = options(dir.path(), Some(OK_WORKER));
    let engine = commands::init_engine(&opts, true).unwrap();

    workflow::start(&engine, &start_opts("p-1")).await.unwrap();
    let report = engine.status("p-1").await.unwrap();
    assert_eq!(report.status, InstanceStatus::Active);
    assert_eq!(report.current_step_id.as_deref(), Some("build"));
    assert_eq!(report.step_outputs["plan"], "ok");

    workflow::continue_instance(&engine, "p-1", None).await.unwrap();
    workflow::status(&engine, "p-1").await.unwrap();
    assert_eq!(engine.status("p-1").await.unwrap().status, InstanceStatus::Completed);

    workflow::checkpoints(&engine, "p-1").await.unwrap();
    workflow::list(&engine, Some("pipeline"), Some("completed")).await.unwrap();
}

#[tokio::test]
async fn test_failed_instance_exits_with_report() {
    let dir = setup();
    let opts = options(dir.path(), Some("cat > /dev/null; echo boom >&2; exit 2"));
    let engine = commands::init_engine(&opts, true).unwrap();

    let rendered = workflow::start(&engine, &start_opts("p-2")).await.unwrap_err();
    let value: serde_json::Value = serde_json::from_str(&rendered).unwrap();
    assert_eq!(value["status"], "failed");
    assert_eq!(value["lastError"]["kind"], "worker_failure");
    assert_eq!(value["retryCount"], 1);
}

#[tokio::test]
async fn test_errors_render_as_json_objects() {
    let dir = setup();
    let opts = options(dir.path(), None);
    let engine = commands::init_engine(&opts, false).unwrap();

    let err = workflow::status(&engine, "nope").await.unwrap_err();
    assert_eq!(error_kind(&err), "not_found");

    let err = workflow::list(&engine, None, Some("sleeping")).await.unwrap_err();
    assert_eq!(error_kind(&err), "usage");

    let err = workflow::context("group", None).unwrap_err();
    assert_eq!(error_kind(&err), "definition");

    // Dispatching commands refuse to run without a worker
    let err = commands::init_engine(&opts, true).err().unwrap();
    assert_eq!(error_kind(&err), "usage");

    let missing = GlobalOptions {
        config: Some(dir.path().join("absent.yaml").to_string_lossy().to_string()),
        ..opts
    };
    let err = commands::init_engine(&missing, false).err().unwrap();
    assert_eq!(error_kind(&err), "not_found");
}

#[tokio::test]
async fn test_validate_reports_definition_errors() {
    let dir = setup();
    std::fs::write(
        dir.path().join("workflows/broken.yaml"),
        "id: broken\nname: Broken\nsteps:\n  - kind: action\n    id: a\n    agent: ghost\n    task: plan\n",
    )
    .unwrap();
    let engine = commands::init_engine(&options(dir.path(), None), false).unwrap();

    workflow::validate(&engine, "pipeline", ResolutionContext::Core, false).unwrap();

    let err = workflow::validate(&engine, "broken", ResolutionContext::Core, false).unwrap_err();
    let value: serde_json::Value = serde_json::from_str(&err).unwrap();
    assert_eq!(value["error"]["kind"], "definition");
    assert!(value["error"]["errors"]
        .as_array()
        .unwrap()
        .iter()
        .any(|e| e.as_str().unwrap().contains("ghost")));
}

#[tokio::test]
async fn test_skip_and_abort_without_worker() {
    let dir = setup();
    let engine = commands::init_engine(&options(dir.path(), Some(OK_WORKER)), true).unwrap();
    workflow::start(&engine, &start_opts("p-3")).await.unwrap();

    // A second process without a worker can still steer the instance
    let control = commands::init_engine(&options(dir.path(), None), false).unwrap();
    workflow::abort(&control, "p-3").await.unwrap();
    let err = workflow::skip(&control, "p-3", None, None).await.unwrap_err();
    assert_eq!(error_kind(&err), "invalid_state");
}
