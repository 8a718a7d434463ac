//! `relay start|continue|status|skip|abort|run|validate|list|checkpoints`.

use relay_core::models::InstanceStatus;
use relay_core::workflow::ResolutionContext;
use relay_core::{ExecutionReport, StartOptions, WorkflowEngine};

use super::{engine_error, print_json, usage_error};

/// Parse `--target-context` / `--group` into a resolution context.
pub fn context(mode: &str, group: Option<String>) -> Result<ResolutionContext, String> {
    ResolutionContext::from_parts(mode, group).map_err(engine_error)
}

/// Print a report. A failed instance is printed as well but still makes the
/// process exit with status 1.
fn emit(report: &ExecutionReport) -> Result<(), String> {
    let value = serde_json::to_value(report).map_err(|e| usage_error(e.to_string()))?;
    if report.status == InstanceStatus::Failed {
        return Err(serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string()));
    }
    print_json(&value);
    Ok(())
}

pub async fn start(engine: &WorkflowEngine, opts: &StartOptions) -> Result<(), String> {
    let report = engine.start(opts).await.map_err(engine_error)?;
    emit(&report)
}

pub async fn run(engine: &WorkflowEngine, opts: &StartOptions) -> Result<(), String> {
    let report = engine.run_to_completion(opts).await.map_err(engine_error)?;
    emit(&report)
}

pub async fn continue_instance(
    engine: &WorkflowEngine,
    instance_id: &str,
    workflow: Option<&str>,
) -> Result<(), String> {
    let report = engine
        .continue_instance(instance_id, workflow)
        .await
        .map_err(engine_error)?;
    emit(&report)
}

pub async fn status(engine: &WorkflowEngine, instance_id: &str) -> Result<(), String> {
    let report = engine.status(instance_id).await.map_err(engine_error)?;
    emit(&report)
}

pub async fn skip(
    engine: &WorkflowEngine,
    instance_id: &str,
    target: Option<&str>,
    workflow: Option<&str>,
) -> Result<(), String> {
    let report = engine
        .skip(instance_id, target, workflow)
        .await
        .map_err(engine_error)?;
    emit(&report)
}

pub async fn abort(engine: &WorkflowEngine, instance_id: &str) -> Result<(), String> {
    let report = engine.abort(instance_id).await.map_err(engine_error)?;
    emit(&report)
}

/// Validate a workflow without creating an instance.
pub fn validate(
    engine: &WorkflowEngine,
    workflow: &str,
    context: ResolutionContext,
    strict: bool,
) -> Result<(), String> {
    let (loaded, report, catalog) = engine
        .validate(workflow, context, strict)
        .map_err(engine_error)?;
    let def = &loaded.definition;
    let steps: Vec<serde_json::Value> = def
        .steps
        .iter()
        .map(|s| serde_json::json!({ "id": s.id(), "kind": s.kind() }))
        .collect();
    let summary = serde_json::json!({
        "workflowId": def.id,
        "name": def.name,
        "version": def.version,
        "source": loaded.source.display().to_string(),
        "context": catalog.context(),
        "steps": steps,
        "valid": report.is_valid(),
        "errors": report.errors,
        "warnings": report.warnings,
    });

    if report.errors.is_empty() {
        print_json(&summary);
        Ok(())
    } else {
        Err(engine_error(relay_core::EngineError::Definition(report.errors)))
    }
}

/// Instances in the store plus the workflow definitions the loader can find.
pub async fn list(
    engine: &WorkflowEngine,
    workflow_id: Option<&str>,
    status: Option<&str>,
) -> Result<(), String> {
    let status = match status {
        None => None,
        Some(s @ ("active" | "completed" | "failed" | "timed_out" | "aborted")) => {
            Some(InstanceStatus::from_str(s))
        }
        Some(other) => return Err(usage_error(format!("unknown status '{}'", other))),
    };

    let instances = engine.list(workflow_id, status).await.map_err(engine_error)?;
    let instances: Vec<serde_json::Value> = instances
        .iter()
        .map(|i| {
            serde_json::json!({
                "instanceId": i.instance_id,
                "workflowId": i.workflow_id,
                "status": i.status,
                "currentStepId": i.current_step_id,
                "startedAt": i.started_at,
            })
        })
        .collect();
    let workflows: Vec<serde_json::Value> = engine
        .loader()
        .available()
        .into_iter()
        .map(|(name, path)| serde_json::json!({ "name": name, "path": path.display().to_string() }))
        .collect();

    print_json(&serde_json::json!({ "instances": instances, "workflows": workflows }));
    Ok(())
}

pub async fn checkpoints(engine: &WorkflowEngine, instance_id: &str) -> Result<(), String> {
    let checkpoints = engine.checkpoints(instance_id).await.map_err(engine_error)?;
    let rows: Vec<serde_json::Value> = checkpoints
        .iter()
        .map(|c| {
            serde_json::json!({
                "checkpointId": c.checkpoint_id,
                "stepId": c.step_id,
                "reason": c.reason,
                "createdAt": c.created_at,
                "currentStepId": c.snapshot.current_step_id,
                "status": c.snapshot.status,
            })
        })
        .collect();
    print_json(&serde_json::json!({ "instanceId": instance_id, "checkpoints": rows }));
    Ok(())
}
