//! Step dispatcher: turns an action step plus instance state into the
//! request handed to a worker.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::EngineError;
use crate::models::{ExecutionInstance, StepFailure};
use crate::workflow::catalog::{Catalog, CatalogEntry};
use crate::workflow::schema::ActionStep;

/// Appended to retries after a malformed response.
pub const FORMAT_REMINDER: &str = "Respond with exactly one JSON object of the form \
{\"status\": \"success\" | \"failure\", \"output\": <value>, \"error\": {\"message\": <string>}}. \
A success for a step that produces an output must include \"output\".";

/// The unit of work handed to a [`WorkerRunner`](super::worker::WorkerRunner).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DispatchRequest {
    pub instance_id: String,
    pub step_id: String,
    pub resolved_agent: CatalogEntry,
    pub resolved_task: CatalogEntry,
    /// Required outputs keyed by name, plus `retry_context` on retries
    pub input_payload: Value,
    /// 1-based attempt number of this dispatch
    pub attempt: u32,
}

/// Why the previous attempt failed, carried into the next payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryContext {
    pub attempt: u32,
    pub previous_error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format_reminder: Option<String>,
}

impl RetryContext {
    pub fn from_failure(failure: &StepFailure) -> Self {
        let format_reminder = (failure.kind == crate::models::FailureKind::MalformedResponse)
            .then(|| FORMAT_REMINDER.to_string());
        Self {
            attempt: failure.attempts,
            previous_error: failure.message.clone(),
            format_reminder,
        }
    }
}

/// Project `stepOutputs` onto the step's `requires` keys.
pub fn build_payload(
    instance: &ExecutionInstance,
    step: &ActionStep,
    retry: Option<&RetryContext>,
) -> Result<Value, EngineError> {
    let mut payload = Map::new();
    for key in &step.requires {
        let value = instance
            .step_outputs
            .get(key)
            .ok_or_else(|| EngineError::MissingOutput {
                step_id: step.id.clone(),
                key: key.clone(),
            })?;
        payload.insert(key.clone(), value.clone());
    }
    if let Some(retry) = retry {
        let retry = serde_json::to_value(retry)
            .map_err(|e| EngineError::InvalidState(format!("Unencodable retry context: {}", e)))?;
        payload.insert("retry_context".to_string(), retry);
    }
    Ok(Value::Object(payload))
}

/// Resolve the step's agent and task and build its request.
///
/// Pure read: the instance is not modified and `attempt` is the number the
/// caller is about to record.
pub fn dispatch(
    instance: &ExecutionInstance,
    step: &ActionStep,
    catalog: &Catalog,
    retry: Option<&RetryContext>,
    attempt: u32,
) -> Result<DispatchRequest, EngineError> {
    let resolved_agent = catalog.resolve_agent(&step.agent).cloned().ok_or_else(|| {
        EngineError::NotFound(format!("agent '{}' referenced by step '{}'", step.agent, step.id))
    })?;
    let resolved_task = catalog.resolve_task(&step.task).cloned().ok_or_else(|| {
        EngineError::NotFound(format!("task '{}' referenced by step '{}'", step.task, step.id))
    })?;
    let input_payload = build_payload(instance, step, retry)?;

    Ok(DispatchRequest {
        instance_id: instance.instance_id.clone(),
        step_id: step.id.clone(),
        resolved_agent,
        resolved_task,
        input_payload,
        attempt,
    })
}
