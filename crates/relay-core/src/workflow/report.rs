//! JSON reports returned by every engine entry point.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{
    Decision, ExecutionInstance, InstanceStatus, StepFailure, StepState, VerificationResult,
};

/// Snapshot of an instance after an invocation.
///
/// `lastStepId` is the last step the engine processed; `retryCount` and
/// `lastError` are filled for failed and timed-out instances.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionReport {
    pub instance_id: String,
    pub workflow_id: String,
    pub status: InstanceStatus,
    pub current_step_id: Option<String>,
    pub last_step_id: Option<String>,
    pub step_outputs: serde_json::Map<String, serde_json::Value>,
    pub completed_steps: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skipped_steps: Vec<String>,
    pub decisions: Vec<Decision>,
    pub attempts: HashMap<String, u32>,
    pub step_states: HashMap<String, StepState>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub verifications: HashMap<String, VerificationResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<StepFailure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_checkpoint_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived_at: Option<DateTime<Utc>>,
    /// Validation warnings and other operator notes for this invocation
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl ExecutionReport {
    pub fn from_instance(instance: &ExecutionInstance) -> Self {
        let failed = matches!(instance.status, InstanceStatus::Failed | InstanceStatus::TimedOut);
        Self {
            instance_id: instance.instance_id.clone(),
            workflow_id: instance.workflow_id.clone(),
            status: instance.status,
            current_step_id: instance.current_step_id.clone(),
            last_step_id: instance.last_step_id.clone(),
            step_outputs: instance.step_outputs.clone(),
            completed_steps: instance.completed_steps.clone(),
            skipped_steps: instance.skipped_steps.clone(),
            decisions: instance.decisions.clone(),
            attempts: instance.attempts.clone(),
            step_states: instance.step_states.clone(),
            verifications: instance.verifications.clone(),
            last_error: if failed { instance.last_error.clone() } else { None },
            retry_count: if failed {
                instance.last_error.as_ref().map(|e| e.attempts)
            } else {
                None
            },
            started_at: instance.started_at,
            last_checkpoint_at: instance.last_checkpoint_at,
            archived_at: instance.archived_at,
            warnings: Vec::new(),
        }
    }

    pub fn with_warnings(mut self, warnings: Vec<String>) -> Self {
        self.warnings.extend(warnings);
        self
    }
}
