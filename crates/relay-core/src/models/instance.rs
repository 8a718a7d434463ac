use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::verification::VerificationResult;
use crate::workflow::catalog::ResolutionContext;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Active,
    Completed,
    Failed,
    TimedOut,
    Aborted,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Aborted => "aborted",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "timed_out" => Self::TimedOut,
            "aborted" => Self::Aborted,
            _ => Self::Active,
        }
    }

    /// Terminal instances are archived and never dispatched again.
    /// `timed_out` is a suspension and stays resumable.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Aborted)
    }
}

/// Per-step recovery state machine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Pending,
    Running,
    Succeeded,
    FailedRetrying,
    FailedFinal,
    Skipped,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    WorkerFailure,
    MalformedResponse,
    StepTimeout,
    GlobalTimeout,
    VerificationFailed,
    MissingOutput,
    Unroutable,
}

impl FailureKind {
    /// Kinds the recovery controller may re-dispatch.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::WorkerFailure | Self::MalformedResponse | Self::StepTimeout | Self::VerificationFailed
        )
    }
}

/// The most recent failure recorded on an instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StepFailure {
    pub step_id: String,
    pub kind: FailureKind,
    pub message: String,
    pub attempts: u32,
    pub at: DateTime<Utc>,
}

/// A routing choice taken by the engine or by an operator override.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub step_id: String,
    pub chosen_target: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub manual: bool,
}

/// Mutable record of one running workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionInstance {
    pub instance_id: String,
    pub workflow_id: String,
    /// Path or name the definition was loaded from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_source: Option<String>,
    /// Catalog context the instance was started with.
    #[serde(default)]
    pub context: ResolutionContext,
    pub status: InstanceStatus,
    /// `None` once the workflow has run past its terminal step.
    pub current_step_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_step_id: Option<String>,
    #[serde(default)]
    pub step_outputs: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub decisions: Vec<Decision>,
    #[serde(default)]
    pub attempts: HashMap<String, u32>,
    #[serde(default)]
    pub step_states: HashMap<String, StepState>,
    #[serde(default)]
    pub completed_steps: Vec<String>,
    #[serde(default)]
    pub skipped_steps: Vec<String>,
    #[serde(default)]
    pub verifications: HashMap<String, VerificationResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<StepFailure>,
    pub started_at: DateTime<Utc>,
    /// Start of the current wall-clock window; reset when a suspended
    /// instance is resumed.
    pub active_since: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_checkpoint_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_checkpoint_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived_at: Option<DateTime<Utc>>,
    /// Optimistic lock counter, bumped by every successful save.
    #[serde(default)]
    pub version: i64,
}

impl ExecutionInstance {
    pub fn new(
        instance_id: String,
        workflow_id: String,
        workflow_source: Option<String>,
        entry_step_id: String,
    ) -> Self {
        let now = Utc::now();
        Self {
            instance_id,
            workflow_id,
            workflow_source,
            context: ResolutionContext::Core,
            status: InstanceStatus::Active,
            current_step_id: Some(entry_step_id),
            last_step_id: None,
            step_outputs: serde_json::Map::new(),
            decisions: Vec::new(),
            attempts: HashMap::new(),
            step_states: HashMap::new(),
            completed_steps: Vec::new(),
            skipped_steps: Vec::new(),
            verifications: HashMap::new(),
            last_error: None,
            started_at: now,
            active_since: now,
            last_checkpoint_at: None,
            last_checkpoint_id: None,
            archived_at: None,
            version: 0,
        }
    }

    pub fn attempts_for(&self, step_id: &str) -> u32 {
        self.attempts.get(step_id).copied().unwrap_or(0)
    }

    pub fn step_state(&self, step_id: &str) -> StepState {
        self.step_states
            .get(step_id)
            .copied()
            .unwrap_or(StepState::Pending)
    }

    pub fn set_step_state(&mut self, step_id: &str, state: StepState) {
        self.step_states.insert(step_id.to_string(), state);
    }

    /// Mark the instance with a terminal status and stamp the archive time.
    pub fn finish(&mut self, status: InstanceStatus) {
        self.status = status;
        if status.is_terminal() && self.archived_at.is_none() {
            self.archived_at = Some(Utc::now());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip_through_str() {
        for status in [
            InstanceStatus::Active,
            InstanceStatus::Completed,
            InstanceStatus::Failed,
            InstanceStatus::TimedOut,
            InstanceStatus::Aborted,
        ] {
            assert_eq!(InstanceStatus::from_str(status.as_str()), status);
        }
    }

    #[test]
    fn test_timed_out_is_not_terminal() {
        assert!(!InstanceStatus::TimedOut.is_terminal());
        assert!(InstanceStatus::Aborted.is_terminal());
    }

    #[test]
    fn test_finish_archives_only_terminal_statuses() {
        let mut inst = ExecutionInstance::new("i".into(), "wf".into(), None, "a".into());
        inst.finish(InstanceStatus::TimedOut);
        assert!(inst.archived_at.is_none());
        inst.finish(InstanceStatus::Completed);
        assert!(inst.archived_at.is_some());
    }

    #[test]
    fn test_instance_serializes_camel_case() {
        let inst = ExecutionInstance::new("i".into(), "wf".into(), None, "a".into());
        let json = serde_json::to_value(&inst).unwrap();
        assert_eq!(json["currentStepId"], "a");
        assert_eq!(json["status"], "active");
    }
}
