use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::instance::ExecutionInstance;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointReason {
    Start,
    Action,
    Phase,
    /// Operator skip, so a later restore keeps the override
    Skip,
}

impl CheckpointReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Action => "action",
            Self::Phase => "phase",
            Self::Skip => "skip",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "action" => Self::Action,
            "phase" => Self::Phase,
            "skip" => Self::Skip,
            _ => Self::Start,
        }
    }
}

/// Immutable snapshot of an instance, used only for restore.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub checkpoint_id: String,
    pub instance_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    pub reason: CheckpointReason,
    pub created_at: DateTime<Utc>,
    pub snapshot: ExecutionInstance,
}

impl Checkpoint {
    /// Snapshot `instance` as it stands now.
    pub fn capture(
        instance: &ExecutionInstance,
        step_id: Option<&str>,
        reason: CheckpointReason,
    ) -> Self {
        Self {
            checkpoint_id: Uuid::new_v4().to_string(),
            instance_id: instance.instance_id.clone(),
            step_id: step_id.map(str::to_string),
            reason,
            created_at: Utc::now(),
            snapshot: instance.clone(),
        }
    }
}
