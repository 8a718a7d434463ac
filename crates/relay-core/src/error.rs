//! Core error type for the Relay engine.
//!
//! `EngineError` is returned by the loader, the stores and the engine entry
//! points. Per-attempt worker failures never surface as `EngineError` until
//! the retry budget is exhausted; they are recorded on the instance as
//! [`StepFailure`](crate::models::StepFailure) instead.

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Workflow definition is invalid: {}", .0.join("; "))]
    Definition(Vec<String>),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Step '{step_id}' requires output '{key}' which has not been produced")]
    MissingOutput { step_id: String, key: String },

    #[error("Routing step '{step_id}' matched no condition and has no default target")]
    Unroutable { step_id: String },

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

}

/// Stable, serializable discriminant of an [`EngineError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineErrorKind {
    NotFound,
    Parse,
    Definition,
    Conflict,
    MissingOutput,
    Unroutable,
    Persistence,
    InvalidState,
}

impl EngineError {
    pub fn kind(&self) -> EngineErrorKind {
        match self {
            Self::NotFound(_) => EngineErrorKind::NotFound,
            Self::Parse(_) => EngineErrorKind::Parse,
            Self::Definition(_) => EngineErrorKind::Definition,
            Self::Conflict(_) => EngineErrorKind::Conflict,
            Self::MissingOutput { .. } => EngineErrorKind::MissingOutput,
            Self::Unroutable { .. } => EngineErrorKind::Unroutable,
            Self::Persistence(_) => EngineErrorKind::Persistence,
            Self::InvalidState(_) => EngineErrorKind::InvalidState,
        }
    }

    /// The step the error is attached to, when there is one.
    pub fn step_id(&self) -> Option<&str> {
        match self {
            Self::MissingOutput { step_id, .. } | Self::Unroutable { step_id } => Some(step_id),
            _ => None,
        }
    }

    /// Structured form used by the CLI exit signal.
    pub fn to_json(&self) -> serde_json::Value {
        let mut error = serde_json::json!({
            "kind": self.kind(),
            "message": self.to_string(),
        });
        if let Some(step_id) = self.step_id() {
            error["stepId"] = serde_json::json!(step_id);
        }
        if let Self::Definition(errors) = self {
            error["errors"] = serde_json::json!(errors);
        }
        serde_json::json!({ "error": error })
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        EngineError::Persistence(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_json_carries_step_id() {
        let err = EngineError::Unroutable {
            step_id: "gate".to_string(),
        };
        let json = err.to_json();
        assert_eq!(json["error"]["kind"], "unroutable");
        assert_eq!(json["error"]["stepId"], "gate");
    }

    #[test]
    fn test_definition_error_lists_all_errors() {
        let err = EngineError::Definition(vec!["a".to_string(), "b".to_string()]);
        assert_eq!(err.to_string(), "Workflow definition is invalid: a; b");
        assert_eq!(err.to_json()["error"]["errors"].as_array().unwrap().len(), 2);
    }
}
