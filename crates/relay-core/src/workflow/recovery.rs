//! Recovery controller: attempt accounting, retry/backoff, timeouts and the
//! error-handling strategy applied once a step's retries are exhausted.
//!
//! Stateless: every decision is a function of the resolved policy and the
//! instance's recorded attempts.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::EngineConfig;
use crate::models::{ExecutionInstance, FailureKind};
use crate::workflow::schema::{ActionStep, ErrorHandlingStrategy, WorkflowDefinition, WorkflowPolicy};

/// Engine configuration with the workflow's `policy` overrides applied.
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryPolicy {
    pub max_retries: u32,
    pub error_handling: ErrorHandlingStrategy,
    pub fallback_step: Option<String>,
    pub global_timeout: Duration,
    pub step_timeout: Duration,
    pub backoff_ms: u64,
    pub max_backoff_ms: u64,
}

/// What the engine does after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Re-dispatch the same step after `delay`
    Retry { delay: Duration },
    /// Halt the instance with status `failed`
    Abort,
    /// Advance past the step; `None` when the step was terminal
    Continue { next: Option<String> },
    /// Jump to a fallback step
    Fallback { target: String },
}

impl RecoveryPolicy {
    pub fn resolve(config: &EngineConfig, policy: &WorkflowPolicy) -> Self {
        Self {
            max_retries: policy.max_retries.unwrap_or(config.max_retries).max(1),
            error_handling: policy.error_handling.unwrap_or(config.error_handling),
            fallback_step: policy
                .fallback_step
                .clone()
                .or_else(|| config.fallback_step.clone()),
            global_timeout: Duration::from_secs(
                policy.global_timeout_secs.unwrap_or(config.global_timeout_secs),
            ),
            step_timeout: Duration::from_secs(
                policy.step_timeout_secs.unwrap_or(config.step_timeout_secs),
            ),
            backoff_ms: policy.backoff_ms.unwrap_or(config.backoff_ms),
            max_backoff_ms: config.max_backoff_ms,
        }
    }

    pub fn for_workflow(config: &EngineConfig, workflow: &WorkflowDefinition) -> Self {
        Self::resolve(config, &workflow.policy)
    }

    /// `attempts` counts dispatches already made, the failed one included.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_retries
    }

    /// Delay before the next attempt: `backoff_ms * 2^(attempts-1)`, capped.
    pub fn backoff(&self, attempts: u32) -> Duration {
        if self.backoff_ms == 0 {
            return Duration::ZERO;
        }
        let exp = attempts.saturating_sub(1).min(16);
        let ms = self.backoff_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(ms.min(self.max_backoff_ms))
    }

    pub fn step_timeout_for(&self, step: &ActionStep) -> Duration {
        step.timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.step_timeout)
    }

    /// Time left in the instance's current wall-clock window, or `None`
    /// once it has run out.
    pub fn remaining_window(&self, instance: &ExecutionInstance, now: DateTime<Utc>) -> Option<Duration> {
        let elapsed = (now - instance.active_since).to_std().unwrap_or(Duration::ZERO);
        self.global_timeout
            .checked_sub(elapsed)
            .filter(|left| !left.is_zero())
    }

    /// Decide how to proceed after `step` failed with `kind`.
    pub fn on_failure(
        &self,
        workflow: &WorkflowDefinition,
        step: &ActionStep,
        kind: FailureKind,
        attempts: u32,
    ) -> FailureOutcome {
        if kind.is_retryable() && self.should_retry(attempts) {
            return FailureOutcome::Retry {
                delay: self.backoff(attempts),
            };
        }
        self.on_final_failure(workflow, step)
    }

    /// Apply the error-handling strategy to a failed-final step.
    pub fn on_final_failure(&self, workflow: &WorkflowDefinition, step: &ActionStep) -> FailureOutcome {
        tracing::info!(
            "[Recovery] Step {} failed for good, applying '{}'",
            step.id,
            self.error_handling.as_str()
        );
        match self.error_handling {
            ErrorHandlingStrategy::Abort => FailureOutcome::Abort,
            ErrorHandlingStrategy::Continue => {
                let next = workflow
                    .step(&step.id)
                    .and_then(|s| workflow.successor(s))
                    .map(String::from);
                FailureOutcome::Continue { next }
            }
            ErrorHandlingStrategy::RetryThenFallback => {
                let target = step
                    .fallback
                    .clone()
                    .or_else(|| self.fallback_step.clone())
                    .filter(|t| *t != step.id && workflow.step(t).is_some());
                match target {
                    Some(target) => FailureOutcome::Fallback { target },
                    None => {
                        tracing::warn!(
                            "[Recovery] No usable fallback for step {}, aborting",
                            step.id
                        );
                        FailureOutcome::Abort
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::schema::Step;

    fn workflow(policy: &str) -> WorkflowDefinition {
        WorkflowDefinition::from_yaml(&format!(
            r#"
id: wf
name: WF
{policy}
steps:
  - kind: action
    id: build
    agent: dev
    task: build
    fallback: rescue
  - kind: action
    id: test
    agent: dev
    task: test
    terminal: true
  - kind: action
    id: rescue
    agent: dev
    task: rescue
"#
        ))
        .unwrap()
    }

    fn action<'a>(wf: &'a WorkflowDefinition, id: &str) -> &'a ActionStep {
        match wf.step(id) {
            Some(Step::Action(a)) => a,
            _ => panic!("no action {}", id),
        }
    }

    #[test]
    fn test_policy_overrides_config() {
        let wf = workflow("policy:\n  max_retries: 5\n  step_timeout_secs: 2");
        let policy = RecoveryPolicy::for_workflow(&EngineConfig::default(), &wf);
        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.step_timeout, Duration::from_secs(2));
        assert_eq!(policy.global_timeout, Duration::from_secs(1800));
    }

    #[test]
    fn test_retry_bound() {
        let policy = RecoveryPolicy::resolve(&EngineConfig::default(), &WorkflowPolicy::default());
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = EngineConfig {
            backoff_ms: 100,
            max_backoff_ms: 350,
            ..Default::default()
        };
        let policy = RecoveryPolicy::resolve(&config, &WorkflowPolicy::default());
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(350));
        assert_eq!(policy.backoff(40), Duration::from_millis(350));
    }

    #[test]
    fn test_strategies() {
        let wf = workflow("policy:\n  error_handling: continue");
        let policy = RecoveryPolicy::for_workflow(&EngineConfig::default(), &wf);
        assert_eq!(
            policy.on_failure(&wf, action(&wf, "build"), FailureKind::WorkerFailure, 3),
            FailureOutcome::Continue { next: Some("test".into()) }
        );
        assert_eq!(
            policy.on_final_failure(&wf, action(&wf, "test")),
            FailureOutcome::Continue { next: None }
        );

        let wf = workflow("policy:\n  error_handling: retry-then-fallback");
        let policy = RecoveryPolicy::for_workflow(&EngineConfig::default(), &wf);
        assert_eq!(
            policy.on_final_failure(&wf, action(&wf, "build")),
            FailureOutcome::Fallback { target: "rescue".into() }
        );
        assert_eq!(policy.on_final_failure(&wf, action(&wf, "test")), FailureOutcome::Abort);

        let wf = workflow("");
        let policy = RecoveryPolicy::for_workflow(&EngineConfig::default(), &wf);
        assert_eq!(
            policy.on_failure(&wf, action(&wf, "build"), FailureKind::WorkerFailure, 1),
            FailureOutcome::Retry { delay: Duration::ZERO }
        );
        assert_eq!(
            policy.on_failure(&wf, action(&wf, "build"), FailureKind::MissingOutput, 1),
            FailureOutcome::Abort
        );
    }

    #[test]
    fn test_remaining_window() {
        let wf = workflow("policy:\n  global_timeout_secs: 60");
        let policy = RecoveryPolicy::for_workflow(&EngineConfig::default(), &wf);
        let mut inst = ExecutionInstance::new("i".into(), "wf".into(), None, "build".into());
        let now = Utc::now();
        inst.active_since = now - chrono::Duration::seconds(20);
        let left = policy.remaining_window(&inst, now).unwrap();
        assert_eq!(left, Duration::from_secs(40));

        inst.active_since = now - chrono::Duration::seconds(61);
        assert!(policy.remaining_window(&inst, now).is_none());
    }
}
