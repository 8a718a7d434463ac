//! Workflow engine: drives one instance one unit of work per call.
//!
//! Each entry point loads the instance, does its work on a working copy and
//! persists it before returning:
//!
//! - `start` validates the definition, creates the instance and advances it.
//! - `continue_instance` advances through routing/phase steps and at most one
//!   action step (retries of that action included).
//! - `status`, `skip` and `abort` never dispatch work.
//!
//! ```text
//! loop {
//!   phase   → mark done, checkpoint, next
//!   routing → Router picks target, record decision, next
//!   action  → Dispatcher → WorkerRunner → (Verifier) → Recovery → next
//! }
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::config::EngineConfig;
use crate::db::Database;
use crate::error::EngineError;
use crate::models::{
    Checkpoint, CheckpointReason, Decision, ExecutionInstance, FailureKind, InstanceStatus,
    StepFailure, StepState, VerificationResult,
};
use crate::store::{CheckpointStore, InstanceStore};
use crate::workflow::catalog::{Catalog, ResolutionContext};
use crate::workflow::dispatcher::{self, RetryContext};
use crate::workflow::expression::PredicateEvaluator;
use crate::workflow::loader::{LoadedWorkflow, WorkflowLoader};
use crate::workflow::recovery::{FailureOutcome, RecoveryPolicy};
use crate::workflow::report::ExecutionReport;
use crate::workflow::router;
use crate::workflow::schema::{ActionStep, Step, WorkflowDefinition};
use crate::workflow::validator::{self, ValidationReport};
use crate::workflow::verification::{ShellVerifier, Verifier};
use crate::workflow::worker::{interpret_response, StepStatus, WorkerError, WorkerRunner};

/// Arguments of `start`.
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Workflow name or path
    pub workflow: String,
    pub context: ResolutionContext,
    pub strict: bool,
    pub instance_id: Option<String>,
}

/// Result of a single action attempt.
enum Attempt {
    Succeeded(Option<serde_json::Value>),
    Failed(FailureKind, String),
    /// The global window ran out while the worker was busy
    WindowExpired,
}

pub struct WorkflowEngine {
    instances: InstanceStore,
    checkpoints: CheckpointStore,
    runner: Arc<dyn WorkerRunner>,
    verifier: Arc<dyn Verifier>,
    evaluator: PredicateEvaluator,
    loader: WorkflowLoader,
    config: EngineConfig,
}

impl WorkflowEngine {
    pub fn new(db: Database, config: EngineConfig, runner: Arc<dyn WorkerRunner>) -> Self {
        Self {
            instances: InstanceStore::new(db.clone()),
            checkpoints: CheckpointStore::new(db),
            runner,
            verifier: Arc::new(ShellVerifier::new(Duration::from_secs(config.step_timeout_secs))),
            evaluator: PredicateEvaluator::new(),
            loader: WorkflowLoader::from_config(&config),
            config,
        }
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn Verifier>) -> Self {
        self.verifier = verifier;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn loader(&self) -> &WorkflowLoader {
        &self.loader
    }

    fn catalog_root(&self) -> PathBuf {
        self.config.catalog_root()
    }

    /// Load and validate a workflow without creating anything.
    pub fn validate(
        &self,
        workflow: &str,
        context: ResolutionContext,
        strict: bool,
    ) -> Result<(LoadedWorkflow, ValidationReport, Catalog), EngineError> {
        let loaded = self.loader.load(workflow)?;
        let (report, catalog) =
            validator::validate_in_context(&loaded.definition, &self.catalog_root(), context, strict);
        Ok((loaded, report, catalog))
    }

    pub async fn start(&self, opts: &StartOptions) -> Result<ExecutionReport, EngineError> {
        let (loaded, report, catalog) = self.validate(&opts.workflow, opts.context.clone(), opts.strict)?;
        let warnings = report.into_result()?;
        for w in &warnings {
            tracing::warn!("[WorkflowEngine] {}", w);
        }

        let def = loaded.definition;
        let source = loaded.source.to_string_lossy().to_string();
        let mut instance = self
            .instances
            .create(&def, Some(&source), opts.instance_id.clone(), &opts.context)
            .await?;

        tracing::info!(
            instance_id = %instance.instance_id,
            "[WorkflowEngine] Started workflow '{}' ({} steps)",
            def.name,
            def.steps.len()
        );

        let report = self.advance(&def, &catalog, &mut instance).await?;
        Ok(report.with_warnings(warnings))
    }

    /// Advance an existing instance by one unit of work. Terminal instances
    /// are returned unchanged; timed-out ones are restored from their latest
    /// checkpoint first.
    pub async fn continue_instance(
        &self,
        instance_id: &str,
        workflow_override: Option<&str>,
    ) -> Result<ExecutionReport, EngineError> {
        let mut instance = self.instances.load(instance_id).await?;
        if instance.status.is_terminal() {
            tracing::info!(
                instance_id = %instance_id,
                "[WorkflowEngine] Instance already {}, nothing to do",
                instance.status.as_str()
            );
            return Ok(ExecutionReport::from_instance(&instance));
        }

        let (def, catalog, warnings) = self.load_for(&instance, workflow_override)?;

        if instance.status == InstanceStatus::TimedOut {
            self.restore_latest_checkpoint(&mut instance).await?;
        }

        let report = self.advance(&def, &catalog, &mut instance).await?;
        Ok(report.with_warnings(warnings))
    }

    pub async fn status(&self, instance_id: &str) -> Result<ExecutionReport, EngineError> {
        let instance = self.instances.load(instance_id).await?;
        Ok(ExecutionReport::from_instance(&instance))
    }

    /// Operator override: move past the current step without running it.
    /// With `target`, jump to that step instead (the manual answer to an
    /// unroutable decision). Attempts are left untouched.
    pub async fn skip(
        &self,
        instance_id: &str,
        target: Option<&str>,
        workflow_override: Option<&str>,
    ) -> Result<ExecutionReport, EngineError> {
        let mut instance = self.instances.load(instance_id).await?;
        if instance.status.is_terminal() {
            return Err(EngineError::InvalidState(format!(
                "instance '{}' is {} and cannot be skipped",
                instance_id,
                instance.status.as_str()
            )));
        }
        let current = instance.current_step_id.clone().ok_or_else(|| {
            EngineError::InvalidState(format!("instance '{}' has no current step", instance_id))
        })?;

        let (def, _, warnings) = self.load_for(&instance, workflow_override)?;
        let step = def.step(&current).ok_or_else(|| {
            EngineError::InvalidState(format!("step '{}' is not in workflow '{}'", current, def.id))
        })?;

        let next = match target {
            Some(t) => {
                if def.step(t).is_none() {
                    return Err(EngineError::NotFound(format!("step '{}'", t)));
                }
                instance.decisions.push(Decision {
                    step_id: current.clone(),
                    chosen_target: t.to_string(),
                    timestamp: Utc::now(),
                    manual: true,
                });
                Some(t.to_string())
            }
            None => match step {
                Step::Routing(_) => {
                    return Err(EngineError::InvalidState(format!(
                        "routing step '{}' needs an explicit target to skip",
                        current
                    )))
                }
                _ => def.successor(step).map(String::from),
            },
        };

        instance.set_step_state(&current, StepState::Skipped);
        if !instance.skipped_steps.contains(&current) {
            instance.skipped_steps.push(current.clone());
        }
        if instance.last_error.as_ref().is_some_and(|e| e.step_id == current) {
            instance.last_error = None;
        }
        instance.last_step_id = Some(current.clone());
        if instance.status == InstanceStatus::TimedOut {
            instance.status = InstanceStatus::Active;
            instance.active_since = Utc::now();
        }
        self.move_to(&mut instance, next);
        self.instances
            .save_with_checkpoint(&mut instance, Some(&current), CheckpointReason::Skip)
            .await?;

        tracing::info!(
            instance_id = %instance_id,
            "[WorkflowEngine] Skipped step {} → {}",
            current,
            instance.current_step_id.as_deref().unwrap_or("(end)")
        );
        Ok(ExecutionReport::from_instance(&instance).with_warnings(warnings))
    }

    /// Mark the instance aborted. No further dispatch happens for it.
    pub async fn abort(&self, instance_id: &str) -> Result<ExecutionReport, EngineError> {
        let mut instance = self.instances.load(instance_id).await?;
        match instance.status {
            InstanceStatus::Aborted => return Ok(ExecutionReport::from_instance(&instance)),
            InstanceStatus::Completed | InstanceStatus::Failed => {
                return Err(EngineError::InvalidState(format!(
                    "instance '{}' is already {}",
                    instance_id,
                    instance.status.as_str()
                )))
            }
            InstanceStatus::Active | InstanceStatus::TimedOut => {}
        }
        instance.finish(InstanceStatus::Aborted);
        self.instances.save(&mut instance).await?;
        tracing::info!(instance_id = %instance_id, "[WorkflowEngine] Aborted");
        Ok(ExecutionReport::from_instance(&instance))
    }

    /// Start an instance and keep continuing it until it leaves `active`.
    pub async fn run_to_completion(&self, opts: &StartOptions) -> Result<ExecutionReport, EngineError> {
        let mut report = self.start(opts).await?;
        let warnings = std::mem::take(&mut report.warnings);
        while report.status == InstanceStatus::Active {
            report = self.continue_instance(&report.instance_id, None).await?;
        }
        Ok(report.with_warnings(warnings))
    }

    pub async fn list(
        &self,
        workflow_id: Option<&str>,
        status: Option<InstanceStatus>,
    ) -> Result<Vec<ExecutionInstance>, EngineError> {
        self.instances.list(workflow_id, status).await
    }

    pub async fn checkpoints(&self, instance_id: &str) -> Result<Vec<Checkpoint>, EngineError> {
        self.instances.load(instance_id).await?;
        self.checkpoints.list(instance_id).await
    }

    fn load_for(
        &self,
        instance: &ExecutionInstance,
        workflow_override: Option<&str>,
    ) -> Result<(Arc<WorkflowDefinition>, Catalog, Vec<String>), EngineError> {
        let source = workflow_override
            .map(String::from)
            .or_else(|| instance.workflow_source.clone())
            .ok_or_else(|| {
                EngineError::InvalidState(format!(
                    "instance '{}' has no recorded workflow source; pass --workflow",
                    instance.instance_id
                ))
            })?;

        let (loaded, report, catalog) = self.validate(&source, instance.context.clone(), false)?;
        if loaded.definition.id != instance.workflow_id {
            return Err(EngineError::InvalidState(format!(
                "workflow '{}' does not match instance workflow '{}'",
                loaded.definition.id, instance.workflow_id
            )));
        }

        let mut warnings = report.warnings;
        if !report.errors.is_empty() {
            tracing::warn!(
                instance_id = %instance.instance_id,
                "[WorkflowEngine] Resuming although the definition no longer validates: {}",
                report.errors.join("; ")
            );
            warnings.extend(report.errors.into_iter().map(|e| format!("definition: {}", e)));
        }
        Ok((loaded.definition, catalog, warnings))
    }

    async fn restore_latest_checkpoint(&self, instance: &mut ExecutionInstance) -> Result<(), EngineError> {
        let checkpoint = self
            .checkpoints
            .latest(&instance.instance_id)
            .await?
            .ok_or_else(|| {
                EngineError::InvalidState(format!(
                    "instance '{}' has no checkpoint to resume from",
                    instance.instance_id
                ))
            })?;

        let mut restored = checkpoint.snapshot;
        restored.version = instance.version;
        restored.status = InstanceStatus::Active;
        restored.archived_at = None;
        restored.active_since = Utc::now();
        restored.last_checkpoint_id = Some(checkpoint.checkpoint_id.clone());
        restored.last_checkpoint_at = Some(checkpoint.created_at);
        *instance = restored;

        tracing::info!(
            instance_id = %instance.instance_id,
            checkpoint_id = %checkpoint.checkpoint_id,
            "[WorkflowEngine] Resuming timed-out instance from checkpoint at step {}",
            instance.current_step_id.as_deref().unwrap_or("(end)")
        );
        Ok(())
    }

    fn move_to(&self, instance: &mut ExecutionInstance, next: Option<String>) {
        match next {
            Some(step_id) => instance.current_step_id = Some(step_id),
            None => {
                instance.current_step_id = None;
                instance.finish(InstanceStatus::Completed);
                tracing::info!(
                    instance_id = %instance.instance_id,
                    "[WorkflowEngine] Workflow completed"
                );
            }
        }
    }

    /// Process routing/phase steps and at most one action step.
    async fn advance(
        &self,
        def: &WorkflowDefinition,
        catalog: &Catalog,
        instance: &mut ExecutionInstance,
    ) -> Result<ExecutionReport, EngineError> {
        let policy = RecoveryPolicy::for_workflow(&self.config, def);
        let mut dispatched = false;
        let mut control_steps = 0usize;

        while instance.status == InstanceStatus::Active {
            let Some(step_id) = instance.current_step_id.clone() else {
                instance.finish(InstanceStatus::Completed);
                self.instances.save(instance).await?;
                break;
            };
            let step = def.step(&step_id).ok_or_else(|| {
                EngineError::InvalidState(format!("step '{}' is not in workflow '{}'", step_id, def.id))
            })?;

            match step {
                Step::Phase(phase) => {
                    control_steps += 1;
                    self.guard_control_loop(def, &step_id, control_steps)?;
                    tracing::info!("[WorkflowEngine] ── Phase: {} ──", phase.label);
                    instance.set_step_state(&phase.id, StepState::Succeeded);
                    instance.last_step_id = Some(phase.id.clone());
                    self.move_to(instance, def.successor(step).map(String::from));
                    self.instances
                        .save_with_checkpoint(instance, Some(&phase.id), CheckpointReason::Phase)
                        .await?;
                }
                Step::Routing(routing) => {
                    control_steps += 1;
                    self.guard_control_loop(def, &step_id, control_steps)?;
                    match router::route(&self.evaluator, instance, routing) {
                        Ok(target) => {
                            instance.decisions.push(Decision {
                                step_id: routing.id.clone(),
                                chosen_target: target.clone(),
                                timestamp: Utc::now(),
                                manual: false,
                            });
                            instance.set_step_state(&routing.id, StepState::Succeeded);
                            instance.last_step_id = Some(routing.id.clone());
                            instance.current_step_id = Some(target);
                            self.instances.save(instance).await?;
                        }
                        Err(e) => {
                            instance.last_error = Some(StepFailure {
                                step_id: routing.id.clone(),
                                kind: FailureKind::Unroutable,
                                message: e.to_string(),
                                attempts: 0,
                                at: Utc::now(),
                            });
                            instance.last_step_id = Some(routing.id.clone());
                            self.instances.save(instance).await?;
                            tracing::warn!(
                                instance_id = %instance.instance_id,
                                "[WorkflowEngine] {}; choose a target with `skip --target`",
                                e
                            );
                            return Err(e);
                        }
                    }
                }
                Step::Action(action) => {
                    if dispatched {
                        break;
                    }
                    dispatched = true;
                    self.run_action(def, catalog, &policy, instance, action).await?;
                }
            }
        }

        Ok(ExecutionReport::from_instance(instance))
    }

    fn guard_control_loop(&self, def: &WorkflowDefinition, step_id: &str, visited: usize) -> Result<(), EngineError> {
        if visited > def.steps.len() * 2 {
            return Err(EngineError::InvalidState(format!(
                "routing/phase steps loop at '{}' without reaching an action",
                step_id
            )));
        }
        Ok(())
    }

    /// Dispatch an action step, retrying locally until it succeeds, its
    /// retries are exhausted, or the global window runs out.
    async fn run_action(
        &self,
        def: &WorkflowDefinition,
        catalog: &Catalog,
        policy: &RecoveryPolicy,
        instance: &mut ExecutionInstance,
        step: &ActionStep,
    ) -> Result<(), EngineError> {
        // Revisited through a loop: the retry budget is per visit
        if matches!(
            instance.step_state(&step.id),
            StepState::Succeeded | StepState::FailedFinal | StepState::Skipped
        ) {
            instance.attempts.remove(&step.id);
        }

        loop {
            let Some(remaining) = policy.remaining_window(instance, Utc::now()) else {
                return self
                    .suspend(instance, &step.id, "global timeout reached before dispatch")
                    .await;
            };

            let retry = instance
                .last_error
                .as_ref()
                .filter(|e| {
                    e.step_id == step.id && instance.step_state(&step.id) == StepState::FailedRetrying
                })
                .map(RetryContext::from_failure);
            let attempt = instance.attempts_for(&step.id) + 1;

            let request = match dispatcher::dispatch(instance, step, catalog, retry.as_ref(), attempt) {
                Ok(request) => request,
                Err(e @ EngineError::MissingOutput { .. }) => {
                    self.record_failure(instance, &step.id, FailureKind::MissingOutput, e.to_string());
                    instance.set_step_state(&step.id, StepState::FailedFinal);
                    instance.finish(InstanceStatus::Failed);
                    self.instances.save(instance).await?;
                    return Err(e);
                }
                Err(e) => return Err(e),
            };

            instance.attempts.insert(step.id.clone(), attempt);
            instance.set_step_state(&step.id, StepState::Running);
            instance.last_step_id = Some(step.id.clone());
            self.instances.save(instance).await?;

            let step_timeout = policy.step_timeout_for(step);
            let bound = step_timeout.min(remaining);
            let window_end = tokio::time::Instant::now() + remaining;
            tracing::info!(
                instance_id = %instance.instance_id,
                "[WorkflowEngine] Dispatching {} to {} (attempt {}, timeout {}s)",
                step.id,
                request.resolved_agent.id,
                attempt,
                bound.as_secs_f64()
            );

            let attempt_result = self
                .attempt(instance, step, &request, step_timeout, window_end)
                .await;
            let (kind, message) = match attempt_result {
                Attempt::WindowExpired => {
                    return self
                        .suspend(instance, &step.id, "global timeout reached while the worker was running")
                        .await;
                }
                Attempt::Succeeded(output) => {
                    if let (Some(key), Some(value)) = (&step.produces, output) {
                        instance.step_outputs.insert(key.clone(), value);
                    }
                    instance.set_step_state(&step.id, StepState::Succeeded);
                    if !instance.completed_steps.contains(&step.id) {
                        instance.completed_steps.push(step.id.clone());
                    }
                    if instance.last_error.as_ref().is_some_and(|e| e.step_id == step.id) {
                        instance.last_error = None;
                    }
                    let next = def.step(&step.id).and_then(|s| def.successor(s)).map(String::from);
                    self.move_to(instance, next);
                    self.instances
                        .save_with_checkpoint(instance, Some(&step.id), CheckpointReason::Action)
                        .await?;
                    tracing::info!(
                        instance_id = %instance.instance_id,
                        "[WorkflowEngine] ✓ {} succeeded after {} attempt(s)",
                        step.id,
                        attempt
                    );
                    return Ok(());
                }
                Attempt::Failed(kind, message) => (kind, message),
            };

            tracing::warn!(
                instance_id = %instance.instance_id,
                "[WorkflowEngine] ✗ {} attempt {} failed ({:?}): {}",
                step.id,
                attempt,
                kind,
                message
            );
            self.record_failure(instance, &step.id, kind, message);

            match policy.on_failure(def, step, kind, attempt) {
                FailureOutcome::Retry { delay } => {
                    instance.set_step_state(&step.id, StepState::FailedRetrying);
                    self.instances.save(instance).await?;
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
                FailureOutcome::Abort => {
                    instance.set_step_state(&step.id, StepState::FailedFinal);
                    instance.finish(InstanceStatus::Failed);
                    self.instances.save(instance).await?;
                    return Ok(());
                }
                FailureOutcome::Continue { next } => {
                    instance.set_step_state(&step.id, StepState::FailedFinal);
                    tracing::info!("[WorkflowEngine] Continuing past failed step {}", step.id);
                    self.move_to(instance, next);
                    self.instances.save(instance).await?;
                    return Ok(());
                }
                FailureOutcome::Fallback { target } => {
                    instance.set_step_state(&step.id, StepState::FailedFinal);
                    tracing::info!("[WorkflowEngine] Falling back from {} to {}", step.id, target);
                    instance.current_step_id = Some(target);
                    self.instances.save(instance).await?;
                    return Ok(());
                }
            }
        }
    }

    /// One worker call plus verification. Each phase is bounded by the step
    /// timeout and by what is left of the global window at `window_end`.
    async fn attempt(
        &self,
        instance: &mut ExecutionInstance,
        step: &ActionStep,
        request: &dispatcher::DispatchRequest,
        step_timeout: Duration,
        window_end: tokio::time::Instant,
    ) -> Attempt {
        let (bound, global_bound) = bounded(step_timeout, window_end);
        let raw = match tokio::time::timeout(bound, self.runner.execute(request, bound)).await {
            Err(_) | Ok(Err(WorkerError::Timeout(_))) => {
                if global_bound {
                    return Attempt::WindowExpired;
                }
                return Attempt::Failed(
                    FailureKind::StepTimeout,
                    format!("step timed out after {}s", bound.as_secs_f64()),
                );
            }
            Ok(Err(e)) => return Attempt::Failed(FailureKind::WorkerFailure, e.to_string()),
            Ok(Ok(raw)) => raw,
        };

        let result = match interpret_response(&raw, step.produces.is_some()) {
            Ok(result) => result,
            Err(reason) => return Attempt::Failed(FailureKind::MalformedResponse, reason),
        };
        if result.status == StepStatus::Failure {
            let message = result
                .error
                .map(|e| e.message)
                .unwrap_or_else(|| "worker reported failure".to_string());
            return Attempt::Failed(FailureKind::WorkerFailure, message);
        }

        if let Some(ref spec) = step.verify {
            let (bound, global_bound) = bounded(step_timeout, window_end);
            let verify = self.verifier.verify(&step.id, spec);
            let mut verification = match tokio::time::timeout(bound, verify).await {
                Ok(verification) => verification,
                Err(_) if global_bound => return Attempt::WindowExpired,
                Err(_) => VerificationResult {
                    subtask_id: step.id.clone(),
                    passed: false,
                    attempts: request.attempt,
                    logs: Vec::new(),
                    error: Some(format!(
                        "{} verification timed out after {}s",
                        spec.kind(),
                        bound.as_secs_f64()
                    )),
                },
            };
            verification.attempts = request.attempt;
            let passed = verification.passed;
            let message = verification
                .error
                .clone()
                .unwrap_or_else(|| format!("{} verification failed", spec.kind()));
            instance.verifications.insert(step.id.clone(), verification);
            if !passed {
                return Attempt::Failed(FailureKind::VerificationFailed, message);
            }
        }

        Attempt::Succeeded(result.output)
    }

    fn record_failure(&self, instance: &mut ExecutionInstance, step_id: &str, kind: FailureKind, message: String) {
        instance.last_error = Some(StepFailure {
            step_id: step_id.to_string(),
            kind,
            message,
            attempts: instance.attempts_for(step_id),
            at: Utc::now(),
        });
    }

    async fn suspend(
        &self,
        instance: &mut ExecutionInstance,
        step_id: &str,
        message: &str,
    ) -> Result<(), EngineError> {
        self.record_failure(instance, step_id, FailureKind::GlobalTimeout, message.to_string());
        instance.set_step_state(step_id, StepState::Pending);
        instance.finish(InstanceStatus::TimedOut);
        self.instances.save(instance).await?;
        tracing::warn!(
            instance_id = %instance.instance_id,
            "[WorkflowEngine] Suspended at {}: {}",
            step_id,
            message
        );
        Ok(())
    }
}

/// Time allowed for the next piece of an attempt, and whether that limit is
/// the end of the global window rather than the step timeout.
fn bounded(step_timeout: Duration, window_end: tokio::time::Instant) -> (Duration, bool) {
    let left = window_end.saturating_duration_since(tokio::time::Instant::now());
    (step_timeout.min(left), left <= step_timeout)
}
