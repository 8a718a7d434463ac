//! YAML schema types for workflow definitions.
//!
//! A workflow YAML is an ordered list of steps, each tagged by `kind`:
//!
//! ```yaml
//! id: greenfield
//! name: "Greenfield Service"
//! version: "1.0"
//!
//! policy:
//!   max_retries: 3
//!   error_handling: retry-then-fallback   # abort | continue | retry-then-fallback
//!   fallback_step: escalate
//!
//! steps:
//!   - kind: phase
//!     id: planning
//!     label: "Planning"
//!
//!   - kind: action
//!     id: brief
//!     agent: analyst
//!     task: create-brief
//!     produces: project_brief
//!
//!   - kind: action
//!     id: score
//!     agent: reviewer
//!     task: score-brief
//!     requires: [project_brief]
//!     produces: score
//!
//!   - kind: routing
//!     id: quality-gate
//!     conditions:
//!       - when: "score >= 8"
//!         target: ship
//!     default: revise
//!
//!   - kind: action
//!     id: revise
//!     agent: analyst
//!     task: revise-brief
//!     requires: [project_brief]
//!     produces: project_brief
//!     next: score
//!
//!   - kind: action
//!     id: ship
//!     agent: pm
//!     task: publish
//!     requires: [project_brief]
//!     terminal: true
//! ```

use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::models::VerificationSpec;

/// Top-level workflow definition loaded from a YAML file.
///
/// Immutable after loading; share it across instances behind an `Arc`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Stable workflow identifier
    #[serde(default)]
    pub id: String,

    /// Display name
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default = "default_version")]
    pub version: String,

    /// Entry step id (defaults to the first declared step)
    #[serde(default)]
    pub entry: Option<String>,

    /// Recovery policy overrides for this workflow
    #[serde(default)]
    pub policy: WorkflowPolicy,

    /// Ordered list of workflow steps
    #[serde(default)]
    pub steps: Vec<Step>,
}

fn default_version() -> String {
    "1.0".to_string()
}

/// What to do once a step has exhausted its retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorHandlingStrategy {
    /// Halt the whole instance (default)
    #[default]
    Abort,
    /// Record the failure and advance past the step
    Continue,
    /// Jump to the configured fallback step, or abort if there is none
    RetryThenFallback,
}

impl ErrorHandlingStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Abort => "abort",
            Self::Continue => "continue",
            Self::RetryThenFallback => "retry-then-fallback",
        }
    }
}

/// Per-workflow overrides of the engine's recovery configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct WorkflowPolicy {
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub error_handling: Option<ErrorHandlingStrategy>,
    #[serde(default)]
    pub fallback_step: Option<String>,
    #[serde(default)]
    pub global_timeout_secs: Option<u64>,
    #[serde(default)]
    pub step_timeout_secs: Option<u64>,
    #[serde(default)]
    pub backoff_ms: Option<u64>,
}

/// A single step in the workflow. The variant set is closed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Step {
    Action(ActionStep),
    Routing(RoutingStep),
    Phase(PhaseStep),
}

/// Work delegated to an isolated worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionStep {
    pub id: String,

    /// Agent reference, resolved against the catalog
    #[serde(alias = "agent_ref")]
    pub agent: String,

    /// Task reference, resolved against the catalog
    #[serde(alias = "task_ref")]
    pub task: String,

    /// Output keys this step consumes
    #[serde(default)]
    pub requires: Vec<String>,

    /// Output key this step's result is stored under
    #[serde(default)]
    pub produces: Option<String>,

    /// Explicit successor (defaults to the following step)
    #[serde(default)]
    pub next: Option<String>,

    /// The workflow completes after this step
    #[serde(default)]
    pub terminal: bool,

    /// Step to jump to once retries are exhausted (retry-then-fallback)
    #[serde(default)]
    pub fallback: Option<String>,

    /// Optional verification run after the worker reports success
    #[serde(default)]
    pub verify: Option<VerificationSpec>,

    /// Per-step timeout override in seconds
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Conditional branch evaluated against accumulated state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoutingStep {
    pub id: String,

    /// Evaluated in declared order; first match wins
    #[serde(default)]
    pub conditions: Vec<Condition>,

    #[serde(default, alias = "default_target")]
    pub default: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Condition {
    /// Predicate expression, e.g. `score >= 8`
    pub when: String,
    pub target: String,
}

/// No-op checkpoint boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhaseStep {
    pub id: String,

    #[serde(default)]
    pub label: String,

    #[serde(default)]
    pub next: Option<String>,

    #[serde(default)]
    pub terminal: bool,
}

impl Step {
    pub fn id(&self) -> &str {
        match self {
            Step::Action(s) => &s.id,
            Step::Routing(s) => &s.id,
            Step::Phase(s) => &s.id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Step::Action(_) => "action",
            Step::Routing(_) => "routing",
            Step::Phase(_) => "phase",
        }
    }

    /// Every step id this step can hand control to.
    pub fn targets(&self) -> Vec<&str> {
        match self {
            Step::Routing(r) => {
                let mut targets: Vec<&str> = r.conditions.iter().map(|c| c.target.as_str()).collect();
                if let Some(ref d) = r.default {
                    targets.push(d);
                }
                targets
            }
            Step::Action(a) => a.next.iter().map(String::as_str).collect(),
            Step::Phase(p) => p.next.iter().map(String::as_str).collect(),
        }
    }
}

impl WorkflowDefinition {
    /// Parse a workflow definition from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, EngineError> {
        let mut def: Self = serde_yaml::from_str(yaml)
            .map_err(|e| EngineError::Parse(format!("Failed to parse workflow YAML: {}", e)))?;
        def.normalize();
        Ok(def)
    }

    /// Load a workflow definition from a file path.
    pub fn from_file(path: &str) -> Result<Self, EngineError> {
        let content = std::fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                EngineError::NotFound(format!("workflow file '{}'", path))
            }
            _ => EngineError::Parse(format!("Failed to read workflow file '{}': {}", path, e)),
        })?;
        Self::from_yaml(&content)
    }

    fn normalize(&mut self) {
        self.id = self.id.trim().to_string();
        self.name = self.name.trim().to_string();
        for step in &mut self.steps {
            match step {
                Step::Action(s) => s.id = s.id.trim().to_string(),
                Step::Routing(s) => s.id = s.id.trim().to_string(),
                Step::Phase(s) => s.id = s.id.trim().to_string(),
            }
        }
    }

    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id() == id)
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.id() == id)
    }

    pub fn entry_step_id(&self) -> Option<&str> {
        match self.entry {
            Some(ref e) => Some(e.as_str()),
            None => self.steps.first().map(Step::id),
        }
    }

    /// Whether the workflow completes after `step`.
    pub fn is_terminal(&self, step: &Step) -> bool {
        match step {
            Step::Routing(_) => false,
            Step::Action(a) => a.terminal || (a.next.is_none() && self.is_last(&a.id)),
            Step::Phase(p) => p.terminal || (p.next.is_none() && self.is_last(&p.id)),
        }
    }

    /// Sequential successor of an action or phase step; `None` when the
    /// step is terminal. Routing steps have no sequential successor.
    pub fn successor<'a>(&'a self, step: &'a Step) -> Option<&'a str> {
        if self.is_terminal(step) {
            return None;
        }
        let explicit = match step {
            Step::Action(a) => a.next.as_deref(),
            Step::Phase(p) => p.next.as_deref(),
            Step::Routing(_) => return None,
        };
        explicit.or_else(|| {
            self.index_of(step.id())
                .and_then(|i| self.steps.get(i + 1))
                .map(Step::id)
        })
    }

    fn is_last(&self, id: &str) -> bool {
        self.steps.last().map(|s| s.id() == id).unwrap_or(false)
    }

    pub fn action_steps(&self) -> impl Iterator<Item = &ActionStep> {
        self.steps.iter().filter_map(|s| match s {
            Step::Action(a) => Some(a),
            _ => None,
        })
    }
}
