//! Workflow engine: declarative multi-step agent workflows.
//!
//! Workflows are YAML files of action, routing and phase steps. Action steps
//! name an agent and a task from the catalog and are run by a pluggable
//! [`WorkerRunner`]; routing steps pick the next step from recorded outputs.
//!
//! # Architecture
//!
//! ```text
//! workflow.yaml ──► WorkflowLoader ──► validator ──► WorkflowEngine
//!                                                     │   │   │
//!   catalog/{core,groups}/{agents,tasks} ──► Catalog ─┘   │   │
//!                                                         │   │
//!                       Router (jexl predicates) ◄────────┘   │
//!                                                             │
//!       Dispatcher ──► WorkerRunner (command / HTTP) ──► Recovery
//!                                                             │
//!                                 InstanceStore + checkpoints ◄┘
//! ```

pub mod catalog;
pub mod dispatcher;
pub mod engine;
pub mod expression;
pub mod loader;
pub mod recovery;
pub mod report;
pub mod router;
pub mod schema;
pub mod validator;
pub mod verification;
pub mod worker;

pub use catalog::{Catalog, CatalogEntry, EntryKind, ResolutionContext};
pub use dispatcher::{DispatchRequest, RetryContext};
pub use engine::{StartOptions, WorkflowEngine};
pub use expression::PredicateEvaluator;
pub use loader::{LoadedWorkflow, WorkflowLoader};
pub use recovery::{FailureOutcome, RecoveryPolicy};
pub use report::ExecutionReport;
pub use schema::{ActionStep, ErrorHandlingStrategy, PhaseStep, RoutingStep, Step, WorkflowDefinition};
pub use validator::ValidationReport;
pub use verification::{ShellVerifier, Verifier};
pub use worker::{CommandWorkerRunner, HttpWorkerRunner, StepResult, WorkerError, WorkerRunner};
