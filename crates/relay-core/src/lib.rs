//! Relay Core: workflow orchestration engine for multi-agent task flows.
//!
//! This crate contains the workflow model, validation, persisted instance
//! state and the engine that drives instances one unit of work at a time.
//! It has no CLI or HTTP server dependency, making it suitable for use in:
//!
//! - the `relay` CLI (via `relay-cli`)
//! - embedding in a long-running service that owns its own scheduler
//! - tests driving the engine with an in-memory database and a fake runner

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod store;
pub mod workflow;

// Convenience re-exports
pub use config::EngineConfig;
pub use db::Database;
pub use error::{EngineError, EngineErrorKind};
pub use workflow::{ExecutionReport, StartOptions, WorkflowEngine};
