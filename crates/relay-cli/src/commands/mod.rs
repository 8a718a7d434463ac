//! CLI command implementations.
//!
//! Every command prints one JSON document to stdout. Failures are returned as
//! the already-rendered JSON error object so `main` only has to print it and
//! exit with status 1.

pub mod workflow;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use relay_core::workflow::{CommandWorkerRunner, DispatchRequest, HttpWorkerRunner, WorkerError, WorkerRunner};
use relay_core::{Database, EngineConfig, EngineError, WorkflowEngine};

/// Options shared by every subcommand.
#[derive(Debug, Clone, Default)]
pub struct GlobalOptions {
    pub db: String,
    pub config: Option<String>,
    pub worker_cmd: Option<String>,
    pub worker_url: Option<String>,
}

/// Stand-in for commands that never dispatch (`status`, `skip`, `abort`, ...).
struct NoWorker;

#[async_trait]
impl WorkerRunner for NoWorker {
    async fn execute(
        &self,
        _request: &DispatchRequest,
        _timeout: std::time::Duration,
    ) -> Result<serde_json::Value, WorkerError> {
        Err(WorkerError::Process(
            "no worker configured; set --worker-cmd or --worker-url".to_string(),
        ))
    }
}

fn runner(opts: &GlobalOptions, required: bool) -> Result<Arc<dyn WorkerRunner>, String> {
    match (&opts.worker_cmd, &opts.worker_url) {
        (Some(_), Some(_)) => Err(usage_error("--worker-cmd and --worker-url are mutually exclusive")),
        (Some(cmd), None) => Ok(Arc::new(CommandWorkerRunner::new(cmd.clone()))),
        (None, Some(url)) => Ok(Arc::new(HttpWorkerRunner::new(url.clone()))),
        (None, None) if required => Err(usage_error(
            "no worker configured; set --worker-cmd (RELAY_WORKER_CMD) or --worker-url (RELAY_WORKER_URL)",
        )),
        (None, None) => Ok(Arc::new(NoWorker)),
    }
}

/// Open the database and build an engine. `dispatches` marks commands that
/// may run workers and therefore need one configured.
pub fn init_engine(opts: &GlobalOptions, dispatches: bool) -> Result<WorkflowEngine, String> {
    let config = EngineConfig::load(opts.config.as_deref().map(Path::new)).map_err(engine_error)?;
    let db = Database::open(&opts.db).map_err(engine_error)?;
    let runner = runner(opts, dispatches)?;
    Ok(WorkflowEngine::new(db, config, runner))
}

/// Render an engine error as the CLI's JSON error object.
pub fn engine_error(err: EngineError) -> String {
    render(&err.to_json())
}

pub fn usage_error(message: impl Into<String>) -> String {
    render(&serde_json::json!({
        "error": { "kind": "usage", "message": message.into() }
    }))
}

fn render(value: &serde_json::Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

/// Pretty-print a JSON value to stdout.
pub fn print_json(value: &serde_json::Value) {
    println!("{}", render(value));
}

/// Load .env and .env.local files from the working directory. Runs before
/// logging is set up, so the loaded files are returned for the caller to log.
pub fn load_dotenv() -> Vec<PathBuf> {
    load_dotenv_from(Path::new("."))
}

/// Variables already present in the environment win.
pub fn load_dotenv_from(dir: &Path) -> Vec<PathBuf> {
    let mut loaded = Vec::new();
    for filename in &[".env.local", ".env"] {
        let path = dir.join(filename);
        let Ok(content) = std::fs::read_to_string(&path) else {
            continue;
        };
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let key = key.trim();
            let mut value = value.trim();
            if value.len() >= 2
                && ((value.starts_with('"') && value.ends_with('"'))
                    || (value.starts_with('\'') && value.ends_with('\'')))
            {
                value = &value[1..value.len() - 1];
            }
            if std::env::var(key).is_err() {
                std::env::set_var(key, value);
            }
        }
        loaded.push(path);
    }
    loaded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_error_shape() {
        let rendered = usage_error("bad flag");
        let value: serde_json::Value = serde_json::from_str(&rendered).unwrap();
        assert_eq!(value["error"]["kind"], "usage");
        assert_eq!(value["error"]["message"], "bad flag");
    }

    #[test]
    fn test_dispatching_commands_need_a_worker() {
        let opts = GlobalOptions {
            db: ":memory:".into(),
            ..Default::default()
        };
        assert!(runner(&opts, true).is_err());
        assert!(runner(&opts, false).is_ok());

        let both = GlobalOptions {
            worker_cmd: Some("cat".into()),
            worker_url: Some("http://localhost".into()),
            ..opts
        };
        assert!(runner(&both, false).is_err());
    }

    #[test]
    fn test_dotenv_files_are_reported_and_do_not_override() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(".env"),
            "# comment\nRELAY_DOTENV_FRESH=\"from-file\"\nRELAY_DOTENV_PRESET=from-file\n",
        )
        .unwrap();
        std::env::set_var("RELAY_DOTENV_PRESET", "from-env");

        let loaded = load_dotenv_from(dir.path());
        assert_eq!(loaded, vec![dir.path().join(".env")]);
        assert_eq!(std::env::var("RELAY_DOTENV_FRESH").unwrap(), "from-file");
        assert_eq!(std::env::var("RELAY_DOTENV_PRESET").unwrap(), "from-env");

        let empty = tempfile::tempdir().unwrap();
        assert!(load_dotenv_from(empty.path()).is_empty());
    }
}
