//! Engine configuration.
//!
//! Read from `relay.yaml` in the working directory (or an explicit path),
//! otherwise built from defaults. A workflow's `policy` block overrides the
//! recovery fields per workflow, see [`crate::workflow::recovery::RecoveryPolicy`].

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::workflow::schema::ErrorHandlingStrategy;

pub const DEFAULT_CONFIG_FILE: &str = "relay.yaml";
pub const DEFAULT_DB_FILE: &str = "relay.db";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Dispatch attempts allowed per step before it is failed-final
    pub max_retries: u32,
    pub error_handling: ErrorHandlingStrategy,
    pub fallback_step: Option<String>,
    /// Wall-clock budget of one active window, in seconds
    pub global_timeout_secs: u64,
    pub step_timeout_secs: u64,
    /// Base retry delay; doubled per attempt, 0 disables waiting
    pub backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Root of the agent/task catalog (`core/` and `groups/<name>/`)
    pub catalog_root: Option<PathBuf>,
    /// Directories searched when a workflow is given by name
    pub workflow_dirs: Vec<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            error_handling: ErrorHandlingStrategy::Abort,
            fallback_step: None,
            global_timeout_secs: 30 * 60,
            step_timeout_secs: 5 * 60,
            backoff_ms: 0,
            max_backoff_ms: 30_000,
            catalog_root: None,
            workflow_dirs: Vec::new(),
        }
    }
}

impl EngineConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self, EngineError> {
        serde_yaml::from_str(yaml)
            .map_err(|e| EngineError::Parse(format!("Failed to parse config YAML: {}", e)))
    }

    /// Load configuration. An explicit path must exist; without one,
    /// `relay.yaml` in the working directory is used when present.
    pub fn load(path: Option<&Path>) -> Result<Self, EngineError> {
        let path = match path {
            Some(p) => {
                if !p.is_file() {
                    return Err(EngineError::NotFound(format!(
                        "config file '{}'",
                        p.display()
                    )));
                }
                p.to_path_buf()
            }
            None => {
                let default = PathBuf::from(DEFAULT_CONFIG_FILE);
                if !default.is_file() {
                    tracing::debug!("[EngineConfig] No {} found, using defaults", DEFAULT_CONFIG_FILE);
                    return Ok(Self::default());
                }
                default
            }
        };

        let content = std::fs::read_to_string(&path).map_err(|e| {
            EngineError::Parse(format!("Failed to read config '{}': {}", path.display(), e))
        })?;
        let config = Self::from_yaml(&content)?;
        tracing::info!("[EngineConfig] Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Catalog root: configured value, else `./.relay`, else `~/.relay`
    /// when only the home one exists.
    pub fn catalog_root(&self) -> PathBuf {
        if let Some(ref root) = self.catalog_root {
            return root.clone();
        }
        let local = PathBuf::from(".relay");
        if local.is_dir() {
            return local;
        }
        match dirs::home_dir().map(|h| h.join(".relay")) {
            Some(home) if home.is_dir() => home,
            _ => local,
        }
    }

    /// Directories searched for `<name>.yaml` workflows, in order.
    pub fn workflow_search_dirs(&self) -> Vec<PathBuf> {
        if !self.workflow_dirs.is_empty() {
            return self.workflow_dirs.clone();
        }
        let mut dirs = vec![PathBuf::from("workflows"), PathBuf::from(".relay/workflows")];
        let catalog = self.catalog_root().join("workflows");
        if !dirs.contains(&catalog) {
            dirs.push(catalog);
        }
        dirs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.global_timeout_secs, 1800);
        assert_eq!(config.step_timeout_secs, 300);
        assert_eq!(config.error_handling, ErrorHandlingStrategy::Abort);
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = EngineConfig::from_yaml(
            "max_retries: 5\nerror_handling: continue\ncatalog_root: /opt/relay\n",
        )
        .unwrap();
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.error_handling, ErrorHandlingStrategy::Continue);
        assert_eq!(config.step_timeout_secs, 300);
        assert_eq!(config.catalog_root(), PathBuf::from("/opt/relay"));
        assert_eq!(
            config.workflow_search_dirs().last(),
            Some(&PathBuf::from("/opt/relay/workflows"))
        );
    }

    #[test]
    fn test_load_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.yaml");
        std::fs::write(&path, "global_timeout_secs: 10\nbackoff_ms: 50\n").unwrap();
        let config = EngineConfig::load(Some(&path)).unwrap();
        assert_eq!(config.global_timeout_secs, 10);
        assert_eq!(config.backoff_ms, 50);

        let missing = EngineConfig::load(Some(&dir.path().join("nope.yaml")));
        assert!(matches!(missing, Err(EngineError::NotFound(_))));
    }

    #[test]
    fn test_bad_strategy_is_parse_error() {
        let err = EngineConfig::from_yaml("error_handling: explode\n").unwrap_err();
        assert!(matches!(err, EngineError::Parse(_)));
    }
}
