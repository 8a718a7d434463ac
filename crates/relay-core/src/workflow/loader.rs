//! Workflow definition loader.
//!
//! A source is either a path to a YAML file or a bare workflow name, which is
//! looked up as `<name>.yaml` / `<name>.yml` in the configured directories.
//! Loading is a pure parse; semantic checks live in the validator.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::workflow::schema::WorkflowDefinition;

/// A parsed definition together with the file it came from.
#[derive(Debug, Clone)]
pub struct LoadedWorkflow {
    pub definition: Arc<WorkflowDefinition>,
    pub source: PathBuf,
}

#[derive(Debug, Clone)]
pub struct WorkflowLoader {
    search_dirs: Vec<PathBuf>,
}

impl WorkflowLoader {
    pub fn new(search_dirs: Vec<PathBuf>) -> Self {
        Self { search_dirs }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.workflow_search_dirs())
    }

    /// Resolve a source to an existing file path.
    pub fn resolve(&self, source: &str) -> Result<PathBuf, EngineError> {
        let direct = Path::new(source);
        if direct.is_file() {
            return Ok(direct.to_path_buf());
        }
        if looks_like_path(source) {
            return Err(EngineError::NotFound(format!("workflow file '{}'", source)));
        }

        for dir in &self.search_dirs {
            for ext in ["yaml", "yml"] {
                let candidate = dir.join(format!("{}.{}", source, ext));
                if candidate.is_file() {
                    return Ok(candidate);
                }
            }
        }

        Err(EngineError::NotFound(format!(
            "workflow '{}' (searched: {})",
            source,
            self.search_dirs
                .iter()
                .map(|d| d.display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        )))
    }

    pub fn load(&self, source: &str) -> Result<LoadedWorkflow, EngineError> {
        let path = self.resolve(source)?;
        let definition = WorkflowDefinition::from_file(&path.to_string_lossy())?;
        tracing::info!(
            "[WorkflowLoader] Loaded workflow '{}' ({} steps) from {}",
            definition.id,
            definition.steps.len(),
            path.display()
        );
        Ok(LoadedWorkflow {
            definition: Arc::new(definition),
            source: path,
        })
    }

    /// Workflow files available in the search directories, as `(name, path)`.
    /// Earlier directories shadow later ones.
    pub fn available(&self) -> Vec<(String, PathBuf)> {
        let mut found: Vec<(String, PathBuf)> = Vec::new();
        for dir in &self.search_dirs {
            let Ok(entries) = std::fs::read_dir(dir) else {
                continue;
            };
            let mut paths: Vec<PathBuf> = entries.filter_map(|e| e.ok()).map(|e| e.path()).collect();
            paths.sort();
            for path in paths {
                let is_yaml = matches!(
                    path.extension().and_then(|e| e.to_str()),
                    Some("yaml") | Some("yml")
                );
                let Some(name) = path.file_stem().map(|s| s.to_string_lossy().to_string()) else {
                    continue;
                };
                if is_yaml && !found.iter().any(|(n, _)| *n == name) {
                    found.push((name, path));
                }
            }
        }
        found
    }
}

fn looks_like_path(source: &str) -> bool {
    source.contains('/')
        || source.contains('\\')
        || source.ends_with(".yaml")
        || source.ends_with(".yml")
}

#[cfg(test)]
mod tests {
    use super::*;

    const WF: &str = "id: hello\nname: Hello\nsteps:\n  - kind: phase\n    id: only\n";

    #[test]
    fn test_load_by_name_and_path() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("hello.yml"), WF).unwrap();
        let loader = WorkflowLoader::new(vec![dir.path().to_path_buf()]);

        let by_name = loader.load("hello").unwrap();
        assert_eq!(by_name.definition.id, "hello");
        assert!(by_name.source.ends_with("hello.yml"));

        let path = dir.path().join("hello.yml");
        let by_path = loader.load(&path.to_string_lossy()).unwrap();
        assert_eq!(by_path.source, path);
    }

    #[test]
    fn test_missing_workflow_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let loader = WorkflowLoader::new(vec![dir.path().to_path_buf()]);
        assert!(matches!(loader.load("ghost"), Err(EngineError::NotFound(_))));
        assert!(matches!(
            loader.load("./nowhere/ghost.yaml"),
            Err(EngineError::NotFound(_))
        ));
    }

    #[test]
    fn test_invalid_yaml_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bad.yaml"), "steps: [unclosed").unwrap();
        let loader = WorkflowLoader::new(vec![dir.path().to_path_buf()]);
        assert!(matches!(loader.load("bad"), Err(EngineError::Parse(_))));
    }

    #[test]
    fn test_available_shadows_by_name() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        std::fs::write(first.path().join("a.yaml"), WF).unwrap();
        std::fs::write(second.path().join("a.yaml"), WF).unwrap();
        std::fs::write(second.path().join("b.yaml"), WF).unwrap();
        std::fs::write(second.path().join("notes.txt"), "x").unwrap();

        let loader = WorkflowLoader::new(vec![first.path().into(), second.path().into()]);
        let names: Vec<String> = loader.available().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["a", "b"]);
    }
}
