//! Agent/task catalog: resolves the `agent` and `task` references of action
//! steps against definition files on disk.
//!
//! ```text
//! <catalog root>/
//!   core/
//!     agents/analyst.md        # markdown with YAML frontmatter
//!     tasks/create-brief.yaml  # or plain YAML
//!   groups/
//!     game-dev/
//!       agents/designer.md
//!       tasks/create-brief.md  # overrides core in hybrid mode
//! ```
//!
//! The file stem is the reference id. Entries are only resolved here; their
//! content is handed to the worker by reference and never interpreted.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Agent,
    Task,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Agent => "agent",
            Self::Task => "task",
        }
    }

    fn dir_name(&self) -> &'static str {
        match self {
            Self::Agent => "agents",
            Self::Task => "tasks",
        }
    }
}

/// Where references are looked up.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionContext {
    /// Core catalog only
    #[default]
    Core,
    /// A single group only
    Group(String),
    /// Core plus an optional group; group entries win
    Hybrid(Option<String>),
}

impl ResolutionContext {
    /// Build from the CLI's `--target-context` / `--group` pair.
    pub fn from_parts(mode: &str, group: Option<String>) -> Result<Self, EngineError> {
        match mode {
            "core" => Ok(Self::Core),
            "group" => group.map(Self::Group).ok_or_else(|| {
                EngineError::Definition(vec![
                    "target context 'group' requires a group name".to_string()
                ])
            }),
            "hybrid" => Ok(Self::Hybrid(group)),
            other => Err(EngineError::Parse(format!(
                "Unknown target context '{}' (expected core, group or hybrid)",
                other
            ))),
        }
    }

    pub fn group(&self) -> Option<&str> {
        match self {
            Self::Core => None,
            Self::Group(g) => Some(g),
            Self::Hybrid(g) => g.as_deref(),
        }
    }

    fn includes_core(&self) -> bool {
        !matches!(self, Self::Group(_))
    }
}

/// A resolved agent or task definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogEntry {
    pub id: String,
    pub kind: EntryKind,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub path: PathBuf,
    /// `core` or `group:<name>`
    pub origin: String,
}

#[derive(Deserialize, Default)]
struct EntryMeta {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

impl CatalogEntry {
    /// Parse a `.md` (frontmatter optional) or `.yaml`/`.yml` definition file.
    pub fn from_file(path: &Path, kind: EntryKind, origin: &str) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read {} '{}': {}", kind.as_str(), path.display(), e))?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        let meta: EntryMeta = match ext {
            "yaml" | "yml" => serde_yaml::from_str(&content)
                .map_err(|e| format!("Failed to parse '{}': {}", path.display(), e))?,
            "md" => match frontmatter(&content) {
                Some(fm) => serde_yaml::from_str(fm).map_err(|e| {
                    format!("Failed to parse frontmatter in '{}': {}", path.display(), e)
                })?,
                None => EntryMeta::default(),
            },
            other => return Err(format!("Unsupported catalog file type '.{}'", other)),
        };

        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .ok_or_else(|| format!("Invalid catalog path '{}'", path.display()))?;
        let id = meta.id.unwrap_or(stem);

        Ok(Self {
            name: meta.name.unwrap_or_else(|| id.clone()),
            id,
            kind,
            description: meta.description,
            path: path.to_path_buf(),
            origin: origin.to_string(),
        })
    }
}

fn frontmatter(content: &str) -> Option<&str> {
    let rest = content.trim_start().strip_prefix("---")?;
    let end = rest.find("\n---")?;
    Some(rest[..end].trim())
}

/// Agents and tasks visible under one resolution context.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    context: ResolutionContext,
    agents: HashMap<String, CatalogEntry>,
    tasks: HashMap<String, CatalogEntry>,
    /// Files that could not be parsed; reported as validation warnings
    pub load_warnings: Vec<String>,
}

impl Catalog {
    /// An empty catalog for the given context, to be filled with [`Catalog::insert`].
    pub fn new(context: ResolutionContext) -> Self {
        Self {
            context,
            ..Default::default()
        }
    }

    /// Load the catalog rooted at `root` for `context`.
    ///
    /// A named group whose directory does not exist is an error. A missing
    /// core directory just yields an empty core.
    pub fn load(root: &Path, context: ResolutionContext) -> Result<Self, EngineError> {
        let mut catalog = Self::new(context.clone());

        if context.includes_core() {
            let core = root.join("core");
            if core.is_dir() {
                catalog.load_dir(&core, "core");
            } else {
                tracing::warn!("[Catalog] Core catalog '{}' does not exist", core.display());
            }
        }

        if let Some(group) = context.group() {
            let dir = root.join("groups").join(group);
            if !dir.is_dir() {
                return Err(EngineError::NotFound(format!(
                    "group '{}' (expected directory {})",
                    group,
                    dir.display()
                )));
            }
            catalog.load_dir(&dir, &format!("group:{}", group));
        }

        tracing::info!(
            "[Catalog] Loaded {} agents and {} tasks from {}",
            catalog.agents.len(),
            catalog.tasks.len(),
            root.display()
        );
        Ok(catalog)
    }

    fn load_dir(&mut self, base: &Path, origin: &str) {
        for kind in [EntryKind::Agent, EntryKind::Task] {
            let dir = base.join(kind.dir_name());
            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue;
            };
            let mut paths: Vec<PathBuf> = entries.filter_map(|e| e.ok()).map(|e| e.path()).collect();
            paths.sort();
            for path in paths {
                if !matches!(
                    path.extension().and_then(|e| e.to_str()),
                    Some("md") | Some("yaml") | Some("yml")
                ) {
                    continue;
                }
                match CatalogEntry::from_file(&path, kind, origin) {
                    Ok(entry) => {
                        tracing::debug!("[Catalog] {} {} ({})", kind.as_str(), entry.id, origin);
                        self.insert(entry);
                    }
                    Err(e) => {
                        tracing::warn!("[Catalog] {}", e);
                        self.load_warnings.push(e);
                    }
                }
            }
        }
    }

    /// Add an entry; later inserts replace earlier ones with the same id.
    pub fn insert(&mut self, entry: CatalogEntry) {
        let map = match entry.kind {
            EntryKind::Agent => &mut self.agents,
            EntryKind::Task => &mut self.tasks,
        };
        map.insert(entry.id.clone(), entry);
    }

    pub fn context(&self) -> &ResolutionContext {
        &self.context
    }

    pub fn resolve(&self, kind: EntryKind, id: &str) -> Option<&CatalogEntry> {
        match kind {
            EntryKind::Agent => self.agents.get(id),
            EntryKind::Task => self.tasks.get(id),
        }
    }

    pub fn resolve_agent(&self, id: &str) -> Option<&CatalogEntry> {
        self.resolve(EntryKind::Agent, id)
    }

    pub fn resolve_task(&self, id: &str) -> Option<&CatalogEntry> {
        self.resolve(EntryKind::Task, id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    fn fixture() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(
            root,
            "core/agents/analyst.md",
            "---\nname: Analyst\ndescription: Writes briefs\n---\nYou analyse.\n",
        );
        write(root, "core/tasks/create-brief.yaml", "name: Create brief\n");
        write(root, "core/tasks/plain.md", "No frontmatter here.\n");
        write(root, "groups/game/agents/designer.md", "---\nname: Designer\n---\n");
        write(root, "groups/game/tasks/create-brief.md", "---\nname: Game brief\n---\n");
        dir
    }

    #[test]
    fn test_core_context() {
        let dir = fixture();
        let catalog = Catalog::load(dir.path(), ResolutionContext::Core).unwrap();
        let analyst = catalog.resolve_agent("analyst").unwrap();
        assert_eq!(analyst.name, "Analyst");
        assert_eq!(analyst.description.as_deref(), Some("Writes briefs"));
        assert_eq!(catalog.resolve_task("plain").unwrap().name, "plain");
        assert!(catalog.resolve_agent("designer").is_none());
    }

    #[test]
    fn test_group_context_excludes_core() {
        let dir = fixture();
        let catalog =
            Catalog::load(dir.path(), ResolutionContext::Group("game".into())).unwrap();
        assert!(catalog.resolve_agent("designer").is_some());
        assert!(catalog.resolve_agent("analyst").is_none());
    }

    #[test]
    fn test_hybrid_group_overrides_core() {
        let dir = fixture();
        let catalog =
            Catalog::load(dir.path(), ResolutionContext::Hybrid(Some("game".into()))).unwrap();
        assert!(catalog.resolve_agent("analyst").is_some());
        assert!(catalog.resolve_agent("designer").is_some());
        let brief = catalog.resolve_task("create-brief").unwrap();
        assert_eq!(brief.origin, "group:game");
        assert_eq!(brief.name, "Game brief");
    }

    #[test]
    fn test_missing_group_is_not_found() {
        let dir = fixture();
        let err = Catalog::load(dir.path(), ResolutionContext::Group("nope".into())).unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[test]
    fn test_malformed_entry_becomes_warning() {
        let dir = fixture();
        write(dir.path(), "core/agents/broken.yaml", "name: [oops\n");
        let catalog = Catalog::load(dir.path(), ResolutionContext::Core).unwrap();
        assert_eq!(catalog.load_warnings.len(), 1);
        assert!(catalog.resolve_agent("broken").is_none());
    }

    #[test]
    fn test_context_from_parts() {
        assert_eq!(
            ResolutionContext::from_parts("core", None).unwrap(),
            ResolutionContext::Core
        );
        assert_eq!(
            ResolutionContext::from_parts("hybrid", None).unwrap(),
            ResolutionContext::Hybrid(None)
        );
        assert!(ResolutionContext::from_parts("group", None).is_err());
        assert!(ResolutionContext::from_parts("galaxy", None).is_err());
    }
}
