//! Influence providers and task identities
//!
//! Every task instance gets an [`Identity`], a SHA-256 digest over its
//! qualified name, its parameters, the output of every applicable influence
//! provider and the identities of its direct dependencies. Dependencies are
//! folded in qualified-name order so the digest does not depend on the order
//! requirements were declared or resolved in.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, trace};
use walkdir::WalkDir;

use crate::error::{GraphError, InfluenceError};
use crate::task::TaskInstance;

/// Content-derived identity of a task instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    /// Wrap an existing hex digest
    pub fn new(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Abbreviated form for log output
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A source of content that invalidates cached artifacts when it changes
pub trait InfluenceProvider: Send + Sync + fmt::Debug {
    /// Name used in the influence string
    fn name(&self) -> &str;

    /// Current value for `task`
    fn influence(&self, task: &TaskInstance) -> Result<String, InfluenceError>;
}

/// Influence of the task kind name
#[derive(Debug, Default)]
pub struct TaskNameInfluence;

impl InfluenceProvider for TaskNameInfluence {
    fn name(&self) -> &str {
        "Name"
    }

    fn influence(&self, task: &TaskInstance) -> Result<String, InfluenceError> {
        Ok(task.name().to_string())
    }
}

/// Influence of the resolved parameter values
#[derive(Debug, Default)]
pub struct TaskParameterInfluence;

impl InfluenceProvider for TaskParameterInfluence {
    fn name(&self) -> &str {
        "Parameters"
    }

    fn influence(&self, task: &TaskInstance) -> Result<String, InfluenceError> {
        let params: Vec<String> = task
            .parameters()
            .iter()
            .map(|(key, value)| format!("{}={}", key, value))
            .collect();
        Ok(params.join(","))
    }
}

/// Influence of the task action and its unexpanded requirements
#[derive(Debug, Default)]
pub struct TaskSourceInfluence;

impl InfluenceProvider for TaskSourceInfluence {
    fn name(&self) -> &str {
        "Source"
    }

    fn influence(&self, task: &TaskInstance) -> Result<String, InfluenceError> {
        let mut hasher = Sha256::new();
        hasher.update(task.action().fingerprint().as_bytes());
        for requirement in &task.definition().requires {
            hasher.update(b"\0");
            hasher.update(requirement.as_bytes());
        }
        Ok(format!("{:x}", hasher.finalize()))
    }
}

/// Influence of file contents matched by a glob pattern.
///
/// Matched directories are walked recursively. A pattern without glob
/// characters must name an existing path.
#[derive(Debug, Clone)]
pub struct FileInfluence {
    base: PathBuf,
    pattern: String,
}

impl FileInfluence {
    pub fn new(base: impl Into<PathBuf>, pattern: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            pattern: pattern.into(),
        }
    }

    fn files(&self, pattern: &str) -> Result<Vec<PathBuf>, InfluenceError> {
        let full_pattern = self.base.join(pattern).to_string_lossy().to_string();
        let is_literal = !pattern.contains(|c: char| matches!(c, '*' | '?' | '['));
        if is_literal && !Path::new(&full_pattern).exists() {
            return Err(InfluenceError::MissingPath(PathBuf::from(full_pattern)));
        }

        let paths = glob::glob(&full_pattern).map_err(|e| InfluenceError::Pattern {
            pattern: pattern.to_string(),
            message: e.to_string(),
        })?;

        let mut files = Vec::new();
        for entry in paths {
            let path = entry.map_err(|e| {
                let path = e.path().to_path_buf();
                InfluenceError::Io {
                    path,
                    source: e.into_error(),
                }
            })?;
            if path.is_dir() {
                for walked in WalkDir::new(&path).follow_links(false) {
                    let walked = walked.map_err(|e| InfluenceError::Io {
                        path: e.path().map(Path::to_path_buf).unwrap_or_else(|| path.clone()),
                        source: e.into(),
                    })?;
                    if walked.file_type().is_file() {
                        files.push(walked.into_path());
                    }
                }
            } else if path.is_file() {
                files.push(path);
            }
        }

        files.sort();
        files.dedup();
        Ok(files)
    }
}

impl InfluenceProvider for FileInfluence {
    fn name(&self) -> &str {
        "File"
    }

    fn influence(&self, task: &TaskInstance) -> Result<String, InfluenceError> {
        let pattern = task.expand(&self.pattern)?;
        let files = self.files(&pattern)?;

        let mut hasher = Sha256::new();
        for file in &files {
            let contents = fs::read(file).map_err(|source| InfluenceError::Io {
                path: file.clone(),
                source,
            })?;
            let relative = file.strip_prefix(&self.base).unwrap_or(file);
            hasher.update(relative.to_string_lossy().as_bytes());
            hasher.update(b"\0");
            hasher.update(Sha256::digest(&contents));
        }

        trace!(pattern = %pattern, files = files.len(), "hashed file influence");
        Ok(format!("{}: {:x}", pattern, hasher.finalize()))
    }
}

/// Influence of an environment variable
#[derive(Debug, Clone)]
pub struct EnvironmentInfluence {
    variable: String,
}

impl EnvironmentInfluence {
    pub fn new(variable: impl Into<String>) -> Self {
        Self {
            variable: variable.into(),
        }
    }
}

impl InfluenceProvider for EnvironmentInfluence {
    fn name(&self) -> &str {
        "Environ"
    }

    fn influence(&self, _task: &TaskInstance) -> Result<String, InfluenceError> {
        Ok(match std::env::var(&self.variable) {
            Ok(value) => format!("{}={}", self.variable, value),
            Err(_) => format!("{} unset", self.variable),
        })
    }
}

/// Influence of a git working tree: the HEAD tree plus uncommitted changes
#[derive(Debug, Clone)]
pub struct GitInfluence {
    path: PathBuf,
}

impl GitInfluence {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl InfluenceProvider for GitInfluence {
    fn name(&self) -> &str {
        "Git"
    }

    fn influence(&self, _task: &TaskInstance) -> Result<String, InfluenceError> {
        let repo = git2::Repository::discover(&self.path)?;
        let head = repo.head()?.peel_to_tree()?;

        let mut options = git2::DiffOptions::new();
        options.include_untracked(true).recurse_untracked_dirs(true);
        let diff = repo.diff_tree_to_workdir_with_index(Some(&head), Some(&mut options))?;

        let mut hasher = Sha256::new();
        let mut changed = false;
        diff.print(git2::DiffFormat::Patch, |_delta, _hunk, line| {
            changed = true;
            hasher.update([line.origin() as u8]);
            hasher.update(line.content());
            true
        })?;

        if changed {
            Ok(format!("tree {} diff {:x}", head.id(), hasher.finalize()))
        } else {
            Ok(format!("tree {}", head.id()))
        }
    }
}

/// Registry of influence providers applied to every task
#[derive(Debug, Default)]
pub struct InfluenceRegistry {
    providers: Vec<Arc<dyn InfluenceProvider>>,
}

impl InfluenceRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the name, parameter and source providers
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(TaskNameInfluence));
        registry.register(Arc::new(TaskParameterInfluence));
        registry.register(Arc::new(TaskSourceInfluence));
        registry
    }

    /// Register a global provider
    pub fn register(&mut self, provider: Arc<dyn InfluenceProvider>) {
        self.providers.push(provider);
    }

    /// Influence strings for `task`, global providers first
    pub fn strings(&self, task: &TaskInstance) -> Result<Vec<String>, GraphError> {
        self.providers
            .iter()
            .chain(task.definition().influence.iter())
            .map(|provider| {
                provider
                    .influence(task)
                    .map(|value| format!("Influence-{}: {}", provider.name(), value))
                    .map_err(|source| GraphError::Influence {
                        task: task.qualified_name().to_string(),
                        provider: provider.name().to_string(),
                        source,
                    })
            })
            .collect()
    }

    /// Compute the identity of `task` given the identities of its direct
    /// dependencies, keyed by qualified name.
    pub fn identity(
        &self,
        task: &TaskInstance,
        influence: &[String],
        dependencies: &BTreeMap<String, Identity>,
    ) -> Identity {
        let mut hasher = Sha256::new();
        hasher.update(b"task\0");
        hasher.update(task.qualified_name().as_bytes());

        for (key, value) in task.parameters() {
            hasher.update(b"\0param\0");
            hasher.update(key.as_bytes());
            hasher.update(b"=");
            hasher.update(value.as_bytes());
        }

        for line in influence {
            hasher.update(b"\0influence\0");
            hasher.update(line.as_bytes());
        }

        for (name, identity) in dependencies {
            hasher.update(b"\0requires\0");
            hasher.update(name.as_bytes());
            hasher.update(b"@");
            hasher.update(identity.as_str().as_bytes());
        }

        let identity = Identity(format!("{:x}", hasher.finalize()));
        debug!(task = %task.qualified_name(), identity = %identity.short(), "computed identity");
        identity
    }
}
