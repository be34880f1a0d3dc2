//! Error types for the build engine

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors raised while defining or instantiating tasks
#[derive(Debug, Error)]
pub enum TaskError {
    /// Task kind is not registered
    #[error("Task '{0}' is not defined")]
    UnknownTask(String),

    /// Parameter is not declared by the task
    #[error("Task '{task}' has no parameter '{parameter}'")]
    UnknownParameter { task: String, parameter: String },

    /// Value is not one of the accepted values
    #[error("Illegal value '{value}' for parameter '{parameter}' of task '{task}' (accepted: {accepted})")]
    IllegalValue {
        task: String,
        parameter: String,
        value: String,
        accepted: String,
    },

    /// Macro references a parameter without a value
    #[error("Parameter '{parameter}' used in '{template}' is not set for task '{task}'")]
    UnsetParameter {
        task: String,
        parameter: String,
        template: String,
    },

    /// Task name could not be parsed
    #[error("Malformed task name '{0}'")]
    MalformedName(String),

    /// Task kind registered twice
    #[error("Task '{0}' is already defined")]
    Duplicate(String),
}

/// Errors raised by influence providers
#[derive(Debug, Error)]
pub enum InfluenceError {
    /// A file could not be read
    #[error("Cannot read '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A literal path does not exist
    #[error("Path '{0}' does not exist")]
    MissingPath(PathBuf),

    /// A glob pattern is invalid
    #[error("Invalid pattern '{pattern}': {message}")]
    Pattern { pattern: String, message: String },

    /// Repository state could not be inspected
    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    /// A macro in the provider configuration could not be expanded
    #[error(transparent)]
    Task(#[from] TaskError),
}

/// Errors raised while building the dependency graph
#[derive(Debug, Error)]
pub enum GraphError {
    /// A requirement could not be resolved
    #[error(transparent)]
    Task(#[from] TaskError),

    /// The requirements form a cycle
    #[error("Cyclic dependency detected among tasks: {}", .0.join(", "))]
    Cycle(Vec<String>),

    /// An influence provider failed while computing an identity
    #[error("Influence '{provider}' failed for task '{task}': {source}")]
    Influence {
        task: String,
        provider: String,
        #[source]
        source: InfluenceError,
    },
}

/// Errors raised by remote storage providers
#[derive(Debug, Error)]
pub enum StorageError {
    /// IO error
    #[error("Storage IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The provider could not serve the request
    #[error("Storage provider '{provider}' unavailable: {message}")]
    Unavailable { provider: String, message: String },
}

/// Errors raised by the artifact cache
#[derive(Debug, Error)]
pub enum CacheError {
    /// IO error
    #[error("Cache IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("Cache serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Cache root cannot be used
    #[error("Invalid cache root '{path}': {message}")]
    InvalidRoot { path: PathBuf, message: String },

    /// Archive creation or extraction failed
    #[error("Archive error for '{path}': {source}")]
    Archive {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Manifest could not be parsed or does not match its location
    #[error("Corrupt manifest '{path}': {message}")]
    CorruptManifest { path: PathBuf, message: String },

    /// Artifact is not present in the local cache
    #[error("Artifact for '{0}' is not committed")]
    NotCommitted(String),

    /// Attribute set is not registered
    #[error("Unknown attribute set '{0}'")]
    UnknownAttributeSet(String),

    /// Post-fetch materialization failed
    #[error("Unpacking '{task}' failed: {message}")]
    Unpack { task: String, message: String },

    /// Remote storage failed
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Stage of task execution at which a failure occurred
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Build,
    Upload,
    Download,
    Unpack,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Build => "build",
            Stage::Upload => "upload",
            Stage::Download => "download",
            Stage::Unpack => "unpack",
        };
        f.write_str(name)
    }
}

/// A task failed while executing
#[derive(Debug, Error)]
#[error("{} of '{}' failed after {:.1}s: {}", .stage, .task, .duration.as_secs_f64(), .message)]
pub struct ExecutionError {
    /// Qualified name of the task
    pub task: String,
    /// Stage that failed
    pub stage: Stage,
    /// Time spent before the failure
    pub duration: Duration,
    /// Failure description
    pub message: String,
}

impl ExecutionError {
    pub fn new(
        task: impl Into<String>,
        stage: Stage,
        duration: Duration,
        message: impl fmt::Display,
    ) -> Self {
        Self {
            task: task.into(),
            stage,
            duration,
            message: message.to_string(),
        }
    }
}

/// Top level error for a build session
#[derive(Debug, Error)]
pub enum BuildError {
    /// Configuration could not be used
    #[error(transparent)]
    Config(#[from] cairn_core::CairnError),

    /// Task definition error
    #[error(transparent)]
    Task(#[from] TaskError),

    /// Graph construction error
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// Artifact cache error
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// Task execution error
    #[error(transparent)]
    Execution(#[from] ExecutionError),

    /// Pending tasks could never become ready
    #[error("Scheduler stalled with pending tasks: {}", .0.join(", "))]
    Stalled(Vec<String>),

    /// A worker task panicked or was cancelled
    #[error("Task worker failed: {0}")]
    Worker(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_error_names_task_and_stage() {
        let err = ExecutionError::new(
            "compiler:arch=x86_64",
            Stage::Upload,
            Duration::from_millis(1500),
            "refused",
        );
        let message = err.to_string();
        assert!(message.starts_with("upload of 'compiler:arch=x86_64'"));
        assert!(message.contains("1.5s"));
        assert!(message.ends_with("refused"));
    }

    #[test]
    fn test_cycle_lists_members() {
        let err = GraphError::Cycle(vec!["a".to_string(), "b".to_string()]);
        assert_eq!(err.to_string(), "Cyclic dependency detected among tasks: a, b");
    }
}
