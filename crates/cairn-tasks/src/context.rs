//! Per-execution context handed to task actions

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use crate::attributes::{AttributeRegistry, Attributes, Environment, EnvironmentScope};
use crate::error::CacheError;
use crate::reporter::{TaskEvent, TaskReporter};
use crate::task::TaskInstance;

/// Committed artifact of a dependency
#[derive(Debug, Clone)]
pub struct DependencyArtifact {
    /// Qualified name of the dependency
    pub task: String,
    /// Location of the committed artifact
    pub path: PathBuf,
    /// Attributes the dependency published
    pub attributes: Attributes,
}

/// What a task action sees while running.
///
/// The environment is private to this execution. Attributes of every
/// dependency are applied when the context is created and reverted when it
/// is dropped.
pub struct ExecutionContext<'a> {
    instance: Arc<TaskInstance>,
    output_dir: PathBuf,
    dependencies: BTreeMap<String, DependencyArtifact>,
    env: EnvironmentScope<'a>,
    attributes: Attributes,
    registry: Arc<AttributeRegistry>,
    reporter: Arc<dyn TaskReporter>,
}

impl<'a> ExecutionContext<'a> {
    pub fn new(
        instance: Arc<TaskInstance>,
        output_dir: impl Into<PathBuf>,
        dependencies: Vec<DependencyArtifact>,
        mut env: EnvironmentScope<'a>,
        registry: Arc<AttributeRegistry>,
        reporter: Arc<dyn TaskReporter>,
    ) -> Self {
        for dependency in &dependencies {
            debug!(
                task = %instance.qualified_name(),
                dependency = %dependency.task,
                "applying dependency attributes"
            );
            registry.apply(&dependency.attributes, &dependency.path, &mut env);
        }

        Self {
            instance,
            output_dir: output_dir.into(),
            dependencies: dependencies
                .into_iter()
                .map(|dependency| (dependency.task.clone(), dependency))
                .collect(),
            env,
            attributes: Attributes::new(),
            registry,
            reporter,
        }
    }

    pub fn instance(&self) -> &Arc<TaskInstance> {
        &self.instance
    }

    /// Directory the task writes its artifact into
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Artifact of a cacheable dependency, by qualified name
    pub fn dependency(&self, task: &str) -> Option<&DependencyArtifact> {
        self.dependencies.get(task)
    }

    pub fn dependencies(&self) -> impl Iterator<Item = &DependencyArtifact> {
        self.dependencies.values()
    }

    /// The isolated environment of this execution
    pub fn env(&self) -> &Environment {
        self.env.env()
    }

    pub fn set_env(&mut self, key: &str, value: &str) {
        self.env.set(key, value);
    }

    /// Publish an attribute with the artifact
    pub fn publish(&mut self, set: &str, key: &str, value: &str) -> Result<(), CacheError> {
        self.registry.publish(&mut self.attributes, set, key, value)
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    /// Forward a line of task output to the reporter
    pub fn report_output(&self, line: impl Into<String>, is_stderr: bool) {
        self.reporter.report(&TaskEvent::Output {
            task: self.instance.qualified_name().to_string(),
            line: line.into(),
            is_stderr,
        });
    }

    /// Published attributes; the environment is restored
    pub fn into_attributes(self) -> Attributes {
        self.attributes
    }
}
