//! Task definitions, instances and the task registry

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use async_trait::async_trait;
use regex::Regex;
use tracing::debug;

use cairn_core::ParameterConfig;

use crate::context::ExecutionContext;
use crate::error::TaskError;
use crate::influence::InfluenceProvider;

/// Resolved parameter values, sorted by name
pub type Parameters = BTreeMap<String, String>;

/// Declaration of a task parameter
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterSpec {
    /// Value used when the parameter is not assigned
    pub default: Option<String>,
    /// Accepted values, anything is accepted when `None`
    pub values: Option<Vec<String>>,
    /// Help text
    pub help: Option<String>,
}

impl ParameterSpec {
    /// Parameter without default or restrictions
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the default value
    pub fn with_default(mut self, value: impl Into<String>) -> Self {
        self.default = Some(value.into());
        self
    }

    /// Restrict the accepted values
    pub fn with_values<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.values = Some(values.into_iter().map(Into::into).collect());
        self
    }

    /// Set the help text
    pub fn with_help(mut self, help: impl Into<String>) -> Self {
        self.help = Some(help.into());
        self
    }

    fn accepts(&self, value: &str) -> bool {
        self.values
            .as_ref()
            .map_or(true, |values| values.iter().any(|v| v == value))
    }
}

impl From<&ParameterConfig> for ParameterSpec {
    fn from(config: &ParameterConfig) -> Self {
        Self {
            default: config.default.clone(),
            values: config.values.clone(),
            help: config.help.clone(),
        }
    }
}

/// The work a task performs
#[async_trait]
pub trait TaskAction: Send + Sync + fmt::Debug {
    /// Stable description of what the action does, folded into identities
    fn fingerprint(&self) -> String;

    /// Produce the task output into `ctx.output_dir()`
    async fn run(&self, ctx: &mut ExecutionContext<'_>) -> anyhow::Result<()>;

    /// Whether [`TaskAction::unpack`] has anything to do
    fn is_unpackable(&self) -> bool {
        false
    }

    /// Materialize a committed artifact after it was fetched or built
    async fn unpack(&self, _task: &TaskInstance, _artifact: &Path) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Immutable template of a task kind
#[derive(Debug, Clone)]
pub struct TaskDefinition {
    /// Kind name, may contain `/` for namespacing
    pub name: String,
    /// Parameter schema
    pub parameters: BTreeMap<String, ParameterSpec>,
    /// Requirement expressions, expanded against the instance parameters
    pub requires: Vec<String>,
    /// Whether the output is stored in the artifact cache
    pub cacheable: bool,
    /// Influence providers attached to this kind only
    pub influence: Vec<Arc<dyn InfluenceProvider>>,
    /// The work performed by instances of this kind
    pub action: Arc<dyn TaskAction>,
}

impl TaskDefinition {
    /// Create a new cacheable task definition
    pub fn new(name: impl Into<String>, action: Arc<dyn TaskAction>) -> Self {
        Self {
            name: name.into(),
            parameters: BTreeMap::new(),
            requires: Vec::new(),
            cacheable: true,
            influence: Vec::new(),
            action,
        }
    }

    /// Declare a parameter
    pub fn with_parameter(mut self, name: impl Into<String>, spec: ParameterSpec) -> Self {
        self.parameters.insert(name.into(), spec);
        self
    }

    /// Add a requirement expression
    pub fn with_requires(mut self, requirement: impl Into<String>) -> Self {
        self.requires.push(requirement.into());
        self
    }

    /// Set whether the output is cached
    pub fn with_cacheable(mut self, cacheable: bool) -> Self {
        self.cacheable = cacheable;
        self
    }

    /// Attach an influence provider
    pub fn with_influence(mut self, provider: Arc<dyn InfluenceProvider>) -> Self {
        self.influence.push(provider);
        self
    }

    /// Kind name with path separators replaced, usable as a directory name
    pub fn canonical_name(&self) -> String {
        self.name.replace('/', "_")
    }
}

/// A task definition bound to concrete parameter values
#[derive(Debug)]
pub struct TaskInstance {
    definition: Arc<TaskDefinition>,
    parameters: Parameters,
    qualified_name: String,
}

impl TaskInstance {
    /// Kind name
    pub fn name(&self) -> &str {
        &self.definition.name
    }

    /// Kind name followed by the sorted parameter list
    pub fn qualified_name(&self) -> &str {
        &self.qualified_name
    }

    /// Kind name usable as a directory name
    pub fn canonical_name(&self) -> String {
        self.definition.canonical_name()
    }

    /// Resolved parameter values
    pub fn parameters(&self) -> &Parameters {
        &self.parameters
    }

    pub fn definition(&self) -> &Arc<TaskDefinition> {
        &self.definition
    }

    pub fn action(&self) -> &Arc<dyn TaskAction> {
        &self.definition.action
    }

    pub fn is_cacheable(&self) -> bool {
        self.definition.cacheable
    }

    /// Expand `{parameter}` macros in `template`
    pub fn expand(&self, template: &str) -> Result<String, TaskError> {
        let mut result = String::with_capacity(template.len());
        let mut last = 0;

        for caps in macro_pattern().captures_iter(template) {
            let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            let value = self.parameters.get(name.as_str()).ok_or_else(|| {
                TaskError::UnsetParameter {
                    task: self.qualified_name.clone(),
                    parameter: name.as_str().to_string(),
                    template: template.to_string(),
                }
            })?;
            result.push_str(&template[last..whole.start()]);
            result.push_str(value);
            last = whole.end();
        }

        result.push_str(&template[last..]);
        Ok(result)
    }

    /// Requirement expressions after macro expansion
    pub fn requires(&self) -> Result<Vec<String>, TaskError> {
        self.definition
            .requires
            .iter()
            .map(|requirement| self.expand(requirement))
            .collect()
    }
}

impl fmt::Display for TaskInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.qualified_name)
    }
}

fn macro_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid macro pattern")
    })
}

/// Format a qualified task name, `kind:key=value,flag`
pub fn format_task_name(kind: &str, parameters: &Parameters) -> String {
    if parameters.is_empty() {
        return kind.to_string();
    }

    let params: Vec<String> = parameters
        .iter()
        .map(|(key, value)| {
            if value.is_empty() {
                key.clone()
            } else {
                format!("{}={}", key, value)
            }
        })
        .collect();
    format!("{}:{}", kind, params.join(","))
}

/// Parse a task name into its kind and parameters.
///
/// A parameter without `=` is a flag with an empty value.
pub fn parse_task_name(name: &str) -> Result<(String, Parameters), TaskError> {
    let (kind, params) = match name.split_once(':') {
        Some((kind, params)) => (kind.trim(), params),
        None => (name.trim(), ""),
    };

    if kind.is_empty() {
        return Err(TaskError::MalformedName(name.to_string()));
    }

    let mut parameters = Parameters::new();
    for param in params.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (key, value) = param.split_once('=').unwrap_or((param, ""));
        let key = key.trim();
        if key.is_empty() {
            return Err(TaskError::MalformedName(name.to_string()));
        }
        parameters.insert(key.to_string(), value.trim().to_string());
    }

    Ok((kind.to_string(), parameters))
}

/// Registry of task kinds, memoizing instances by qualified name
#[derive(Debug, Default)]
pub struct TaskRegistry {
    definitions: BTreeMap<String, Arc<TaskDefinition>>,
    instances: Mutex<HashMap<String, Arc<TaskInstance>>>,
}

impl TaskRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task kind
    pub fn register(&mut self, definition: TaskDefinition) -> Result<(), TaskError> {
        if self.definitions.contains_key(&definition.name) {
            return Err(TaskError::Duplicate(definition.name));
        }
        debug!(task = %definition.name, "registered task");
        self.definitions
            .insert(definition.name.clone(), Arc::new(definition));
        Ok(())
    }

    /// Look up a task kind
    pub fn get(&self, name: &str) -> Option<&Arc<TaskDefinition>> {
        self.definitions.get(name)
    }

    /// All registered kinds, sorted by name
    pub fn definitions(&self) -> impl Iterator<Item = &Arc<TaskDefinition>> {
        self.definitions.values()
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    /// Resolve a task name such as `compiler:arch=x86_64` to its instance.
    ///
    /// Requesting the same instance twice returns the same object.
    pub fn instance(&self, name: &str) -> Result<Arc<TaskInstance>, TaskError> {
        let (kind, assigned) = parse_task_name(name)?;
        let definition = self
            .definitions
            .get(&kind)
            .ok_or_else(|| TaskError::UnknownTask(kind.clone()))?;

        for (parameter, value) in &assigned {
            let spec = definition.parameters.get(parameter).ok_or_else(|| {
                TaskError::UnknownParameter {
                    task: kind.clone(),
                    parameter: parameter.clone(),
                }
            })?;
            if !spec.accepts(value) {
                return Err(TaskError::IllegalValue {
                    task: kind.clone(),
                    parameter: parameter.clone(),
                    value: value.clone(),
                    accepted: spec.values.clone().unwrap_or_default().join(", "),
                });
            }
        }

        let mut parameters = assigned;
        for (parameter, spec) in &definition.parameters {
            if let Some(default) = &spec.default {
                parameters
                    .entry(parameter.clone())
                    .or_insert_with(|| default.clone());
            }
        }

        let qualified_name = format_task_name(&kind, &parameters);
        let mut instances = self
            .instances
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let instance = instances
            .entry(qualified_name.clone())
            .or_insert_with(|| {
                Arc::new(TaskInstance {
                    definition: definition.clone(),
                    parameters,
                    qualified_name,
                })
            });
        Ok(instance.clone())
    }
}
