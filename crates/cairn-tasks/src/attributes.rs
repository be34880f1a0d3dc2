//! Artifact attributes and the isolated task environment
//!
//! Attributes are typed values a task publishes alongside its output, grouped
//! into named sets owned by an [`AttributeProvider`]. They are stored in the
//! artifact manifest and applied to the environment of every task that
//! consumes the artifact.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use crate::error::CacheError;

/// Environment variables holding search paths
pub const PATH_LIST_VARIABLES: &[&str] = &["PATH", "LD_LIBRARY_PATH", "PKG_CONFIG_PATH"];

#[cfg(windows)]
const PATH_SEPARATOR: char = ';';
#[cfg(not(windows))]
const PATH_SEPARATOR: char = ':';

/// A single published attribute
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Attribute {
    /// Free-form text with no effect on the environment
    Text(String),
    /// Environment variable set to a literal value
    Environ(String),
    /// Search path entries relative to the artifact, prepended to a variable
    PathList(Vec<String>),
}

/// Attributes of one set, keyed by name
pub type AttributeSet = BTreeMap<String, Attribute>;

/// All attributes of an artifact, keyed by set name
pub type Attributes = BTreeMap<String, AttributeSet>;

/// Owner of a named attribute set
pub trait AttributeProvider: Send + Sync + fmt::Debug {
    /// Set name, as stored in the manifest
    fn name(&self) -> &'static str;

    /// Create a typed attribute from a raw published value
    fn create(&self, key: &str, value: &str) -> Attribute;

    /// Apply an attribute of an artifact located at `artifact`
    fn apply(
        &self,
        key: &str,
        attribute: &Attribute,
        artifact: &Path,
        env: &mut EnvironmentScope<'_>,
    );
}

/// Environment exports, the `environ` set
#[derive(Debug, Default)]
pub struct EnvironProvider;

impl AttributeProvider for EnvironProvider {
    fn name(&self) -> &'static str {
        "environ"
    }

    fn create(&self, key: &str, value: &str) -> Attribute {
        if PATH_LIST_VARIABLES.contains(&key) {
            Attribute::PathList(
                value
                    .split(PATH_SEPARATOR)
                    .filter(|entry| !entry.is_empty())
                    .map(str::to_string)
                    .collect(),
            )
        } else {
            Attribute::Environ(value.to_string())
        }
    }

    fn apply(
        &self,
        key: &str,
        attribute: &Attribute,
        artifact: &Path,
        env: &mut EnvironmentScope<'_>,
    ) {
        match attribute {
            Attribute::Environ(value) => env.set(key, value),
            Attribute::PathList(entries) => {
                // Prepend in reverse so the first entry ends up first
                for entry in entries.iter().rev() {
                    env.prepend_path(key, &artifact.join(entry).to_string_lossy());
                }
            }
            Attribute::Text(_) => {}
        }
    }
}

/// Free-form strings, the `strings` set
#[derive(Debug, Default)]
pub struct StringsProvider;

impl AttributeProvider for StringsProvider {
    fn name(&self) -> &'static str {
        "strings"
    }

    fn create(&self, _key: &str, value: &str) -> Attribute {
        Attribute::Text(value.to_string())
    }

    fn apply(
        &self,
        _key: &str,
        _attribute: &Attribute,
        _artifact: &Path,
        _env: &mut EnvironmentScope<'_>,
    ) {
    }
}

/// Registry of attribute providers
#[derive(Debug, Default)]
pub struct AttributeRegistry {
    providers: Vec<Arc<dyn AttributeProvider>>,
}

impl AttributeRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the `environ` and `strings` providers
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(EnvironProvider));
        registry.register(Arc::new(StringsProvider));
        registry
    }

    pub fn register(&mut self, provider: Arc<dyn AttributeProvider>) {
        self.providers.push(provider);
    }

    fn provider(&self, set: &str) -> Option<&Arc<dyn AttributeProvider>> {
        self.providers.iter().find(|p| p.name() == set)
    }

    /// Create an attribute in `set` and store it in `attributes`
    pub fn publish(
        &self,
        attributes: &mut Attributes,
        set: &str,
        key: &str,
        value: &str,
    ) -> Result<(), CacheError> {
        let provider = self
            .provider(set)
            .ok_or_else(|| CacheError::UnknownAttributeSet(set.to_string()))?;
        attributes
            .entry(set.to_string())
            .or_default()
            .insert(key.to_string(), provider.create(key, value));
        Ok(())
    }

    /// Serialize attributes for the manifest
    pub fn format(&self, attributes: &Attributes) -> Result<serde_json::Value, CacheError> {
        for set in attributes.keys() {
            if self.provider(set).is_none() {
                return Err(CacheError::UnknownAttributeSet(set.clone()));
            }
        }
        Ok(serde_json::to_value(attributes)?)
    }

    /// Parse attributes from a manifest, skipping sets nobody provides
    pub fn parse(&self, value: serde_json::Value) -> Result<Attributes, CacheError> {
        let mut attributes: Attributes = serde_json::from_value(value)?;
        attributes.retain(|set, _| {
            let known = self.provider(set).is_some();
            if !known {
                warn!(set = %set, "ignoring unknown attribute set");
            }
            known
        });
        Ok(attributes)
    }

    /// Apply the attributes of the artifact at `artifact` to `env`
    pub fn apply(&self, attributes: &Attributes, artifact: &Path, env: &mut EnvironmentScope<'_>) {
        for (set, values) in attributes {
            let Some(provider) = self.provider(set) else {
                continue;
            };
            for (key, attribute) in values {
                trace!(set = %set, key = %key, "applying attribute");
                provider.apply(key, attribute, artifact, env);
            }
        }
    }
}

/// Environment variables of a single task execution
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environment {
    vars: BTreeMap<String, String>,
}

impl Environment {
    /// Create an empty environment
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the current process environment
    pub fn from_process() -> Self {
        let vars = std::env::vars_os()
            .filter_map(|(key, value)| Some((key.into_string().ok()?, value.into_string().ok()?)))
            .collect();
        Self { vars }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.vars.iter()
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Start a scope whose changes are reverted when it is dropped
    pub fn scope(&mut self) -> EnvironmentScope<'_> {
        EnvironmentScope {
            env: self,
            saved: Vec::new(),
        }
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Environment {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            vars: iter
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        }
    }
}

/// Scoped modification of an [`Environment`].
///
/// Every change made through the scope is undone, in reverse order, when the
/// scope is dropped.
#[derive(Debug)]
pub struct EnvironmentScope<'a> {
    env: &'a mut Environment,
    saved: Vec<(String, Option<String>)>,
}

impl EnvironmentScope<'_> {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.env.get(key)
    }

    /// The environment with all changes applied
    pub fn env(&self) -> &Environment {
        self.env
    }

    pub fn set(&mut self, key: &str, value: &str) {
        let previous = self.env.vars.insert(key.to_string(), value.to_string());
        self.saved.push((key.to_string(), previous));
    }

    pub fn remove(&mut self, key: &str) {
        let previous = self.env.vars.remove(key);
        self.saved.push((key.to_string(), previous));
    }

    /// Prepend `entry` to a search path variable
    pub fn prepend_path(&mut self, key: &str, entry: &str) {
        let value = match self.env.get(key) {
            Some(current) if !current.is_empty() => {
                format!("{}{}{}", entry, PATH_SEPARATOR, current)
            }
            _ => entry.to_string(),
        };
        self.set(key, &value);
    }
}

impl Drop for EnvironmentScope<'_> {
    fn drop(&mut self) {
        while let Some((key, previous)) = self.saved.pop() {
            match previous {
                Some(value) => self.env.vars.insert(key, value),
                None => self.env.vars.remove(&key),
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn sep(entries: &[&str]) -> String {
        entries.join(PATH_SEPARATOR.to_string().as_str())
    }

    #[test]
    fn test_environ_create() {
        let provider = EnvironProvider;
        assert_eq!(
            provider.create("PATH", &sep(&["bin", "sbin"])),
            Attribute::PathList(vec!["bin".to_string(), "sbin".to_string()])
        );
        assert_eq!(
            provider.create("CC", "gcc"),
            Attribute::Environ("gcc".to_string())
        );
    }

    #[test]
    fn test_scope_restores_on_drop() {
        let mut env: Environment = [("PATH", "/usr/bin"), ("HOME", "/home/user")]
            .into_iter()
            .collect();
        let original = env.clone();

        {
            let mut scope = env.scope();
            scope.set("CC", "clang");
            scope.prepend_path("PATH", "/opt/bin");
            scope.remove("HOME");
            scope.set("CC", "gcc");

            assert_eq!(scope.get("CC"), Some("gcc"));
            assert_eq!(scope.get("PATH"), Some(sep(&["/opt/bin", "/usr/bin"]).as_str()));
            assert_eq!(scope.get("HOME"), None);
        }

        assert_eq!(env, original);
    }

    #[test]
    fn test_registry_apply() {
        let registry = AttributeRegistry::with_defaults();
        let mut attributes = Attributes::new();
        registry
            .publish(&mut attributes, "environ", "PATH", &sep(&["bin", "tools"]))
            .unwrap();
        registry
            .publish(&mut attributes, "environ", "CC", "gcc")
            .unwrap();
        registry
            .publish(&mut attributes, "strings", "version", "1.0")
            .unwrap();

        let artifact = PathBuf::from("/cache/compiler/abc");
        let mut env: Environment = [("PATH", "/usr/bin")].into_iter().collect();
        let mut scope = env.scope();
        registry.apply(&attributes, &artifact, &mut scope);

        let bin = artifact.join("bin").to_string_lossy().to_string();
        let tools = artifact.join("tools").to_string_lossy().to_string();
        let expected = sep(&[bin.as_str(), tools.as_str(), "/usr/bin"]);
        assert_eq!(scope.get("PATH"), Some(expected.as_str()));
        assert_eq!(scope.get("CC"), Some("gcc"));
        assert_eq!(scope.get("version"), None);
    }

    #[test]
    fn test_publish_unknown_set() {
        let registry = AttributeRegistry::with_defaults();
        let mut attributes = Attributes::new();
        assert!(matches!(
            registry.publish(&mut attributes, "metrics", "k", "v"),
            Err(CacheError::UnknownAttributeSet(_))
        ));
    }

    #[test]
    fn test_format_and_parse() {
        let registry = AttributeRegistry::with_defaults();
        let mut attributes = Attributes::new();
        registry
            .publish(&mut attributes, "environ", "LD_LIBRARY_PATH", "lib")
            .unwrap();

        let value = registry.format(&attributes).unwrap();
        assert_eq!(
            value["environ"]["LD_LIBRARY_PATH"],
            serde_json::json!({ "type": "path_list", "value": ["lib"] })
        );
        assert_eq!(registry.parse(value).unwrap(), attributes);

        let unknown = serde_json::json!({ "metrics": { "k": { "type": "text", "value": "v" } } });
        assert!(registry.parse(unknown).unwrap().is_empty());
    }
}
