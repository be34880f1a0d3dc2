//! Configuration types

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Main configuration for Cairn
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Project name
    pub name: Option<String>,

    /// Artifact cache configuration
    pub cache: CacheConfig,

    /// Scheduler configuration
    pub scheduler: SchedulerConfig,

    /// Remote storage configuration
    pub storage: StorageConfig,

    /// Task definitions, keyed by task kind name
    pub tasks: BTreeMap<String, TaskConfig>,
}

/// Artifact cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Cache root directory (`~` is expanded)
    pub root: PathBuf,

    /// Maximum cache size in bytes, zero disables eviction.
    ///
    /// Accepts plain integers or strings with a `K`, `M`, `G` or `T` suffix.
    #[serde(deserialize_with = "deserialize_size")]
    pub max_size: u64,

    /// Whether artifacts may be downloaded from remote storage
    pub download: bool,

    /// Whether artifacts are uploaded to remote storage after a build
    pub upload: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root: default_cache_root(),
            max_size: 0,
            download: true,
            upload: true,
        }
    }
}

impl CacheConfig {
    /// Cache root with a leading `~` replaced by the home directory
    pub fn resolved_root(&self) -> PathBuf {
        expand_home(&self.root)
    }
}

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum number of tasks executing at the same time
    pub concurrency: usize,

    /// Prefer network executors over local execution
    pub network: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            network: false,
        }
    }
}

/// Remote storage configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Shared directory used as a remote artifact store
    pub directory: Option<DirectoryStorageConfig>,
}

/// Directory-backed remote storage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryStorageConfig {
    /// Root of the shared directory
    pub path: PathBuf,
}

/// A task kind declared in the configuration file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    /// Shell command to execute, parameters are expanded with `{name}`
    pub command: Option<String>,

    /// Requirement expressions, e.g. `compiler:arch={arch}`
    pub requires: Vec<String>,

    /// Parameter schema
    pub parameters: BTreeMap<String, ParameterConfig>,

    /// Whether the output is stored in the artifact cache
    pub cacheable: bool,

    /// File globs whose content influences the task identity
    pub influence: Vec<String>,

    /// Environment variables whose value influences the task identity
    pub environ_influence: Vec<String>,

    /// Git working trees whose state influences the task identity
    pub git_influence: Vec<PathBuf>,

    /// Environment variables exported to consumers of the artifact
    pub exports: BTreeMap<String, String>,

    /// Free-form string attributes recorded in the artifact
    pub strings: BTreeMap<String, String>,

    /// Command run once in the artifact directory after it lands in the cache
    pub unpack: Option<String>,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            command: None,
            requires: Vec::new(),
            parameters: BTreeMap::new(),
            cacheable: true,
            influence: Vec::new(),
            environ_influence: Vec::new(),
            git_influence: Vec::new(),
            exports: BTreeMap::new(),
            strings: BTreeMap::new(),
            unpack: None,
        }
    }
}

/// Declaration of a single task parameter
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ParameterConfig {
    /// Default value
    pub default: Option<String>,

    /// Accepted values, any value is accepted when absent
    pub values: Option<Vec<String>>,

    /// Help text
    pub help: Option<String>,
}

fn default_cache_root() -> PathBuf {
    dirs::cache_dir()
        .map(|dir| dir.join("cairn"))
        .unwrap_or_else(|| PathBuf::from(".cairn/cache"))
}

fn expand_home(path: &std::path::Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| path.to_path_buf()),
        Err(_) => path.to_path_buf(),
    }
}

/// Parse a human readable size such as `512M` or `10GiB` into bytes
pub fn parse_size(value: &str) -> Option<u64> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (digits, suffix) = value.split_at(split);
    let number: u64 = digits.parse().ok()?;

    let unit = suffix
        .trim()
        .trim_end_matches("iB")
        .trim_end_matches('B')
        .to_ascii_uppercase();
    let multiplier: u64 = match unit.as_str() {
        "" => 1,
        "K" => 1 << 10,
        "M" => 1 << 20,
        "G" => 1 << 30,
        "T" => 1 << 40,
        _ => return None,
    };
    number.checked_mul(multiplier)
}

fn deserialize_size<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum SizeRepr {
        Bytes(u64),
        Text(String),
    }

    match SizeRepr::deserialize(deserializer)? {
        SizeRepr::Bytes(bytes) => Ok(bytes),
        SizeRepr::Text(text) => parse_size(&text)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid size '{}'", text))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("0"), Some(0));
        assert_eq!(parse_size("1024"), Some(1024));
        assert_eq!(parse_size("4K"), Some(4096));
        assert_eq!(parse_size("512M"), Some(512 * 1024 * 1024));
        assert_eq!(parse_size("10GiB"), Some(10 * 1024 * 1024 * 1024));
        assert_eq!(parse_size("2 GB"), Some(2 * 1024 * 1024 * 1024));
        assert_eq!(parse_size("10X"), None);
        assert_eq!(parse_size("G"), None);
    }

    #[test]
    fn test_max_size_accepts_integer_and_suffix() {
        let cache: CacheConfig = toml::from_str("max_size = 2048").unwrap();
        assert_eq!(cache.max_size, 2048);

        let cache: CacheConfig = toml::from_str("max_size = \"1M\"").unwrap();
        assert_eq!(cache.max_size, 1 << 20);

        assert!(toml::from_str::<CacheConfig>("max_size = \"lots\"").is_err());
    }

    #[test]
    fn test_task_config_defaults() {
        let task: TaskConfig = toml::from_str("command = \"true\"").unwrap();
        assert!(task.cacheable);
        assert!(task.requires.is_empty());
        assert!(task.unpack.is_none());
    }

    #[test]
    fn test_expand_home() {
        let cache = CacheConfig {
            root: PathBuf::from("/var/cache/cairn"),
            ..Default::default()
        };
        assert_eq!(cache.resolved_root(), PathBuf::from("/var/cache/cairn"));

        if let Some(home) = dirs::home_dir() {
            let cache = CacheConfig {
                root: PathBuf::from("~/.cache/cairn"),
                ..Default::default()
            };
            assert_eq!(cache.resolved_root(), home.join(".cache/cairn"));
        }
    }
}
