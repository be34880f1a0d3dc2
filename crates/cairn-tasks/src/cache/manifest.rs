//! Artifact manifest

use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CacheError;
use crate::influence::Identity;
use crate::task::Parameters;

/// Manifest file name inside an artifact directory
pub const MANIFEST_FILE: &str = ".manifest.json";

/// Description of a committed artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Qualified name of the producing task
    pub task: String,
    /// Identity the artifact is stored under
    pub identity: Identity,
    /// Total size of the artifact content in bytes
    pub size: u64,
    /// Whether post-fetch materialization has run
    #[serde(default)]
    pub unpacked: bool,
    /// Qualified names of the direct dependencies
    #[serde(default)]
    pub requires: Vec<String>,
    /// Resolved parameters
    #[serde(default)]
    pub parameters: Parameters,
    /// Influence strings the identity was computed from
    #[serde(default)]
    pub influence: Vec<String>,
    /// Published attributes, keyed by attribute set
    #[serde(default)]
    pub attributes: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Manifest {
    /// Read the manifest of the artifact in `dir`
    pub fn read(dir: &Path) -> Result<Self, CacheError> {
        let path = dir.join(MANIFEST_FILE);
        let contents = fs::read_to_string(&path)?;
        serde_json::from_str(&contents).map_err(|e| CacheError::CorruptManifest {
            path,
            message: e.to_string(),
        })
    }

    /// Write the manifest into `dir`
    pub fn write(&self, dir: &Path) -> Result<(), CacheError> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(dir.join(MANIFEST_FILE), json)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_corrupt_manifest_is_reported() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join(MANIFEST_FILE), "{ not json").unwrap();

        assert!(matches!(
            Manifest::read(temp.path()),
            Err(CacheError::CorruptManifest { .. })
        ));
    }

    #[test]
    fn test_missing_optional_fields() {
        let temp = TempDir::new().unwrap();
        fs::write(
            temp.path().join(MANIFEST_FILE),
            r#"{"task":"app","identity":"abc","size":3,"created_at":"2024-01-01T00:00:00Z"}"#,
        )
        .unwrap();

        let manifest = Manifest::read(temp.path()).unwrap();
        assert!(!manifest.unpacked);
        assert!(manifest.requires.is_empty());
        assert!(manifest.attributes.is_null());
    }
}
