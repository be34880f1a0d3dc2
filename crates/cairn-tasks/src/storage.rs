//! Remote artifact storage
//!
//! Storage providers move transfer archives between the local cache and a
//! shared location. The cache produces and consumes the archive at
//! [`ArtifactRef::archive`]; providers only copy it.

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, info};

use crate::error::StorageError;
use crate::influence::Identity;

/// Location of an artifact as seen by storage providers
#[derive(Debug, Clone)]
pub struct ArtifactRef {
    /// Canonical kind name
    pub kind: String,
    /// Qualified name of the producing task
    pub task: String,
    /// Artifact identity
    pub identity: Identity,
    /// Local path of the transfer archive
    pub archive: PathBuf,
}

impl ArtifactRef {
    /// Archive file name, `<identity>.tar.gz`
    pub fn archive_name(&self) -> String {
        format!("{}.tar.gz", self.identity)
    }
}

/// A remote location artifacts can be fetched from and published to
#[async_trait]
pub trait StorageProvider: Send + Sync + fmt::Debug {
    /// Provider name for diagnostics
    fn name(&self) -> &str;

    /// Fetch the archive into `artifact.archive`. Returns false if the
    /// provider does not have the artifact.
    async fn download(&self, artifact: &ArtifactRef, force: bool) -> Result<bool, StorageError>;

    /// Publish the archive at `artifact.archive`. Returns false if the
    /// provider refused the artifact.
    async fn upload(&self, artifact: &ArtifactRef, force: bool) -> Result<bool, StorageError>;

    /// URL of the stored artifact, `None` if the provider does not have it
    async fn location(&self, artifact: &ArtifactRef) -> Result<Option<String>, StorageError>;
}

/// Storage backed by a shared directory, e.g. a network mount.
///
/// Archives are stored as `<root>/<kind>/<identity>.tar.gz`.
#[derive(Debug, Clone)]
pub struct DirectoryStorage {
    root: PathBuf,
}

impl DirectoryStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn remote_path(&self, artifact: &ArtifactRef) -> PathBuf {
        self.root.join(&artifact.kind).join(artifact.archive_name())
    }
}

#[async_trait]
impl StorageProvider for DirectoryStorage {
    fn name(&self) -> &str {
        "directory"
    }

    async fn download(&self, artifact: &ArtifactRef, _force: bool) -> Result<bool, StorageError> {
        let remote = self.remote_path(artifact);
        if !tokio::fs::try_exists(&remote).await? {
            debug!(task = %artifact.task, "not found in directory storage");
            return Ok(false);
        }

        if let Some(parent) = artifact.archive.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(&remote, &artifact.archive).await?;
        info!(task = %artifact.task, from = %remote.display(), "downloaded artifact");
        Ok(true)
    }

    async fn upload(&self, artifact: &ArtifactRef, force: bool) -> Result<bool, StorageError> {
        let remote = self.remote_path(artifact);
        if !force && tokio::fs::try_exists(&remote).await? {
            debug!(task = %artifact.task, "already present in directory storage");
            return Ok(true);
        }

        if let Some(parent) = remote.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Copy under a temporary name so readers never see a partial archive
        let partial = remote.with_extension("partial");
        tokio::fs::copy(&artifact.archive, &partial).await?;
        tokio::fs::rename(&partial, &remote).await?;
        info!(task = %artifact.task, to = %remote.display(), "uploaded artifact");
        Ok(true)
    }

    async fn location(&self, artifact: &ArtifactRef) -> Result<Option<String>, StorageError> {
        let remote = self.remote_path(artifact);
        if !tokio::fs::try_exists(&remote).await? {
            return Ok(None);
        }

        let remote = if remote.is_absolute() {
            remote
        } else {
            std::env::current_dir()?.join(remote)
        };
        let url = url::Url::from_file_path(&remote).map_err(|_| StorageError::Unavailable {
            provider: self.name().to_string(),
            message: format!("'{}' cannot be expressed as a URL", remote.display()),
        })?;
        Ok(Some(url.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn artifact(local: &Path) -> ArtifactRef {
        ArtifactRef {
            kind: "toolchain_gcc".to_string(),
            task: "toolchain/gcc".to_string(),
            identity: Identity::new("abc123"),
            archive: local.join("toolchain_gcc").join("abc123.tar.gz"),
        }
    }

    #[tokio::test]
    async fn test_directory_storage_round_trip() {
        let remote = TempDir::new().unwrap();
        let local = TempDir::new().unwrap();
        let storage = DirectoryStorage::new(remote.path());
        let artifact = artifact(local.path());

        assert!(!storage.download(&artifact, false).await.unwrap());
        assert!(storage.location(&artifact).await.unwrap().is_none());

        std::fs::create_dir_all(artifact.archive.parent().unwrap()).unwrap();
        std::fs::write(&artifact.archive, b"archive").unwrap();
        assert!(storage.upload(&artifact, false).await.unwrap());
        assert!(remote.path().join("toolchain_gcc/abc123.tar.gz").exists());

        let location = storage.location(&artifact).await.unwrap().unwrap();
        assert!(location.starts_with("file://"));
        assert!(location.ends_with("toolchain_gcc/abc123.tar.gz"));

        std::fs::remove_file(&artifact.archive).unwrap();
        assert!(storage.download(&artifact, false).await.unwrap());
        assert_eq!(std::fs::read(&artifact.archive).unwrap(), b"archive");
    }

    #[tokio::test]
    async fn test_upload_skips_existing_unless_forced() {
        let remote = TempDir::new().unwrap();
        let local = TempDir::new().unwrap();
        let storage = DirectoryStorage::new(remote.path());
        let artifact = artifact(local.path());
        let stored = remote.path().join("toolchain_gcc/abc123.tar.gz");

        std::fs::create_dir_all(stored.parent().unwrap()).unwrap();
        std::fs::write(&stored, b"old").unwrap();
        std::fs::create_dir_all(artifact.archive.parent().unwrap()).unwrap();
        std::fs::write(&artifact.archive, b"new").unwrap();

        assert!(storage.upload(&artifact, false).await.unwrap());
        assert_eq!(std::fs::read(&stored).unwrap(), b"old");

        assert!(storage.upload(&artifact, true).await.unwrap());
        assert_eq!(std::fs::read(&stored).unwrap(), b"new");
    }
}
