//! Content-addressed artifact cache
//!
//! Artifacts live at `<root>/<canonical kind>/<identity>/`. New artifacts are
//! produced in a private staging directory next to their final location and
//! become visible only when [`ArtifactCache::commit`] moves them into place.
//! Every committed artifact is recorded in the [`CacheIndex`], which drives
//! least-recently-used eviction once the cache grows past its size budget.

mod archive;
mod index;
mod manifest;

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use tempfile::TempDir;
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

use cairn_core::CacheConfig;

use crate::attributes::{AttributeRegistry, Attributes};
use crate::error::CacheError;
use crate::graph::GraphNode;
use crate::influence::Identity;
use crate::storage::{ArtifactRef, StorageProvider};

pub use archive::{compress, decompress};
pub use index::{ActiveLease, ActiveSet, CacheIndex, IndexEntry, INDEX_FILE};
pub use manifest::{Manifest, MANIFEST_FILE};

/// Options for opening an [`ArtifactCache`]
#[derive(Debug, Clone)]
pub struct CacheOptions {
    /// Cache root directory
    pub root: PathBuf,
    /// Size budget in bytes, zero disables eviction
    pub max_size: u64,
    /// Whether artifacts may be downloaded from storage providers
    pub download: bool,
    /// Whether artifacts are uploaded to storage providers
    pub upload: bool,
}

impl CacheOptions {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            max_size: 0,
            download: true,
            upload: true,
        }
    }
}

impl From<&CacheConfig> for CacheOptions {
    fn from(config: &CacheConfig) -> Self {
        Self {
            root: config.resolved_root(),
            max_size: config.max_size,
            download: config.download,
            upload: config.upload,
        }
    }
}

/// An artifact under construction.
///
/// The staging directory is removed when the value is dropped without being
/// committed.
#[derive(Debug)]
pub struct StagedArtifact {
    node: Arc<GraphNode>,
    dir: TempDir,
    attributes: Attributes,
}

impl StagedArtifact {
    /// Directory the task writes its output into
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn node(&self) -> &Arc<GraphNode> {
        &self.node
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    pub fn set_attributes(&mut self, attributes: Attributes) {
        self.attributes = attributes;
    }
}

/// Cache statistics
#[derive(Debug, Default, Clone)]
pub struct CacheStats {
    /// Number of committed artifacts
    pub entries: usize,
    /// Total size in bytes
    pub total_size: u64,
    /// Size budget in bytes, zero when unlimited
    pub max_size: u64,
}

impl CacheStats {
    /// Format total size in human-readable form
    pub fn formatted_size(&self) -> String {
        format_size(self.total_size)
    }
}

/// Format a byte count in human-readable form
pub fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.1} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Statistics from an eviction pass
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EvictionStats {
    /// Artifacts removed
    pub evicted: usize,
    /// Bytes freed
    pub freed: u64,
    /// Cache size after the pass
    pub remaining: u64,
}

/// Content-addressed store of task artifacts
#[derive(Debug)]
pub struct ArtifactCache {
    root: PathBuf,
    max_size: u64,
    download: bool,
    upload: bool,
    index: Mutex<CacheIndex>,
    active: ActiveSet,
    storage: Vec<Arc<dyn StorageProvider>>,
    attributes: Arc<AttributeRegistry>,
    locks: Mutex<HashMap<Identity, Arc<tokio::sync::Mutex<()>>>>,
}

impl ArtifactCache {
    /// Open the cache, creating the root directory if needed
    pub fn open(
        options: CacheOptions,
        attributes: Arc<AttributeRegistry>,
    ) -> Result<Self, CacheError> {
        if options.root.as_os_str().is_empty() {
            return Err(CacheError::InvalidRoot {
                path: options.root,
                message: "path is empty".to_string(),
            });
        }
        fs::create_dir_all(&options.root).map_err(|e| CacheError::InvalidRoot {
            path: options.root.clone(),
            message: e.to_string(),
        })?;

        let index = CacheIndex::load(&options.root)?;
        info!(
            root = %options.root.display(),
            entries = index.len(),
            max_size = options.max_size,
            "opened artifact cache"
        );

        Ok(Self {
            root: options.root,
            max_size: options.max_size,
            download: options.download,
            upload: options.upload,
            index: Mutex::new(index),
            active: ActiveSet::new(),
            storage: Vec::new(),
            attributes,
            locks: Mutex::new(HashMap::new()),
        })
    }

    /// Add a storage provider, tried after the ones already registered
    pub fn with_storage(mut self, provider: Arc<dyn StorageProvider>) -> Self {
        self.storage.push(provider);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    pub fn download_enabled(&self) -> bool {
        self.download
    }

    pub fn upload_enabled(&self) -> bool {
        self.upload
    }

    pub fn has_storage(&self) -> bool {
        !self.storage.is_empty()
    }

    pub fn active(&self) -> &ActiveSet {
        &self.active
    }

    pub fn attributes(&self) -> &Arc<AttributeRegistry> {
        &self.attributes
    }

    fn index(&self) -> MutexGuard<'_, CacheIndex> {
        self.index.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lock serializing work on one identity within this process
    pub fn lock(&self, identity: &Identity) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(identity.clone())
            .or_default()
            .clone()
    }

    /// Final location of a node's artifact; it may not exist
    pub fn get_path(&self, node: &GraphNode) -> PathBuf {
        self.root
            .join(node.canonical_name())
            .join(node.identity().as_str())
    }

    /// Location of a node's transfer archive
    pub fn archive_path(&self, node: &GraphNode) -> PathBuf {
        self.root
            .join(node.canonical_name())
            .join(format!("{}.tar.gz", node.identity()))
    }

    fn artifact_ref(&self, node: &GraphNode) -> ArtifactRef {
        ArtifactRef {
            kind: node.canonical_name(),
            task: node.qualified_name().to_string(),
            identity: node.identity().clone(),
            archive: self.archive_path(node),
        }
    }

    /// Whether a committed artifact exists locally
    pub fn is_available_locally(&self, node: &GraphNode) -> bool {
        node.is_cacheable() && self.get_path(node).join(MANIFEST_FILE).is_file()
    }

    /// Whether any storage provider has the artifact
    pub async fn is_available_remotely(&self, node: &GraphNode) -> bool {
        if !node.is_cacheable() || !self.download {
            return false;
        }
        self.location(node).await.is_some()
    }

    /// Whether the artifact is available locally, or remotely when `remote`
    pub async fn is_available(&self, node: &GraphNode, remote: bool) -> bool {
        self.is_available_locally(node) || (remote && self.is_available_remotely(node).await)
    }

    /// Read the manifest of a committed artifact
    pub fn manifest(&self, node: &GraphNode) -> Result<Manifest, CacheError> {
        if !self.is_available_locally(node) {
            return Err(CacheError::NotCommitted(node.qualified_name().to_string()));
        }
        Manifest::read(&self.get_path(node))
    }

    /// Published attributes of a committed artifact
    pub fn artifact_attributes(&self, node: &GraphNode) -> Result<Attributes, CacheError> {
        let manifest = self.manifest(node)?;
        self.attributes.parse(manifest.attributes)
    }

    /// Record that a committed artifact was used
    pub fn touch(&self, node: &GraphNode) -> Result<(), CacheError> {
        let mut index = self.index();
        if index.touch(node.identity()) {
            index.save()?;
        }
        Ok(())
    }

    /// Allocate a private staging directory for a node's output
    pub fn stage(&self, node: Arc<GraphNode>) -> Result<StagedArtifact, CacheError> {
        let kind_dir = self.root.join(node.canonical_name());
        fs::create_dir_all(&kind_dir)?;
        let dir = tempfile::Builder::new()
            .prefix(".stage-")
            .tempdir_in(&kind_dir)?;
        debug!(task = %node.qualified_name(), staging = %dir.path().display(), "staged artifact");
        Ok(StagedArtifact {
            node,
            dir,
            attributes: Attributes::new(),
        })
    }

    /// Commit a staged artifact under its identity.
    ///
    /// Committing an identity that already exists discards the staged copy.
    /// Non-cacheable artifacts are discarded.
    #[instrument(
        skip_all,
        fields(task = %staged.node.qualified_name(), identity = %staged.node.identity().short())
    )]
    pub fn commit(&self, staged: StagedArtifact) -> Result<(), CacheError> {
        let node = staged.node.clone();
        if !node.is_cacheable() {
            return Ok(());
        }

        let final_path = self.get_path(&node);
        if final_path.join(MANIFEST_FILE).is_file() {
            debug!("artifact already committed");
            return self.touch(&node);
        }

        let size = directory_size(staged.path())?;
        let manifest = Manifest {
            task: node.qualified_name().to_string(),
            identity: node.identity().clone(),
            size,
            unpacked: false,
            requires: node
                .dependencies()
                .iter()
                .map(|dep| dep.qualified_name().to_string())
                .collect(),
            parameters: node.instance().parameters().clone(),
            influence: node.influence().to_vec(),
            attributes: self.attributes.format(&staged.attributes)?,
            created_at: Utc::now(),
        };
        manifest.write(staged.path())?;

        // A leftover directory without a manifest is an interrupted commit
        if final_path.exists() {
            fs::remove_dir_all(&final_path)?;
        }
        let staging = staged.dir.into_path();
        if let Err(e) = fs::rename(&staging, &final_path) {
            let _ = fs::remove_dir_all(&staging);
            return Err(e.into());
        }

        {
            let mut index = self.index();
            index.insert(
                node.identity().clone(),
                IndexEntry {
                    kind: node.canonical_name(),
                    size,
                    last_used: manifest.created_at,
                },
            );
            index.save()?;
        }
        info!(size, "committed artifact");

        self.evict()?;
        Ok(())
    }

    /// Drop a staged artifact, any transfer archive of the node and an
    /// uncommitted final directory
    pub fn discard(&self, staged: StagedArtifact) {
        let archive = self.archive_path(&staged.node);
        if archive.exists() {
            let _ = fs::remove_file(&archive);
        }
        let final_path = self.get_path(&staged.node);
        if final_path.exists() && !final_path.join(MANIFEST_FILE).is_file() {
            let _ = fs::remove_dir_all(&final_path);
        }
        debug!(task = %staged.node.qualified_name(), "discarded staged artifact");
    }

    /// Remove least recently used artifacts until the cache fits its budget.
    ///
    /// Active artifacts are never removed; the pass stops early if only
    /// active artifacts remain.
    #[instrument(skip(self))]
    pub fn evict(&self) -> Result<EvictionStats, CacheError> {
        let mut index = self.index();
        let mut stats = EvictionStats {
            remaining: index.total_size(),
            ..Default::default()
        };
        if self.max_size == 0 || stats.remaining <= self.max_size {
            return Ok(stats);
        }

        let active = self.active.snapshot();
        for (identity, entry) in index.eviction_candidates(&active) {
            if stats.remaining <= self.max_size {
                break;
            }

            let path = self.root.join(&entry.kind).join(identity.as_str());
            if path.exists() {
                fs::remove_dir_all(&path)?;
            }
            index.remove(&identity);
            stats.evicted += 1;
            stats.freed += entry.size;
            stats.remaining -= entry.size;
            debug!(
                identity = %identity.short(),
                kind = %entry.kind,
                size = entry.size,
                "evicted artifact"
            );
        }

        index.save()?;
        if stats.remaining > self.max_size {
            warn!(
                remaining = stats.remaining,
                max_size = self.max_size,
                "cache exceeds budget, remaining artifacts are in use"
            );
        }
        info!(evicted = stats.evicted, freed = stats.freed, "eviction complete");
        Ok(stats)
    }

    /// Fetch an artifact from the first storage provider that has it.
    ///
    /// Returns true when the artifact is now available locally, or when
    /// there is nothing to download from. When no provider delivers the
    /// artifact, the last transfer error is returned.
    pub async fn download(&self, node: &GraphNode, force: bool) -> Result<bool, CacheError> {
        if !node.is_cacheable() || (!self.download && !force) {
            return Ok(true);
        }
        if !force && self.is_available_locally(node) {
            return Ok(true);
        }

        let artifact = self.artifact_ref(node);
        if let Some(parent) = artifact.archive.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut failure = None;
        for provider in &self.storage {
            match provider.download(&artifact, force).await {
                Ok(true) => {
                    let result = self.install_archive(node);
                    let _ = fs::remove_file(&artifact.archive);
                    result?;
                    info!(
                        task = %node.qualified_name(),
                        provider = provider.name(),
                        "downloaded artifact"
                    );
                    return Ok(true);
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(
                        task = %node.qualified_name(),
                        provider = provider.name(),
                        error = %e,
                        "download failed"
                    );
                    failure = Some(e);
                }
            }
        }

        match failure {
            Some(e) => Err(e.into()),
            None => Ok(self.storage.is_empty()),
        }
    }

    /// Decompress a downloaded archive and commit its content
    fn install_archive(&self, node: &GraphNode) -> Result<(), CacheError> {
        let kind_dir = self.root.join(node.canonical_name());
        let staging = tempfile::Builder::new()
            .prefix(".fetch-")
            .tempdir_in(&kind_dir)?;
        decompress(&self.archive_path(node), staging.path())?;

        let manifest = Manifest::read(staging.path())?;
        if &manifest.identity != node.identity() {
            return Err(CacheError::CorruptManifest {
                path: self.archive_path(node),
                message: format!(
                    "archive holds identity {} instead of {}",
                    manifest.identity,
                    node.identity()
                ),
            });
        }

        let final_path = self.get_path(node);
        if final_path.exists() {
            fs::remove_dir_all(&final_path)?;
        }
        fs::rename(staging.into_path(), &final_path)?;

        {
            let mut index = self.index();
            index.insert(
                node.identity().clone(),
                IndexEntry {
                    kind: node.canonical_name(),
                    size: manifest.size,
                    last_used: Utc::now(),
                },
            );
            index.save()?;
        }

        self.evict()?;
        Ok(())
    }

    /// Publish an artifact to every storage provider.
    ///
    /// Returns true only if all providers accepted it.
    pub async fn upload(&self, node: &GraphNode, force: bool) -> Result<bool, CacheError> {
        if !node.is_cacheable() || (!self.upload && !force) || self.storage.is_empty() {
            return Ok(true);
        }
        if !self.is_available_locally(node) {
            return Err(CacheError::NotCommitted(node.qualified_name().to_string()));
        }

        let artifact = self.artifact_ref(node);
        compress(&self.get_path(node), &artifact.archive)?;

        let mut accepted = true;
        for provider in &self.storage {
            match provider.upload(&artifact, force).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(
                        task = %node.qualified_name(),
                        provider = provider.name(),
                        "upload refused"
                    );
                    accepted = false;
                }
                Err(e) => {
                    warn!(
                        task = %node.qualified_name(),
                        provider = provider.name(),
                        error = %e,
                        "upload failed"
                    );
                    accepted = false;
                }
            }
        }

        let _ = fs::remove_file(&artifact.archive);
        Ok(accepted)
    }

    /// URL of the artifact in the first storage provider that has it
    pub async fn location(&self, node: &GraphNode) -> Option<String> {
        let artifact = self.artifact_ref(node);
        for provider in &self.storage {
            match provider.location(&artifact).await {
                Ok(Some(url)) if !url.is_empty() => return Some(url),
                Ok(_) => {}
                Err(e) => {
                    warn!(
                        task = %node.qualified_name(),
                        provider = provider.name(),
                        error = %e,
                        "location lookup failed"
                    );
                }
            }
        }
        None
    }

    /// Run the task's post-fetch materialization, once per artifact.
    ///
    /// The action works on a copy of the artifact; the committed directory
    /// is only replaced when it succeeds. Takes the identity lock, so it must
    /// not be called while holding it.
    #[instrument(skip_all, fields(task = %node.qualified_name()))]
    pub async fn unpack(&self, node: &GraphNode) -> Result<(), CacheError> {
        if !node.is_cacheable() {
            return Ok(());
        }
        let lock = self.lock(node.identity());
        let _guard = lock.lock().await;
        self.unpack_locked(node).await
    }

    /// [`ArtifactCache::unpack`] for a caller already holding the identity lock
    pub(crate) async fn unpack_locked(&self, node: &GraphNode) -> Result<(), CacheError> {
        if !node.is_cacheable() {
            return Ok(());
        }

        let final_path = self.get_path(node);
        let mut manifest = self.manifest(node)?;
        if manifest.unpacked {
            return Ok(());
        }

        let action = node.instance().action();
        if !action.is_unpackable() {
            manifest.unpacked = true;
            return manifest.write(&final_path);
        }

        let kind_dir = self.root.join(node.canonical_name());
        let staging = tempfile::Builder::new()
            .prefix(".unpack-")
            .tempdir_in(&kind_dir)?;
        copy_tree(&final_path, staging.path())?;

        action
            .unpack(node.instance(), staging.path())
            .await
            .map_err(|e| CacheError::Unpack {
                task: node.qualified_name().to_string(),
                message: format!("{:#}", e),
            })?;

        manifest.unpacked = true;
        manifest.size = directory_size(staging.path())?;
        manifest.write(staging.path())?;

        let backup = kind_dir.join(format!(".backup-{}", node.identity()));
        fs::rename(&final_path, &backup)?;
        if let Err(e) = fs::rename(staging.path(), &final_path) {
            fs::rename(&backup, &final_path)?;
            return Err(e.into());
        }
        // The staging directory has been moved into place
        let _ = staging.into_path();
        fs::remove_dir_all(&backup)?;

        {
            let mut index = self.index();
            if let Some(mut entry) = index.remove(node.identity()) {
                entry.size = manifest.size;
                entry.last_used = Utc::now();
                index.insert(node.identity().clone(), entry);
                index.save()?;
            }
        }

        info!("unpacked artifact");
        Ok(())
    }

    /// Current cache statistics
    pub fn status(&self) -> CacheStats {
        let index = self.index();
        CacheStats {
            entries: index.len(),
            total_size: index.total_size(),
            max_size: self.max_size,
        }
    }

    /// Committed artifacts, least recently used first
    pub fn entries(&self) -> Vec<(Identity, IndexEntry)> {
        self.index().eviction_candidates(&Default::default())
    }

    /// Remove every artifact that is not active. Returns the number removed.
    pub fn clean(&self) -> Result<usize, CacheError> {
        let mut index = self.index();
        let active = self.active.snapshot();
        let mut removed = 0;

        for (identity, entry) in index.eviction_candidates(&active) {
            let path = self.root.join(&entry.kind).join(identity.as_str());
            if path.exists() {
                fs::remove_dir_all(&path)?;
            }
            index.remove(&identity);
            removed += 1;
        }

        index.save()?;
        info!(removed, "cache cleaned");
        Ok(removed)
    }
}

/// Total size of the regular files below `dir`, excluding the manifest
fn directory_size(dir: &Path) -> Result<u64, CacheError> {
    let mut size = 0;
    for entry in WalkDir::new(dir) {
        let entry = entry.map_err(std::io::Error::from)?;
        if entry.depth() == 1 && entry.file_name() == MANIFEST_FILE {
            continue;
        }
        if entry.file_type().is_file() {
            size += entry.metadata().map_err(std::io::Error::from)?.len();
        }
    }
    Ok(size)
}

/// Recursively copy the content of `from` into the existing directory `to`
fn copy_tree(from: &Path, to: &Path) -> Result<(), CacheError> {
    for entry in WalkDir::new(from).min_depth(1) {
        let entry = entry.map_err(std::io::Error::from)?;
        let relative = entry.path().strip_prefix(from).unwrap_or(entry.path());
        let target = to.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            copy_symlink(entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(from: &Path, to: &Path) -> Result<(), CacheError> {
    let target = fs::read_link(from)?;
    std::os::unix::fs::symlink(target, to)?;
    Ok(())
}

#[cfg(not(unix))]
fn copy_symlink(from: &Path, to: &Path) -> Result<(), CacheError> {
    fs::copy(from, to)?;
    Ok(())
}
