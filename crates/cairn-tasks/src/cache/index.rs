//! Persistent index of committed artifacts

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::CacheError;
use crate::influence::Identity;

use super::manifest::Manifest;

/// Index file name inside the cache root
pub const INDEX_FILE: &str = "index.json";

/// Metadata of a committed artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    /// Canonical name of the owning task kind
    pub kind: String,
    /// Artifact size in bytes
    pub size: u64,
    /// Last time the artifact was committed or used
    pub last_used: DateTime<Utc>,
}

/// Index of committed artifacts, persisted as `<root>/index.json`
#[derive(Debug)]
pub struct CacheIndex {
    root: PathBuf,
    entries: BTreeMap<Identity, IndexEntry>,
}

impl CacheIndex {
    /// Load the index, dropping entries whose artifact directory is gone.
    ///
    /// An unreadable index is rebuilt from the artifact manifests.
    pub fn load(root: &Path) -> Result<Self, CacheError> {
        let path = root.join(INDEX_FILE);
        let mut index = Self {
            root: root.to_path_buf(),
            entries: BTreeMap::new(),
        };

        if !path.exists() {
            return Ok(index);
        }

        match fs::read_to_string(&path)
            .map_err(CacheError::from)
            .and_then(|contents| {
                Ok(serde_json::from_str::<BTreeMap<Identity, IndexEntry>>(
                    &contents,
                )?)
            })
        {
            Ok(entries) => index.entries = entries,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cache index unreadable, rebuilding");
                index.rebuild()?;
                return Ok(index);
            }
        }

        let before = index.entries.len();
        let root = index.root.clone();
        index
            .entries
            .retain(|identity, entry| root.join(&entry.kind).join(identity.as_str()).is_dir());
        let dropped = before - index.entries.len();
        if dropped > 0 {
            warn!(dropped, "dropped stale cache index entries");
            index.save()?;
        }

        debug!(entries = index.entries.len(), "cache index loaded");
        Ok(index)
    }

    /// Recreate the index from the manifests found under the root
    pub fn rebuild(&mut self) -> Result<(), CacheError> {
        self.entries.clear();

        for kind in fs::read_dir(&self.root)? {
            let kind = kind?;
            if !kind.file_type()?.is_dir() {
                continue;
            }
            for artifact in fs::read_dir(kind.path())? {
                let artifact = artifact?;
                let name = artifact.file_name().to_string_lossy().to_string();
                if name.starts_with('.') || !artifact.file_type()?.is_dir() {
                    continue;
                }
                match Manifest::read(&artifact.path()) {
                    Ok(manifest) => {
                        self.entries.insert(
                            manifest.identity,
                            IndexEntry {
                                kind: kind.file_name().to_string_lossy().to_string(),
                                size: manifest.size,
                                last_used: manifest.created_at,
                            },
                        );
                    }
                    Err(e) => {
                        warn!(path = %artifact.path().display(), error = %e, "skipping artifact");
                    }
                }
            }
        }

        self.save()
    }

    /// Persist the index atomically
    pub fn save(&self) -> Result<(), CacheError> {
        let json = serde_json::to_string_pretty(&self.entries)?;
        let mut file = tempfile::NamedTempFile::new_in(&self.root)?;
        file.write_all(json.as_bytes())?;
        file.persist(self.root.join(INDEX_FILE))
            .map_err(|e| CacheError::Io(e.error))?;
        Ok(())
    }

    pub fn get(&self, identity: &Identity) -> Option<&IndexEntry> {
        self.entries.get(identity)
    }

    pub fn insert(&mut self, identity: Identity, entry: IndexEntry) {
        self.entries.insert(identity, entry);
    }

    pub fn remove(&mut self, identity: &Identity) -> Option<IndexEntry> {
        self.entries.remove(identity)
    }

    /// Mark an artifact as used now. Returns false if it is not indexed.
    pub fn touch(&mut self, identity: &Identity) -> bool {
        match self.entries.get_mut(identity) {
            Some(entry) => {
                entry.last_used = Utc::now();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Identity, &IndexEntry)> {
        self.entries.iter()
    }

    /// Aggregate size of all committed artifacts
    pub fn total_size(&self) -> u64 {
        self.entries.values().map(|e| e.size).sum()
    }

    /// Artifacts that may be evicted, least recently used first
    pub fn eviction_candidates(&self, active: &HashSet<Identity>) -> Vec<(Identity, IndexEntry)> {
        let mut candidates: Vec<(Identity, IndexEntry)> = self
            .entries
            .iter()
            .filter(|(identity, _)| !active.contains(*identity))
            .map(|(identity, entry)| (identity.clone(), entry.clone()))
            .collect();
        candidates.sort_by(|a, b| a.1.last_used.cmp(&b.1.last_used).then_with(|| a.0.cmp(&b.0)));
        candidates
    }
}

/// Identities needed by in-flight builds, protected from eviction
#[derive(Debug, Clone, Default)]
pub struct ActiveSet {
    counts: Arc<Mutex<HashMap<Identity, usize>>>,
}

impl ActiveSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark identities active until the returned lease is dropped
    pub fn acquire<I>(&self, identities: I) -> ActiveLease
    where
        I: IntoIterator<Item = Identity>,
    {
        let identities: Vec<Identity> = identities.into_iter().collect();
        let mut counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        for identity in &identities {
            *counts.entry(identity.clone()).or_insert(0) += 1;
        }
        ActiveLease {
            set: self.clone(),
            identities,
        }
    }

    pub fn contains(&self, identity: &Identity) -> bool {
        self.counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(identity)
    }

    /// Copy of the currently active identities
    pub fn snapshot(&self) -> HashSet<Identity> {
        self.counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    fn release(&self, identities: &[Identity]) {
        let mut counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        for identity in identities {
            if let Some(count) = counts.get_mut(identity) {
                *count -= 1;
                if *count == 0 {
                    counts.remove(identity);
                }
            }
        }
    }
}

/// Keeps identities in an [`ActiveSet`] while alive
#[derive(Debug)]
pub struct ActiveLease {
    set: ActiveSet,
    identities: Vec<Identity>,
}

impl Drop for ActiveLease {
    fn drop(&mut self) {
        self.set.release(&self.identities);
    }
}
