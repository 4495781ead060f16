//! Step cache.
//!
//! Each build step's output is keyed by
//!
//! ```text
//! key = sha256( parent key ‖ 0x00 ‖ step descriptor ‖ 0x00 ‖ step input digest )
//! ```
//!
//! so a key changes whenever anything below it changed. Inputs per step:
//! base image digest, working directory, manifest digest + installer argv,
//! and the context fingerprint. A hit requires every referenced blob to
//! still be present.

use crate::constants::CACHE_INDEX_FILE;
use crate::error::Result;
use crate::image::write_json_atomic;
use crate::layer::LayerDescriptor;
use crate::storage::BlobStore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

/// Cached output of one step. `layer` is `None` for steps that changed nothing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub layer: Option<LayerDescriptor>,
}

/// Computes a chained step key.
pub fn step_key(parent: &str, descriptor: &str, input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(parent.as_bytes());
    hasher.update([0u8]);
    hasher.update(descriptor.as_bytes());
    hasher.update([0u8]);
    hasher.update(input.as_bytes());
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

/// Persistent `key → layer` map at `<root>/cache.json`.
pub struct StepCache {
    path: PathBuf,
    // Serializes read-modify-write of the index within one process.
    lock: Mutex<()>,
}

impl StepCache {
    /// Opens the cache index in `root`.
    pub fn open(root: &Path) -> Result<Self> {
        fs::create_dir_all(root)?;
        Ok(Self {
            path: root.join(CACHE_INDEX_FILE),
            lock: Mutex::new(()),
        })
    }

    fn read(&self) -> Result<BTreeMap<String, CacheEntry>> {
        match fs::read_to_string(&self.path) {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Looks up `key`. Entries whose layer blob is gone are misses.
    pub fn get(&self, key: &str, storage: &BlobStore) -> Result<Option<CacheEntry>> {
        let entries = self.read()?;
        let Some(entry) = entries.get(key) else {
            return Ok(None);
        };
        if let Some(layer) = &entry.layer
            && !storage.has_blob(&layer.digest)
        {
            debug!("Cache entry {} lost blob {}", key, layer.digest);
            return Ok(None);
        }
        Ok(Some(entry.clone()))
    }

    /// Records the output of a step.
    pub fn insert(&self, key: &str, entry: CacheEntry) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut entries = self.read()?;
        entries.insert(key.to_string(), entry);
        write_json_atomic(&self.path, &entries)
    }

    /// Drops every entry.
    pub fn clear(&self) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Number of entries.
    pub fn len(&self) -> Result<usize> {
        Ok(self.read()?.len())
    }

    /// Layer blobs referenced by cache entries.
    pub fn referenced_blobs(&self) -> Result<HashSet<String>> {
        Ok(self
            .read()?
            .into_values()
            .filter_map(|e| e.layer.map(|l| l.digest))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_step_key_chains() {
        let a = step_key("", "FROM python:3.11-slim", "sha256:base");
        let b = step_key(&a, "WORKDIR /app", "/app");
        assert_ne!(a, b);
        assert_eq!(b, step_key(&a, "WORKDIR /app", "/app"));
        assert_ne!(b, step_key("other", "WORKDIR /app", "/app"));
    }

    #[test]
    fn test_missing_blob_is_a_miss() {
        let temp = TempDir::new().unwrap();
        let storage = BlobStore::with_path(temp.path().join("blobs")).unwrap();
        let cache = StepCache::open(temp.path()).unwrap();

        let digest = storage.put_blob_computed(b"layer").unwrap();
        let layer = LayerDescriptor {
            digest: digest.clone(),
            diff_id: digest.clone(),
            size: 5,
            media_type: crate::constants::OCI_LAYER_MEDIA_TYPE_GZIP.to_string(),
        };
        cache.insert("k", CacheEntry { layer: Some(layer) }).unwrap();
        cache.insert("empty", CacheEntry { layer: None }).unwrap();

        assert!(cache.get("k", &storage).unwrap().is_some());
        assert!(cache.get("empty", &storage).unwrap().is_some());
        assert_eq!(cache.referenced_blobs().unwrap().len(), 1);

        storage.remove_blob(&digest).unwrap();
        assert!(cache.get("k", &storage).unwrap().is_none());

        cache.clear().unwrap();
        assert_eq!(cache.len().unwrap(), 0);
    }
}
