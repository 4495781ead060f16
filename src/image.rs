//! # Image Store
//!
//! Built images are two blobs in the [`BlobStore`]: an OCI image config
//! (environment, working directory, command, layer diff ids, history) and
//! an OCI image manifest (config descriptor plus ordered layer
//! descriptors). A small JSON index maps `name:tag` to a manifest digest.
//!
//! ```text
//! images.json ─► sha256:<manifest> ─► sha256:<config>
//!                                  └► sha256:<layer 0> … sha256:<layer n>
//! ```
//!
//! An image exists only once its tag is in the index. [`ImageStore::commit`]
//! writes both blobs first and the index entry last (atomically), so a build
//! that fails at any step leaves no image behind.

use crate::constants::{
    IMAGE_INDEX_FILE, OCI_IMAGE_CONFIG_MEDIA_TYPE, OCI_IMAGE_MANIFEST_MEDIA_TYPE,
};
use crate::error::{Error, Result};
use crate::layer::LayerDescriptor;
use crate::storage::BlobStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

// =============================================================================
// OCI Image Types
// =============================================================================

/// Runtime defaults carried by an image.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerConfig {
    #[serde(rename = "Env", default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    #[serde(rename = "Entrypoint", default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,
    #[serde(rename = "Cmd", default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,
    #[serde(rename = "WorkingDir", default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
}

impl ContainerConfig {
    /// The argv a container starts with: entrypoint followed by cmd.
    pub fn argv(&self) -> Vec<String> {
        let mut argv = self.entrypoint.clone().unwrap_or_default();
        argv.extend(self.cmd.clone().unwrap_or_default());
        argv
    }

    /// Sets or replaces `KEY=value` in the environment.
    pub fn set_env(&mut self, key: &str, value: &str) {
        let prefix = format!("{}=", key);
        self.env.retain(|e| !e.starts_with(&prefix));
        self.env.push(format!("{}{}", prefix, value));
    }

    /// Looks up an environment variable.
    pub fn get_env(&self, key: &str) -> Option<&str> {
        let prefix = format!("{}=", key);
        self.env.iter().find_map(|e| e.strip_prefix(&prefix))
    }
}

/// Uncompressed layer digests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootFs {
    #[serde(rename = "type")]
    pub fs_type: String,
    #[serde(default)]
    pub diff_ids: Vec<String>,
}

impl Default for RootFs {
    fn default() -> Self {
        Self {
            fs_type: "layers".to_string(),
            diff_ids: Vec::new(),
        }
    }
}

/// One history record per build step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct History {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub empty_layer: Option<bool>,
}

/// OCI image configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageConfig {
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub os: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    #[serde(default)]
    pub config: ContainerConfig,
    #[serde(default)]
    pub rootfs: RootFs,
    #[serde(default)]
    pub history: Vec<History>,
}

/// Content descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: String,
    pub size: u64,
}

/// OCI image manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    pub schema_version: u32,
    pub media_type: String,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
}

// =============================================================================
// Image Records
// =============================================================================

/// A committed image, loaded from the store.
#[derive(Debug, Clone)]
pub struct ImageRecord {
    /// Tag the record was resolved from.
    pub tag: String,
    /// Digest of the manifest blob; the image id.
    pub manifest_digest: String,
    pub manifest: ImageManifest,
    pub config: ImageConfig,
}

impl ImageRecord {
    /// Layers bottom-to-top with their diff ids.
    pub fn layers(&self) -> Vec<LayerDescriptor> {
        self.manifest
            .layers
            .iter()
            .zip(self.config.rootfs.diff_ids.iter())
            .map(|(d, diff_id)| LayerDescriptor {
                digest: d.digest.clone(),
                diff_id: diff_id.clone(),
                size: d.size,
                media_type: d.media_type.clone(),
            })
            .collect()
    }

    /// Sum of compressed layer sizes.
    pub fn size(&self) -> u64 {
        self.manifest.layers.iter().map(|l| l.size).sum()
    }

    /// Short id (first 12 hex characters of the manifest digest).
    pub fn short_id(&self) -> &str {
        let hash = self
            .manifest_digest
            .split_once(':')
            .map(|(_, h)| h)
            .unwrap_or(&self.manifest_digest);
        &hash[..12.min(hash.len())]
    }

    /// Every blob the image references.
    pub fn blobs(&self) -> Vec<String> {
        let mut blobs = vec![
            self.manifest_digest.clone(),
            self.manifest.config.digest.clone(),
        ];
        blobs.extend(self.manifest.layers.iter().map(|l| l.digest.clone()));
        blobs
    }
}

/// Listing entry.
#[derive(Debug, Clone)]
pub struct ImageInfo {
    pub tag: String,
    pub manifest_digest: String,
    pub size: u64,
    pub created: Option<DateTime<Utc>>,
}

// =============================================================================
// Image Store
// =============================================================================

/// Tag index plus blob access for built images.
pub struct ImageStore {
    storage: Arc<BlobStore>,
    index_path: PathBuf,
}

impl ImageStore {
    /// Opens the store whose index lives in `root`.
    pub fn open(root: &Path, storage: Arc<BlobStore>) -> Result<Self> {
        fs::create_dir_all(root).map_err(|e| Error::StorageInitFailed {
            path: root.to_path_buf(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            storage,
            index_path: root.join(IMAGE_INDEX_FILE),
        })
    }

    /// Underlying blob storage.
    pub fn storage(&self) -> &Arc<BlobStore> {
        &self.storage
    }

    fn read_index(&self) -> Result<BTreeMap<String, String>> {
        match fs::read_to_string(&self.index_path) {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_index(&self, index: &BTreeMap<String, String>) -> Result<()> {
        write_json_atomic(&self.index_path, index)
    }

    /// Writes config and manifest blobs, then points `tag` at the manifest.
    pub fn commit(
        &self,
        tag: &str,
        config: &ImageConfig,
        layers: &[LayerDescriptor],
    ) -> Result<ImageRecord> {
        let tag = normalize_tag(tag);

        let config_bytes = serde_json::to_vec(config)?;
        let config_digest = self.storage.put_blob_computed(&config_bytes)?;

        let manifest = ImageManifest {
            schema_version: 2,
            media_type: OCI_IMAGE_MANIFEST_MEDIA_TYPE.to_string(),
            config: Descriptor {
                media_type: OCI_IMAGE_CONFIG_MEDIA_TYPE.to_string(),
                digest: config_digest,
                size: config_bytes.len() as u64,
            },
            layers: layers
                .iter()
                .map(|l| Descriptor {
                    media_type: l.media_type.clone(),
                    digest: l.digest.clone(),
                    size: l.size,
                })
                .collect(),
        };
        let manifest_bytes = serde_json::to_vec(&manifest)?;
        let manifest_digest = self.storage.put_blob_computed(&manifest_bytes)?;

        let mut index = self.read_index()?;
        index.insert(tag.clone(), manifest_digest.clone());
        self.write_index(&index)?;

        info!("Tagged {} as {}", manifest_digest, tag);

        Ok(ImageRecord {
            tag,
            manifest_digest,
            manifest,
            config: config.clone(),
        })
    }

    /// Resolves a tag (or a manifest digest) to its record.
    pub fn get(&self, tag_or_digest: &str) -> Result<ImageRecord> {
        let index = self.read_index()?;
        let tag = normalize_tag(tag_or_digest);

        let (tag, manifest_digest) = match index.get(&tag) {
            Some(digest) => (tag, digest.clone()),
            None => index
                .iter()
                .find(|(_, d)| d.as_str() == tag_or_digest)
                .map(|(t, d)| (t.clone(), d.clone()))
                .ok_or_else(|| Error::ImageNotFound(tag_or_digest.to_string()))?,
        };

        let manifest: ImageManifest =
            serde_json::from_slice(&self.storage.get_blob(&manifest_digest)?)?;
        let config: ImageConfig =
            serde_json::from_slice(&self.storage.get_blob(&manifest.config.digest)?)?;

        debug!("Resolved {} to {}", tag, manifest_digest);

        Ok(ImageRecord {
            tag,
            manifest_digest,
            manifest,
            config,
        })
    }

    /// Returns true if `tag` is committed.
    pub fn exists(&self, tag: &str) -> bool {
        self.read_index()
            .map(|index| index.contains_key(&normalize_tag(tag)))
            .unwrap_or(false)
    }

    /// Lists committed images sorted by tag.
    pub fn list(&self) -> Result<Vec<ImageInfo>> {
        let index = self.read_index()?;
        let mut out = Vec::with_capacity(index.len());
        for tag in index.keys() {
            let record = self.get(tag)?;
            out.push(ImageInfo {
                tag: tag.clone(),
                manifest_digest: record.manifest_digest.clone(),
                size: record.size(),
                created: record.config.created,
            });
        }
        Ok(out)
    }

    /// Removes a tag. Blobs stay until [`BlobStore::gc`] runs.
    pub fn remove(&self, tag: &str) -> Result<()> {
        let mut index = self.read_index()?;
        let tag = normalize_tag(tag);
        if index.remove(&tag).is_none() {
            return Err(Error::ImageNotFound(tag));
        }
        self.write_index(&index)?;
        info!("Removed image {}", tag);
        Ok(())
    }

    /// Every blob referenced by a committed image.
    pub fn referenced_blobs(&self) -> Result<HashSet<String>> {
        let mut set = HashSet::new();
        for tag in self.read_index()?.keys() {
            set.extend(self.get(tag)?.blobs());
        }
        Ok(set)
    }
}

/// Appends `:latest` to a reference without a tag.
pub fn normalize_tag(tag: &str) -> String {
    if tag.starts_with("sha256:") {
        return tag.to_string();
    }
    let last = tag.rsplit('/').next().unwrap_or(tag);
    if last.contains(':') || last.contains('@') {
        tag.to_string()
    } else {
        format!("{}:latest", tag)
    }
}

/// Serializes `value` to `path` via temp file + rename.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let content = serde_json::to_vec_pretty(value)?;
    let temp = path.with_extension(format!("tmp.{}", uuid::Uuid::now_v7()));
    fs::write(&temp, content).map_err(|e| Error::StorageWriteFailed(e.to_string()))?;
    fs::rename(&temp, path).map_err(|e| {
        let _ = fs::remove_file(&temp);
        Error::StorageWriteFailed(e.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(temp: &TempDir) -> ImageStore {
        let blobs = Arc::new(BlobStore::with_path(temp.path().join("blobs")).unwrap());
        ImageStore::open(temp.path(), blobs).unwrap()
    }

    fn layer(store: &ImageStore, data: &[u8]) -> LayerDescriptor {
        let digest = store.storage().put_blob_computed(data).unwrap();
        LayerDescriptor {
            digest,
            diff_id: crate::storage::sha256_digest(b"uncompressed"),
            size: data.len() as u64,
            media_type: crate::constants::OCI_LAYER_MEDIA_TYPE_GZIP.to_string(),
        }
    }

    #[test]
    fn test_commit_and_get() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        let layers = vec![layer(&store, b"l0"), layer(&store, b"l1")];

        let mut config = ImageConfig {
            architecture: "amd64".into(),
            os: "linux".into(),
            created: None,
            config: ContainerConfig::default(),
            rootfs: RootFs::default(),
            history: vec![],
        };
        config.rootfs.diff_ids = layers.iter().map(|l| l.diff_id.clone()).collect();
        config.config.cmd = Some(vec!["python".into(), "bot.py".into()]);

        let committed = store.commit("bot", &config, &layers).unwrap();
        assert_eq!(committed.tag, "bot:latest");

        let loaded = store.get("bot").unwrap();
        assert_eq!(loaded.manifest_digest, committed.manifest_digest);
        assert_eq!(loaded.layers(), layers);
        assert_eq!(loaded.config.config.argv(), vec!["python", "bot.py"]);

        let by_digest = store.get(&committed.manifest_digest).unwrap();
        assert_eq!(by_digest.tag, "bot:latest");
    }

    #[test]
    fn test_remove_and_missing() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        assert!(matches!(store.get("nope:1"), Err(Error::ImageNotFound(_))));
        assert!(store.remove("nope:1").is_err());
    }

    #[test]
    fn test_normalize_tag() {
        assert_eq!(normalize_tag("bot"), "bot:latest");
        assert_eq!(normalize_tag("bot:v1"), "bot:v1");
        assert_eq!(normalize_tag("localhost:5000/bot"), "localhost:5000/bot:latest");
    }

    #[test]
    fn test_env_helpers() {
        let mut config = ContainerConfig::default();
        config.set_env("PATH", "/bin");
        config.set_env("PATH", "/usr/local/bin:/bin");
        assert_eq!(config.env.len(), 1);
        assert_eq!(config.get_env("PATH"), Some("/usr/local/bin:/bin"));
    }
}
