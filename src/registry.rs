//! # Base Image Sources
//!
//! The base step starts every build from a fixed runtime image. That image
//! comes from one of two sources, chosen per reference:
//!
//! ```text
//!   reference ──► LocalBaseSource ── <base dir>/<name>/<tag>/rootfs ──► pack_tree ──┐
//!       │               (found)                                                    ├─► ImageHandle
//!       └──────► RegistrySource ─── manifest ─► platform manifest ─► config + layers ┘
//! ```
//!
//! A reference found in a configured base directory is served locally;
//! anything else goes to the registry. Once a source is chosen its failure
//! is final: there is no retry against the other source or another image.
//!
//! ## Registry Pulls
//!
//! - **Multi-arch resolution**: an image index resolves to the Linux
//!   manifest for the host architecture
//! - **Layer deduplication**: layers already in the [`BlobStore`] are not
//!   downloaded again
//! - **Size limits**: `MAX_LAYER_SIZE` and `MAX_LAYERS` are enforced before
//!   download
//! - **Timeouts**: every network operation is bounded by `IMAGE_PULL_TIMEOUT`
//! - **In-flight tracking**: layers being written are protected from
//!   [`BlobStore::gc`]
//!
//! The image config blob is fetched too: its `Env` (notably `PATH`) and
//! the layer diff ids carry over into the built image.
//!
//! ## Local Base Directories
//!
//! ```text
//! <base dir>/
//! └── python/
//!     └── 3.11-slim/
//!         ├── rootfs/        # unpacked filesystem
//!         └── config.json    # optional {"Env": [...], "WorkingDir": ...}
//! ```
//!
//! The rootfs is packed into one reproducible layer, so the same tree
//! always yields the same base digest.

use crate::constants::{
    DEFAULT_PATH_ENV, IMAGE_PULL_TIMEOUT, MAX_LAYER_SIZE, MAX_LAYERS, validate_image_ref,
};
use crate::error::{Error, Result};
use crate::image::{ContainerConfig, ImageConfig};
use crate::layer::{LayerDescriptor, pack_tree, uncompressed_digest};
use crate::platform::Platform;
use crate::storage::{BlobStore, sha256_digest};
use async_trait::async_trait;
use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::manifest::{OciDescriptor, OciManifest};
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::{Client, Reference};
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// A base image whose layers are all present in the blob store.
#[derive(Debug, Clone)]
pub struct ImageHandle {
    /// Reference as requested.
    pub reference: String,
    /// Manifest digest (registry) or layer digest (local).
    pub digest: String,
    /// Platform of the resolved variant (e.g., "linux/amd64").
    pub platform: String,
    /// Layers, bottom to top.
    pub layers: Vec<LayerDescriptor>,
    /// Runtime defaults inherited by built images.
    pub config: ContainerConfig,
}

/// Produces a base image.
#[async_trait]
pub trait BaseImageSource: Send + Sync {
    /// Source name for logs.
    fn name(&self) -> &'static str;

    /// Makes `reference` available in `storage`.
    async fn pull(&self, reference: &str, storage: &Arc<BlobStore>) -> Result<ImageHandle>;
}

/// Resolves `reference` from `base_dirs` if present there, else the registry.
pub async fn resolve_base(
    reference: &str,
    storage: &Arc<BlobStore>,
    base_dirs: &[PathBuf],
) -> Result<ImageHandle> {
    validate_reference(reference)?;

    let local = LocalBaseSource::new(base_dirs.to_vec());
    let source: Box<dyn BaseImageSource> = if local.locate(reference)?.is_some() {
        Box::new(local)
    } else {
        Box::new(RegistrySource::new(Platform::detect()))
    };

    debug!("Base image {} from {} source", reference, source.name());
    source.pull(reference, storage).await
}

fn validate_reference(reference: &str) -> Result<()> {
    validate_image_ref(reference).map_err(|reason| Error::InvalidImageReference {
        reference: reference.to_string(),
        reason: reason.to_string(),
    })
}

// =============================================================================
// Registry Source
// =============================================================================

/// Pulls from an OCI registry.
pub struct RegistrySource {
    client: Client,
    auth: RegistryAuth,
    platform: Platform,
}

impl RegistrySource {
    /// Anonymous HTTPS client targeting `platform`.
    pub fn new(platform: Platform) -> Self {
        Self {
            client: Client::new(ClientConfig {
                protocol: ClientProtocol::Https,
                ..Default::default()
            }),
            auth: RegistryAuth::Anonymous,
            platform,
        }
    }

    /// Uses basic authentication.
    pub fn with_basic_auth(mut self, username: &str, password: &str) -> Self {
        self.auth = RegistryAuth::Basic(username.to_string(), password.to_string());
        self
    }

    async fn fetch_blob(&self, reference: &Reference, desc: &OciDescriptor) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        tokio::time::timeout(IMAGE_PULL_TIMEOUT, async {
            self.client.pull_blob(reference, desc, &mut data).await
        })
        .await
        .map_err(|_| Error::Timeout {
            operation: format!("pull blob {}", desc.digest),
            duration: IMAGE_PULL_TIMEOUT,
        })?
        .map_err(|e| Error::ImagePullFailed {
            reference: reference.to_string(),
            reason: format!("blob {}: {}", desc.digest, e),
        })?;
        Ok(data)
    }

    /// Resolves an image index to the manifest for this platform.
    async fn resolve_manifest(
        &self,
        reference: &Reference,
        manifest: OciManifest,
    ) -> Result<(OciDescriptor, Vec<OciDescriptor>, String)> {
        let target = self.platform.image_platform();

        let index = match manifest {
            OciManifest::Image(img) => return Ok((img.config, img.layers, target)),
            OciManifest::ImageIndex(index) => index,
        };

        let arch = self.platform.oci_arch();
        let matching = index.manifests.iter().find(|m| {
            m.platform
                .as_ref()
                .is_some_and(|p| p.os == "linux" && p.architecture == arch)
        });

        let manifest_desc = matching.ok_or_else(|| {
            let available: Vec<String> = index
                .manifests
                .iter()
                .filter_map(|m| m.platform.as_ref())
                .map(|p| format!("{}/{}", p.os, p.architecture))
                .collect();
            Error::ImagePullFailed {
                reference: reference.to_string(),
                reason: format!("no manifest for {}. Available: {}", target, available.join(", ")),
            }
        })?;

        let platform_ref: Reference = format!(
            "{}/{}@{}",
            reference.registry(),
            reference.repository(),
            manifest_desc.digest
        )
        .parse()
        .map_err(|e| Error::ImagePullFailed {
            reference: reference.to_string(),
            reason: format!("failed to build digest reference: {}", e),
        })?;

        let (platform_manifest, _) = tokio::time::timeout(IMAGE_PULL_TIMEOUT, async {
            self.client.pull_manifest(&platform_ref, &self.auth).await
        })
        .await
        .map_err(|_| Error::Timeout {
            operation: format!("pull platform manifest for {}", reference),
            duration: IMAGE_PULL_TIMEOUT,
        })?
        .map_err(|e| Error::ImagePullFailed {
            reference: reference.to_string(),
            reason: format!("failed to pull platform manifest: {}", e),
        })?;

        match platform_manifest {
            OciManifest::Image(img) => Ok((img.config, img.layers, target)),
            OciManifest::ImageIndex(_) => Err(Error::ImagePullFailed {
                reference: reference.to_string(),
                reason: "nested image index not supported".to_string(),
            }),
        }
    }
}

#[async_trait]
impl BaseImageSource for RegistrySource {
    fn name(&self) -> &'static str {
        "registry"
    }

    async fn pull(&self, image_ref: &str, storage: &Arc<BlobStore>) -> Result<ImageHandle> {
        validate_reference(image_ref)?;
        info!(
            "Pulling image {} for platform {}",
            image_ref,
            self.platform.image_platform()
        );

        let reference: Reference = image_ref.parse().map_err(|e| Error::InvalidImageReference {
            reference: image_ref.to_string(),
            reason: format!("{}", e),
        })?;

        let (manifest, digest) = tokio::time::timeout(IMAGE_PULL_TIMEOUT, async {
            self.client.pull_manifest(&reference, &self.auth).await
        })
        .await
        .map_err(|_| Error::Timeout {
            operation: format!("pull manifest for {}", image_ref),
            duration: IMAGE_PULL_TIMEOUT,
        })?
        .map_err(|e| Error::ImagePullFailed {
            reference: image_ref.to_string(),
            reason: e.to_string(),
        })?;

        let (config_desc, layer_descs, platform) =
            self.resolve_manifest(&reference, manifest).await?;

        if layer_descs.len() > MAX_LAYERS {
            return Err(Error::ImagePullFailed {
                reference: image_ref.to_string(),
                reason: format!("too many layers: {} > {}", layer_descs.len(), MAX_LAYERS),
            });
        }

        let config_bytes = self.fetch_blob(&reference, &config_desc).await?;
        let image_config: ImageConfig = serde_json::from_slice(&config_bytes)?;
        if image_config.rootfs.diff_ids.len() != layer_descs.len() {
            return Err(Error::ImagePullFailed {
                reference: image_ref.to_string(),
                reason: format!(
                    "config lists {} diff ids for {} layers",
                    image_config.rootfs.diff_ids.len(),
                    layer_descs.len()
                ),
            });
        }

        let mut layers = Vec::with_capacity(layer_descs.len());
        for (desc, diff_id) in layer_descs.iter().zip(&image_config.rootfs.diff_ids) {
            let size = desc.size.max(0) as u64;
            layers.push(LayerDescriptor {
                digest: desc.digest.clone(),
                diff_id: diff_id.clone(),
                size,
                media_type: desc.media_type.clone(),
            });

            if storage.has_blob(&desc.digest) {
                debug!("Layer {} already cached", desc.digest);
                continue;
            }
            if size > MAX_LAYER_SIZE as u64 {
                return Err(Error::ImageTooLarge {
                    size,
                    limit: MAX_LAYER_SIZE as u64,
                });
            }

            debug!("Pulling layer: {} ({} bytes)", desc.digest, size);
            storage.track_inflight(&desc.digest);
            let stored = match self.fetch_blob(&reference, desc).await {
                Ok(data) => verify_diff_id(image_ref, &data, diff_id)
                    .and_then(|()| storage.put_blob(&desc.digest, &data)),
                Err(e) => Err(e),
            };
            storage.untrack_inflight(&desc.digest);
            stored?;
        }

        let mut config = image_config.config;
        if config.get_env("PATH").is_none() {
            config.env.push(DEFAULT_PATH_ENV.to_string());
        }

        info!("Pulled {} ({} layers, {})", image_ref, layers.len(), digest);

        Ok(ImageHandle {
            reference: image_ref.to_string(),
            digest,
            platform,
            layers,
            config,
        })
    }
}

/// Checks a pulled layer against the diff id its image config lists.
fn verify_diff_id(reference: &str, data: &[u8], diff_id: &str) -> Result<()> {
    let actual = if data.starts_with(&[0x1f, 0x8b]) {
        uncompressed_digest(data)?
    } else {
        sha256_digest(data)
    };
    if actual != diff_id {
        return Err(Error::ImagePullFailed {
            reference: reference.to_string(),
            reason: format!("layer diff id mismatch: expected {}, got {}", diff_id, actual),
        });
    }
    Ok(())
}

// =============================================================================
// Local Source
// =============================================================================

/// Serves base images from unpacked root filesystems on disk.
#[derive(Debug, Clone, Default)]
pub struct LocalBaseSource {
    dirs: Vec<PathBuf>,
}

impl LocalBaseSource {
    /// Searches `dirs` in order.
    pub fn new(dirs: Vec<PathBuf>) -> Self {
        Self { dirs }
    }

    /// Returns the image directory for `reference`, if any base dir has it.
    pub fn locate(&self, reference: &str) -> Result<Option<PathBuf>> {
        let (name, tag) = split_reference(reference);

        let rel = Path::new(name).join(tag);
        if rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(Error::InvalidImageReference {
                reference: reference.to_string(),
                reason: "path components not allowed".to_string(),
            });
        }

        Ok(self
            .dirs
            .iter()
            .map(|dir| dir.join(&rel))
            .find(|dir| dir.join("rootfs").is_dir()))
    }
}

#[async_trait]
impl BaseImageSource for LocalBaseSource {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn pull(&self, reference: &str, storage: &Arc<BlobStore>) -> Result<ImageHandle> {
        let dir = self
            .locate(reference)?
            .ok_or_else(|| Error::ImageNotFound(reference.to_string()))?;

        let rootfs = dir.join("rootfs");
        let packed = tokio::task::spawn_blocking(move || pack_tree(&rootfs))
            .await
            .map_err(|e| Error::Internal(format!("pack task failed: {}", e)))??;
        let layer = packed.store(storage)?;

        let mut config = match fs::read(dir.join("config.json")) {
            Ok(bytes) => serde_json::from_slice::<ContainerConfig>(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => ContainerConfig::default(),
            Err(e) => return Err(e.into()),
        };
        if config.get_env("PATH").is_none() {
            config.env.push(DEFAULT_PATH_ENV.to_string());
        }

        info!(
            "Loaded local base {} from {} ({})",
            reference,
            dir.display(),
            layer.digest
        );

        Ok(ImageHandle {
            reference: reference.to_string(),
            digest: layer.digest.clone(),
            platform: Platform::detect().image_platform(),
            layers: vec![layer],
            config,
        })
    }
}

/// Splits `name:tag` (tag defaults to `latest`; digests are kept whole).
fn split_reference(reference: &str) -> (&str, &str) {
    if let Some((name, digest)) = reference.split_once('@') {
        return (name, digest);
    }
    let last_slash = reference.rfind('/').map(|i| i + 1).unwrap_or(0);
    match reference[last_slash..].rfind(':') {
        Some(idx) => (
            &reference[..last_slash + idx],
            &reference[last_slash + idx + 1..],
        ),
        None => (reference, "latest"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_split_reference() {
        assert_eq!(split_reference("python:3.11-slim"), ("python", "3.11-slim"));
        assert_eq!(split_reference("python"), ("python", "latest"));
        assert_eq!(
            split_reference("localhost:5000/team/python:3"),
            ("localhost:5000/team/python", "3")
        );
    }

    #[test]
    fn test_locate_rejects_traversal() {
        let source = LocalBaseSource::new(vec![PathBuf::from("/nonexistent")]);
        assert!(source.locate("../etc:passwd").is_err());
        assert!(source.locate("python:3.11-slim").unwrap().is_none());
    }

    #[test]
    fn test_pulled_layer_diff_id_is_verified() {
        let tree = TempDir::new().unwrap();
        fs::write(tree.path().join("python"), "#!/bin/sh\n").unwrap();
        let packed = pack_tree(tree.path()).unwrap();

        verify_diff_id("python:3.11-slim", &packed.data, &packed.diff_id).unwrap();

        let wrong = sha256_digest(b"something else");
        let err = verify_diff_id("python:3.11-slim", &packed.data, &wrong).unwrap_err();
        assert!(matches!(err, Error::ImagePullFailed { .. }));

        // Uncompressed layers are their own diff id.
        let plain = b"plain tar bytes";
        verify_diff_id("python:3.11-slim", plain, &sha256_digest(plain)).unwrap();
    }

    #[tokio::test]
    async fn test_local_base_pull() {
        let bases = TempDir::new().unwrap();
        let image_dir = bases.path().join("python").join("3.11-slim");
        fs::create_dir_all(image_dir.join("rootfs/usr/bin")).unwrap();
        fs::write(image_dir.join("rootfs/usr/bin/python"), "#!/bin/sh\n").unwrap();
        fs::write(
            image_dir.join("config.json"),
            r#"{"Env":["PATH=/usr/bin","LANG=C.UTF-8"]}"#,
        )
        .unwrap();

        let store = TempDir::new().unwrap();
        let storage = Arc::new(BlobStore::with_path(store.path().to_path_buf()).unwrap());

        let handle = resolve_base("python:3.11-slim", &storage, &[bases.path().to_path_buf()])
            .await
            .unwrap();
        assert_eq!(handle.layers.len(), 1);
        assert!(storage.has_blob(&handle.digest));
        assert_eq!(handle.config.get_env("PATH"), Some("/usr/bin"));

        let again = resolve_base("python:3.11-slim", &storage, &[bases.path().to_path_buf()])
            .await
            .unwrap();
        assert_eq!(handle.digest, again.digest);
    }
}
