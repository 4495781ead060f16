//! Run bundles.
//!
//! A bundle is a committed image unpacked for one run:
//!
//! ```text
//! <store>/bundles/<run id>/
//! ├── config.json   # process args, cwd, env, root path
//! └── rootfs/       # all image layers applied bottom to top
//! ```
//!
//! Every run gets a fresh rootfs, so nothing a process writes leaks into
//! the image or into the next run.

use crate::constants::{BUNDLE_DIR, OCI_IMAGE_SPEC_VERSION};
use crate::error::{Error, Result};
use crate::image::ImageRecord;
use crate::layer::extract_layers;
use crate::runtime::ProcessSpec;
use crate::storage::BlobStore;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// An unpacked image ready to run.
#[derive(Debug, Clone)]
pub struct Bundle {
    /// Run id (directory name).
    pub id: String,
    /// Bundle directory.
    pub path: PathBuf,
    /// Root filesystem.
    pub rootfs: PathBuf,
    /// Process to start.
    pub process: ProcessSpec,
}

/// Serialized run configuration (`config.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleConfig {
    pub oci_version: String,
    pub image: String,
    pub root: BundleRoot,
    pub process: BundleProcess,
}

/// Root filesystem entry of [`BundleConfig`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleRoot {
    pub path: String,
}

/// Process entry of [`BundleConfig`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleProcess {
    pub args: Vec<String>,
    pub cwd: String,
    pub env: Vec<String>,
}

// =============================================================================
// Bundle Builder
// =============================================================================

/// Unpacks committed images under `<store>/bundles`.
pub struct BundleBuilder {
    base_dir: PathBuf,
    storage: Arc<BlobStore>,
}

impl BundleBuilder {
    /// Creates a builder rooted at `<store_root>/bundles`.
    pub fn new(store_root: &Path, storage: Arc<BlobStore>) -> Result<Self> {
        let base_dir = store_root.join(BUNDLE_DIR);
        fs::create_dir_all(&base_dir).map_err(|e| Error::BundleBuildFailed(e.to_string()))?;
        Ok(Self { base_dir, storage })
    }

    /// Bundle base directory.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Unpacks `image` into a fresh bundle.
    pub fn build(&self, image: &ImageRecord) -> Result<Bundle> {
        let id = uuid::Uuid::now_v7().simple().to_string();
        let path = self.base_dir.join(&id);
        let rootfs = path.join("rootfs");

        fs::create_dir_all(&rootfs)
            .map_err(|e| Error::BundleBuildFailed(format!("failed to create rootfs: {}", e)))?;

        if let Err(e) = extract_layers(&image.layers(), &rootfs, &self.storage) {
            let _ = fs::remove_dir_all(&path);
            return Err(e);
        }

        let container = &image.config.config;
        let process = ProcessSpec::new(
            container.argv(),
            container.working_dir.clone().unwrap_or_else(|| "/".to_string()),
        )
        .with_env(container.env.clone());

        if process.args.is_empty() {
            let _ = fs::remove_dir_all(&path);
            return Err(Error::BundleBuildFailed(format!(
                "image {} has no entrypoint",
                image.tag
            )));
        }

        let config = BundleConfig {
            oci_version: OCI_IMAGE_SPEC_VERSION.to_string(),
            image: image.manifest_digest.clone(),
            root: BundleRoot {
                path: "rootfs".to_string(),
            },
            process: BundleProcess {
                args: process.args.clone(),
                cwd: process.cwd.clone(),
                env: process.env.clone(),
            },
        };
        let config_json = serde_json::to_string_pretty(&config)
            .map_err(|e| Error::BundleBuildFailed(format!("failed to serialize config: {}", e)))?;
        fs::write(path.join("config.json"), config_json)
            .map_err(|e| Error::BundleBuildFailed(format!("failed to write config.json: {}", e)))?;

        info!("Built bundle {} for {}", id, image.tag);

        Ok(Bundle {
            id,
            path,
            rootfs,
            process,
        })
    }

    /// Deletes a bundle directory.
    pub fn remove(&self, bundle: &Bundle) -> Result<()> {
        if !bundle.path.starts_with(&self.base_dir) {
            return Err(Error::PathTraversal {
                path: bundle.path.display().to_string(),
            });
        }
        match fs::remove_dir_all(&bundle.path) {
            Ok(()) => {
                debug!("Removed bundle {}", bundle.id);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                warn!("Failed to remove bundle {}: {}", bundle.id, e);
                Err(e.into())
            }
        }
    }

    /// Removes every leftover bundle; returns how many were deleted.
    pub fn prune(&self) -> Result<usize> {
        let mut removed = 0;
        for entry in fs::read_dir(&self.base_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                fs::remove_dir_all(entry.path())?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}
