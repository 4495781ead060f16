//! # Build and Runtime Constants
//!
//! Defines the fixed packaging contract (base image, working directory,
//! manifest name, entrypoint), resource limits, timeouts, and storage
//! layout. These constants are the **single source of truth** for the
//! defaults used by [`crate::recipe`] and for the bounds enforced by
//! [`crate::layer`], [`crate::registry`] and [`crate::context`].
//!
//! ## Modification Guidelines
//!
//! Before modifying any limit:
//! 1. Consider interactions with other limits (e.g., `MAX_LAYERS × MAX_LAYER_SIZE`)
//! 2. Update dependent tests and documentation

use std::time::Duration;

// =============================================================================
// Packaging Contract
// =============================================================================
//
// The four build parameters and the entrypoint. A recipe built with
// `BuildRecipe::default()` uses exactly these values.
// =============================================================================

/// Base runtime image reference.
pub const DEFAULT_BASE_IMAGE: &str = "python:3.11-slim";

/// Working directory for both build steps and the entrypoint.
pub const DEFAULT_WORKDIR: &str = "/app";

/// Dependency manifest file name, resolved at the build-context root.
pub const MANIFEST_FILE: &str = "requirements.txt";

/// Fixed entrypoint command.
pub const DEFAULT_ENTRYPOINT: &[&str] = &["python", "bot.py"];

/// Installer invocation for the install step.
///
/// Runs from the working directory with the manifest staged next to it.
/// `--no-cache-dir` keeps the package cache out of the install layer.
pub const DEFAULT_INSTALL_COMMAND: &[&str] = &[
    "python",
    "-m",
    "pip",
    "install",
    "--no-cache-dir",
    "-r",
    MANIFEST_FILE,
];

/// Installer cache locations (relative to the rootfs) stripped from the
/// install snapshot before the layer is captured.
pub const INSTALLER_CACHE_PATHS: &[&str] = &["root/.cache/pip"];

/// Prefix of installer scratch directories under `tmp/`, also stripped.
pub const INSTALLER_TMP_PREFIX: &str = "pip-";

/// Default `PATH` for images whose base config declares none.
pub const DEFAULT_PATH_ENV: &str =
    "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Tag applied when `build` is given no `-t`.
pub const DEFAULT_IMAGE_TAG: &str = "app:latest";

// =============================================================================
// Size Limits
// =============================================================================
//
// The cumulative worst-case is MAX_LAYERS × MAX_LAYER_SIZE; MAX_ROOTFS_SIZE
// provides the actual extraction bound.
// =============================================================================

/// Maximum image reference length in bytes.
///
/// **Security**: Rejects pathological references before they reach the
/// reference parser.
pub const MAX_IMAGE_REF_LEN: usize = 512;

/// Maximum size of a single compressed layer (512 MiB).
///
/// Enforced both for pulled base layers and for layers produced by a build.
pub const MAX_LAYER_SIZE: usize = 512 * 1024 * 1024;

/// Maximum total extracted rootfs size (4 GiB).
///
/// **Attack Vector**: Compression bombs (small compressed, huge uncompressed).
pub const MAX_ROOTFS_SIZE: u64 = 4 * 1024 * 1024 * 1024;

/// Maximum number of layers in an image (base layers plus build steps).
pub const MAX_LAYERS: usize = 128;

/// Maximum dependency manifest size (1 MiB).
pub const MAX_MANIFEST_SIZE: u64 = 1024 * 1024;

/// Maximum number of files copied from a build context.
pub const MAX_CONTEXT_FILES: usize = 100_000;

// =============================================================================
// Timeouts
// =============================================================================

/// Timeout for base image pulls (5 minutes), manifest and all layers.
pub const IMAGE_PULL_TIMEOUT: Duration = Duration::from_secs(300);

/// Timeout for the install step (30 minutes).
///
/// An installer that hangs resolving an unreachable index counts as a
/// resolution failure once this elapses.
pub const INSTALL_TIMEOUT: Duration = Duration::from_secs(1800);

/// Grace period between SIGTERM and SIGKILL when a run is stopped.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(10);

// =============================================================================
// Storage Paths
// =============================================================================
//
// All paths are relative to the configured store root (default
// `~/.layerkit`).
// =============================================================================

/// Default store root directory name under the home directory.
pub const STORE_ROOT_DIR: &str = ".layerkit";

/// Environment variable overriding the store root.
pub const STORE_ROOT_ENV: &str = "LAYERKIT_ROOT";

/// Environment variable listing local base-image directories (`:` separated).
pub const BASE_DIRS_ENV: &str = "LAYERKIT_BASE_DIRS";

/// Subdirectory for content-addressed blobs.
///
/// Structure: `blobs/sha256/<2-char-prefix>/<full-hash>`
pub const BLOB_STORE_DIR: &str = "blobs";

/// Subdirectory for materialized root filesystems.
pub const BUNDLE_DIR: &str = "bundles";

/// Subdirectory for per-build scratch snapshots.
pub const SCRATCH_DIR: &str = "scratch";

/// Tag → manifest digest index file.
pub const IMAGE_INDEX_FILE: &str = "images.json";

/// Step cache index file.
pub const CACHE_INDEX_FILE: &str = "cache.json";

// =============================================================================
// OCI Media Types
// =============================================================================

/// OCI Image Spec version written into generated manifests.
pub const OCI_IMAGE_SPEC_VERSION: &str = "1.0.2";

/// OCI Image Manifest media type.
pub const OCI_IMAGE_MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";

/// OCI Image Config media type.
pub const OCI_IMAGE_CONFIG_MEDIA_TYPE: &str = "application/vnd.oci.image.config.v1+json";

/// Gzip-compressed tar layer media type.
pub const OCI_LAYER_MEDIA_TYPE_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

/// Docker's gzip layer media type, accepted from registries.
pub const DOCKER_LAYER_MEDIA_TYPE_GZIP: &str =
    "application/vnd.docker.image.rootfs.diff.tar.gzip";

/// Whiteout file prefix marking a deletion in a layer.
pub const WHITEOUT_PREFIX: &str = ".wh.";

/// Opaque-directory whiteout marker.
pub const WHITEOUT_OPAQUE: &str = ".wh..wh..opq";

// =============================================================================
// Validation
// =============================================================================

/// Characters permitted in an image reference.
pub const IMAGE_REF_VALID_CHARS: &str = "/:.-_@";

/// Validates an image reference's length and character set.
///
/// Returns the reason on failure so callers can wrap it in their own error.
pub fn validate_image_ref(reference: &str) -> std::result::Result<(), &'static str> {
    if reference.is_empty() {
        return Err("empty reference");
    }
    if reference.len() > MAX_IMAGE_REF_LEN {
        return Err("reference too long");
    }
    if !reference
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || IMAGE_REF_VALID_CHARS.contains(c))
    {
        return Err("contains invalid characters");
    }
    Ok(())
}

/// Validates a working directory path: absolute, no `..`, no NUL.
pub fn validate_workdir(path: &str) -> std::result::Result<(), &'static str> {
    if !path.starts_with('/') {
        return Err("must be absolute");
    }
    if path.contains('\0') {
        return Err("contains NUL");
    }
    if path.split('/').any(|c| c == "..") {
        return Err("contains '..'");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_contract() {
        assert_eq!(DEFAULT_BASE_IMAGE, "python:3.11-slim");
        assert_eq!(DEFAULT_WORKDIR, "/app");
        assert_eq!(DEFAULT_ENTRYPOINT, &["python", "bot.py"]);
        assert!(DEFAULT_INSTALL_COMMAND.contains(&"--no-cache-dir"));
        assert!(DEFAULT_INSTALL_COMMAND.contains(&MANIFEST_FILE));
    }

    #[test]
    fn test_validate_image_ref() {
        assert!(validate_image_ref("python:3.11-slim").is_ok());
        assert!(validate_image_ref("ghcr.io/org/app@sha256:abcd").is_ok());
        assert!(validate_image_ref("").is_err());
        assert!(validate_image_ref("bad ref").is_err());
        assert!(validate_image_ref(&"a".repeat(MAX_IMAGE_REF_LEN + 1)).is_err());
    }

    #[test]
    fn test_validate_workdir() {
        assert!(validate_workdir("/app").is_ok());
        assert!(validate_workdir("/srv/app/").is_ok());
        assert!(validate_workdir("app").is_err());
        assert!(validate_workdir("/app/../etc").is_err());
    }
}
