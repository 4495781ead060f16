//! Build context: the manifest plus the application source tree.
//!
//! The whole context directory is the source tree; nothing is filtered.
//! Its fingerprint (paths, types, modes, content hashes) keys the copy
//! step's cache entry, so editing any source file invalidates only that
//! step.

use crate::constants::{MANIFEST_FILE, MAX_CONTEXT_FILES};
use crate::error::{Error, Result};
use crate::layer::{EntryKind, Snapshot};
use crate::manifest::Manifest;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// A loaded build context.
#[derive(Debug, Clone)]
pub struct BuildContext {
    root: PathBuf,
    manifest: Manifest,
    fingerprint: String,
}

impl BuildContext {
    /// Loads the context at `root` with the default manifest name.
    pub fn load(root: &Path) -> Result<Self> {
        Self::load_with_manifest(root, MANIFEST_FILE)
    }

    /// Loads the context at `root`, reading `manifest_name` from its root.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidContext`] if `root` is not a readable directory
    /// - [`Error::ManifestMissing`] if the manifest is absent
    /// - [`Error::InvalidManifest`] if the manifest is malformed
    pub fn load_with_manifest(root: &Path, manifest_name: &str) -> Result<Self> {
        if !root.is_dir() {
            return Err(Error::InvalidContext {
                path: root.to_path_buf(),
                reason: "not a directory".to_string(),
            });
        }

        let manifest = Manifest::load(&root.join(manifest_name))?;

        let snapshot = Snapshot::scan(root).map_err(|e| Error::InvalidContext {
            path: root.to_path_buf(),
            reason: e.to_string(),
        })?;

        if snapshot.len() > MAX_CONTEXT_FILES {
            return Err(Error::InvalidContext {
                path: root.to_path_buf(),
                reason: format!(
                    "{} entries exceeds limit of {}",
                    snapshot.len(),
                    MAX_CONTEXT_FILES
                ),
            });
        }

        let fingerprint = fingerprint(&snapshot);

        info!(
            "Loaded build context {} ({} entries, {} requirements)",
            root.display(),
            snapshot.len(),
            manifest.requirements().count()
        );

        Ok(Self {
            root: root.to_path_buf(),
            manifest,
            fingerprint,
        })
    }

    /// Context root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Parsed dependency manifest.
    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// Digest over every path in the source tree.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Copies the whole source tree into `dest`, replacing same-path entries.
    pub fn copy_into(&self, dest: &Path) -> Result<()> {
        fs::create_dir_all(dest)?;
        copy_tree(&self.root, dest)?;
        debug!("Copied context into {}", dest.display());
        Ok(())
    }
}

fn fingerprint(snapshot: &Snapshot) -> String {
    let mut hasher = Sha256::new();
    for path in snapshot.paths() {
        hasher.update(path.to_string_lossy().as_bytes());
        hasher.update([0u8]);
        match snapshot.get(path) {
            Some(EntryKind::Dir { mode }) => hasher.update(format!("d{:o}", mode)),
            Some(EntryKind::File { mode, hash, .. }) => {
                hasher.update(format!("f{:o}:{}", mode, hash))
            }
            Some(EntryKind::Symlink { target }) => {
                hasher.update(format!("l{}", target.to_string_lossy()))
            }
            None => {}
        }
        hasher.update([b'\n']);
    }
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

/// Recursively copies `src` into `dst`, preserving symlinks and permissions.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        let meta = fs::symlink_metadata(&from)?;
        let ft = meta.file_type();

        // Replace entries of a different type instead of merging into them.
        if let Ok(existing) = fs::symlink_metadata(&to) {
            let same_dir = existing.is_dir() && ft.is_dir();
            if !same_dir {
                if existing.is_dir() {
                    fs::remove_dir_all(&to)?;
                } else {
                    fs::remove_file(&to)?;
                }
            }
        }

        if ft.is_symlink() {
            let target = fs::read_link(&from)?;
            make_symlink(&target, &to)?;
        } else if ft.is_dir() {
            fs::create_dir_all(&to)?;
            fs::set_permissions(&to, meta.permissions())?;
            copy_tree(&from, &to)?;
        } else if ft.is_file() {
            fs::copy(&from, &to)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn make_symlink(target: &Path, link: &Path) -> Result<()> {
    std::os::unix::fs::symlink(target, link)?;
    Ok(())
}

#[cfg(not(unix))]
fn make_symlink(target: &Path, link: &Path) -> Result<()> {
    let _ = (target, link);
    Err(Error::Internal("symlinks require a unix host".to_string()))
}
