//! # Filesystem Layers
//!
//! A layer is a gzip-compressed tar archive holding the filesystem delta one
//! build step produced. This module:
//!
//! - indexes a root filesystem into a [`Snapshot`] (type, mode, content hash
//!   per path),
//! - diffs two snapshots into a [`LayerDiff`],
//! - packs a diff into a reproducible archive ([`pack_diff`]),
//! - applies archives onto a rootfs in order ([`extract_layers`]).
//!
//! ## Reproducibility
//!
//! Packed archives are byte-for-byte reproducible: entries are written in
//! sorted path order, with mtime 0, uid/gid 0 and no user/group names, and
//! the gzip header carries no timestamp. The same tree therefore always
//! yields the same layer digest, which is what lets the step cache key on
//! inputs rather than on outputs.
//!
//! ## Deletions
//!
//! A path present in the parent snapshot and missing from the child is
//! recorded as an empty `.wh.<name>` file in the same directory. When a
//! whole directory disappears only the directory gets a whiteout.
//!
//! ## Security
//!
//! Extraction rejects absolute paths and `..` components, bounds each
//! compressed layer by [`MAX_LAYER_SIZE`] and the extracted total by
//! [`MAX_ROOTFS_SIZE`].

use crate::constants::{
    MAX_LAYER_SIZE, MAX_ROOTFS_SIZE, OCI_LAYER_MEDIA_TYPE_GZIP, WHITEOUT_OPAQUE, WHITEOUT_PREFIX,
};
use crate::error::{Error, Result};
use crate::storage::{BlobStore, sha256_digest};
use flate2::Compression;
use flate2::GzBuilder;
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};
use tar::{Archive, EntryType, Header};
use tracing::debug;

/// Reference to a stored layer blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerDescriptor {
    /// Digest of the compressed blob.
    pub digest: String,
    /// Digest of the uncompressed tar stream.
    pub diff_id: String,
    /// Compressed size in bytes.
    pub size: u64,
    /// Media type.
    pub media_type: String,
}

// =============================================================================
// Snapshots
// =============================================================================

/// Metadata recorded per path in a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    Dir { mode: u32 },
    File { mode: u32, size: u64, hash: String },
    Symlink { target: PathBuf },
}

/// Index of a root filesystem keyed by path relative to the root.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    entries: BTreeMap<PathBuf, EntryKind>,
}

impl Snapshot {
    /// Walks `root` without following symlinks.
    pub fn scan(root: &Path) -> Result<Self> {
        let mut entries = BTreeMap::new();
        if root.exists() {
            scan_dir(root, Path::new(""), &mut entries)?;
        }
        Ok(Self { entries })
    }

    /// Number of indexed paths.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing was indexed.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Looks up one path.
    pub fn get(&self, path: &Path) -> Option<&EntryKind> {
        self.entries.get(path)
    }

    /// Iterates indexed paths in sorted order.
    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.entries.keys().map(PathBuf::as_path)
    }

    /// Returns the changes that turn `self` into `after`.
    pub fn diff(&self, after: &Snapshot) -> LayerDiff {
        let changed: Vec<PathBuf> = after
            .entries
            .iter()
            .filter(|(path, kind)| self.entries.get(*path) != Some(*kind))
            .map(|(path, _)| path.clone())
            .collect();

        let mut deleted: Vec<PathBuf> = Vec::new();
        for path in self.entries.keys() {
            if after.entries.contains_key(path) {
                continue;
            }
            // A deleted directory's whiteout covers its children.
            if deleted.iter().any(|d| path.starts_with(d)) {
                continue;
            }
            deleted.push(path.clone());
        }

        LayerDiff { changed, deleted }
    }

    /// Returns a diff that recreates the whole snapshot.
    pub fn as_full_diff(&self) -> LayerDiff {
        LayerDiff {
            changed: self.entries.keys().cloned().collect(),
            deleted: Vec::new(),
        }
    }
}

fn scan_dir(root: &Path, rel: &Path, out: &mut BTreeMap<PathBuf, EntryKind>) -> Result<()> {
    let dir = root.join(rel);
    for entry in fs::read_dir(&dir)? {
        let entry = entry?;
        let rel_path = rel.join(entry.file_name());
        let meta = fs::symlink_metadata(entry.path())?;
        let ft = meta.file_type();

        if ft.is_symlink() {
            let target = fs::read_link(entry.path())?;
            out.insert(rel_path, EntryKind::Symlink { target });
        } else if ft.is_dir() {
            out.insert(
                rel_path.clone(),
                EntryKind::Dir {
                    mode: file_mode(&meta),
                },
            );
            scan_dir(root, &rel_path, out)?;
        } else if ft.is_file() {
            let hash = hash_file(&entry.path())?;
            out.insert(
                rel_path,
                EntryKind::File {
                    mode: file_mode(&meta),
                    size: meta.len(),
                    hash,
                },
            );
        } else {
            debug!("Skipping special file {}", rel_path.display());
        }
    }
    Ok(())
}

fn hash_file(path: &Path) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut file = fs::File::open(path)?;
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(unix)]
fn file_mode(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn file_mode(meta: &fs::Metadata) -> u32 {
    if meta.is_dir() { 0o755 } else { 0o644 }
}

/// Paths to add or replace, and paths to delete, between two snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LayerDiff {
    /// Added or modified paths, sorted, parents before children.
    pub changed: Vec<PathBuf>,
    /// Removed paths (topmost only).
    pub deleted: Vec<PathBuf>,
}

impl LayerDiff {
    /// Returns true if the diff carries no change.
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.deleted.is_empty()
    }
}

// =============================================================================
// Packing
// =============================================================================

/// A packed layer not yet written to the blob store.
#[derive(Debug, Clone)]
pub struct PackedLayer {
    /// Gzip-compressed tar bytes.
    pub data: Vec<u8>,
    /// Digest of the uncompressed tar.
    pub diff_id: String,
}

impl PackedLayer {
    /// Stores the layer and returns its descriptor.
    pub fn store(self, storage: &BlobStore) -> Result<LayerDescriptor> {
        let size = self.data.len() as u64;
        let digest = storage.put_blob_computed(&self.data)?;
        Ok(LayerDescriptor {
            digest,
            diff_id: self.diff_id,
            size,
            media_type: OCI_LAYER_MEDIA_TYPE_GZIP.to_string(),
        })
    }
}

/// Packs the paths named by `diff`, read from `root`, into a layer.
pub fn pack_diff(root: &Path, diff: &LayerDiff) -> Result<PackedLayer> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.follow_symlinks(false);

    // Merge whiteouts into the sorted stream so parents still precede children.
    let mut items: Vec<(PathBuf, bool)> = diff
        .changed
        .iter()
        .map(|p| (p.clone(), false))
        .chain(diff.deleted.iter().map(|p| (whiteout_path(p), true)))
        .collect();
    items.sort();

    for (rel, is_whiteout) in items {
        if is_whiteout {
            let mut header = base_header(EntryType::Regular, 0o644, 0);
            builder
                .append_data(&mut header, &rel, io::empty())
                .map_err(layer_err)?;
            continue;
        }
        append_path(&mut builder, root, &rel)?;
    }

    let tar_bytes = builder.into_inner().map_err(layer_err)?;
    let diff_id = sha256_digest(&tar_bytes);

    let mut encoder = GzBuilder::new().write(Vec::new(), Compression::default());
    encoder.write_all(&tar_bytes).map_err(layer_err)?;
    let data = encoder.finish().map_err(layer_err)?;

    if data.len() > MAX_LAYER_SIZE {
        return Err(Error::ImageTooLarge {
            size: data.len() as u64,
            limit: MAX_LAYER_SIZE as u64,
        });
    }

    debug!(
        "Packed layer: {} changed, {} deleted, {} bytes",
        diff.changed.len(),
        diff.deleted.len(),
        data.len()
    );

    Ok(PackedLayer { data, diff_id })
}

/// Packs an entire tree as a single layer.
pub fn pack_tree(root: &Path) -> Result<PackedLayer> {
    let snapshot = Snapshot::scan(root)?;
    pack_diff(root, &snapshot.as_full_diff())
}

fn whiteout_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let parent = path.parent().unwrap_or(Path::new(""));
    parent.join(format!("{}{}", WHITEOUT_PREFIX, name))
}

fn base_header(kind: EntryType, mode: u32, size: u64) -> Header {
    let mut header = Header::new_gnu();
    header.set_entry_type(kind);
    header.set_mode(mode);
    header.set_size(size);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header
}

fn append_path(builder: &mut tar::Builder<Vec<u8>>, root: &Path, rel: &Path) -> Result<()> {
    let full = root.join(rel);
    let meta = fs::symlink_metadata(&full)?;
    let ft = meta.file_type();

    if ft.is_symlink() {
        let target = fs::read_link(&full)?;
        let mut header = base_header(EntryType::Symlink, 0o777, 0);
        builder
            .append_link(&mut header, rel, &target)
            .map_err(layer_err)?;
    } else if ft.is_dir() {
        let mut header = base_header(EntryType::Directory, file_mode(&meta), 0);
        builder
            .append_data(&mut header, rel, io::empty())
            .map_err(layer_err)?;
    } else if ft.is_file() {
        let mut header = base_header(EntryType::Regular, file_mode(&meta), meta.len());
        let file = fs::File::open(&full)?;
        builder
            .append_data(&mut header, rel, file)
            .map_err(layer_err)?;
    }
    Ok(())
}

fn layer_err(e: io::Error) -> Error {
    Error::LayerCreationFailed(e.to_string())
}

// =============================================================================
// Extraction
// =============================================================================

/// Applies stored layers to `rootfs`, bottom to top.
pub fn extract_layers(layers: &[LayerDescriptor], rootfs: &Path, storage: &BlobStore) -> Result<()> {
    fs::create_dir_all(rootfs)?;
    let mut total_size = 0u64;

    for layer in layers {
        debug!("Extracting layer: {}", layer.digest);
        let data = storage.get_blob(&layer.digest)?;
        apply_layer(&data, &layer.digest, rootfs, &mut total_size)?;
    }

    Ok(())
}

/// Applies one compressed layer to `rootfs`.
///
/// `total_size` accumulates extracted bytes across calls so the rootfs
/// bound holds for the whole image.
pub fn apply_layer(data: &[u8], digest: &str, rootfs: &Path, total_size: &mut u64) -> Result<()> {
    if data.len() > MAX_LAYER_SIZE {
        return Err(Error::ImageTooLarge {
            size: data.len() as u64,
            limit: MAX_LAYER_SIZE as u64,
        });
    }

    let extract_err = |e: io::Error| Error::LayerExtractionFailed {
        digest: digest.to_string(),
        reason: e.to_string(),
    };

    let decoder = GzDecoder::new(data);
    let mut archive = Archive::new(decoder);
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);

    for entry in archive.entries().map_err(extract_err)? {
        let mut entry = entry.map_err(extract_err)?;
        let path = entry.path().map_err(extract_err)?.into_owned();

        check_entry_path(&path)?;

        let filename = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        let parent = path.parent().unwrap_or(Path::new(""));

        if filename == WHITEOUT_OPAQUE {
            check_ancestors(rootfs, &path)?;
            clear_dir(&rootfs.join(parent))?;
            continue;
        }
        if let Some(target) = filename.strip_prefix(WHITEOUT_PREFIX) {
            check_ancestors(rootfs, &path)?;
            remove_path(&rootfs.join(parent).join(target))?;
            continue;
        }

        *total_size += entry.size();
        if *total_size > MAX_ROOTFS_SIZE {
            return Err(Error::ImageTooLarge {
                size: *total_size,
                limit: MAX_ROOTFS_SIZE,
            });
        }

        // A path may change type between layers (file ↔ dir ↔ symlink).
        let dest = rootfs.join(&path);
        let is_dir_entry = entry.header().entry_type() == EntryType::Directory;
        if let Ok(existing) = fs::symlink_metadata(&dest) {
            let existing_dir = existing.file_type().is_dir();
            if existing_dir != is_dir_entry || existing.file_type().is_symlink() {
                check_ancestors(rootfs, &path)?;
                remove_path(&dest)?;
            }
        }

        entry.unpack_in(rootfs).map_err(extract_err)?;
    }

    Ok(())
}

fn check_entry_path(path: &Path) -> Result<()> {
    let bad = path
        .components()
        .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)));
    if bad {
        return Err(Error::PathTraversal {
            path: path.to_string_lossy().to_string(),
        });
    }
    Ok(())
}

/// Fails when a directory above `path` inside `rootfs` is a symlink.
///
/// Removals must never resolve through a link planted by an earlier layer.
fn check_ancestors(rootfs: &Path, path: &Path) -> Result<()> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    let mut current = rootfs.to_path_buf();
    for component in parent.components() {
        let Component::Normal(name) = component else {
            continue;
        };
        current.push(name);
        match fs::symlink_metadata(&current) {
            Ok(meta) if meta.file_type().is_symlink() => {
                return Err(Error::PathTraversal {
                    path: path.to_string_lossy().to_string(),
                });
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

fn remove_path(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_dir() => fs::remove_dir_all(path)?,
        Ok(_) => fs::remove_file(path)?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

fn clear_dir(dir: &Path) -> Result<()> {
    if !dir.is_dir() {
        return Ok(());
    }
    for entry in fs::read_dir(dir)? {
        remove_path(&entry?.path())?;
    }
    Ok(())
}

/// Digest of the uncompressed tar inside a gzipped layer (its diff id).
pub fn uncompressed_digest(data: &[u8]) -> Result<String> {
    let mut decoder = GzDecoder::new(data);
    let mut tar_bytes = Vec::new();
    decoder
        .read_to_end(&mut tar_bytes)
        .map_err(|e| Error::LayerExtractionFailed {
            digest: sha256_digest(data),
            reason: e.to_string(),
        })?;
    Ok(sha256_digest(&tar_bytes))
}
