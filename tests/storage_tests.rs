//! Tests for the content-addressed blob store.
//!
//! Covers digest verification, path sanitization, concurrent writers and
//! garbage collection with in-flight protection.

use layerkit::storage::{BlobStore, sha256_digest};
use std::collections::HashSet;
use std::sync::Arc;
use tempfile::TempDir;

fn store() -> (TempDir, BlobStore) {
    let dir = TempDir::new().unwrap();
    let store = BlobStore::with_path(dir.path().join("blobs")).unwrap();
    (dir, store)
}

// =============================================================================
// Put/Get Tests
// =============================================================================

#[test]
fn test_put_computed_returns_digest() {
    let (_dir, store) = store();
    let digest = store.put_blob_computed(b"layer bytes").unwrap();

    assert_eq!(digest, sha256_digest(b"layer bytes"));
    assert!(store.has_blob(&digest));
    assert_eq!(store.get_blob(&digest).unwrap(), b"layer bytes");
    assert_eq!(store.blob_size(&digest).unwrap(), 11);
}

#[test]
fn test_put_verifies_digest() {
    let (_dir, store) = store();
    let wrong = sha256_digest(b"something else");

    assert!(store.put_blob(&wrong, b"actual").is_err());
    assert!(!store.has_blob(&wrong));
    assert!(store.list_blobs().unwrap().is_empty());
}

#[test]
fn test_only_sha256_accepted() {
    let (_dir, store) = store();
    let hash = hex::encode([0u8; 64]);
    assert!(store.put_blob(&format!("sha512:{}", hash), b"x").is_err());
}

#[test]
fn test_same_content_stored_once() {
    let (_dir, store) = store();
    let a = store.put_blob_computed(b"requests==2.31.0\n").unwrap();
    let b = store.put_blob_computed(b"requests==2.31.0\n").unwrap();

    assert_eq!(a, b);
    assert_eq!(store.list_blobs().unwrap(), vec![a]);
}

#[test]
fn test_missing_blob_is_not_found() {
    let (_dir, store) = store();
    let err = store.get_blob(&sha256_digest(b"never stored")).unwrap_err();
    assert!(matches!(err, layerkit::Error::BlobNotFound { .. }));
    assert!(store.blob_size(&sha256_digest(b"never stored")).is_err());
}

#[test]
fn test_remove_blob_is_idempotent() {
    let (_dir, store) = store();
    let digest = store.put_blob_computed(b"x").unwrap();
    store.remove_blob(&digest).unwrap();
    store.remove_blob(&digest).unwrap();
    assert!(!store.has_blob(&digest));
}

// =============================================================================
// Path Safety Tests
// =============================================================================

#[test]
fn test_blob_path_sharded_under_base() {
    let (_dir, store) = store();
    let digest = sha256_digest(b"shard me");
    let hash = digest.strip_prefix("sha256:").unwrap();

    let path = store.blob_path(&digest);
    assert_eq!(
        path,
        store.base_dir().join("sha256").join(&hash[..2]).join(hash)
    );
}

#[test]
fn test_traversal_in_digest_stays_inside_store() {
    let (_dir, store) = store();
    for digest in ["sha256:../../../etc/passwd", "../../x:abcd", "sha256:ab/../cd"] {
        let path = store.blob_path(digest);
        assert!(path.starts_with(store.base_dir()), "{} escaped", digest);
        assert!(!path.components().any(|c| c.as_os_str() == ".."));
    }
}

// =============================================================================
// Concurrency Tests
// =============================================================================

#[test]
fn test_concurrent_writers_same_blob() {
    let (_dir, store) = store();
    let store = Arc::new(store);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let store = Arc::clone(&store);
            std::thread::spawn(move || store.put_blob_computed(&[7u8; 64 * 1024]).unwrap())
        })
        .collect();
    let digests: HashSet<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(digests.len(), 1);
    let digest = digests.into_iter().next().unwrap();
    assert_eq!(store.get_blob(&digest).unwrap().len(), 64 * 1024);
    // no leftover temp files
    assert_eq!(store.list_blobs().unwrap().len(), 1);
    assert_eq!(store.total_size().unwrap(), 64 * 1024);
}

// =============================================================================
// Garbage Collection Tests
// =============================================================================

#[test]
fn test_gc_removes_only_unreferenced() {
    let (_dir, store) = store();
    let keep = store.put_blob_computed(b"keep").unwrap();
    let drop = store.put_blob_computed(b"drop me").unwrap();

    let referenced: HashSet<_> = [keep.clone()].into_iter().collect();
    let stats = store.gc(&referenced).unwrap();

    assert_eq!(stats.removed_count, 1);
    assert_eq!(stats.freed_bytes, 7);
    assert!(store.has_blob(&keep));
    assert!(!store.has_blob(&drop));
}

#[test]
fn test_gc_skips_inflight_blobs() {
    let (_dir, store) = store();
    let digest = store.put_blob_computed(b"being pulled").unwrap();

    store.track_inflight(&digest);
    assert_eq!(store.gc(&HashSet::new()).unwrap().removed_count, 0);
    assert!(store.has_blob(&digest));

    store.untrack_inflight(&digest);
    assert_eq!(store.gc(&HashSet::new()).unwrap().removed_count, 1);
}
