//! Tests for the image builder.
//!
//! Runs full builds in host isolation against a local base image, with a
//! shell script standing in for the package installer.

mod common;

use async_trait::async_trait;
use common::{Fixture, failing_installer, recipe};
use layerkit::bundle::BundleBuilder;
use layerkit::{
    BuildContext, BuildOptions, Error, Executor, ImageBuilder, Isolation, ProcessExecutor,
    ProcessSpec,
};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tokio::process::Command;

async fn build(fixture: &Fixture, options: &BuildOptions) -> layerkit::Result<layerkit::BuildReport> {
    let builder = ImageBuilder::new(fixture.config())?;
    let context = BuildContext::load(fixture.context_path())?;
    builder.build(&recipe(), &context, options).await
}

// =============================================================================
// Successful Builds
// =============================================================================

#[tokio::test]
async fn test_build_produces_tagged_image() {
    let fixture = Fixture::new();
    let report = build(&fixture, &BuildOptions::new("bot:latest")).await.unwrap();

    let names: Vec<_> = report.steps.iter().map(|s| s.step).collect();
    assert_eq!(names, vec!["base", "workdir", "install", "copy"]);
    assert!(report.steps.iter().all(|s| !s.cached));

    let image = &report.image;
    assert_eq!(image.tag, "bot:latest");
    assert_eq!(image.config.config.working_dir.as_deref(), Some("/app"));
    assert_eq!(image.config.config.argv(), vec!["python", "bot.py"]);
    assert_eq!(
        image.config.config.get_env("PATH"),
        Some("/usr/local/bin:/usr/bin:/bin")
    );
    assert_eq!(image.config.rootfs.diff_ids.len(), image.manifest.layers.len());
    // base + workdir + install + copy
    assert_eq!(image.manifest.layers.len(), 4);
    assert_eq!(image.config.history.len(), 4);
}

#[tokio::test]
async fn test_workdir_contains_whole_source_tree() {
    let fixture = Fixture::new();
    fs::create_dir_all(fixture.context_path().join("handlers")).unwrap();
    fs::write(fixture.context_path().join("handlers/start.py"), "x = 1\n").unwrap();
    fs::write(fixture.context_path().join(".env.example"), "TOKEN=\n").unwrap();

    let report = build(&fixture, &BuildOptions::new("bot:latest")).await.unwrap();

    let storage = Arc::new(layerkit::BlobStore::with_path(fixture.store_root().join("blobs")).unwrap());
    let bundles = BundleBuilder::new(&fixture.store_root(), storage).unwrap();
    let bundle = bundles.build(&report.image).unwrap();

    let app = bundle.rootfs.join("app");
    for file in ["bot.py", "requirements.txt", "handlers/start.py", ".env.example"] {
        assert!(app.join(file).is_file(), "{} missing from /app", file);
    }
    assert_eq!(
        fs::read_to_string(
            bundle
                .rootfs
                .join("usr/local/lib/python3.11/site-packages/requests/INSTALLED")
        )
        .unwrap(),
        "requests==2.31.0\n"
    );
    assert_eq!(bundle.process.cwd, "/app");
    assert_eq!(bundle.process.args, vec!["python", "bot.py"]);

    bundles.remove(&bundle).unwrap();
}

#[tokio::test]
async fn test_installer_cache_is_not_retained() {
    let fixture = Fixture::new();
    let report = build(&fixture, &BuildOptions::new("bot:latest")).await.unwrap();

    let storage = Arc::new(layerkit::BlobStore::with_path(fixture.store_root().join("blobs")).unwrap());
    let bundles = BundleBuilder::new(&fixture.store_root(), storage).unwrap();
    let bundle = bundles.build(&report.image).unwrap();

    assert!(!bundle.rootfs.join("root/.cache/pip").exists());
    assert!(!bundle.rootfs.join("tmp/pip-build-xyz").exists());
    assert!(bundle.rootfs.join("tmp").is_dir());
}

// =============================================================================
// Dependency Resolution Failures
// =============================================================================

#[tokio::test]
async fn test_unresolvable_manifest_fails_without_image() {
    let fixture = Fixture::new();
    fixture.write_context("nosuchpkg==9.9\n", "print('x')\n");

    let builder = ImageBuilder::new(fixture.config()).unwrap();
    let context = BuildContext::load(fixture.context_path()).unwrap();
    let recipe = layerkit::BuildRecipe::default().with_install_command(failing_installer());

    let err = builder
        .build(&recipe, &context, &BuildOptions::new("bot:latest"))
        .await
        .unwrap_err();

    match &err {
        Error::DependencyResolution { exit_code, reason } => {
            assert_eq!(*exit_code, Some(1));
            assert!(reason.contains("No matching distribution"));
        }
        other => panic!("expected dependency resolution failure, got {:?}", other),
    }
    assert!(err.is_dependency_resolution());
    assert!(!builder.images().exists("bot:latest"));
    assert!(builder.images().list().unwrap().is_empty());
    assert!(
        fs::read_dir(fixture.store_root().join("scratch"))
            .map(|mut d| d.next().is_none())
            .unwrap_or(true),
        "scratch rootfs should be cleaned up"
    );
}

#[tokio::test]
async fn test_failed_rebuild_keeps_previous_image() {
    let fixture = Fixture::new();
    let first = build(&fixture, &BuildOptions::new("bot:latest")).await.unwrap();

    fixture.write_context("nosuchpkg==9.9\n", "print('x')\n");
    let builder = ImageBuilder::new(fixture.config()).unwrap();
    let context = BuildContext::load(fixture.context_path()).unwrap();
    let recipe = layerkit::BuildRecipe::default().with_install_command(failing_installer());
    assert!(
        builder
            .build(&recipe, &context, &BuildOptions::new("bot:latest"))
            .await
            .is_err()
    );

    let current = builder.images().get("bot:latest").unwrap();
    assert_eq!(current.manifest_digest, first.image.manifest_digest);
}

#[tokio::test]
async fn test_missing_installer_is_dependency_failure() {
    let fixture = Fixture::new();
    let builder = ImageBuilder::new(fixture.config()).unwrap();
    let context = BuildContext::load(fixture.context_path()).unwrap();
    let recipe = layerkit::BuildRecipe::default()
        .with_install_command(vec!["/nonexistent/pip".to_string()]);

    let err = builder
        .build(&recipe, &context, &BuildOptions::new("bot:latest"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::DependencyResolution { exit_code: None, .. }));
}

#[tokio::test]
async fn test_malformed_manifest_rejected_before_build() {
    let fixture = Fixture::new();
    fixture.write_context("requests==2.31.0\nthis is not valid!!\n", "print('x')\n");

    let err = BuildContext::load(fixture.context_path()).unwrap_err();
    assert!(matches!(err, Error::InvalidManifest { line: 2, .. }));
}

#[tokio::test]
async fn test_unknown_base_image_fails() {
    let fixture = Fixture::new();
    let builder = ImageBuilder::new(fixture.config()).unwrap();
    let context = BuildContext::load(fixture.context_path()).unwrap();
    let recipe = common::recipe().with_base_image("bad image ref");

    let err = builder
        .build(&recipe, &context, &BuildOptions::new("bot:latest"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidImageReference { .. }));
    assert!(!builder.images().exists("bot:latest"));
}

// =============================================================================
// Layer Caching
// =============================================================================

#[tokio::test]
async fn test_source_change_reuses_install_layer() {
    let fixture = Fixture::new();
    let first = build(&fixture, &BuildOptions::new("bot:latest")).await.unwrap();

    fixture.write_context("requests==2.31.0\n", "print('bot v2')\n");
    let second = build(&fixture, &BuildOptions::new("bot:latest")).await.unwrap();

    let install_1 = first.step("install").unwrap();
    let install_2 = second.step("install").unwrap();
    assert!(second.step("workdir").unwrap().cached);
    assert!(install_2.cached);
    assert_eq!(install_1.layers, install_2.layers);

    let copy_2 = second.step("copy").unwrap();
    assert!(!copy_2.cached);
    assert_ne!(first.step("copy").unwrap().layers, copy_2.layers);
    assert_ne!(first.image.manifest_digest, second.image.manifest_digest);
}

#[tokio::test]
async fn test_manifest_change_invalidates_install_and_copy() {
    let fixture = Fixture::new();
    let first = build(&fixture, &BuildOptions::new("bot:latest")).await.unwrap();

    fixture.write_context("requests==2.32.0\n", "print('bot started')\n");
    let second = build(&fixture, &BuildOptions::new("bot:latest")).await.unwrap();

    assert!(second.step("workdir").unwrap().cached);
    assert!(!second.step("install").unwrap().cached);
    assert!(!second.step("copy").unwrap().cached);
    assert_ne!(
        first.step("install").unwrap().layers,
        second.step("install").unwrap().layers
    );
}

#[tokio::test]
async fn test_unchanged_rebuild_is_fully_cached_and_identical_layers() {
    let fixture = Fixture::new();
    let first = build(&fixture, &BuildOptions::new("bot:latest")).await.unwrap();
    let second = build(&fixture, &BuildOptions::new("bot:latest")).await.unwrap();

    assert!(second.steps.iter().skip(1).all(|s| s.cached));
    assert_eq!(first.image.layers(), second.image.layers());
}

#[tokio::test]
async fn test_no_cache_rebuild_is_reproducible() {
    let fixture = Fixture::new();
    let first = build(&fixture, &BuildOptions::new("bot:latest")).await.unwrap();
    let second = build(&fixture, &BuildOptions::new("bot:latest").no_cache(true))
        .await
        .unwrap();

    assert!(second.steps.iter().all(|s| !s.cached));
    // Deterministic packing: same inputs, same layer digests.
    assert_eq!(first.image.layers(), second.image.layers());
}

/// Reports `isolation` while running everything on the host.
struct ReportingExecutor {
    isolation: Isolation,
    inner: ProcessExecutor,
}

#[async_trait]
impl Executor for ReportingExecutor {
    fn isolation(&self) -> Isolation {
        self.isolation
    }

    fn command(&self, rootfs: &Path, spec: &ProcessSpec) -> layerkit::Result<Command> {
        self.inner.command(rootfs, spec)
    }
}

#[tokio::test]
async fn test_isolation_change_invalidates_install() {
    let fixture = Fixture::new();
    let context = BuildContext::load(fixture.context_path()).unwrap();
    let options = BuildOptions::new("bot:latest");

    let host = ImageBuilder::new(fixture.config()).unwrap();
    let first = host.build(&recipe(), &context, &options).await.unwrap();

    let executor = Arc::new(ReportingExecutor {
        isolation: Isolation::Chroot,
        inner: ProcessExecutor::new(Isolation::Host).unwrap(),
    });
    let chroot = ImageBuilder::with_executor(fixture.config(), executor).unwrap();
    let second = chroot.build(&recipe(), &context, &options).await.unwrap();

    assert!(second.step("workdir").unwrap().cached);
    assert!(!second.step("install").unwrap().cached);
    assert!(!second.step("copy").unwrap().cached);

    // Back on the host the first install layer is still a hit.
    let third = host.build(&recipe(), &context, &options).await.unwrap();
    assert!(third.step("install").unwrap().cached);
    assert_eq!(
        first.step("install").unwrap().layers,
        third.step("install").unwrap().layers
    );
}

// =============================================================================
// Garbage Collection
// =============================================================================

#[tokio::test]
async fn test_gc_keeps_referenced_blobs() {
    let fixture = Fixture::new();
    let report = build(&fixture, &BuildOptions::new("bot:latest")).await.unwrap();

    let builder = ImageBuilder::new(fixture.config()).unwrap();
    let orphan = builder.storage().put_blob_computed(b"orphan").unwrap();

    let stats = builder.gc().unwrap();
    assert_eq!(stats.removed_count, 1);
    assert!(!builder.storage().has_blob(&orphan));
    for blob in report.image.blobs() {
        assert!(builder.storage().has_blob(&blob));
    }

    // After untagging and clearing the cache everything is collectable.
    builder.images().remove("bot:latest").unwrap();
    builder.cache().clear().unwrap();
    builder.gc().unwrap();
    assert!(builder.storage().list_blobs().unwrap().is_empty());
}

#[tokio::test]
async fn test_gc_prunes_leftover_bundles() {
    let fixture = Fixture::new();
    let report = build(&fixture, &BuildOptions::new("bot:latest")).await.unwrap();

    let builder = ImageBuilder::new(fixture.config()).unwrap();
    let bundles = BundleBuilder::new(&fixture.store_root(), Arc::clone(builder.storage())).unwrap();
    let leftover = bundles.build(&report.image).unwrap();
    assert!(leftover.path.exists());

    builder.gc().unwrap();
    assert!(!leftover.path.exists());
    assert!(fs::read_dir(bundles.base_dir()).unwrap().next().is_none());
    for blob in report.image.blobs() {
        assert!(builder.storage().has_blob(&blob));
    }
}
