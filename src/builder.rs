//! # Image Builder
//!
//! Builds an image from a [`BuildRecipe`] and a [`BuildContext`] as an
//! ordered pipeline of immutable [`Stage`]s:
//!
//! ```text
//!  Stage 0            Stage 1             Stage 2                  Stage 3
//! ┌──────────┐      ┌──────────┐      ┌───────────────┐      ┌───────────────┐
//! │ base     │ ───► │ + /app   │ ───► │ + site-pkgs   │ ───► │ + source tree │ ──► commit
//! │ layers   │      │ (workdir)│      │ (install)     │      │ (copy)        │
//! └──────────┘      └──────────┘      └───────────────┘      └───────────────┘
//!   key₀ = H(∅, FROM, base digest)     key₂ = H(key₁, INSTALL, manifest ‖ argv)
//! ```
//!
//! ## Caching
//!
//! Every step has a chained key (see [`crate::cache::step_key`]). On a hit
//! the stored layer is reused without touching the filesystem; on a miss
//! the scratch rootfs is brought up to date with the parent stage, the
//! step runs, and the difference between the before and after snapshots
//! becomes the step's layer.
//!
//! ## Failure
//!
//! Steps are not retried. The image tag is written only after the last
//! step succeeded, so a failed build records nothing. The installer
//! exiting non-zero, being killed or timing out is
//! [`Error::DependencyResolution`].
//!
//! [`Error::DependencyResolution`]: crate::error::Error::DependencyResolution

use crate::bundle::BundleBuilder;
use crate::cache::{CacheEntry, StepCache, step_key};
use crate::config::{Isolation, LayerkitConfig};
use crate::constants::{
    BLOB_STORE_DIR, INSTALL_TIMEOUT, INSTALLER_CACHE_PATHS, INSTALLER_TMP_PREFIX, MAX_LAYERS,
    SCRATCH_DIR,
};
use crate::context::BuildContext;
use crate::error::{Error, Result};
use crate::image::{ContainerConfig, History, ImageConfig, ImageRecord, ImageStore, RootFs};
use crate::layer::{LayerDescriptor, Snapshot, extract_layers, pack_diff};
use crate::platform::Platform;
use crate::recipe::{BuildRecipe, Step};
use crate::registry::resolve_base;
use crate::runtime::{Executor, ProcessExecutor, ProcessSpec};
use crate::storage::{BlobStore, GcStats};
use chrono::Utc;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

// =============================================================================
// Options / Report
// =============================================================================

/// Per-build options.
#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Tag to commit the image under.
    pub tag: String,
    /// Skip cache lookups (results are still recorded).
    pub no_cache: bool,
}

impl BuildOptions {
    /// Options for `tag` with caching enabled.
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            no_cache: false,
        }
    }

    /// Disables cache lookups.
    pub fn no_cache(mut self, no_cache: bool) -> Self {
        self.no_cache = no_cache;
        self
    }
}

/// Outcome of one step.
#[derive(Debug, Clone)]
pub struct StepReport {
    pub step: &'static str,
    pub description: String,
    /// Chained cache key.
    pub key: String,
    /// Layers contributed (base: all base layers; others: zero or one).
    pub layers: Vec<LayerDescriptor>,
    pub cached: bool,
}

impl StepReport {
    /// Compressed bytes contributed by this step.
    pub fn size(&self) -> u64 {
        self.layers.iter().map(|l| l.size).sum()
    }
}

/// Outcome of a successful build.
#[derive(Debug, Clone)]
pub struct BuildReport {
    pub image: ImageRecord,
    pub steps: Vec<StepReport>,
}

impl BuildReport {
    /// Report for the step named `name`.
    pub fn step(&self, name: &str) -> Option<&StepReport> {
        self.steps.iter().find(|s| s.step == name)
    }
}

// =============================================================================
// Stages
// =============================================================================

/// The image as of one step: layer chain plus runtime defaults.
#[derive(Debug, Clone)]
pub struct Stage {
    /// Chained key of the step that produced this stage.
    pub chain_id: String,
    pub layers: Vec<LayerDescriptor>,
    pub config: ContainerConfig,
    pub history: Vec<History>,
}

impl Stage {
    fn next(
        &self,
        step: &Step,
        key: String,
        layer: Option<LayerDescriptor>,
        config: ContainerConfig,
    ) -> Stage {
        let mut layers = self.layers.clone();
        let mut history = self.history.clone();
        history.push(History {
            created: Some(Utc::now()),
            created_by: Some(step.describe()),
            empty_layer: layer.is_none().then_some(true),
        });
        layers.extend(layer);
        Stage {
            chain_id: key,
            layers,
            config,
            history,
        }
    }
}

/// Scratch rootfs for one build, removed on drop.
struct Scratch {
    dir: PathBuf,
    rootfs: PathBuf,
    /// Number of stage layers present in `rootfs`.
    applied: usize,
    /// Snapshot of `rootfs`, if still current.
    snapshot: Option<Snapshot>,
}

impl Scratch {
    fn create(base: &Path) -> Result<Self> {
        let dir = base.join(uuid::Uuid::now_v7().simple().to_string());
        let rootfs = dir.join("rootfs");
        fs::create_dir_all(&rootfs)?;
        Ok(Self {
            dir,
            rootfs,
            applied: 0,
            snapshot: None,
        })
    }

    /// Brings the rootfs up to `stage` and returns its snapshot.
    fn prepare(&mut self, stage: &Stage, storage: &BlobStore) -> Result<Snapshot> {
        if self.applied < stage.layers.len() {
            extract_layers(&stage.layers[self.applied..], &self.rootfs, storage)?;
            self.applied = stage.layers.len();
            self.snapshot = None;
        }
        match self.snapshot.take() {
            Some(snapshot) => Ok(snapshot),
            None => Snapshot::scan(&self.rootfs),
        }
    }

    /// Packs the changes since `before` into a stored layer.
    fn capture(&mut self, before: &Snapshot, storage: &BlobStore) -> Result<Option<LayerDescriptor>> {
        let after = Snapshot::scan(&self.rootfs)?;
        let diff = before.diff(&after);
        self.snapshot = Some(after);

        if diff.is_empty() {
            return Ok(None);
        }
        let layer = pack_diff(&self.rootfs, &diff)?.store(storage)?;
        self.applied += 1;
        Ok(Some(layer))
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir_all(&self.dir) {
            warn!("Failed to remove scratch dir {}: {}", self.dir.display(), e);
        }
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builds and stores images.
pub struct ImageBuilder {
    config: LayerkitConfig,
    storage: Arc<BlobStore>,
    images: ImageStore,
    cache: StepCache,
    executor: Arc<dyn Executor>,
}

impl ImageBuilder {
    /// Opens the store at `config.store_root` with a process executor.
    pub fn new(config: LayerkitConfig) -> Result<Self> {
        let executor = Arc::new(ProcessExecutor::new(config.isolation)?);
        Self::with_executor(config, executor)
    }

    /// Opens the store with a custom executor.
    pub fn with_executor(config: LayerkitConfig, executor: Arc<dyn Executor>) -> Result<Self> {
        let root = &config.store_root;
        let storage = Arc::new(BlobStore::with_path(root.join(BLOB_STORE_DIR))?);
        let images = ImageStore::open(root, Arc::clone(&storage))?;
        let cache = StepCache::open(root)?;
        Ok(Self {
            config,
            storage,
            images,
            cache,
            executor,
        })
    }

    /// Image store.
    pub fn images(&self) -> &ImageStore {
        &self.images
    }

    /// Blob storage.
    pub fn storage(&self) -> &Arc<BlobStore> {
        &self.storage
    }

    /// Step cache.
    pub fn cache(&self) -> &StepCache {
        &self.cache
    }

    /// Runs every step of `recipe` against `context` and commits the image.
    pub async fn build(
        &self,
        recipe: &BuildRecipe,
        context: &BuildContext,
        options: &BuildOptions,
    ) -> Result<BuildReport> {
        recipe.validate()?;
        crate::constants::validate_image_ref(&options.tag).map_err(|reason| {
            Error::InvalidImageReference {
                reference: options.tag.clone(),
                reason: reason.to_string(),
            }
        })?;

        info!(
            "Building {} from {} ({} isolation)",
            options.tag,
            context.root().display(),
            self.executor.isolation()
        );

        let mut scratch = Scratch::create(&self.config.store_root.join(SCRATCH_DIR))?;
        let mut reports = Vec::new();
        let steps = recipe.steps();

        let Some((Step::Base { image }, rest)) = steps.split_first() else {
            return Err(Error::InvalidRecipe("recipe must start with a base step".into()));
        };

        info!("Step 1/{}: FROM {}", steps.len(), image);
        let base = resolve_base(image, &self.storage, &self.config.base_dirs).await?;
        let base_key = step_key("", &steps[0].describe(), &base.digest);
        let mut stage = Stage {
            chain_id: base_key.clone(),
            layers: base.layers.clone(),
            config: base.config.clone(),
            history: base
                .layers
                .iter()
                .map(|_| History {
                    created: None,
                    created_by: Some(steps[0].describe()),
                    empty_layer: None,
                })
                .collect(),
        };
        reports.push(StepReport {
            step: steps[0].name(),
            description: steps[0].describe(),
            key: base_key,
            layers: base.layers,
            cached: false,
        });

        for (idx, step) in rest.iter().enumerate() {
            info!("Step {}/{}: {}", idx + 2, steps.len(), step.describe());

            let input = step_input(step, context, self.executor.isolation());
            let key = step_key(&stage.chain_id, &step.describe(), &input);
            let config = next_config(step, recipe, &stage.config);

            let cached = if options.no_cache {
                None
            } else {
                self.cache.get(&key, &self.storage)?
            };

            let (layer, hit) = match cached {
                Some(entry) => {
                    info!(" ---> Using cache {}", short(&key));
                    (entry.layer, true)
                }
                None => {
                    let before = scratch.prepare(&stage, &self.storage)?;
                    self.run_step(step, recipe, context, &stage, &scratch.rootfs).await?;
                    let layer = scratch.capture(&before, &self.storage)?;
                    self.cache.insert(&key, CacheEntry { layer: layer.clone() })?;
                    (layer, false)
                }
            };

            if let Some(l) = &layer {
                debug!("{} layer {} ({} bytes)", step.name(), l.digest, l.size);
            }

            reports.push(StepReport {
                step: step.name(),
                description: step.describe(),
                key: key.clone(),
                layers: layer.iter().cloned().collect(),
                cached: hit,
            });
            stage = stage.next(step, key, layer, config);
        }

        if stage.layers.len() > MAX_LAYERS {
            return Err(Error::InvalidRecipe(format!(
                "image has {} layers, limit is {}",
                stage.layers.len(),
                MAX_LAYERS
            )));
        }

        let image_config = ImageConfig {
            architecture: Platform::detect().oci_arch().to_string(),
            os: "linux".to_string(),
            created: Some(Utc::now()),
            config: stage.config.clone(),
            rootfs: RootFs {
                diff_ids: stage.layers.iter().map(|l| l.diff_id.clone()).collect(),
                ..RootFs::default()
            },
            history: stage.history.clone(),
        };

        let image = self.images.commit(&options.tag, &image_config, &stage.layers)?;
        info!(
            "Successfully built {} ({})",
            image.tag,
            image.short_id()
        );

        Ok(BuildReport {
            image,
            steps: reports,
        })
    }

    /// Applies one non-base step to the scratch rootfs.
    async fn run_step(
        &self,
        step: &Step,
        recipe: &BuildRecipe,
        context: &BuildContext,
        stage: &Stage,
        rootfs: &Path,
    ) -> Result<()> {
        let workdir = rootfs.join(recipe.workdir_rel());
        match step {
            Step::Base { .. } => Err(Error::InvalidRecipe("base step must come first".into())),
            Step::Workdir { .. } => fs::create_dir_all(&workdir).map_err(|e| step_error(step, e)),
            Step::Install { manifest, command } => {
                fs::create_dir_all(&workdir).map_err(|e| step_error(step, e))?;
                fs::write(workdir.join(manifest), context.manifest().content())
                    .map_err(|e| step_error(step, e))?;

                let spec = ProcessSpec::new(command.clone(), recipe.workdir.clone())
                    .with_env(stage.config.env.clone());
                self.install(rootfs, &spec, INSTALL_TIMEOUT).await?;
                strip_installer_caches(rootfs).map_err(|e| step_error(step, e))
            }
            Step::Copy => context
                .copy_into(&workdir)
                .map_err(|e| step_error(step, e)),
        }
    }

    /// Runs the installer. Every failure mode is a dependency resolution failure.
    async fn install(&self, rootfs: &Path, spec: &ProcessSpec, timeout: Duration) -> Result<()> {
        let result = match self.executor.exec(rootfs, spec, timeout).await {
            Ok(result) => result,
            Err(Error::Timeout { duration, .. }) => {
                return Err(Error::DependencyResolution {
                    exit_code: None,
                    reason: format!("installer timed out after {:?}", duration),
                });
            }
            Err(e) => {
                return Err(Error::DependencyResolution {
                    exit_code: None,
                    reason: e.to_string(),
                });
            }
        };

        debug!(
            "Installer output:\n{}",
            String::from_utf8_lossy(&result.stdout)
        );

        if !result.is_success() {
            return Err(Error::DependencyResolution {
                exit_code: Some(result.exit_code),
                reason: result.output_tail(20),
            });
        }
        Ok(())
    }

    /// Removes unreferenced blobs, leftover scratch directories and run bundles.
    pub fn gc(&self) -> Result<GcStats> {
        let mut referenced = self.images.referenced_blobs()?;
        referenced.extend(self.cache.referenced_blobs()?);

        let scratch = self.config.store_root.join(SCRATCH_DIR);
        if scratch.exists() {
            fs::remove_dir_all(&scratch)?;
        }

        let bundles = BundleBuilder::new(&self.config.store_root, Arc::clone(&self.storage))?;
        let pruned = bundles.prune()?;
        if pruned > 0 {
            info!("Removed {} leftover bundles", pruned);
        }

        self.storage.gc(&referenced)
    }
}

/// Digest of what a step consumes besides its parent.
///
/// The installer runs differently per isolation mode, so its layer is keyed on it.
fn step_input(step: &Step, context: &BuildContext, isolation: Isolation) -> String {
    match step {
        Step::Base { image } => image.clone(),
        Step::Workdir { path } => path.clone(),
        Step::Install { command, .. } => format!(
            "{}\0{}\0{}",
            context.manifest().digest(),
            command.join("\0"),
            isolation
        ),
        Step::Copy => context.fingerprint().to_string(),
    }
}

/// Runtime defaults after `step`.
fn next_config(step: &Step, recipe: &BuildRecipe, current: &ContainerConfig) -> ContainerConfig {
    let mut config = current.clone();
    match step {
        Step::Workdir { path } => config.working_dir = Some(path.clone()),
        Step::Copy => {
            config.entrypoint = None;
            config.cmd = Some(recipe.entrypoint.clone());
        }
        Step::Base { .. } | Step::Install { .. } => {}
    }
    config
}

/// Deletes installer caches so they never land in a layer.
fn strip_installer_caches(rootfs: &Path) -> std::io::Result<()> {
    for rel in INSTALLER_CACHE_PATHS {
        let path = rootfs.join(rel);
        if path.exists() {
            debug!("Removing installer cache {}", path.display());
            fs::remove_dir_all(&path)?;
        }
    }

    let tmp = rootfs.join("tmp");
    if tmp.is_dir() {
        for entry in fs::read_dir(&tmp)? {
            let entry = entry?;
            if entry
                .file_name()
                .to_string_lossy()
                .starts_with(INSTALLER_TMP_PREFIX)
            {
                if entry.file_type()?.is_dir() {
                    fs::remove_dir_all(entry.path())?;
                } else {
                    fs::remove_file(entry.path())?;
                }
            }
        }
    }
    Ok(())
}

fn step_error(step: &Step, e: impl std::fmt::Display) -> Error {
    Error::StepFailed {
        step: step.name().to_string(),
        reason: e.to_string(),
    }
}

fn short(digest: &str) -> &str {
    let hash = digest.strip_prefix("sha256:").unwrap_or(digest);
    &hash[..12.min(hash.len())]
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_strip_installer_caches() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        fs::create_dir_all(root.join("root/.cache/pip/http")).unwrap();
        fs::create_dir_all(root.join("tmp/pip-build-abc")).unwrap();
        fs::write(root.join("tmp/pip-unpack.tar"), "x").unwrap();
        fs::write(root.join("tmp/keep.txt"), "x").unwrap();

        strip_installer_caches(root).unwrap();

        assert!(!root.join("root/.cache/pip").exists());
        assert!(root.join("root/.cache").exists());
        assert!(!root.join("tmp/pip-build-abc").exists());
        assert!(!root.join("tmp/pip-unpack.tar").exists());
        assert!(root.join("tmp/keep.txt").exists());
    }

    #[test]
    fn test_next_config_sets_workdir_and_cmd() {
        let recipe = BuildRecipe::default();
        let base = ContainerConfig {
            cmd: Some(vec!["python3".into()]),
            ..ContainerConfig::default()
        };

        let after_workdir = next_config(&recipe.steps()[1], &recipe, &base);
        assert_eq!(after_workdir.working_dir.as_deref(), Some("/app"));

        let after_copy = next_config(&Step::Copy, &recipe, &after_workdir);
        assert_eq!(after_copy.argv(), vec!["python", "bot.py"]);
    }

    #[test]
    fn test_stage_next_records_empty_layers() {
        let stage = Stage {
            chain_id: "k0".into(),
            layers: vec![],
            config: ContainerConfig::default(),
            history: vec![],
        };
        let next = stage.next(&Step::Copy, "k1".into(), None, ContainerConfig::default());
        assert_eq!(next.chain_id, "k1");
        assert!(next.layers.is_empty());
        assert_eq!(next.history[0].empty_layer, Some(true));
        assert!(stage.history.is_empty());
    }
}
