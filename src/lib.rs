//! # layerkit
//!
//! **Layered Image Builder and Single-Process Supervisor**
//!
//! Packages a Python application into an immutable, layered image and runs
//! it as one supervised process. The packaging contract is fixed: base
//! `python:3.11-slim`, working directory `/app`, dependencies from
//! `requirements.txt` installed without a package cache, the whole source
//! tree copied last, and `python bot.py` as the entrypoint.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                            layerkit                                 │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────────────────────────────────────────────────┐    │
//! │  │                      ImageBuilder                           │    │
//! │  │   FROM base → WORKDIR /app → INSTALL manifest → COPY .      │    │
//! │  │   chained step keys │ snapshot diff → layer │ atomic tag    │    │
//! │  └─────────────────────────────────────────────────────────────┘    │
//! │                              │                                      │
//! │  ┌───────────────────────────┼───────────────────────────────┐      │
//! │  │                 Image Store / Step Cache                  │      │
//! │  │  images.json (tag → manifest) │ cache.json (key → layer)  │      │
//! │  └───────────────────────────┼───────────────────────────────┘      │
//! │                              │                                      │
//! │  ┌───────────────────────────┼───────────────────────────────┐      │
//! │  │               Content-Addressed Storage                   │      │
//! │  │  Digest verification │ Deduplication │ Atomic writes      │      │
//! │  └───────────────────────────┼───────────────────────────────┘      │
//! │                              │                                      │
//! │  ┌───────────────────────────┴───────────────────────────────┐      │
//! │  │                       Supervisor                          │      │
//! │  │  Bundle (rootfs) → spawn entrypoint → forward signals     │      │
//! │  │  exit code pass-through │ StopHandle (TERM → KILL)        │      │
//! │  └───────────────────────────────────────────────────────────┘      │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │                        Base Image Sources                           │
//! │      ┌──────────────────┐            ┌──────────────────────┐       │
//! │      │  RegistrySource  │            │   LocalBaseSource    │       │
//! │      │  OCI distribution│            │  <dir>/<name>/<tag>  │       │
//! │      └──────────────────┘            └──────────────────────┘       │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Layer Caching
//!
//! A step's key chains its parent's key with the step's own input, so:
//!
//! | Change                   | Rebuilt steps          |
//! |--------------------------|------------------------|
//! | source file only         | copy                   |
//! | `requirements.txt`       | install, copy          |
//! | base image digest        | workdir, install, copy |
//!
//! # Failure Model
//!
//! A build either commits a tagged image or records nothing. An installer
//! that exits non-zero, is killed, or times out fails the build with
//! [`Error::DependencyResolution`].
//!
//! # Key Security Properties
//!
//! - **Path Traversal Protection**: layer extraction rejects `..` and
//!   absolute paths (see [`layer::apply_layer`]).
//! - **Size Limits**: `MAX_LAYER_SIZE`, `MAX_ROOTFS_SIZE`, `MAX_LAYERS`,
//!   `MAX_MANIFEST_SIZE` and `MAX_CONTEXT_FILES` bound every input.
//! - **Digest Verification**: blobs are verified before they are stored
//!   (see [`storage::BlobStore::put_blob`]).
//! - **Timeouts**: registry pulls are bounded by `IMAGE_PULL_TIMEOUT`,
//!   installs by `INSTALL_TIMEOUT`.
//!
//! # Example
//!
//! ```rust,ignore
//! use layerkit::{BuildContext, BuildOptions, BuildRecipe, ImageBuilder, LayerkitConfig, Supervisor};
//!
//! #[tokio::main]
//! async fn main() -> layerkit::Result<()> {
//!     let config = LayerkitConfig::load(None)?;
//!     let context = BuildContext::load(std::path::Path::new("."))?;
//!
//!     let builder = ImageBuilder::new(config.clone())?;
//!     let report = builder
//!         .build(&BuildRecipe::default(), &context, &BuildOptions::new("bot:latest"))
//!         .await?;
//!
//!     let code = Supervisor::new(&config)?.run(&report.image.tag).await?;
//!     std::process::exit(code);
//! }
//! ```

pub mod builder;
pub mod bundle;
pub mod cache;
pub mod config;
pub mod constants;
pub mod context;
pub mod error;
pub mod image;
pub mod layer;
pub mod manifest;
pub mod platform;
pub mod recipe;
pub mod registry;
pub mod runtime;
pub mod storage;
pub mod supervisor;

// Re-exports
pub use builder::{BuildOptions, BuildReport, ImageBuilder, Stage, StepReport};
pub use bundle::{Bundle, BundleBuilder};
pub use cache::StepCache;
pub use config::{Isolation, LayerkitConfig};
pub use constants::*;
pub use context::BuildContext;
pub use error::{Error, Result};
pub use image::{ImageConfig, ImageManifest, ImageRecord, ImageStore};
pub use layer::LayerDescriptor;
pub use manifest::{Manifest, Requirement};
pub use platform::{Arch, Capability, Os, Platform};
pub use recipe::{BuildRecipe, Step};
pub use registry::{BaseImageSource, ImageHandle, LocalBaseSource, RegistrySource};
pub use runtime::{ExecResult, Executor, ProcessExecutor, ProcessSpec, Signal};
pub use storage::BlobStore;
pub use supervisor::{OutputMode, RunOutcome, RunningContainer, StopHandle, Supervisor};
