//! # Process Supervisor
//!
//! Starts the single entrypoint process of a committed image and sees it
//! through to its exit:
//!
//! ```text
//!  ImageStore ──► BundleBuilder ──► rootfs ──► Executor::command ──► child
//!                                                                    │
//!        SIGTERM / SIGINT / SIGHUP ──── forwarded unchanged ────────►│
//!        StopHandle::stop ── SIGTERM, grace period, SIGKILL ────────►│
//!                                                                    ▼
//!                                       exit code (128 + n when killed by signal n)
//! ```
//!
//! The child is the only foreground process. Its arguments, working
//! directory and environment come from the image config; nothing is added.
//! The supervisor does not restart it and has no opinion on how it handles
//! the forwarded signals.

use crate::bundle::{Bundle, BundleBuilder};
use crate::config::LayerkitConfig;
use crate::constants::{BLOB_STORE_DIR, DEFAULT_GRACE_PERIOD};
use crate::error::{Error, Result};
use crate::image::ImageStore;
use crate::runtime::{Executor, ProcessExecutor, Signal, exit_code_of};
use crate::storage::BlobStore;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Child;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Where the child's stdio goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
    /// Share the supervisor's stdin/stdout/stderr.
    #[default]
    Inherit,
    /// Capture stdout and stderr; stdin is closed.
    Capture,
}

/// How a run ended.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub exit_code: i32,
    /// Captured stdout ([`OutputMode::Capture`] only).
    pub stdout: Vec<u8>,
    /// Captured stderr ([`OutputMode::Capture`] only).
    pub stderr: Vec<u8>,
}

// =============================================================================
// Stop Handle
// =============================================================================

/// Stops a running container from elsewhere.
#[derive(Debug, Clone)]
pub struct StopHandle {
    pid: u32,
    exited: watch::Receiver<Option<i32>>,
}

impl StopHandle {
    /// Child process id.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Returns true once the child has been reaped.
    pub fn has_exited(&self) -> bool {
        self.exited.borrow().is_some()
    }

    /// SIGTERM, then SIGKILL after [`DEFAULT_GRACE_PERIOD`].
    pub async fn stop(&self) -> Result<()> {
        self.stop_with_grace(DEFAULT_GRACE_PERIOD).await
    }

    /// SIGTERM, then SIGKILL if the child outlives `grace`.
    pub async fn stop_with_grace(&self, grace: Duration) -> Result<()> {
        if self.has_exited() {
            return Ok(());
        }
        info!("Stopping pid {} (grace {:?})", self.pid, grace);
        Signal::Term.send(self.pid)?;

        let mut exited = self.exited.clone();
        let timed_out = tokio::time::timeout(grace, exited.wait_for(Option::is_some))
            .await
            .is_err();
        if timed_out && !self.has_exited() {
            warn!("pid {} ignored SIGTERM, sending SIGKILL", self.pid);
            Signal::Kill.send(self.pid)?;
        }
        Ok(())
    }
}

// =============================================================================
// Running Container
// =============================================================================

/// Signal streams registered before the child is spawned.
///
/// Signals arriving between `start` and `wait` stay queued here and are
/// forwarded once `wait` runs.
#[cfg(unix)]
struct ForwardedSignals {
    term: tokio::signal::unix::Signal,
    int: tokio::signal::unix::Signal,
    hup: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl ForwardedSignals {
    fn register() -> Result<Self> {
        use tokio::signal::unix::{SignalKind, signal};

        Ok(Self {
            term: signal(SignalKind::terminate())?,
            int: signal(SignalKind::interrupt())?,
            hup: signal(SignalKind::hangup())?,
        })
    }
}

#[cfg(not(unix))]
struct ForwardedSignals;

#[cfg(not(unix))]
impl ForwardedSignals {
    fn register() -> Result<Self> {
        Ok(Self)
    }
}

/// A started entrypoint process.
pub struct RunningContainer {
    child: Child,
    pid: u32,
    bundle: Bundle,
    bundles: Arc<BundleBuilder>,
    signals: ForwardedSignals,
    exit_tx: watch::Sender<Option<i32>>,
    exit_rx: watch::Receiver<Option<i32>>,
    stdout: Option<JoinHandle<Vec<u8>>>,
    stderr: Option<JoinHandle<Vec<u8>>>,
}

impl RunningContainer {
    /// Child process id.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Bundle the process runs in.
    pub fn bundle(&self) -> &Bundle {
        &self.bundle
    }

    /// Handle for stopping the process from another task.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            pid: self.pid,
            exited: self.exit_rx.clone(),
        }
    }

    /// Waits for exit, forwarding SIGTERM, SIGINT and SIGHUP to the child.
    ///
    /// The bundle is removed once the process is gone.
    pub async fn wait(mut self) -> Result<RunOutcome> {
        let status = self.wait_forwarding().await;
        let exit_code = match status {
            Ok(code) => code,
            Err(e) => {
                let _ = self.bundles.remove(&self.bundle);
                return Err(e);
            }
        };
        let _ = self.exit_tx.send(Some(exit_code));

        let stdout = collect(self.stdout.take()).await;
        let stderr = collect(self.stderr.take()).await;

        info!("Process {} exited with code {}", self.pid, exit_code);
        if let Err(e) = self.bundles.remove(&self.bundle) {
            warn!("Failed to clean up bundle {}: {}", self.bundle.id, e);
        }

        Ok(RunOutcome {
            exit_code,
            stdout,
            stderr,
        })
    }

    #[cfg(unix)]
    async fn wait_forwarding(&mut self) -> Result<i32> {
        loop {
            let forward = tokio::select! {
                status = self.child.wait() => return Ok(exit_code_of(status?)),
                _ = self.signals.term.recv() => Signal::Term,
                _ = self.signals.int.recv() => Signal::Int,
                _ = self.signals.hup.recv() => Signal::Hup,
            };
            debug!("Forwarding {} to pid {}", forward, self.pid);
            if let Err(e) = forward.send(self.pid) {
                warn!("Failed to forward {}: {}", forward, e);
            }
        }
    }

    #[cfg(not(unix))]
    async fn wait_forwarding(&mut self) -> Result<i32> {
        Ok(exit_code_of(self.child.wait().await?))
    }
}

async fn collect(handle: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    match handle {
        Some(handle) => handle.await.unwrap_or_default(),
        None => Vec::new(),
    }
}

fn drain<R>(reader: Option<R>) -> Option<JoinHandle<Vec<u8>>>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    reader.map(|mut r| {
        tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = r.read_to_end(&mut buf).await;
            buf
        })
    })
}

// =============================================================================
// Supervisor
// =============================================================================

/// Runs images from the local store.
pub struct Supervisor {
    images: ImageStore,
    bundles: Arc<BundleBuilder>,
    executor: Arc<dyn Executor>,
}

impl Supervisor {
    /// Opens the store at `config.store_root` with a process executor.
    pub fn new(config: &LayerkitConfig) -> Result<Self> {
        let executor = Arc::new(ProcessExecutor::new(config.isolation)?);
        Self::with_executor(config, executor)
    }

    /// Opens the store with a custom executor.
    pub fn with_executor(config: &LayerkitConfig, executor: Arc<dyn Executor>) -> Result<Self> {
        let root = &config.store_root;
        let storage = Arc::new(BlobStore::with_path(root.join(BLOB_STORE_DIR))?);
        let images = ImageStore::open(root, Arc::clone(&storage))?;
        let bundles = Arc::new(BundleBuilder::new(root, storage)?);
        Ok(Self {
            images,
            bundles,
            executor,
        })
    }

    /// Materializes `tag` and spawns its entrypoint.
    pub async fn start(&self, tag: &str, output: OutputMode) -> Result<RunningContainer> {
        let image = self.images.get(tag)?;
        let bundle = self.bundles.build(&image)?;

        let mut cmd = match self.executor.command(&bundle.rootfs, &bundle.process) {
            Ok(cmd) => cmd,
            Err(e) => {
                let _ = self.bundles.remove(&bundle);
                return Err(e);
            }
        };
        match output {
            OutputMode::Inherit => {
                cmd.stdin(Stdio::inherit())
                    .stdout(Stdio::inherit())
                    .stderr(Stdio::inherit());
            }
            OutputMode::Capture => {
                cmd.stdin(Stdio::null())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::piped());
            }
        }
        cmd.kill_on_drop(true);

        let signals = match ForwardedSignals::register() {
            Ok(signals) => signals,
            Err(e) => {
                let _ = self.bundles.remove(&bundle);
                return Err(e);
            }
        };

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let _ = self.bundles.remove(&bundle);
                return Err(Error::SpawnFailed {
                    command: bundle.process.display(),
                    reason: e.to_string(),
                });
            }
        };
        let pid = child.id().ok_or_else(|| Error::Internal("child has no pid".into()))?;

        info!(
            "Started '{}' in {} (pid {}, image {})",
            bundle.process.display(),
            bundle.process.cwd,
            pid,
            image.short_id()
        );

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());
        let (exit_tx, exit_rx) = watch::channel(None);

        Ok(RunningContainer {
            child,
            pid,
            bundle,
            bundles: Arc::clone(&self.bundles),
            signals,
            exit_tx,
            exit_rx,
            stdout,
            stderr,
        })
    }

    /// Runs `tag` in the foreground and returns its exit code.
    pub async fn run(&self, tag: &str) -> Result<i32> {
        let container = self.start(tag, OutputMode::Inherit).await?;
        Ok(container.wait().await?.exit_code)
    }
}
