//! Process execution against a snapshot root filesystem.
//!
//! Build steps and the entrypoint both run a process "inside" a rootfs:
//!
//! - [`Isolation::Chroot`]: `chroot(2)` into the rootfs, `chdir` into the
//!   working directory, environment replaced by the image environment.
//! - [`Isolation::Host`]: run on the host with the current directory set to
//!   `<rootfs>/<workdir>` and the image environment layered over the host's.
//!
//! [`Executor`] is the seam between the builder/supervisor and process
//! creation. [`ProcessExecutor`] is the implementation used in practice.

use crate::config::Isolation;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

// =============================================================================
// Signals
// =============================================================================

/// Signal that can be delivered to a supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// SIGTERM (graceful shutdown).
    Term,
    /// SIGKILL (force kill).
    Kill,
    /// SIGHUP (hangup).
    Hup,
    /// SIGINT (interrupt).
    Int,
}

impl Signal {
    /// Returns the signal number.
    #[cfg(unix)]
    pub fn as_i32(&self) -> i32 {
        match self {
            Self::Term => libc::SIGTERM,
            Self::Kill => libc::SIGKILL,
            Self::Hup => libc::SIGHUP,
            Self::Int => libc::SIGINT,
        }
    }

    #[cfg(not(unix))]
    pub fn as_i32(&self) -> i32 {
        match self {
            Self::Term => 15,
            Self::Kill => 9,
            Self::Hup => 1,
            Self::Int => 2,
        }
    }

    /// Sends this signal to `pid`. A process that already exited is not an error.
    #[cfg(unix)]
    pub fn send(&self, pid: u32) -> Result<()> {
        // SAFETY: kill(2) has no memory-safety preconditions.
        let ret = unsafe { libc::kill(pid as i32, self.as_i32()) };
        if ret != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ESRCH) {
                return Err(Error::SignalFailed {
                    signal: self.to_string(),
                    pid,
                    reason: err.to_string(),
                });
            }
        }
        Ok(())
    }

    #[cfg(not(unix))]
    pub fn send(&self, pid: u32) -> Result<()> {
        Err(Error::SignalFailed {
            signal: self.to_string(),
            pid,
            reason: "signals require a unix host".to_string(),
        })
    }
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Term => write!(f, "SIGTERM"),
            Self::Kill => write!(f, "SIGKILL"),
            Self::Hup => write!(f, "SIGHUP"),
            Self::Int => write!(f, "SIGINT"),
        }
    }
}

// =============================================================================
// Process Spec / Result
// =============================================================================

/// What to run inside a rootfs.
#[derive(Debug, Clone, Default)]
pub struct ProcessSpec {
    /// argv; `args[0]` is resolved through `PATH`.
    pub args: Vec<String>,
    /// Absolute working directory inside the rootfs.
    pub cwd: String,
    /// `KEY=VALUE` environment entries.
    pub env: Vec<String>,
}

impl ProcessSpec {
    /// Creates a spec for `args` in `cwd`.
    pub fn new(args: Vec<String>, cwd: impl Into<String>) -> Self {
        Self {
            args,
            cwd: cwd.into(),
            env: Vec::new(),
        }
    }

    /// Adds environment entries.
    pub fn with_env(mut self, env: Vec<String>) -> Self {
        self.env = env;
        self
    }

    /// The command line as one string, for logs and errors.
    pub fn display(&self) -> String {
        self.args.join(" ")
    }
}

/// Result of a captured execution.
#[derive(Debug, Clone)]
pub struct ExecResult {
    /// Exit code (`128 + signo` when killed by a signal).
    pub exit_code: i32,
    /// Standard output.
    pub stdout: Vec<u8>,
    /// Standard error.
    pub stderr: Vec<u8>,
}

impl ExecResult {
    /// Returns true if the command succeeded (exit code 0).
    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }

    /// Last `max_lines` lines of stderr (falling back to stdout).
    pub fn output_tail(&self, max_lines: usize) -> String {
        let source = if self.stderr.iter().any(|b| !b.is_ascii_whitespace()) {
            &self.stderr
        } else {
            &self.stdout
        };
        let text = String::from_utf8_lossy(source);
        let lines: Vec<&str> = text.lines().collect();
        let start = lines.len().saturating_sub(max_lines);
        lines[start..].join("\n")
    }
}

/// Maps an exit status to a shell-style exit code.
pub fn exit_code_of(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return 128 + sig;
        }
    }
    1
}

// =============================================================================
// Executor
// =============================================================================

/// Runs processes against a rootfs.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Isolation mode this executor applies.
    fn isolation(&self) -> Isolation;

    /// Builds a ready-to-spawn command for `spec` in `rootfs`.
    fn command(&self, rootfs: &Path, spec: &ProcessSpec) -> Result<Command>;

    /// Runs `spec` to completion, capturing output.
    ///
    /// The process is killed if it outlives `timeout`.
    async fn exec(&self, rootfs: &Path, spec: &ProcessSpec, timeout: Duration) -> Result<ExecResult> {
        let mut cmd = self.command(rootfs, spec)?;
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| Error::SpawnFailed {
            command: spec.display(),
            reason: e.to_string(),
        })?;

        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| Error::Timeout {
                operation: spec.display(),
                duration: timeout,
            })??;

        Ok(ExecResult {
            exit_code: exit_code_of(output.status),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

/// Executor backed by `tokio::process`.
#[derive(Debug, Clone, Copy)]
pub struct ProcessExecutor {
    isolation: Isolation,
}

impl ProcessExecutor {
    /// Creates an executor for `isolation`.
    ///
    /// # Errors
    ///
    /// [`Error::IsolationUnavailable`] if chroot is requested on a host
    /// that cannot provide it.
    pub fn new(isolation: Isolation) -> Result<Self> {
        if isolation == Isolation::Chroot {
            let platform = crate::platform::Platform::detect();
            if !platform.supports_chroot() {
                return Err(Error::IsolationUnavailable {
                    isolation: isolation.to_string(),
                    reason: "requires Linux and root privileges".to_string(),
                });
            }
        }
        Ok(Self { isolation })
    }

    fn host_cwd(rootfs: &Path, cwd: &str) -> PathBuf {
        rootfs.join(cwd.trim_start_matches('/'))
    }
}

#[async_trait]
impl Executor for ProcessExecutor {
    fn isolation(&self) -> Isolation {
        self.isolation
    }

    fn command(&self, rootfs: &Path, spec: &ProcessSpec) -> Result<Command> {
        let (program, args) = spec.args.split_first().ok_or_else(|| Error::SpawnFailed {
            command: String::new(),
            reason: "empty command".to_string(),
        })?;

        let mut cmd = Command::new(program);
        cmd.args(args);

        match self.isolation {
            Isolation::Host => {
                cmd.current_dir(Self::host_cwd(rootfs, &spec.cwd));
                apply_env(&mut cmd, &spec.env);
            }
            Isolation::Chroot => {
                cmd.env_clear();
                apply_env(&mut cmd, &spec.env);
                chroot_into(&mut cmd, rootfs, &spec.cwd)?;
            }
        }

        debug!(
            "Prepared '{}' ({}, cwd {})",
            spec.display(),
            self.isolation,
            spec.cwd
        );
        Ok(cmd)
    }
}

fn apply_env(cmd: &mut Command, env: &[String]) {
    for entry in env {
        if let Some((key, value)) = entry.split_once('=') {
            cmd.env(key, value);
        }
    }
}

#[cfg(target_os = "linux")]
fn chroot_into(cmd: &mut Command, rootfs: &Path, cwd: &str) -> Result<()> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let root = CString::new(rootfs.as_os_str().as_bytes())
        .map_err(|_| Error::Internal("rootfs path contains NUL".to_string()))?;
    let dir = CString::new(cwd.as_bytes())
        .map_err(|_| Error::Internal("working directory contains NUL".to_string()))?;

    // SAFETY: the closure runs in the forked child before exec and only
    // calls async-signal-safe functions (chroot, chdir) on pre-built CStrings.
    unsafe {
        cmd.pre_exec(move || {
            if libc::chroot(root.as_ptr()) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            if libc::chdir(dir.as_ptr()) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn chroot_into(_cmd: &mut Command, _rootfs: &Path, _cwd: &str) -> Result<()> {
    Err(Error::IsolationUnavailable {
        isolation: Isolation::Chroot.to_string(),
        reason: "chroot isolation requires Linux".to_string(),
    })
}
