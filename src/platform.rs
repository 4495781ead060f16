//! Platform detection and capability enumeration.
//!
//! Detects OS, architecture, and the capabilities that decide which
//! isolation modes can run build steps and entrypoints, and which
//! platform variant of a multi-arch base image to pull.

use std::collections::HashSet;

/// Detected platform information.
#[derive(Debug, Clone)]
pub struct Platform {
    /// Operating system.
    pub os: Os,
    /// CPU architecture.
    pub arch: Arch,
    /// Available capabilities.
    pub capabilities: HashSet<Capability>,
}

/// Operating system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Os {
    Linux,
    Darwin,
    Windows,
    Unknown,
}

/// CPU architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
    Amd64,
    Arm64,
    Arm,
    Unknown,
}

/// Platform capabilities that affect isolation availability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Process may `chroot(2)` (Linux, effective uid 0).
    Chroot,
    /// POSIX signals can be forwarded to a child.
    Signals,
}

impl Platform {
    /// Detects the current platform and its capabilities.
    pub fn detect() -> Self {
        let os = Self::detect_os();
        let arch = Self::detect_arch();
        let capabilities = Self::detect_capabilities(os);

        Self {
            os,
            arch,
            capabilities,
        }
    }

    fn detect_os() -> Os {
        #[cfg(target_os = "linux")]
        return Os::Linux;

        #[cfg(target_os = "macos")]
        return Os::Darwin;

        #[cfg(target_os = "windows")]
        return Os::Windows;

        #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
        return Os::Unknown;
    }

    fn detect_arch() -> Arch {
        #[cfg(target_arch = "x86_64")]
        return Arch::Amd64;

        #[cfg(target_arch = "aarch64")]
        return Arch::Arm64;

        #[cfg(target_arch = "arm")]
        return Arch::Arm;

        #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64", target_arch = "arm")))]
        return Arch::Unknown;
    }

    fn detect_capabilities(os: Os) -> HashSet<Capability> {
        let mut caps = HashSet::new();

        #[cfg(unix)]
        caps.insert(Capability::Signals);

        if os == Os::Linux && Self::is_root() {
            caps.insert(Capability::Chroot);
        }

        caps
    }

    #[cfg(unix)]
    fn is_root() -> bool {
        // SAFETY: geteuid has no preconditions and cannot fail.
        unsafe { libc::geteuid() == 0 }
    }

    #[cfg(not(unix))]
    fn is_root() -> bool {
        false
    }

    /// Returns true if build steps and entrypoints can run chrooted.
    pub fn supports_chroot(&self) -> bool {
        self.capabilities.contains(&Capability::Chroot)
    }

    /// Returns the host OCI platform string (e.g., "linux/amd64").
    pub fn oci_platform(&self) -> String {
        let os = match self.os {
            Os::Linux => "linux",
            Os::Darwin => "darwin",
            Os::Windows => "windows",
            Os::Unknown => "unknown",
        };

        format!("{}/{}", os, self.oci_arch())
    }

    /// Returns the platform string of the image variant to pull.
    ///
    /// Base images are Linux images regardless of the host OS.
    pub fn image_platform(&self) -> String {
        format!("linux/{}", self.oci_arch())
    }

    /// Returns the OCI architecture name.
    pub fn oci_arch(&self) -> &'static str {
        match self.arch {
            Arch::Amd64 => "amd64",
            Arch::Arm64 => "arm64",
            Arch::Arm => "arm",
            Arch::Unknown => "amd64",
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?}/{:?} (capabilities: {:?})",
            self.os, self.arch, self.capabilities
        )
    }
}
