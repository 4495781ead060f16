//! Store and execution configuration.
//!
//! Resolution order for each field: explicit setter (CLI flag) → environment
//! → `<store root>/config.json` → built-in default.

use crate::constants::{BASE_DIRS_ENV, STORE_ROOT_DIR, STORE_ROOT_ENV};
use crate::error::{Error, Result};
use crate::platform::Platform;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::debug;

/// How build steps and the entrypoint are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Isolation {
    /// Chrooted into the snapshot rootfs (Linux, root).
    Chroot,
    /// On the host, current directory set to the snapshot's working directory.
    Host,
}

impl Isolation {
    /// Best mode the platform supports.
    pub fn detect(platform: &Platform) -> Self {
        if platform.supports_chroot() {
            Self::Chroot
        } else {
            Self::Host
        }
    }
}

impl fmt::Display for Isolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Chroot => write!(f, "chroot"),
            Self::Host => write!(f, "host"),
        }
    }
}

impl FromStr for Isolation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "chroot" => Ok(Self::Chroot),
            "host" => Ok(Self::Host),
            other => Err(Error::InvalidRecipe(format!(
                "unknown isolation '{}' (expected chroot or host)",
                other
            ))),
        }
    }
}

/// Optional on-disk settings at `<store root>/config.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ConfigFile {
    isolation: Option<Isolation>,
    base_dirs: Vec<PathBuf>,
    install_command: Option<Vec<String>>,
}

/// Resolved configuration.
#[derive(Debug, Clone)]
pub struct LayerkitConfig {
    /// Root of blobs, indexes and bundles.
    pub store_root: PathBuf,
    /// Execution mode for steps and runs.
    pub isolation: Isolation,
    /// Directories searched for local base images before the registry.
    pub base_dirs: Vec<PathBuf>,
    /// Installer argv replacing the default `pip install` invocation.
    pub install_command: Option<Vec<String>>,
}

/// Returns `$LAYERKIT_ROOT`, else `~/.layerkit`.
pub fn default_store_root() -> PathBuf {
    if let Some(root) = std::env::var_os(STORE_ROOT_ENV).filter(|v| !v.is_empty()) {
        return PathBuf::from(root);
    }
    match dirs::home_dir() {
        Some(home) => home.join(STORE_ROOT_DIR),
        None => PathBuf::from(STORE_ROOT_DIR),
    }
}

impl LayerkitConfig {
    /// Resolves configuration for `store_root` (or the default root).
    pub fn load(store_root: Option<PathBuf>) -> Result<Self> {
        let store_root = store_root.unwrap_or_else(default_store_root);
        let file = Self::read_file(&store_root)?;

        let isolation = file
            .isolation
            .unwrap_or_else(|| Isolation::detect(&Platform::detect()));

        let mut base_dirs: Vec<PathBuf> = std::env::var(BASE_DIRS_ENV)
            .map(|v| {
                v.split(':')
                    .filter(|s| !s.is_empty())
                    .map(PathBuf::from)
                    .collect()
            })
            .unwrap_or_default();
        base_dirs.extend(file.base_dirs);

        debug!(
            "Config: root={}, isolation={}, {} base dirs",
            store_root.display(),
            isolation,
            base_dirs.len()
        );

        Ok(Self {
            store_root,
            isolation,
            base_dirs,
            install_command: file.install_command.filter(|c| !c.is_empty()),
        })
    }

    /// Configuration rooted at `store_root` with explicit settings only.
    pub fn with_root(store_root: PathBuf, isolation: Isolation) -> Self {
        Self {
            store_root,
            isolation,
            base_dirs: Vec::new(),
            install_command: None,
        }
    }

    /// Overrides the isolation mode.
    pub fn isolation(mut self, isolation: Isolation) -> Self {
        self.isolation = isolation;
        self
    }

    /// Adds a local base-image directory.
    pub fn base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.base_dirs.push(dir.into());
        self
    }

    fn read_file(store_root: &Path) -> Result<ConfigFile> {
        let path = store_root.join("config.json");
        match fs::read_to_string(&path) {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_isolation_parse() {
        assert_eq!("chroot".parse::<Isolation>().unwrap(), Isolation::Chroot);
        assert_eq!("HOST".parse::<Isolation>().unwrap(), Isolation::Host);
        assert!("vm".parse::<Isolation>().is_err());
        assert_eq!(Isolation::Host.to_string(), "host");
    }

    #[test]
    fn test_config_file_is_read() {
        let temp = TempDir::new().unwrap();
        fs::write(
            temp.path().join("config.json"),
            r#"{"isolation":"host","baseDirs":["/srv/bases"],"installCommand":["uv","pip","install"]}"#,
        )
        .unwrap();

        let config = LayerkitConfig::load(Some(temp.path().to_path_buf())).unwrap();
        assert_eq!(config.isolation, Isolation::Host);
        assert!(config.base_dirs.contains(&PathBuf::from("/srv/bases")));
        assert_eq!(config.install_command.unwrap()[0], "uv");
    }

    #[test]
    fn test_malformed_config_file_fails() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("config.json"), "{not json").unwrap();
        assert!(LayerkitConfig::load(Some(temp.path().to_path_buf())).is_err());
    }
}
