//! Shared fixtures: a local base image, a build context and a host-mode
//! configuration, so builds need neither network nor root.

#![allow(dead_code)]

use layerkit::{BuildRecipe, Isolation, LayerkitConfig};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Store root, base image directory and build context for one test.
pub struct Fixture {
    pub store: TempDir,
    pub bases: TempDir,
    pub context: TempDir,
}

impl Fixture {
    pub fn new() -> Self {
        let fixture = Self {
            store: TempDir::new().unwrap(),
            bases: TempDir::new().unwrap(),
            context: TempDir::new().unwrap(),
        };
        fixture.write_base();
        fixture.write_context("requests==2.31.0\n", "print('bot started')\n");
        fixture
    }

    /// `python:3.11-slim` as an unpacked rootfs.
    fn write_base(&self) {
        let image = self.bases.path().join("python").join("3.11-slim");
        let rootfs = image.join("rootfs");
        fs::create_dir_all(rootfs.join("usr/local/bin")).unwrap();
        fs::create_dir_all(rootfs.join("usr/local/lib/python3.11/site-packages")).unwrap();
        fs::create_dir_all(rootfs.join("tmp")).unwrap();
        fs::write(rootfs.join("usr/local/bin/python"), "#!/bin/sh\n").unwrap();
        fs::write(
            image.join("config.json"),
            r#"{"Env":["PATH=/usr/local/bin:/usr/bin:/bin","LANG=C.UTF-8"],"Cmd":["python3"]}"#,
        )
        .unwrap();
    }

    pub fn write_context(&self, requirements: &str, bot: &str) {
        fs::write(self.context.path().join("requirements.txt"), requirements).unwrap();
        fs::write(self.context.path().join("bot.py"), bot).unwrap();
    }

    pub fn context_path(&self) -> &Path {
        self.context.path()
    }

    pub fn config(&self) -> LayerkitConfig {
        LayerkitConfig::with_root(self.store.path().to_path_buf(), Isolation::Host)
            .base_dir(self.bases.path())
    }

    pub fn store_root(&self) -> PathBuf {
        self.store.path().to_path_buf()
    }
}

/// Installer stand-in: records the staged manifest as an installed package
/// and leaves a pip-style cache behind.
pub fn fake_installer() -> Vec<String> {
    vec![
        "sh".to_string(),
        "-c".to_string(),
        concat!(
            "test -f requirements.txt || exit 3; ",
            "mkdir -p ../usr/local/lib/python3.11/site-packages/requests; ",
            "cp requirements.txt ../usr/local/lib/python3.11/site-packages/requests/INSTALLED; ",
            "mkdir -p ../root/.cache/pip/http && echo cached > ../root/.cache/pip/http/blob; ",
            "mkdir -p ../tmp/pip-build-xyz && echo tmp > ../tmp/pip-build-xyz/f"
        )
        .to_string(),
    ]
}

/// Installer stand-in that fails the way pip does for an unknown package.
pub fn failing_installer() -> Vec<String> {
    vec![
        "sh".to_string(),
        "-c".to_string(),
        "echo 'ERROR: No matching distribution found for nosuchpkg==9.9' >&2; exit 1".to_string(),
    ]
}

/// Default recipe with the fake installer.
pub fn recipe() -> BuildRecipe {
    BuildRecipe::default().with_install_command(fake_installer())
}
