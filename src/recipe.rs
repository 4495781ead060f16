//! Build recipe: the four ordered build steps and the entrypoint.
//!
//! ```text
//!   Base(python:3.11-slim) → Workdir(/app) → Install(requirements.txt) → Copy(.)
//!                                                         entrypoint: python bot.py
//! ```
//!
//! The order is fixed. Every step's output is the input of the next one,
//! which is what makes layer caching sound: a step can only be reused when
//! everything below it was reused too.

use crate::constants::{
    DEFAULT_BASE_IMAGE, DEFAULT_ENTRYPOINT, DEFAULT_INSTALL_COMMAND, DEFAULT_WORKDIR,
    MANIFEST_FILE, validate_image_ref, validate_workdir,
};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// One build step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "step")]
pub enum Step {
    /// Start from the base runtime image.
    Base { image: String },
    /// Create (if absent) and enter the working directory.
    Workdir { path: String },
    /// Stage the manifest in the working directory and run the installer.
    Install {
        manifest: String,
        command: Vec<String>,
    },
    /// Copy the whole build context into the working directory.
    Copy,
}

impl Step {
    /// Short step name used in logs, history and errors.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Base { .. } => "base",
            Self::Workdir { .. } => "workdir",
            Self::Install { .. } => "install",
            Self::Copy => "copy",
        }
    }

    /// Human-readable form recorded in image history.
    pub fn describe(&self) -> String {
        match self {
            Self::Base { image } => format!("FROM {}", image),
            Self::Workdir { path } => format!("WORKDIR {}", path),
            Self::Install { manifest, command } => {
                format!("INSTALL {} ({})", manifest, command.join(" "))
            }
            Self::Copy => "COPY . .".to_string(),
        }
    }
}

/// Everything needed to build and start an image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRecipe {
    /// Base runtime image reference.
    pub base_image: String,
    /// Working directory for the install step, the copy and the entrypoint.
    pub workdir: String,
    /// Manifest file name at the context root.
    pub manifest: String,
    /// Installer argv, run from the working directory.
    pub install_command: Vec<String>,
    /// Entrypoint argv.
    pub entrypoint: Vec<String>,
}

impl Default for BuildRecipe {
    fn default() -> Self {
        Self {
            base_image: DEFAULT_BASE_IMAGE.to_string(),
            workdir: DEFAULT_WORKDIR.to_string(),
            manifest: MANIFEST_FILE.to_string(),
            install_command: DEFAULT_INSTALL_COMMAND.iter().map(|s| s.to_string()).collect(),
            entrypoint: DEFAULT_ENTRYPOINT.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl BuildRecipe {
    /// Replaces the base image.
    pub fn with_base_image(mut self, image: impl Into<String>) -> Self {
        self.base_image = image.into();
        self
    }

    /// Replaces the installer argv.
    pub fn with_install_command(mut self, command: Vec<String>) -> Self {
        self.install_command = command;
        self
    }

    /// Replaces the entrypoint argv.
    pub fn with_entrypoint(mut self, entrypoint: Vec<String>) -> Self {
        self.entrypoint = entrypoint;
        self
    }

    /// Checks every field before a build starts.
    pub fn validate(&self) -> Result<()> {
        validate_image_ref(&self.base_image).map_err(|reason| Error::InvalidImageReference {
            reference: self.base_image.clone(),
            reason: reason.to_string(),
        })?;
        validate_workdir(&self.workdir)
            .map_err(|reason| Error::InvalidRecipe(format!("workdir '{}' {}", self.workdir, reason)))?;

        if self.manifest.is_empty() || self.manifest.contains('/') || self.manifest == ".." {
            return Err(Error::InvalidRecipe(format!(
                "manifest '{}' must be a file name at the context root",
                self.manifest
            )));
        }
        if self.install_command.is_empty() {
            return Err(Error::InvalidRecipe("empty install command".to_string()));
        }
        if self.entrypoint.is_empty() {
            return Err(Error::InvalidRecipe("empty entrypoint".to_string()));
        }
        Ok(())
    }

    /// The build steps in execution order.
    pub fn steps(&self) -> Vec<Step> {
        vec![
            Step::Base {
                image: self.base_image.clone(),
            },
            Step::Workdir {
                path: self.workdir.clone(),
            },
            Step::Install {
                manifest: self.manifest.clone(),
                command: self.install_command.clone(),
            },
            Step::Copy,
        ]
    }

    /// Working directory relative to the rootfs (no leading `/`).
    pub fn workdir_rel(&self) -> &str {
        self.workdir.trim_start_matches('/')
    }
}
