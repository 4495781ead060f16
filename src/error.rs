//! Error types for the image builder and process supervisor.

use std::path::PathBuf;

/// Result type alias for layerkit operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while building or running an image.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Build Errors
    // =========================================================================
    /// Dependency installation failed. Fatal: the build is aborted and no
    /// image is recorded.
    #[error("dependency resolution failed (installer exit code {exit_code:?}): {reason}")]
    DependencyResolution {
        exit_code: Option<i32>,
        reason: String,
    },

    /// A build step failed for a reason other than dependency resolution.
    #[error("build step '{step}' failed: {reason}")]
    StepFailed { step: String, reason: String },

    /// The build recipe is not valid.
    #[error("invalid build recipe: {0}")]
    InvalidRecipe(String),

    // =========================================================================
    // Build Context Errors
    // =========================================================================
    /// The dependency manifest is absent from the build context.
    #[error("dependency manifest not found at {path}")]
    ManifestMissing { path: PathBuf },

    /// A manifest line could not be parsed.
    #[error("invalid dependency manifest at line {line}: {reason}")]
    InvalidManifest { line: usize, reason: String },

    /// The build context could not be read.
    #[error("invalid build context at {path}: {reason}")]
    InvalidContext { path: PathBuf, reason: String },

    // =========================================================================
    // Image/Registry Errors
    // =========================================================================
    /// Failed to parse image reference.
    #[error("invalid image reference '{reference}': {reason}")]
    InvalidImageReference { reference: String, reason: String },

    /// Base image pull failed.
    #[error("failed to pull image '{reference}': {reason}")]
    ImagePullFailed { reference: String, reason: String },

    /// No image with this tag or digest exists in the local store.
    #[error("image not found: {0}")]
    ImageNotFound(String),

    /// Image size exceeded limits.
    #[error("image exceeds size limit: {size} > {limit} bytes")]
    ImageTooLarge { size: u64, limit: u64 },

    // =========================================================================
    // Layer Errors
    // =========================================================================
    /// Layer extraction failed.
    #[error("failed to extract layer {digest}: {reason}")]
    LayerExtractionFailed { digest: String, reason: String },

    /// Layer creation failed.
    #[error("failed to create layer: {0}")]
    LayerCreationFailed(String),

    /// Path traversal attempt detected in tar archive.
    #[error("path traversal detected in layer: {path}")]
    PathTraversal { path: String },

    // =========================================================================
    // Storage Errors
    // =========================================================================
    /// Storage initialization failed.
    #[error("failed to initialize storage at {path}: {reason}")]
    StorageInitFailed { path: PathBuf, reason: String },

    /// Blob not found in storage.
    #[error("blob not found: {digest}")]
    BlobNotFound { digest: String },

    /// Storage write failed.
    #[error("failed to write to storage: {0}")]
    StorageWriteFailed(String),

    // =========================================================================
    // Bundle Errors
    // =========================================================================
    /// Materializing an image for a run failed.
    #[error("failed to build bundle: {0}")]
    BundleBuildFailed(String),

    // =========================================================================
    // Execution Errors
    // =========================================================================
    /// The process could not be spawned.
    #[error("failed to spawn '{command}': {reason}")]
    SpawnFailed { command: String, reason: String },

    /// The requested isolation mode is not available here.
    #[error("isolation '{isolation}' not available: {reason}")]
    IsolationUnavailable { isolation: String, reason: String },

    /// Signal delivery failed.
    #[error("failed to send {signal} to pid {pid}: {reason}")]
    SignalFailed {
        signal: String,
        pid: u32,
        reason: String,
    },

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    // =========================================================================
    // Timeout Errors
    // =========================================================================
    /// Operation timed out.
    #[error("operation timed out after {duration:?}: {operation}")]
    Timeout {
        operation: String,
        duration: std::time::Duration,
    },

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal error (should not happen).
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl Error {
    /// Returns true for the fatal build-time dependency resolution class.
    pub fn is_dependency_resolution(&self) -> bool {
        matches!(self, Self::DependencyResolution { .. })
    }
}
