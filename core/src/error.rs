use std::path::PathBuf;

use thiserror::Error;

/// ocifs error types
#[derive(Error, Debug)]
pub enum RootfsError {
    /// Image reference is empty or malformed
    #[error("Invalid image reference '{reference}': {reason}")]
    InvalidReference { reference: String, reason: String },

    /// One or more build options were rejected
    #[error("Invalid build options: {}", .0.join("; "))]
    InvalidOptions(Vec<String>),

    /// Manifest or index could not be resolved, fetched or decoded
    #[error("Manifest fetch failed: {registry} - {message}")]
    ManifestFetch { registry: String, message: String },

    /// Image index has no entry for the requested platform
    #[error("No manifest for platform {platform} in {reference}")]
    NoMatchingPlatform { reference: String, platform: String },

    /// Registry token exchange failed
    #[error("Auth token error: {registry} - {message}")]
    AuthToken { registry: String, message: String },

    /// Layer blob could not be fetched
    #[error("Blob fetch failed: {digest} - {message}")]
    BlobFetch { digest: String, message: String },

    /// Malformed gzip or tar framing
    #[error("Archive read error: {0}")]
    ArchiveRead(String),

    /// Filesystem write failure while applying a layer
    #[error("Extraction I/O error: {0}")]
    ExtractionIo(String),

    /// Overlay source file does not exist
    #[error("Source file not found: {}", .0.display())]
    SourceNotFound(PathBuf),

    /// Overlay copy failed
    #[error("Overlay I/O error: {0}")]
    OverlayIo(String),

    /// External filesystem tooling failed
    #[error("Image format error: {tool} - {message}")]
    ImageFormat { tool: String, message: String },

    /// Materialization requested before layers were staged
    #[error("Cannot create rootfs image in state {state}: call build() first")]
    PrematureMaterialization { state: String },

    /// Operation not valid from the current build state
    #[error("Cannot {operation} in state {state}")]
    InvalidBuildState {
        operation: &'static str,
        state: String,
    },

    /// Build deadline exceeded
    #[error("Timeout: {0}")]
    Timeout(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for RootfsError {
    fn from(err: serde_json::Error) -> Self {
        RootfsError::Serialization(err.to_string())
    }
}

/// Result type alias for ocifs operations
pub type Result<T> = std::result::Result<T, RootfsError>;
