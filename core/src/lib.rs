//! ocifs core - shared error and configuration types.
//!
//! Used by the runtime (image resolution, extraction, formatting) and the CLI.

pub mod config;
pub mod error;

// Re-export commonly used types
pub use config::{BuildOptions, BuildOptionsBuilder, ImageSize, Platform};
pub use error::{Result, RootfsError};

/// ocifs version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
