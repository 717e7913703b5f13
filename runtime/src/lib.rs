//! ocifs runtime - builds ext4 root filesystems from OCI images.
//!
//! Resolves an image reference against its registry, streams the layers of
//! the matching platform into a staging directory, and formats the result
//! into a filesystem image.

#![allow(clippy::result_large_err)]

pub mod oci;
pub mod rootfs;

#[cfg(test)]
pub(crate) mod testutil;

// Re-export common types
pub use oci::{CredentialSelector, CredentialStore, HttpRegistryClient, ImageReference};
pub use oci::{ManifestResolver, ProgressObserver, ProgressUpdate, RegistryClient, ResolvedManifest};
pub use rootfs::{BuildState, Ext4Formatter, ImageFormatter, RootfsBuild};

/// ocifs runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
