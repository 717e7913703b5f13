//! OCI registry access for rootfs builds.
//!
//! - Reference parsing (`registry/repository[:tag][@digest]`)
//! - Per-registry credential selection
//! - Manifest and platform resolution over the distribution API
//! - Streaming layer extraction (gzip/tar, whiteouts)
//!
//! # Flow
//!
//! ```text
//! ImageReference ──► ManifestResolver ──► ResolvedManifest
//!                         │                    │ layers
//!                   RegistryClient ◄───────────┘
//!                         │ blob stream
//!                   ProgressReader ──► extract_layer ──► staging dir
//! ```

pub mod auth;
pub mod credentials;
pub mod layers;
pub mod manifest;
pub mod progress;
pub mod reference;
pub mod registry;

pub use auth::{Credential, CredentialProvider, CredentialSelector, CredentialStrategy};
pub use credentials::CredentialStore;
pub use layers::{apply_tar, extract_layer, extract_layer_as, LayerStats};
pub use manifest::{ManifestDocument, ManifestResolver, ResolvedManifest};
pub use progress::{ProgressObserver, ProgressReader, ProgressUpdate};
pub use reference::ImageReference;
pub use registry::{BlobStream, Descriptor, HttpRegistryClient, RegistryClient};
