//! Manifest resolution.
//!
//! Resolves an image reference to exactly one platform-specific manifest.
//! The fetched document is decoded once into [`ManifestDocument`]; nothing
//! past this module looks at manifest media-type strings again.

use std::sync::Arc;

use oci_spec::image::{ImageIndex, ImageManifest};
use ocifs_core::config::Platform;
use ocifs_core::error::{Result, RootfsError};

use super::reference::ImageReference;
use super::registry::{Descriptor, RegistryClient};

pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const DOCKER_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";

/// Media types sent in the `Accept` header of manifest requests.
pub const ACCEPTED_MANIFEST_TYPES: &[&str] =
    &[OCI_INDEX, OCI_MANIFEST, DOCKER_MANIFEST_LIST, DOCKER_MANIFEST];

/// Kind of document a manifest media type denotes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestKind {
    /// Single-platform image manifest
    Manifest,
    /// Multi-platform index / manifest list
    Index,
}

impl ManifestKind {
    pub fn from_media_type(media_type: &str) -> Option<Self> {
        match media_type {
            OCI_MANIFEST | DOCKER_MANIFEST => Some(ManifestKind::Manifest),
            OCI_INDEX | DOCKER_MANIFEST_LIST => Some(ManifestKind::Index),
            _ => None,
        }
    }
}

/// A decoded manifest or index.
#[derive(Debug)]
pub enum ManifestDocument {
    Manifest(ImageManifest),
    Index(ImageIndex),
}

impl ManifestDocument {
    /// Decode `bytes` according to `media_type`. When the media type is
    /// missing or unknown, the document's own `mediaType` field or its
    /// shape decides.
    pub fn decode(bytes: &[u8], media_type: &str) -> std::result::Result<Self, String> {
        let kind = match ManifestKind::from_media_type(media_type) {
            Some(kind) => kind,
            None => sniff_kind(bytes)?,
        };
        match kind {
            ManifestKind::Manifest => serde_json::from_slice::<ImageManifest>(bytes)
                .map(ManifestDocument::Manifest)
                .map_err(|e| format!("invalid image manifest: {}", e)),
            ManifestKind::Index => serde_json::from_slice::<ImageIndex>(bytes)
                .map(ManifestDocument::Index)
                .map_err(|e| format!("invalid image index: {}", e)),
        }
    }
}

fn sniff_kind(bytes: &[u8]) -> std::result::Result<ManifestKind, String> {
    let value: serde_json::Value =
        serde_json::from_slice(bytes).map_err(|e| format!("manifest is not JSON: {}", e))?;
    if let Some(kind) = value
        .get("mediaType")
        .and_then(|m| m.as_str())
        .and_then(ManifestKind::from_media_type)
    {
        return Ok(kind);
    }
    if value.get("manifests").is_some() {
        Ok(ManifestKind::Index)
    } else if value.get("layers").is_some() {
        Ok(ManifestKind::Manifest)
    } else {
        Err("unrecognized manifest document".to_string())
    }
}

/// The platform-specific manifest selected for a build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedManifest {
    /// Content digest of the manifest itself
    pub digest: String,
    pub media_type: String,
    /// Layers, bottom to top
    pub layers: Vec<Descriptor>,
    /// Image config blob (not used by the pipeline)
    pub config: Descriptor,
    /// Platform the manifest was selected for, when it came from an index
    pub platform: Option<Platform>,
}

impl ResolvedManifest {
    fn from_manifest(
        digest: String,
        media_type: &str,
        manifest: &ImageManifest,
        platform: Option<Platform>,
    ) -> Self {
        let media_type = if media_type.is_empty() {
            manifest
                .media_type()
                .as_ref()
                .map(|m| m.to_string())
                .unwrap_or_else(|| OCI_MANIFEST.to_string())
        } else {
            media_type.to_string()
        };
        Self {
            digest,
            media_type,
            layers: manifest.layers().iter().map(Descriptor::from).collect(),
            config: Descriptor::from(manifest.config()),
            platform,
        }
    }

    /// Sum of the declared compressed layer sizes.
    pub fn total_layer_size(&self) -> u64 {
        self.layers.iter().map(|l| l.size).sum()
    }
}

impl From<&oci_spec::image::Descriptor> for Descriptor {
    fn from(d: &oci_spec::image::Descriptor) -> Self {
        Descriptor {
            media_type: d.media_type().to_string(),
            digest: d.digest().to_string(),
            size: u64::try_from(d.size()).unwrap_or(0),
        }
    }
}

/// First index entry that is an image manifest for exactly `platform`.
///
/// OS and architecture are compared case-sensitively with no fallback to
/// compatible platforms. A variant is only compared when one is requested.
pub fn select_platform(index: &ImageIndex, platform: &Platform) -> Option<Descriptor> {
    index
        .manifests()
        .iter()
        .find(|entry| {
            let is_manifest = ManifestKind::from_media_type(&entry.media_type().to_string())
                == Some(ManifestKind::Manifest);
            let matches = entry.platform().as_ref().map_or(false, |p| {
                p.os().to_string() == platform.os
                    && p.architecture().to_string() == platform.architecture
                    && platform
                        .variant
                        .as_ref()
                        .map_or(true, |v| p.variant().as_deref() == Some(v.as_str()))
            });
            is_manifest && matches
        })
        .map(Descriptor::from)
}

/// Resolves references to a single platform-specific manifest.
pub struct ManifestResolver {
    registry: Arc<dyn RegistryClient>,
}

impl ManifestResolver {
    pub fn new(registry: Arc<dyn RegistryClient>) -> Self {
        Self { registry }
    }

    /// Resolve `reference` for `platform`.
    ///
    /// # Errors
    ///
    /// - `NoMatchingPlatform` if the reference is an index without an entry
    ///   for `platform`
    /// - `ManifestFetch` if fetching or decoding any document fails
    pub async fn resolve(
        &self,
        reference: &ImageReference,
        platform: &Platform,
    ) -> Result<ResolvedManifest> {
        let descriptor = self.registry.resolve(reference).await?;
        tracing::debug!(
            reference = %reference,
            digest = %descriptor.digest,
            media_type = %descriptor.media_type,
            "Resolved reference"
        );

        let bytes = self.registry.fetch_manifest(reference, &descriptor).await?;
        let document = ManifestDocument::decode(&bytes, &descriptor.media_type)
            .map_err(|e| fetch_error(reference, e))?;

        match document {
            ManifestDocument::Manifest(manifest) => Ok(ResolvedManifest::from_manifest(
                descriptor.digest,
                &descriptor.media_type,
                &manifest,
                None,
            )),
            ManifestDocument::Index(index) => {
                let Some(entry) = select_platform(&index, platform) else {
                    tracing::error!(
                        reference = %reference,
                        platform = %platform,
                        "No matching manifest found"
                    );
                    return Err(RootfsError::NoMatchingPlatform {
                        reference: reference.to_string(),
                        platform: platform.to_string(),
                    });
                };
                tracing::debug!(
                    reference = %reference,
                    platform = %platform,
                    digest = %entry.digest,
                    "Selected platform manifest from index"
                );

                let bytes = self.registry.fetch_manifest(reference, &entry).await?;
                match ManifestDocument::decode(&bytes, &entry.media_type)
                    .map_err(|e| fetch_error(reference, e))?
                {
                    ManifestDocument::Manifest(manifest) => Ok(ResolvedManifest::from_manifest(
                        entry.digest,
                        &entry.media_type,
                        &manifest,
                        Some(platform.clone()),
                    )),
                    ManifestDocument::Index(_) => Err(fetch_error(
                        reference,
                        format!("index entry {} is itself an index", entry.digest),
                    )),
                }
            }
        }
    }
}

fn fetch_error(reference: &ImageReference, message: String) -> RootfsError {
    RootfsError::ManifestFetch {
        registry: reference.registry.clone(),
        message,
    }
}
