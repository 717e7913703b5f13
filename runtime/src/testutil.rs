//! Test fixtures: in-memory layers, manifests and a fake registry.

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;

use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use ocifs_core::error::{Result, RootfsError};
use parking_lot::Mutex;
use tar::{EntryType, Header};

use crate::oci::layers::OCI_LAYER_GZIP;
use crate::oci::manifest::OCI_MANIFEST;
use crate::oci::registry::{sha256_digest, BlobStream, Descriptor, RegistryClient};
use crate::oci::ImageReference;

pub fn digest_of(data: &[u8]) -> String {
    sha256_digest(data)
}

/// Deterministic bytes that gzip cannot shrink.
pub fn noise(len: usize) -> Vec<u8> {
    let mut seed = 0x2545_f491_u32;
    (0..len)
        .map(|_| {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            seed as u8
        })
        .collect()
}

/// Builds a tar (optionally gzip) layer entry by entry.
pub struct LayerBuilder {
    builder: tar::Builder<Vec<u8>>,
}

impl LayerBuilder {
    pub fn new() -> Self {
        Self {
            builder: tar::Builder::new(Vec::new()),
        }
    }

    fn header(entry_type: EntryType, size: u64, mode: u32) -> Header {
        let mut header = Header::new_gnu();
        header.set_entry_type(entry_type);
        header.set_size(size);
        header.set_mode(mode);
        header.set_mtime(1_700_000_000);
        header
    }

    pub fn file(mut self, path: &str, content: &[u8], mode: u32) -> Self {
        let mut header = Self::header(EntryType::Regular, content.len() as u64, mode);
        self.builder.append_data(&mut header, path, content).unwrap();
        self
    }

    pub fn dir(mut self, path: &str, mode: u32) -> Self {
        let mut header = Self::header(EntryType::Directory, 0, mode);
        self.builder
            .append_data(&mut header, path, std::io::empty())
            .unwrap();
        self
    }

    pub fn symlink(self, path: &str, target: &str) -> Self {
        self.link(EntryType::Symlink, path, target)
    }

    pub fn hardlink(self, path: &str, target: &str) -> Self {
        self.link(EntryType::Link, path, target)
    }

    fn link(mut self, entry_type: EntryType, path: &str, target: &str) -> Self {
        let mut header = Self::header(entry_type, 0, 0o777);
        header.set_link_name(target).unwrap();
        self.builder
            .append_data(&mut header, path, std::io::empty())
            .unwrap();
        self
    }

    pub fn special(mut self, path: &str, entry_type: EntryType) -> Self {
        let mut header = Self::header(entry_type, 0, 0o644);
        self.builder
            .append_data(&mut header, path, std::io::empty())
            .unwrap();
        self
    }

    /// Regular file with the name written verbatim, bypassing the
    /// builder's path checks (for `..` and absolute names).
    pub fn raw_file(mut self, path: &str, content: &[u8]) -> Self {
        let mut header = Self::header(EntryType::Regular, content.len() as u64, 0o644);
        let name = &mut header.as_old_mut().name;
        name[..path.len()].copy_from_slice(path.as_bytes());
        header.set_cksum();
        self.builder.append(&header, content).unwrap();
        self
    }

    pub fn tar(self) -> Vec<u8> {
        self.builder.into_inner().unwrap()
    }

    pub fn gzip(self) -> Vec<u8> {
        let tar = self.tar();
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&tar).unwrap();
        encoder.finish().unwrap()
    }
}

/// Gzip layer of regular files with mode 0644.
pub fn targz_layer(files: &[(&str, &[u8])]) -> Vec<u8> {
    files
        .iter()
        .fold(LayerBuilder::new(), |b, (path, content)| {
            b.file(path, content, 0o644)
        })
        .gzip()
}

/// OCI image manifest JSON listing `layers`.
pub fn image_manifest(layers: &[Descriptor]) -> Vec<u8> {
    let layers: Vec<_> = layers
        .iter()
        .map(|l| {
            serde_json::json!({
                "mediaType": l.media_type,
                "digest": l.digest,
                "size": l.size,
            })
        })
        .collect();
    serde_json::to_vec(&serde_json::json!({
        "schemaVersion": 2,
        "mediaType": OCI_MANIFEST,
        "config": {
            "mediaType": "application/vnd.oci.image.config.v1+json",
            "digest": digest_of(b"{}"),
            "size": 2,
        },
        "layers": layers,
    }))
    .unwrap()
}

pub struct IndexEntry {
    descriptor: Descriptor,
    os: String,
    architecture: String,
    variant: Option<String>,
}

impl IndexEntry {
    pub fn new(descriptor: &Descriptor, os: &str, architecture: &str) -> Self {
        Self {
            descriptor: descriptor.clone(),
            os: os.to_string(),
            architecture: architecture.to_string(),
            variant: None,
        }
    }

    pub fn variant(mut self, variant: &str) -> Self {
        self.variant = Some(variant.to_string());
        self
    }
}

/// OCI image index JSON over `entries`.
pub fn image_index(entries: &[IndexEntry]) -> Vec<u8> {
    let manifests: Vec<_> = entries
        .iter()
        .map(|e| {
            let mut platform = serde_json::json!({
                "architecture": e.architecture,
                "os": e.os,
            });
            if let Some(variant) = &e.variant {
                platform["variant"] = serde_json::json!(variant);
            }
            serde_json::json!({
                "mediaType": e.descriptor.media_type,
                "digest": e.descriptor.digest,
                "size": e.descriptor.size,
                "platform": platform,
            })
        })
        .collect();
    serde_json::to_vec(&serde_json::json!({
        "schemaVersion": 2,
        "mediaType": "application/vnd.oci.image.index.v1+json",
        "manifests": manifests,
    }))
    .unwrap()
}

/// In-memory registry keyed by tag and digest.
#[derive(Clone, Default)]
pub struct FakeRegistry {
    tags: HashMap<String, Descriptor>,
    manifests: HashMap<String, Vec<u8>>,
    blobs: HashMap<String, Vec<u8>>,
    fetched: Arc<Mutex<Vec<String>>>,
}

impl FakeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_blob(&mut self, data: Vec<u8>) -> Descriptor {
        self.add_blob_as(data, OCI_LAYER_GZIP)
    }

    pub fn add_blob_as(&mut self, data: Vec<u8>, media_type: &str) -> Descriptor {
        let descriptor = Descriptor {
            media_type: media_type.to_string(),
            digest: digest_of(&data),
            size: data.len() as u64,
        };
        self.blobs.insert(descriptor.digest.clone(), data);
        descriptor
    }

    pub fn add_manifest(&mut self, media_type: &str, bytes: Vec<u8>) -> Descriptor {
        let descriptor = Descriptor {
            media_type: media_type.to_string(),
            digest: digest_of(&bytes),
            size: bytes.len() as u64,
        };
        self.manifests.insert(descriptor.digest.clone(), bytes);
        descriptor
    }

    pub fn tag(&mut self, tag: &str, media_type: &str, bytes: Vec<u8>) -> Descriptor {
        let descriptor = self.add_manifest(media_type, bytes);
        self.tags.insert(tag.to_string(), descriptor.clone());
        descriptor
    }

    /// Digests of the blobs fetched so far, in order.
    pub fn fetched_blobs(&self) -> Vec<String> {
        self.fetched.lock().clone()
    }
}

#[async_trait]
impl RegistryClient for FakeRegistry {
    async fn resolve(&self, reference: &ImageReference) -> Result<Descriptor> {
        self.tags
            .get(reference.tag_or_digest())
            .cloned()
            .ok_or_else(|| RootfsError::ManifestFetch {
                registry: reference.registry.clone(),
                message: format!("manifest {} not found", reference.tag_or_digest()),
            })
    }

    async fn fetch_manifest(
        &self,
        reference: &ImageReference,
        descriptor: &Descriptor,
    ) -> Result<Vec<u8>> {
        self.manifests
            .get(&descriptor.digest)
            .cloned()
            .ok_or_else(|| RootfsError::ManifestFetch {
                registry: reference.registry.clone(),
                message: format!("manifest {} not found", descriptor.digest),
            })
    }

    async fn fetch_blob(
        &self,
        _reference: &ImageReference,
        descriptor: &Descriptor,
    ) -> Result<BlobStream> {
        let data = self
            .blobs
            .get(&descriptor.digest)
            .cloned()
            .ok_or_else(|| RootfsError::BlobFetch {
                digest: descriptor.digest.clone(),
                message: "blob unknown to registry".to_string(),
            })?;
        self.fetched.lock().push(descriptor.digest.clone());
        Ok(Box::pin(std::io::Cursor::new(data)))
    }
}
