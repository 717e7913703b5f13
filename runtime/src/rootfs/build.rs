//! Rootfs build coordinator.
//!
//! A [`RootfsBuild`] walks one image through
//! `Uninitialized → ReferenceResolved → LayersStaged → FileOverlaysApplied →
//! Materialized`. Any failure moves it to `Failed` and releases the staging
//! directory; a failed or materialized build accepts no further operations.
//!
//! Dropping a build, including a `build()` future cut short by a timeout or
//! Ctrl-C, cancels any layer extraction still running on the blocking pool.
//! The staging directory is removed once that extraction has stopped.

use std::fmt;
use std::fs;
use std::future::Future;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use ocifs_core::config::BuildOptions;
use ocifs_core::error::{Result, RootfsError};
use serde::Serialize;
use tokio_util::io::SyncIoBridge;
use tokio_util::sync::CancellationToken;

use super::format::{Ext4Formatter, ImageFormatter};
use super::staging::StagingDir;
use crate::oci::auth::CredentialSelector;
use crate::oci::layers::{extract_layer_as, resolve_in_root};
use crate::oci::manifest::{ManifestResolver, ResolvedManifest};
use crate::oci::progress::{ProgressObserver, ProgressReader};
use crate::oci::reference::ImageReference;
use crate::oci::registry::{Descriptor, HttpRegistryClient, RegistryClient};

/// Lifecycle state of a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BuildState {
    Uninitialized,
    ReferenceResolved,
    LayersStaged,
    FileOverlaysApplied,
    Materialized,
    Failed,
}

impl fmt::Display for BuildState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BuildState::Uninitialized => "uninitialized",
            BuildState::ReferenceResolved => "reference-resolved",
            BuildState::LayersStaged => "layers-staged",
            BuildState::FileOverlaysApplied => "file-overlays-applied",
            BuildState::Materialized => "materialized",
            BuildState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One image-to-rootfs build.
pub struct RootfsBuild {
    reference: ImageReference,
    options: BuildOptions,
    registry: Arc<dyn RegistryClient>,
    formatter: Arc<dyn ImageFormatter>,
    observer: Option<Arc<dyn ProgressObserver>>,
    state: BuildState,
    staging: Option<StagingDir>,
    kept_staging: Option<PathBuf>,
    manifest: Option<ResolvedManifest>,
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl RootfsBuild {
    /// Build `reference` with the default collaborators: an HTTP registry
    /// client using credentials from the environment, and the ext4
    /// formatter.
    pub fn new(reference: &str, options: BuildOptions) -> Result<Self> {
        let reference = ImageReference::parse(reference)?;
        let registry = HttpRegistryClient::new(Arc::new(CredentialSelector::from_env()))
            .with_insecure_registries(options.insecure_registries());
        Ok(Self::with_collaborators(
            reference,
            options,
            Arc::new(registry),
            Arc::new(Ext4Formatter::new()),
        ))
    }

    pub fn with_collaborators(
        reference: ImageReference,
        options: BuildOptions,
        registry: Arc<dyn RegistryClient>,
        formatter: Arc<dyn ImageFormatter>,
    ) -> Self {
        Self {
            reference,
            options,
            registry,
            formatter,
            observer: None,
            state: BuildState::Uninitialized,
            staging: None,
            kept_staging: None,
            manifest: None,
            deadline: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Report layer download progress to `observer`.
    pub fn with_progress(mut self, observer: Arc<dyn ProgressObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn reference(&self) -> &ImageReference {
        &self.reference
    }

    pub fn options(&self) -> &BuildOptions {
        &self.options
    }

    pub fn state(&self) -> BuildState {
        self.state
    }

    /// Staging directory while the build holds one, or the kept directory
    /// after release when `keep_staging` is set.
    pub fn staging_path(&self) -> Option<&Path> {
        self.staging
            .as_ref()
            .map(StagingDir::path)
            .or(self.kept_staging.as_deref())
    }

    /// Manifest selected by `build()`.
    pub fn manifest(&self) -> Option<&ResolvedManifest> {
        self.manifest.as_ref()
    }

    /// Where `create()` writes the image.
    pub fn output_path(&self) -> PathBuf {
        self.options.output_path()
    }

    /// Resolve the manifest and stage every layer, in manifest order.
    pub async fn build(&mut self) -> Result<()> {
        self.expect_state("build", &[BuildState::Uninitialized])?;
        let result = self.stage_image().await;
        self.finish(result)
    }

    /// Copy the local file `source` into the rootfs at `dest`.
    ///
    /// `dest` is an absolute path inside the image. When it is empty, `/`
    /// or ends in `/`, the source's file name is appended. Calling again
    /// with the same arguments overwrites the earlier copy.
    pub fn add_file(&mut self, source: impl AsRef<Path>, dest: &str) -> Result<()> {
        self.expect_state(
            "add_file",
            &[BuildState::LayersStaged, BuildState::FileOverlaysApplied],
        )?;
        let result = self.copy_overlay(source.as_ref(), dest);
        self.finish(result)?;
        self.state = BuildState::FileOverlaysApplied;
        Ok(())
    }

    /// Format the staged tree into `<output_dir>/<image_name>` and release
    /// the staging directory. Returns the image path.
    pub async fn create(&mut self) -> Result<PathBuf> {
        match self.state {
            BuildState::LayersStaged | BuildState::FileOverlaysApplied => {}
            BuildState::Uninitialized | BuildState::ReferenceResolved => {
                return Err(RootfsError::PrematureMaterialization {
                    state: self.state.to_string(),
                })
            }
            BuildState::Materialized | BuildState::Failed => {
                return Err(RootfsError::InvalidBuildState {
                    operation: "create",
                    state: self.state.to_string(),
                })
            }
        }
        let result = self.materialize().await;
        let output = self.finish(result)?;
        self.state = BuildState::Materialized;
        self.release_staging();
        Ok(output)
    }

    fn expect_state(&self, operation: &'static str, allowed: &[BuildState]) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(RootfsError::InvalidBuildState {
                operation,
                state: self.state.to_string(),
            })
        }
    }

    /// Record the outcome of an operation: failures are terminal.
    fn finish<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(ref e) = result {
            tracing::error!(
                reference = %self.reference,
                state = %self.state,
                error = %e,
                "Rootfs build failed"
            );
            self.state = BuildState::Failed;
            self.cancel.cancel();
            self.release_staging();
        }
        result
    }

    fn release_staging(&mut self) {
        if let Some(staging) = self.staging.take() {
            if self.options.keep_staging() {
                self.kept_staging = Some(staging.keep());
            } else {
                staging.release();
            }
        }
    }

    fn staging_dir(&self) -> Result<&Path> {
        self.staging
            .as_ref()
            .map(StagingDir::path)
            .ok_or_else(|| RootfsError::Other("staging directory is gone".to_string()))
    }

    async fn stage_image(&mut self) -> Result<()> {
        self.deadline = self.options.timeout().map(|t| Instant::now() + t);
        let staging = StagingDir::create(self.options.staging_root())?;
        tracing::info!(
            reference = %self.reference,
            platform = %self.options.platform(),
            staging = %staging.path().display(),
            "Building rootfs"
        );
        self.staging = Some(staging);

        let resolver = ManifestResolver::new(self.registry.clone());
        let manifest = within_deadline(
            self.deadline,
            "resolving the manifest",
            resolver.resolve(&self.reference, self.options.platform()),
        )
        .await?;
        tracing::info!(
            digest = %manifest.digest,
            layers = manifest.layers.len(),
            bytes = manifest.total_layer_size(),
            "Resolved manifest"
        );
        self.manifest = Some(manifest.clone());
        self.state = BuildState::ReferenceResolved;

        let count = manifest.layers.len();
        for (index, layer) in manifest.layers.iter().enumerate() {
            self.stage_layer(index + 1, count, layer).await?;
        }

        self.state = BuildState::LayersStaged;
        tracing::info!(reference = %self.reference, layers = count, "Layers staged");
        Ok(())
    }

    async fn stage_layer(&mut self, position: usize, count: usize, layer: &Descriptor) -> Result<()> {
        tracing::info!(
            layer = position,
            of = count,
            digest = %layer.digest,
            size = layer.size,
            "Staging layer"
        );
        let stream = within_deadline(
            self.deadline,
            "fetching a layer",
            self.registry.fetch_blob(&self.reference, layer),
        )
        .await?;

        let mut reader = ProgressReader::new(stream, short_digest(&layer.digest), layer.size)
            .with_deadline(self.deadline)
            .with_cancellation(self.cancel.clone());
        if let Some(observer) = self.observer.clone() {
            reader = reader.on_progress(move |update| observer.on_progress(update));
        }

        let lease = self
            .staging
            .as_ref()
            .map(StagingDir::lease)
            .ok_or_else(|| RootfsError::Other("staging directory is gone".to_string()))?;
        let media_type = layer.media_type.clone();
        let bridge = SyncIoBridge::new(reader);
        // The task outlives this future when the build is dropped mid-layer.
        let stats = tokio::task::spawn_blocking(move || {
            extract_layer_as(bridge, lease.path(), &media_type)
        })
        .await
        .map_err(|e| RootfsError::Other(format!("layer extraction task failed: {}", e)))??;

        tracing::debug!(
            digest = %layer.digest,
            files = stats.files,
            directories = stats.directories,
            symlinks = stats.symlinks,
            hardlinks = stats.hardlinks,
            whiteouts = stats.whiteouts,
            skipped = stats.skipped,
            "Layer applied"
        );
        if let Some(staging) = self.staging.as_mut() {
            staging.record_layer(&stats);
        }
        Ok(())
    }

    fn copy_overlay(&self, source: &Path, dest: &str) -> Result<()> {
        let meta = fs::metadata(source).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => RootfsError::SourceNotFound(source.to_path_buf()),
            _ => overlay_io(source, e),
        })?;
        if !meta.is_file() {
            return Err(RootfsError::OverlayIo(format!(
                "{} is not a regular file",
                source.display()
            )));
        }

        let rel = overlay_destination(source, dest)?;
        let root = self.staging_dir()?;
        let parent = match rel.parent() {
            Some(parent) => resolve_in_root(root, parent)
                .map_err(|e| RootfsError::OverlayIo(e.to_string()))?,
            None => root.to_path_buf(),
        };
        let target = parent.join(rel.file_name().unwrap_or_default());

        fs::create_dir_all(&parent).map_err(|e| overlay_io(&parent, e))?;
        match fs::symlink_metadata(&target) {
            Ok(meta) if meta.is_dir() => {
                return Err(RootfsError::OverlayIo(format!(
                    "destination /{} is a directory",
                    rel.display()
                )))
            }
            // Never write through a link, or into a read-only file, that
            // came with the image.
            Ok(_) => fs::remove_file(&target).map_err(|e| overlay_io(&target, e))?,
            Err(_) => {}
        }
        fs::copy(source, &target).map_err(|e| overlay_io(&target, e))?;

        tracing::info!(
            source = %source.display(),
            dest = %format!("/{}", rel.display()),
            "Added file to rootfs"
        );
        Ok(())
    }

    async fn materialize(&mut self) -> Result<PathBuf> {
        let staging = self
            .staging
            .as_mut()
            .ok_or_else(|| RootfsError::Other("staging directory is gone".to_string()))?;
        staging.apply_directory_modes()?;

        let output = self.options.output_path();
        fs::create_dir_all(self.options.output_dir())?;
        tracing::info!(
            output = %output.display(),
            size = %self.options.size(),
            "Formatting rootfs image"
        );
        within_deadline(
            self.deadline,
            "formatting the image",
            self.formatter
                .format(staging.path(), &output, self.options.size()),
        )
        .await?;
        Ok(output)
    }
}

impl Drop for RootfsBuild {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.release_staging();
    }
}

/// Image-relative path for an overlay destination.
fn overlay_destination(source: &Path, dest: &str) -> Result<PathBuf> {
    let mut rel = PathBuf::new();
    for component in Path::new(dest).components() {
        match component {
            Component::Normal(part) => rel.push(part),
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir => {
                if !rel.pop() {
                    return Err(RootfsError::OverlayIo(format!(
                        "destination {} escapes the rootfs",
                        dest
                    )));
                }
            }
            Component::Prefix(_) => {
                return Err(RootfsError::OverlayIo(format!("invalid destination {}", dest)))
            }
        }
    }

    if dest.is_empty() || dest.ends_with('/') || rel.as_os_str().is_empty() {
        let name = source.file_name().ok_or_else(|| {
            RootfsError::OverlayIo(format!("{} has no file name", source.display()))
        })?;
        rel.push(name);
    }
    Ok(rel)
}

fn overlay_io(path: &Path, e: io::Error) -> RootfsError {
    RootfsError::OverlayIo(format!("{}: {}", path.display(), e))
}

/// First 12 hex digits of a digest, for progress labels.
fn short_digest(digest: &str) -> String {
    let hex = digest.split_once(':').map_or(digest, |(_, hex)| hex);
    hex.chars().take(12).collect()
}

async fn within_deadline<T>(
    deadline: Option<Instant>,
    what: &str,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match deadline {
        Some(deadline) => {
            tokio::time::timeout_at(tokio::time::Instant::from_std(deadline), fut)
                .await
                .map_err(|_| RootfsError::Timeout(format!("deadline exceeded while {}", what)))?
        }
        None => fut.await,
    }
}
