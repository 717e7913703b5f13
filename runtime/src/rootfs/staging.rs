//! Scoped staging directory.
//!
//! Owned by exactly one build. The directory is removed when the value is
//! dropped or released, unless it was explicitly kept. A blocking extractor
//! holds a [`StagingLease`] while it writes; removal then waits for the
//! lease to go away so the extractor never recreates a released tree.

use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ocifs_core::error::{Result, RootfsError};
use parking_lot::Mutex;
use tempfile::TempDir;

use crate::oci::layers::LayerStats;

/// Mode of the image's root directory.
const ROOT_DIR_MODE: u32 = 0o755;

/// The on-disk directory, shared by the owner and any leases.
struct StagingRoot {
    path: PathBuf,
    /// `None` once the directory was kept.
    dir: Mutex<Option<TempDir>>,
}

impl Drop for StagingRoot {
    fn drop(&mut self) {
        if let Some(dir) = self.dir.get_mut().take() {
            match dir.close() {
                Ok(()) => tracing::debug!(path = %self.path.display(), "Removed staging directory"),
                Err(e) => tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Failed to remove staging directory"
                ),
            }
        }
    }
}

/// Keeps a staging directory on disk until dropped.
#[derive(Clone)]
pub struct StagingLease(Arc<StagingRoot>);

impl StagingLease {
    pub fn path(&self) -> &Path {
        &self.0.path
    }
}

pub struct StagingDir {
    root: Arc<StagingRoot>,
    /// Declared directory modes collected from all layers, relative paths.
    directory_modes: BTreeMap<PathBuf, u32>,
}

impl StagingDir {
    /// Create a fresh staging directory under `staging_root`, or under the
    /// system temporary directory when none is given.
    pub fn create(staging_root: Option<&Path>) -> Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("ocifs-rootfs-");
        let dir = match staging_root {
            Some(root) => builder.tempdir_in(root),
            None => builder.tempdir(),
        }
        .map_err(|e| {
            RootfsError::ExtractionIo(format!("failed to create staging directory: {}", e))
        })?;

        tracing::debug!(path = %dir.path().display(), "Created staging directory");
        Ok(Self {
            root: Arc::new(StagingRoot {
                path: dir.path().to_path_buf(),
                dir: Mutex::new(Some(dir)),
            }),
            directory_modes: BTreeMap::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.root.path
    }

    /// Hold the directory on disk for a writer running outside the build.
    pub fn lease(&self) -> StagingLease {
        StagingLease(self.root.clone())
    }

    /// Remember the directory modes a layer declared. Later layers win.
    pub fn record_layer(&mut self, stats: &LayerStats) {
        self.directory_modes.extend(
            stats
                .directory_modes
                .iter()
                .map(|(path, mode)| (path.clone(), *mode)),
        );
    }

    /// Give every staged directory its declared mode. Runs once, right
    /// before formatting, children before parents.
    pub fn apply_directory_modes(&mut self) -> Result<()> {
        let root = self.path();
        for (rel, mode) in self.directory_modes.iter().rev() {
            let path = root.join(rel);
            match fs::symlink_metadata(&path) {
                Ok(meta) if meta.is_dir() => {
                    fs::set_permissions(&path, fs::Permissions::from_mode(*mode)).map_err(
                        |e| {
                            RootfsError::ExtractionIo(format!(
                                "failed to set mode {:o} on {}: {}",
                                mode,
                                path.display(),
                                e
                            ))
                        },
                    )?;
                }
                // Removed by a whiteout or replaced by a file or link.
                _ => {}
            }
        }
        fs::set_permissions(root, fs::Permissions::from_mode(ROOT_DIR_MODE))
            .map_err(|e| RootfsError::ExtractionIo(e.to_string()))?;
        tracing::debug!(
            directories = self.directory_modes.len(),
            "Applied directory modes"
        );
        Ok(())
    }

    /// Keep the directory on disk and return its path.
    pub fn keep(self) -> PathBuf {
        if let Some(dir) = self.root.dir.lock().take() {
            let _ = dir.into_path();
        }
        let path = self.root.path.clone();
        tracing::info!(path = %path.display(), "Kept staging directory");
        path
    }

    /// Remove the directory, logging rather than failing on errors. With a
    /// lease outstanding, removal happens when the last lease is dropped.
    pub fn release(self) {
        let path = self.path().to_path_buf();
        // Read-only directories from the image would block removal.
        for rel in self.directory_modes.keys() {
            let dir = path.join(rel);
            if let Ok(meta) = fs::symlink_metadata(&dir) {
                if meta.is_dir() {
                    let mode = meta.permissions().mode() | 0o700;
                    let _ = fs::set_permissions(&dir, fs::Permissions::from_mode(mode));
                }
            }
        }
        if Arc::strong_count(&self.root) > 1 {
            tracing::debug!(
                path = %path.display(),
                "Staging directory still in use, removing it once the writer stops"
            );
        }
    }
}
