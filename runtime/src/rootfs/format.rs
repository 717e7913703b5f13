//! Image formatting: turns a staged tree into a filesystem image.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use ocifs_core::config::ImageSize;
use ocifs_core::error::{Result, RootfsError};
use tokio::process::Command;

/// Produces a filesystem image from a directory tree.
#[async_trait]
pub trait ImageFormatter: Send + Sync {
    /// Write an image of `source_dir` to `output_path`. `size` is the
    /// initial filesystem size; formatters may shrink the result.
    async fn format(&self, source_dir: &Path, output_path: &Path, size: ImageSize)
        -> Result<()>;
}

/// ext4 via e2fsprogs: `mke2fs -d` populates the filesystem from the
/// staged tree, `resize2fs -M` shrinks it to its minimum size.
#[derive(Debug, Clone)]
pub struct Ext4Formatter {
    mke2fs: PathBuf,
    resize2fs: PathBuf,
}

impl Ext4Formatter {
    pub fn new() -> Self {
        Self::with_tools("mke2fs", "resize2fs")
    }

    /// Use specific tool binaries instead of looking them up in `PATH`.
    pub fn with_tools(mke2fs: impl Into<PathBuf>, resize2fs: impl Into<PathBuf>) -> Self {
        Self {
            mke2fs: mke2fs.into(),
            resize2fs: resize2fs.into(),
        }
    }

    fn mke2fs_args(source_dir: &Path, output_path: &Path, size: ImageSize) -> Vec<OsString> {
        vec![
            "-F".into(),
            "-t".into(),
            "ext4".into(),
            "-d".into(),
            source_dir.into(),
            output_path.into(),
            size.to_mke2fs_arg().into(),
        ]
    }

    fn resize2fs_args(output_path: &Path) -> Vec<OsString> {
        vec!["-M".into(), output_path.into()]
    }
}

impl Default for Ext4Formatter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ImageFormatter for Ext4Formatter {
    async fn format(
        &self,
        source_dir: &Path,
        output_path: &Path,
        size: ImageSize,
    ) -> Result<()> {
        // mke2fs never shrinks an existing file.
        match tokio::fs::remove_file(output_path).await {
            Ok(()) => {
                tracing::debug!(output = %output_path.display(), "Replaced existing image")
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(RootfsError::ImageFormat {
                    tool: self.mke2fs.display().to_string(),
                    message: format!("cannot replace {}: {}", output_path.display(), e),
                })
            }
        }

        run_tool(
            &self.mke2fs,
            &Self::mke2fs_args(source_dir, output_path, size),
        )
        .await?;
        run_tool(&self.resize2fs, &Self::resize2fs_args(output_path)).await?;

        tracing::info!(output = %output_path.display(), "Created ext4 image");
        Ok(())
    }
}

async fn run_tool(tool: &Path, args: &[OsString]) -> Result<()> {
    let tool_name = tool.display().to_string();
    tracing::debug!(tool = %tool_name, args = ?args, "Running formatter tool");

    let output = Command::new(tool)
        .args(args)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| RootfsError::ImageFormat {
            tool: tool_name.clone(),
            message: if e.kind() == std::io::ErrorKind::NotFound {
                "not found; install e2fsprogs".to_string()
            } else {
                format!("failed to execute: {}", e)
            },
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(RootfsError::ImageFormat {
            tool: tool_name,
            message: format!(
                "exit {}: {}",
                output.status.code().unwrap_or(-1),
                stderr.trim()
            ),
        });
    }
    Ok(())
}
