//! `ocifs build` command.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use ocifs_core::config::{BuildOptions, BuildOptionsBuilder, Platform};
use ocifs_runtime::{Ext4Formatter, ImageReference, RootfsBuild};

use crate::output::{format_bytes, LayerProgress};

#[derive(Args)]
pub struct BuildArgs {
    /// Image reference (e.g., "ubuntu:22.04", "ghcr.io/org/image:tag")
    pub image: String,

    /// Add a local file to the rootfs (repeatable)
    #[arg(short = 'f', long = "file", value_name = "SRC=DEST", value_parser = parse_overlay)]
    pub files: Vec<(PathBuf, String)>,

    /// Target operating system (default: linux)
    #[arg(long)]
    pub os: Option<String>,

    /// Target architecture (default: host architecture)
    #[arg(long)]
    pub arch: Option<String>,

    /// Target architecture variant (e.g., "v8")
    #[arg(long)]
    pub variant: Option<String>,

    /// Output directory (default: current directory)
    #[arg(short, long = "output", value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Image file name (default: rootfs.ext4)
    #[arg(long)]
    pub name: Option<String>,

    /// Initial filesystem size before shrinking (e.g., "150M", "2G")
    #[arg(long)]
    pub size: Option<String>,

    /// Keep the staging directory after the build
    #[arg(long)]
    pub keep_staging: bool,

    /// Abort the build after this many seconds
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Registry reached over plain HTTP (repeatable)
    #[arg(long = "insecure", value_name = "HOST")]
    pub insecure: Vec<String>,

    /// JSON options file; flags override its fields
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,
}

/// Parse a `SRC=DEST` overlay argument.
fn parse_overlay(value: &str) -> Result<(PathBuf, String), String> {
    let (src, dest) = value
        .split_once('=')
        .ok_or_else(|| format!("expected SRC=DEST, got '{}'", value))?;
    if src.is_empty() {
        return Err(format!("missing source in '{}'", value));
    }
    Ok((PathBuf::from(src), dest.to_string()))
}

impl BuildArgs {
    fn options(&self) -> Result<BuildOptions, Box<dyn std::error::Error>> {
        let mut builder = match &self.config {
            Some(path) => BuildOptionsBuilder::from_file(path)?,
            None => BuildOptions::builder().arch(Platform::host_linux().architecture),
        };
        if let Some(os) = &self.os {
            builder = builder.os(os);
        }
        if let Some(arch) = &self.arch {
            builder = builder.arch(arch);
        }
        if let Some(variant) = &self.variant {
            builder = builder.variant(variant);
        }
        if let Some(dir) = &self.output_dir {
            builder = builder.output_dir(dir);
        }
        if let Some(name) = &self.name {
            builder = builder.image_name(name);
        }
        if let Some(size) = &self.size {
            builder = builder.size(size);
        }
        if self.keep_staging {
            builder = builder.keep_staging(true);
        }
        if let Some(secs) = self.timeout {
            builder = builder.timeout(Duration::from_secs(secs));
        }
        for host in &self.insecure {
            builder = builder.insecure_registry(host);
        }
        Ok(builder.build()?)
    }
}

pub async fn execute(args: BuildArgs, verbosity: u8) -> Result<(), Box<dyn std::error::Error>> {
    let options = args.options()?;
    let reference = ImageReference::parse(&args.image)?;
    let registry = super::registry_client(options.insecure_registries())?;

    let mut build = RootfsBuild::with_collaborators(
        reference,
        options,
        registry,
        Arc::new(Ext4Formatter::new()),
    );
    let progress = (verbosity >= 2).then(|| Arc::new(LayerProgress::new()));
    if let Some(progress) = &progress {
        build = build.with_progress(progress.clone());
    }

    let result = run(&mut build, &args.files).await;
    if let Some(progress) = &progress {
        progress.clear();
    }
    let output = result?;

    let size = std::fs::metadata(&output).map(|m| m.len()).unwrap_or(0);
    if let Some(staging) = build.staging_path() {
        eprintln!("Staging kept at {}", staging.display());
    }
    println!("{} ({})", output.display(), format_bytes(size));
    Ok(())
}

async fn run(
    build: &mut RootfsBuild,
    files: &[(PathBuf, String)],
) -> Result<PathBuf, Box<dyn std::error::Error>> {
    build.build().await?;
    for (src, dest) in files {
        build.add_file(src, dest)?;
    }
    Ok(build.create().await?)
}
