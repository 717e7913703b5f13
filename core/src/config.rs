//! Build configuration.
//!
//! `BuildOptions` is an immutable value: the only way to obtain one is
//! `BuildOptionsBuilder::build()`, which validates every field at once and
//! reports all problems together.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Result, RootfsError};

/// Default target operating system.
pub const DEFAULT_OS: &str = "linux";

/// Default target architecture.
pub const DEFAULT_ARCH: &str = "amd64";

/// Default file name of the materialized image.
pub const DEFAULT_IMAGE_NAME: &str = "rootfs.ext4";

/// Default filesystem size handed to the formatter before shrinking.
pub const DEFAULT_IMAGE_SIZE: &str = "150M";

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;
const GIB: u64 = 1024 * MIB;

/// Target platform of a build (OS, architecture, optional variant).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    pub os: String,
    pub architecture: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl Platform {
    pub fn new(os: impl Into<String>, architecture: impl Into<String>) -> Self {
        Self {
            os: os.into(),
            architecture: architecture.into(),
            variant: None,
        }
    }

    pub fn with_variant(mut self, variant: impl Into<String>) -> Self {
        self.variant = Some(variant.into());
        self
    }

    /// Linux on the host's CPU architecture, using OCI architecture names.
    pub fn host_linux() -> Self {
        let arch = match std::env::consts::ARCH {
            "x86_64" => "amd64",
            "aarch64" => "arm64",
            "x86" => "386",
            "powerpc64" => "ppc64le",
            other => other,
        };
        Self::new(DEFAULT_OS, arch)
    }
}

impl Default for Platform {
    fn default() -> Self {
        Self::new(DEFAULT_OS, DEFAULT_ARCH)
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;
        if let Some(ref variant) = self.variant {
            write!(f, "/{}", variant)?;
        }
        Ok(())
    }
}

impl FromStr for Platform {
    type Err = RootfsError;

    /// Parse `os/arch[/variant]`, e.g. `linux/arm64/v8`.
    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.trim().split('/').collect();
        match parts.as_slice() {
            [os, arch] if !os.is_empty() && !arch.is_empty() => Ok(Self::new(*os, *arch)),
            [os, arch, variant] if !os.is_empty() && !arch.is_empty() && !variant.is_empty() => {
                Ok(Self::new(*os, *arch).with_variant(*variant))
            }
            _ => Err(RootfsError::InvalidOptions(vec![format!(
                "invalid platform '{}': expected os/arch[/variant]",
                s
            )])),
        }
    }
}

/// Size of the filesystem image, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ImageSize(u64);

impl ImageSize {
    pub fn from_bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    pub fn bytes(&self) -> u64 {
        self.0
    }

    /// Size argument understood by `mke2fs` (kibibytes with a `k` suffix).
    pub fn to_mke2fs_arg(&self) -> String {
        format!("{}k", self.0 / KIB)
    }
}

impl FromStr for ImageSize {
    type Err = String;

    /// Parse `512K`, `150M`, `2G` or a plain byte count.
    fn from_str(s: &str) -> std::result::Result<Self, String> {
        let s = s.trim();
        if s.is_empty() {
            return Err("size must not be empty".to_string());
        }
        let (digits, unit) = match s.char_indices().find(|(_, c)| !c.is_ascii_digit()) {
            Some((pos, _)) => (&s[..pos], &s[pos..]),
            None => (s, ""),
        };
        let value: u64 = digits
            .parse()
            .map_err(|_| format!("invalid size '{}'", s))?;
        let multiplier = match unit.to_ascii_uppercase().as_str() {
            "" | "B" => 1,
            "K" | "KB" | "KIB" => KIB,
            "M" | "MB" | "MIB" => MIB,
            "G" | "GB" | "GIB" => GIB,
            _ => return Err(format!("invalid size unit in '{}'", s)),
        };
        value
            .checked_mul(multiplier)
            .map(ImageSize)
            .ok_or_else(|| format!("size '{}' is too large", s))
    }
}

impl fmt::Display for ImageSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.0;
        if bytes % GIB == 0 && bytes > 0 {
            write!(f, "{}G", bytes / GIB)
        } else if bytes % MIB == 0 && bytes > 0 {
            write!(f, "{}M", bytes / MIB)
        } else if bytes % KIB == 0 && bytes > 0 {
            write!(f, "{}K", bytes / KIB)
        } else {
            write!(f, "{}", bytes)
        }
    }
}

impl Serialize for ImageSize {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

/// Validated, immutable options for one rootfs build.
#[derive(Debug, Clone, Serialize)]
pub struct BuildOptions {
    platform: Platform,
    output_dir: PathBuf,
    image_name: String,
    size: ImageSize,
    staging_root: Option<PathBuf>,
    keep_staging: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    timeout_secs: Option<u64>,
    insecure_registries: Vec<String>,
}

impl BuildOptions {
    pub fn builder() -> BuildOptionsBuilder {
        BuildOptionsBuilder::default()
    }

    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn image_name(&self) -> &str {
        &self.image_name
    }

    /// Full path of the image produced by `create()`.
    pub fn output_path(&self) -> PathBuf {
        self.output_dir.join(&self.image_name)
    }

    pub fn size(&self) -> ImageSize {
        self.size
    }

    /// Parent directory for the staging tree (`None` = system temp dir).
    pub fn staging_root(&self) -> Option<&Path> {
        self.staging_root.as_deref()
    }

    pub fn keep_staging(&self) -> bool {
        self.keep_staging
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    /// Registries reached over plain HTTP.
    pub fn insecure_registries(&self) -> &[String] {
        &self.insecure_registries
    }
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            platform: Platform::default(),
            output_dir: PathBuf::from("."),
            image_name: DEFAULT_IMAGE_NAME.to_string(),
            size: ImageSize(150 * MIB),
            staging_root: None,
            keep_staging: false,
            timeout_secs: None,
            insecure_registries: Vec::new(),
        }
    }
}

/// Builder for [`BuildOptions`].
///
/// Also the on-disk shape of an options file, so a JSON config can be
/// loaded first and individual fields overridden afterwards.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "snake_case")]
pub struct BuildOptionsBuilder {
    os: Option<String>,
    arch: Option<String>,
    variant: Option<String>,
    output_dir: Option<PathBuf>,
    image_name: Option<String>,
    size: Option<String>,
    staging_root: Option<PathBuf>,
    keep_staging: Option<bool>,
    timeout_secs: Option<u64>,
    insecure_registries: Vec<String>,
}

impl BuildOptionsBuilder {
    /// Load builder fields from a JSON options file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            RootfsError::Other(format!(
                "Failed to read options file {}: {}",
                path.display(),
                e
            ))
        })?;
        Ok(serde_json::from_str(&data)?)
    }

    pub fn os(mut self, os: impl Into<String>) -> Self {
        self.os = Some(os.into());
        self
    }

    pub fn arch(mut self, arch: impl Into<String>) -> Self {
        self.arch = Some(arch.into());
        self
    }

    pub fn variant(mut self, variant: impl Into<String>) -> Self {
        self.variant = Some(variant.into());
        self
    }

    pub fn platform(self, platform: Platform) -> Self {
        let variant = platform.variant.clone();
        let mut builder = self.os(platform.os).arch(platform.architecture);
        builder.variant = variant;
        builder
    }

    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    pub fn image_name(mut self, name: impl Into<String>) -> Self {
        self.image_name = Some(name.into());
        self
    }

    /// Filesystem size, e.g. `150M`. Parsed and checked in `build()`.
    pub fn size(mut self, size: impl Into<String>) -> Self {
        self.size = Some(size.into());
        self
    }

    pub fn staging_root(mut self, dir: impl Into<PathBuf>) -> Self {
        self.staging_root = Some(dir.into());
        self
    }

    pub fn keep_staging(mut self, keep: bool) -> Self {
        self.keep_staging = Some(keep);
        self
    }

    /// Overall build deadline, rounded up to whole seconds.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        let partial = u64::from(timeout.subsec_nanos() > 0);
        self.timeout_secs = Some(timeout.as_secs().saturating_add(partial));
        self
    }

    pub fn insecure_registry(mut self, registry: impl Into<String>) -> Self {
        self.insecure_registries.push(registry.into());
        self
    }

    /// Validate every field and produce the options, or report all
    /// problems in a single `InvalidOptions` error.
    pub fn build(self) -> Result<BuildOptions> {
        let defaults = BuildOptions::default();
        let mut errors = Vec::new();

        let os = self.os.unwrap_or_else(|| DEFAULT_OS.to_string());
        check_platform_field("os", &os, &mut errors);
        let arch = self.arch.unwrap_or_else(|| DEFAULT_ARCH.to_string());
        check_platform_field("arch", &arch, &mut errors);
        if let Some(ref variant) = self.variant {
            check_platform_field("variant", variant, &mut errors);
        }

        let output_dir = self.output_dir.unwrap_or(defaults.output_dir);
        if output_dir.as_os_str().is_empty() {
            errors.push("output directory must not be empty".to_string());
        } else if output_dir.exists() && !output_dir.is_dir() {
            errors.push(format!(
                "output directory {} is not a directory",
                output_dir.display()
            ));
        }

        let image_name = self.image_name.unwrap_or(defaults.image_name);
        if image_name.is_empty()
            || image_name == "."
            || image_name == ".."
            || image_name.contains('/')
        {
            errors.push(format!("invalid image name '{}'", image_name));
        }

        let size = match self.size {
            Some(raw) => match raw.parse::<ImageSize>() {
                Ok(size) if size.bytes() >= MIB => size,
                Ok(_) => {
                    errors.push(format!("size '{}' must be at least 1M", raw));
                    defaults.size
                }
                Err(e) => {
                    errors.push(e);
                    defaults.size
                }
            },
            None => defaults.size,
        };

        if let Some(ref root) = self.staging_root {
            if !root.is_dir() {
                errors.push(format!(
                    "staging root {} is not an existing directory",
                    root.display()
                ));
            }
        }

        if self.timeout_secs == Some(0) {
            errors.push("timeout must be greater than zero".to_string());
        }

        for registry in &self.insecure_registries {
            if registry.trim().is_empty() || registry.contains('/') {
                errors.push(format!("invalid insecure registry '{}'", registry));
            }
        }

        if !errors.is_empty() {
            return Err(RootfsError::InvalidOptions(errors));
        }

        Ok(BuildOptions {
            platform: Platform {
                os,
                architecture: arch,
                variant: self.variant,
            },
            output_dir,
            image_name,
            size,
            staging_root: self.staging_root,
            keep_staging: self.keep_staging.unwrap_or(false),
            timeout_secs: self.timeout_secs,
            insecure_registries: self.insecure_registries,
        })
    }
}

fn check_platform_field(name: &str, value: &str, errors: &mut Vec<String>) {
    if value.is_empty() {
        errors.push(format!("{} must not be empty", name));
    } else if value.contains('/') || value.chars().any(char::is_whitespace) {
        errors.push(format!("invalid {} '{}'", name, value));
    }
}
