//! OCI image reference parsing.
//!
//! Parses image references like `docker.io/library/ubuntu:latest` into structured components.

use ocifs_core::error::{Result, RootfsError};

/// Default registry when none is specified.
const DEFAULT_REGISTRY: &str = "docker.io";

/// Tag used by the resolution layer when the reference carries neither a tag nor a digest.
pub const DEFAULT_TAG: &str = "latest";

/// Maximum length of a tag accepted by registries.
const MAX_TAG_LEN: usize = 128;

/// Parsed OCI image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Reference string as supplied by the caller
    raw: String,
    /// Registry hostname, optionally with port (e.g., "ghcr.io", "localhost:5000")
    pub registry: String,
    /// Repository path (e.g., "library/ubuntu", "synadia/nex-rootfs")
    pub repository: String,
    /// Tag, if present in the input (e.g., "latest", "5.0.2")
    pub tag: Option<String>,
    /// Digest (e.g., "sha256:abc123...")
    pub digest: Option<String>,
}

impl ImageReference {
    /// Parse an image reference string.
    ///
    /// Supports formats:
    /// - `docker.io/library/ubuntu:latest`
    /// - `ghcr.io/org/image` (no tag; resolved as `latest`)
    /// - `ghcr.io/org/image@sha256:abc...`
    /// - `localhost:5000/image:tag`
    /// - `ubuntu` → docker.io/library/ubuntu
    pub fn parse(reference: &str) -> Result<Self> {
        let raw = reference.trim();
        if raw.is_empty() {
            return Err(invalid(reference, "empty image reference"));
        }

        // Split off digest first (@ separator)
        let (name_tag, digest) = match raw.rfind('@') {
            Some(at_pos) => {
                let digest_part = &raw[at_pos + 1..];
                validate_digest(raw, digest_part)?;
                (&raw[..at_pos], Some(digest_part.to_string()))
            }
            None => (raw, None),
        };

        // Split tag on the last colon after the last slash. A colon before
        // the first slash belongs to a registry port.
        let (name, tag) = match name_tag.rfind('/') {
            Some(slash_pos) => {
                let after_slash = &name_tag[slash_pos + 1..];
                match after_slash.rfind(':') {
                    Some(colon_pos) => (
                        &name_tag[..slash_pos + 1 + colon_pos],
                        Some(after_slash[colon_pos + 1..].to_string()),
                    ),
                    None => (name_tag, None),
                }
            }
            None => match name_tag.rfind(':') {
                Some(colon_pos) => (
                    &name_tag[..colon_pos],
                    Some(name_tag[colon_pos + 1..].to_string()),
                ),
                None => (name_tag, None),
            },
        };

        if let Some(ref tag) = tag {
            validate_tag(raw, tag)?;
        }

        let (registry, repository) = split_registry_repository(raw, name)?;
        validate_repository(raw, &repository)?;

        Ok(ImageReference {
            raw: raw.to_string(),
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// The reference string as originally supplied.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// What to ask the registry for: the digest if pinned, else the tag,
    /// else [`DEFAULT_TAG`].
    pub fn tag_or_digest(&self) -> &str {
        self.digest
            .as_deref()
            .or(self.tag.as_deref())
            .unwrap_or(DEFAULT_TAG)
    }

    /// Same repository, pinned to `digest`.
    pub fn with_digest(&self, digest: &str) -> Self {
        Self {
            raw: self.raw.clone(),
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            tag: self.tag.clone(),
            digest: Some(digest.to_string()),
        }
    }

    /// Get the full reference string.
    pub fn full_reference(&self) -> String {
        let mut s = format!("{}/{}", self.registry, self.repository);
        if let Some(ref tag) = self.tag {
            s.push(':');
            s.push_str(tag);
        }
        if let Some(ref digest) = self.digest {
            s.push('@');
            s.push_str(digest);
        }
        s
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.full_reference())
    }
}

impl std::str::FromStr for ImageReference {
    type Err = RootfsError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Lowercased registry host with the Docker Hub aliases folded into
/// `docker.io`, for keying per-host settings.
pub fn canonical_registry(registry: &str) -> String {
    let host = registry.trim().to_ascii_lowercase();
    match host.as_str() {
        "index.docker.io" | "registry-1.docker.io" => DEFAULT_REGISTRY.to_string(),
        _ => host,
    }
}

fn invalid(reference: &str, reason: impl Into<String>) -> RootfsError {
    RootfsError::InvalidReference {
        reference: reference.to_string(),
        reason: reason.into(),
    }
}

/// Split a name into registry and repository components.
fn split_registry_repository(reference: &str, name: &str) -> Result<(String, String)> {
    // The first component is a registry hostname if it contains a dot or
    // colon, or is "localhost"
    if let Some(slash_pos) = name.find('/') {
        let first = &name[..slash_pos];
        if first.contains('.') || first.contains(':') || first == "localhost" {
            let repo = &name[slash_pos + 1..];
            if repo.is_empty() {
                return Err(invalid(reference, "empty repository"));
            }
            return Ok((first.to_string(), repo.to_string()));
        }
    }

    // No registry detected, use the default
    let repository = if name.contains('/') {
        name.to_string()
    } else {
        // Single name like "ubuntu" → "library/ubuntu" for Docker Hub
        format!("library/{}", name)
    };

    Ok((DEFAULT_REGISTRY.to_string(), repository))
}

fn validate_repository(reference: &str, repository: &str) -> Result<()> {
    for component in repository.split('/') {
        if component.is_empty() {
            return Err(invalid(reference, "empty repository path component"));
        }
        let valid_chars = component
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-'));
        let alnum_edges = component
            .chars()
            .next()
            .zip(component.chars().last())
            .map_or(false, |(first, last)| {
                first.is_ascii_alphanumeric() && last.is_ascii_alphanumeric()
            });
        if !valid_chars || !alnum_edges {
            return Err(invalid(
                reference,
                format!("invalid repository path component '{}'", component),
            ));
        }
    }
    Ok(())
}

fn validate_tag(reference: &str, tag: &str) -> Result<()> {
    if tag.is_empty() {
        return Err(invalid(reference, "empty tag"));
    }
    if tag.len() > MAX_TAG_LEN {
        return Err(invalid(reference, "tag longer than 128 characters"));
    }
    let starts_ok = tag
        .chars()
        .next()
        .map_or(false, |c| c.is_ascii_alphanumeric() || c == '_');
    let chars_ok = tag
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if !starts_ok || !chars_ok {
        return Err(invalid(reference, format!("invalid tag '{}'", tag)));
    }
    Ok(())
}

fn validate_digest(reference: &str, digest: &str) -> Result<()> {
    let Some((algorithm, hex)) = digest.split_once(':') else {
        return Err(invalid(
            reference,
            "invalid digest format: expected algorithm:hex",
        ));
    };
    if algorithm.is_empty() || hex.is_empty() || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(invalid(
            reference,
            format!("invalid digest '{}'", digest),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_registry() {
        assert_eq!(canonical_registry("index.docker.io"), "docker.io");
        assert_eq!(canonical_registry(" Registry-1.Docker.io "), "docker.io");
        assert_eq!(canonical_registry("GHCR.io"), "ghcr.io");
        assert_eq!(canonical_registry("localhost:5000"), "localhost:5000");
    }

    #[test]
    fn test_parse_registry_repo_tag() {
        let cases = [
            ("docker.io/library/ubuntu:latest", "docker.io", "library/ubuntu", "latest"),
            ("docker.io/synadia/nex-rootfs:alpine", "docker.io", "synadia/nex-rootfs", "alpine"),
            ("ghcr.io/actions/setup-go:5.0.2", "ghcr.io", "actions/setup-go", "5.0.2"),
        ];
        for (raw, registry, repository, tag) in cases {
            let r = ImageReference::parse(raw).unwrap();
            assert_eq!(r.registry, registry, "{raw}");
            assert_eq!(r.repository, repository, "{raw}");
            assert_eq!(r.tag.as_deref(), Some(tag), "{raw}");
            assert_eq!(r.digest, None);
            assert_eq!(r.raw(), raw);
        }
    }

    #[test]
    fn test_parse_does_not_default_tag() {
        let r = ImageReference::parse("ghcr.io/org/image").unwrap();
        assert_eq!(r.tag, None);
        assert_eq!(r.tag_or_digest(), "latest");
    }

    #[test]
    fn test_parse_simple_name() {
        let r = ImageReference::parse("ubuntu").unwrap();
        assert_eq!(r.registry, "docker.io");
        assert_eq!(r.repository, "library/ubuntu");
        assert_eq!(r.tag, None);
    }

    #[test]
    fn test_parse_user_repo_with_tag() {
        let r = ImageReference::parse("myuser/myimage:v1.0").unwrap();
        assert_eq!(r.registry, "docker.io");
        assert_eq!(r.repository, "myuser/myimage");
        assert_eq!(r.tag, Some("v1.0".to_string()));
    }

    #[test]
    fn test_parse_digest_only() {
        let r = ImageReference::parse(
            "ghcr.io/org/image@sha256:abcdef1234567890abcdef1234567890abcdef1234567890abcdef1234567890",
        )
        .unwrap();
        assert_eq!(r.registry, "ghcr.io");
        assert_eq!(r.repository, "org/image");
        assert_eq!(r.tag, None);
        assert!(r.tag_or_digest().starts_with("sha256:"));
    }

    #[test]
    fn test_parse_tag_and_digest() {
        let r = ImageReference::parse("ghcr.io/org/image:v0.1.0@sha256:abcdef1234567890").unwrap();
        assert_eq!(r.tag, Some("v0.1.0".to_string()));
        assert_eq!(r.digest, Some("sha256:abcdef1234567890".to_string()));
        assert_eq!(r.tag_or_digest(), "sha256:abcdef1234567890");
    }

    #[test]
    fn test_parse_registry_with_port() {
        let r = ImageReference::parse("localhost:5000/myimage:v1").unwrap();
        assert_eq!(r.registry, "localhost:5000");
        assert_eq!(r.repository, "myimage");
        assert_eq!(r.tag, Some("v1".to_string()));

        let r = ImageReference::parse("127.0.0.1:5000/team/app").unwrap();
        assert_eq!(r.registry, "127.0.0.1:5000");
        assert_eq!(r.repository, "team/app");
        assert_eq!(r.tag, None);
    }

    #[test]
    fn test_deep_repository_path() {
        let r = ImageReference::parse("ghcr.io/org/sub/image:v1").unwrap();
        assert_eq!(r.repository, "org/sub/image");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for raw in [
            "",
            "   ",
            "ubuntu@invaliddigest",
            "ubuntu@sha256:not-hex",
            "docker.io/Library/Ubuntu:latest",
            "docker.io/library/ubuntu:",
            "docker.io/library//ubuntu",
            "docker.io/",
            "docker.io/library/ubuntu:-bad",
        ] {
            let err = ImageReference::parse(raw).unwrap_err();
            assert!(
                matches!(err, RootfsError::InvalidReference { .. }),
                "{raw:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_with_digest() {
        let r = ImageReference::parse("docker.io/library/ubuntu:latest").unwrap();
        let pinned = r.with_digest("sha256:abc");
        assert_eq!(pinned.tag_or_digest(), "sha256:abc");
        assert_eq!(pinned.repository, r.repository);
    }

    #[test]
    fn test_display() {
        let r = ImageReference::parse("ghcr.io/actions/setup-go:5.0.2").unwrap();
        assert_eq!(format!("{}", r), "ghcr.io/actions/setup-go:5.0.2");
    }
}
