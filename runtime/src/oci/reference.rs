//! Image reference parsing.
//!
//! Parses references like `example.registry/library/app:latest` into
//! registry host, repository and tag-or-digest.

use cont_core::error::{ContError, Result};

use super::digest::Digest;

/// Default registry when none is specified.
const DEFAULT_REGISTRY: &str = "docker.io";

/// Default tag when none is specified.
const DEFAULT_TAG: &str = "latest";

/// Parsed image reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    /// Registry hostname, optionally with port (e.g., "ghcr.io", "localhost:5000")
    pub registry: String,
    /// Repository path (e.g., "library/nginx")
    pub repository: String,
    /// Tag (e.g., "latest", "v0.1.0")
    pub tag: Option<String>,
    /// Pinned content digest
    pub digest: Option<Digest>,
}

impl ImageReference {
    /// Parse an image reference string.
    ///
    /// Supports formats:
    /// - `nginx` → docker.io/library/nginx:latest
    /// - `nginx:1.25` → docker.io/library/nginx:1.25
    /// - `myuser/myimage` → docker.io/myuser/myimage:latest
    /// - `ghcr.io/org/image:tag` → ghcr.io/org/image:tag
    /// - `ghcr.io/org/image@sha256:abc...` → ghcr.io/org/image@sha256:abc...
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(ContError::InvalidReference("Empty image reference".to_string()));
        }
        if reference.chars().any(char::is_whitespace) {
            return Err(ContError::InvalidReference(format!(
                "Whitespace in image reference '{}'",
                reference
            )));
        }

        // Split off digest first (@ separator)
        let (name_tag, digest) = match reference.rsplit_once('@') {
            Some((name_tag, digest_part)) => (name_tag, Some(Digest::parse(digest_part)?)),
            None => (reference, None),
        };

        // A tag colon can only appear after the last slash; a colon before any
        // slash with a numeric suffix is a registry port.
        let last_segment_start = name_tag.rfind('/').map_or(0, |pos| pos + 1);
        let (name, tag) = match name_tag[last_segment_start..].rfind(':') {
            Some(colon) => {
                let colon = last_segment_start + colon;
                let after = &name_tag[colon + 1..];
                let looks_like_port = last_segment_start == 0
                    && digest.is_none()
                    && !after.is_empty()
                    && after.chars().all(|c| c.is_ascii_digit());
                if looks_like_port {
                    (name_tag, None)
                } else {
                    (&name_tag[..colon], Some(after.to_string()))
                }
            }
            None => (name_tag, None),
        };

        if matches!(tag.as_deref(), Some("")) {
            return Err(ContError::InvalidReference(format!(
                "Empty tag in reference '{}'",
                reference
            )));
        }

        let (registry, repository) = Self::split_registry_repository(name)?;

        let tag = if tag.is_none() && digest.is_none() {
            Some(DEFAULT_TAG.to_string())
        } else {
            tag
        };

        Ok(ImageReference {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Split a name into registry and repository components.
    fn split_registry_repository(name: &str) -> Result<(String, String)> {
        // The first component is a registry host if it contains a dot or a
        // colon, or is "localhost".
        if let Some((first, rest)) = name.split_once('/') {
            if first.contains('.') || first.contains(':') || first == "localhost" {
                if rest.is_empty() {
                    return Err(ContError::InvalidReference(format!(
                        "Empty repository in reference '{}'",
                        name
                    )));
                }
                return Ok((first.to_string(), rest.to_string()));
            }
        }

        if name.is_empty() || name.starts_with('/') || name.ends_with('/') {
            return Err(ContError::InvalidReference(format!(
                "Invalid repository in reference '{}'",
                name
            )));
        }

        let repository = if name.contains('/') {
            name.to_string()
        } else {
            // Single name like "nginx" → "library/nginx" for Docker Hub
            format!("library/{}", name)
        };

        Ok((DEFAULT_REGISTRY.to_string(), repository))
    }

    /// The tag-or-digest part used to look the reference up in a registry.
    ///
    /// A digest wins over a tag when both are present.
    pub fn target(&self) -> String {
        match (&self.digest, &self.tag) {
            (Some(digest), _) => digest.to_string(),
            (None, Some(tag)) => tag.clone(),
            (None, None) => DEFAULT_TAG.to_string(),
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
            s.push_str(digest.as_str());
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
    type Err = ContError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
