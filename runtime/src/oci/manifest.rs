//! Descriptors, image manifests and image indexes.
//!
//! Only the fields the pull pipeline relies on are modelled; unknown fields
//! are ignored when parsing.

use std::collections::BTreeMap;

use cont_core::error::{ContError, Result};
use serde::{Deserialize, Serialize};

use super::digest::Digest;

/// OCI image manifest.
pub const OCI_MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";
/// OCI image index.
pub const OCI_INDEX_MEDIA_TYPE: &str = "application/vnd.oci.image.index.v1+json";
/// Docker schema 2 manifest.
pub const DOCKER_MANIFEST_MEDIA_TYPE: &str = "application/vnd.docker.distribution.manifest.v2+json";
/// Docker schema 2 manifest list.
pub const DOCKER_MANIFEST_LIST_MEDIA_TYPE: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";

/// Annotation carrying the reference an index entry was tagged with.
pub const REF_NAME_ANNOTATION: &str = "org.opencontainers.image.ref.name";

/// Manifest media types accepted when resolving a reference.
pub const ACCEPTED_MANIFEST_MEDIA_TYPES: &[&str] = &[
    OCI_MANIFEST_MEDIA_TYPE,
    OCI_INDEX_MEDIA_TYPE,
    DOCKER_MANIFEST_MEDIA_TYPE,
    DOCKER_MANIFEST_LIST_MEDIA_TYPE,
];

/// True for single-image manifest media types.
pub fn is_manifest_media_type(media_type: &str) -> bool {
    media_type == OCI_MANIFEST_MEDIA_TYPE || media_type == DOCKER_MANIFEST_MEDIA_TYPE
}

/// True for multi-platform index media types.
pub fn is_index_media_type(media_type: &str) -> bool {
    media_type == OCI_INDEX_MEDIA_TYPE || media_type == DOCKER_MANIFEST_LIST_MEDIA_TYPE
}

/// Content-addressed pointer to an immutable artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: Digest,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl Descriptor {
    /// Describe a byte slice.
    pub fn for_bytes(media_type: impl Into<String>, bytes: &[u8]) -> Self {
        Self {
            media_type: media_type.into(),
            digest: Digest::of(bytes),
            size: bytes.len() as u64,
            platform: None,
            annotations: BTreeMap::new(),
        }
    }
}

/// Target platform of an index entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    pub architecture: String,
    pub os: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl Platform {
    /// Linux on the host CPU, using OCI architecture names.
    pub fn host_linux() -> Self {
        let architecture = match std::env::consts::ARCH {
            "x86_64" => "amd64",
            "aarch64" => "arm64",
            "x86" => "386",
            other => other,
        };
        Self {
            architecture: architecture.to_string(),
            os: "linux".to_string(),
            variant: None,
        }
    }
}

/// Parsed image manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl Manifest {
    /// Parse and validate manifest bytes.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let manifest: Manifest = serde_json::from_slice(bytes)
            .map_err(|e| ContError::ManifestParseError(format!("Invalid image manifest: {}", e)))?;

        if manifest.schema_version != 2 {
            return Err(ContError::ManifestParseError(format!(
                "Unsupported manifest schema version {}",
                manifest.schema_version
            )));
        }
        if let Some(ref media_type) = manifest.media_type {
            if !is_manifest_media_type(media_type) {
                return Err(ContError::ManifestParseError(format!(
                    "Unsupported manifest media type '{}'",
                    media_type
                )));
            }
        }

        Ok(manifest)
    }

    /// Sum of config and layer sizes.
    pub fn total_size(&self) -> u64 {
        self.config.size + self.layers.iter().map(|l| l.size).sum::<u64>()
    }
}

/// Parsed image index (multi-platform manifest list).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageIndex {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub manifests: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl ImageIndex {
    /// An empty schema 2 OCI index.
    pub fn empty() -> Self {
        Self {
            schema_version: 2,
            media_type: Some(OCI_INDEX_MEDIA_TYPE.to_string()),
            manifests: Vec::new(),
            annotations: BTreeMap::new(),
        }
    }

    /// Parse and validate index bytes.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let index: ImageIndex = serde_json::from_slice(bytes)
            .map_err(|e| ContError::ManifestParseError(format!("Invalid image index: {}", e)))?;

        if index.schema_version != 2 {
            return Err(ContError::ManifestParseError(format!(
                "Unsupported index schema version {}",
                index.schema_version
            )));
        }
        if let Some(ref media_type) = index.media_type {
            if !is_index_media_type(media_type) {
                return Err(ContError::ManifestParseError(format!(
                    "Unsupported index media type '{}'",
                    media_type
                )));
            }
        }

        Ok(index)
    }

    /// Pick the manifest entry for a platform.
    ///
    /// A variant is only compared when the wanted platform names one.
    pub fn select(&self, wanted: &Platform) -> Option<&Descriptor> {
        self.manifests.iter().find(|entry| {
            entry.platform.as_ref().map_or(false, |p| {
                p.os == wanted.os
                    && p.architecture == wanted.architecture
                    && (wanted.variant.is_none() || p.variant == wanted.variant)
            })
        })
    }
}

/// Infer the media type of a manifest document from its body.
///
/// Registries may omit `mediaType`; a `manifests` array marks an index.
pub fn sniff_media_type(bytes: &[u8]) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(bytes).ok()?;
    if let Some(media_type) = value.get("mediaType").and_then(|v| v.as_str()) {
        return Some(media_type.to_string());
    }
    if value.get("manifests").map_or(false, |v| v.is_array()) {
        Some(OCI_INDEX_MEDIA_TYPE.to_string())
    } else if value.get("layers").is_some() {
        Some(OCI_MANIFEST_MEDIA_TYPE.to_string())
    } else {
        None
    }
}
