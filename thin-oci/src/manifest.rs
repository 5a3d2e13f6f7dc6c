use serde::{Deserialize, Serialize};

use crate::platform::PlatformKey;
use crate::{OciError, Result};

// ---------------------------------------------------------------------------
// OCI Image Manifest
// ---------------------------------------------------------------------------

/// A provider artifact manifest: an ordered layer list plus a config blob
/// descriptor.  Produced once per install and read-only afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OciManifest {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,

    #[serde(rename = "mediaType", default)]
    pub media_type: String,

    pub config: Descriptor,

    #[serde(default)]
    pub layers: Vec<Descriptor>,
}

impl OciManifest {
    /// Parse raw manifest bytes, rejecting image indexes.
    pub fn from_slice(data: &[u8]) -> Result<Self> {
        let manifest: OciManifest = serde_json::from_slice(data)
            .map_err(|e| OciError::Manifest(format!("failed to parse manifest: {}", e)))?;
        if is_index_media_type(&manifest.media_type) {
            return Err(OciError::Manifest(format!(
                "expected an image manifest, got {}",
                manifest.media_type
            )));
        }
        Ok(manifest)
    }

    /// Whether the config blob carries anything beyond the `{}` placeholder.
    pub fn has_config_payload(&self) -> bool {
        self.config.size > 2
    }
}

// ---------------------------------------------------------------------------
// Descriptor
// ---------------------------------------------------------------------------

/// A content-addressable descriptor used in both manifests and image indexes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Descriptor {
    #[serde(rename = "mediaType")]
    pub media_type: String,

    pub digest: String,

    pub size: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
}

impl Descriptor {
    pub fn new(media_type: impl Into<String>, digest: impl Into<String>, size: u64) -> Self {
        Self {
            media_type: media_type.into(),
            digest: digest.into(),
            size,
            platform: None,
        }
    }

    /// The first 16 characters of the digest (`sha256:` plus 9 hex chars),
    /// used as the display key for a layer.
    pub fn short_digest(&self) -> &str {
        short_digest(&self.digest)
    }

    pub fn is_empty_placeholder(&self) -> bool {
        self.media_type == MEDIA_TYPE_EMPTY
    }
}

/// Truncate a digest to its 16-character display form.
pub fn short_digest(digest: &str) -> &str {
    match digest.char_indices().nth(16) {
        Some((end, _)) => &digest[..end],
        None => digest,
    }
}

// ---------------------------------------------------------------------------
// Platform
// ---------------------------------------------------------------------------

/// Target platform for a manifest inside an image index.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Platform {
    pub architecture: String,
    pub os: String,
    #[serde(default)]
    pub variant: Option<String>,
}

// ---------------------------------------------------------------------------
// Image Index (fat manifest)
// ---------------------------------------------------------------------------

/// An OCI image index (application/vnd.oci.image.index.v1+json or
/// application/vnd.docker.distribution.manifest.list.v2+json).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageIndex {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,

    pub manifests: Vec<Descriptor>,
}

impl ImageIndex {
    /// Select the descriptor whose platform matches the given target.
    pub fn select_platform(&self, target: &PlatformKey) -> Result<&Descriptor> {
        self.manifests
            .iter()
            .find(|d| d.platform.as_ref().is_some_and(|p| target.matches(p)))
            .ok_or_else(|| {
                OciError::Manifest(format!("no manifest found for platform {}", target))
            })
    }
}

/// Either a single manifest or an index that still needs a platform pick.
#[derive(Debug)]
pub enum ManifestDocument {
    Manifest(OciManifest),
    Index(ImageIndex),
}

impl ManifestDocument {
    /// Peek at the document's media type (or shape) and deserialize it.
    pub fn from_slice(data: &[u8]) -> Result<Self> {
        let raw: serde_json::Value = serde_json::from_slice(data)
            .map_err(|e| OciError::Manifest(format!("failed to parse manifest: {}", e)))?;
        let media_type = raw.get("mediaType").and_then(|v| v.as_str()).unwrap_or("");

        if !media_type.is_empty()
            && !is_index_media_type(media_type)
            && !is_manifest_media_type(media_type)
        {
            return Err(OciError::Manifest(format!(
                "unsupported manifest media type {}",
                media_type
            )));
        }

        if is_index_media_type(media_type) || raw.get("manifests").is_some() {
            let idx: ImageIndex = serde_json::from_value(raw)
                .map_err(|e| OciError::Manifest(format!("failed to parse image index: {}", e)))?;
            Ok(ManifestDocument::Index(idx))
        } else {
            let m: OciManifest = serde_json::from_value(raw)
                .map_err(|e| OciError::Manifest(format!("failed to parse manifest: {}", e)))?;
            Ok(ManifestDocument::Manifest(m))
        }
    }
}

// ---------------------------------------------------------------------------
// Media type constants
// ---------------------------------------------------------------------------

pub const MEDIA_TYPE_OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const MEDIA_TYPE_OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_DOCKER_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
pub const MEDIA_TYPE_DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";

/// Placeholder layer/config with `{}` content.
pub const MEDIA_TYPE_EMPTY: &str = "application/vnd.oci.empty.v1+json";
/// Layer carrying the provider's `thin.provider.yaml`.
pub const MEDIA_TYPE_PROVIDER: &str = "application/vnd.sourceplane.provider.v1";
/// Layer carrying the provider's `assets/` tree.
pub const MEDIA_TYPE_ASSETS: &str = "application/vnd.sourceplane.assets.v1";
/// Prefix of per-platform binary layers; completed by `<os>-<arch>`.
pub const MEDIA_TYPE_BINARY_PREFIX: &str = "application/vnd.sourceplane.bin.";

/// Returns `true` when `media_type` is an image index / manifest list.
pub fn is_index_media_type(media_type: &str) -> bool {
    media_type == MEDIA_TYPE_OCI_INDEX || media_type == MEDIA_TYPE_DOCKER_MANIFEST_LIST
}

/// Returns `true` when `media_type` is a single image manifest.
pub fn is_manifest_media_type(media_type: &str) -> bool {
    media_type == MEDIA_TYPE_OCI_MANIFEST || media_type == MEDIA_TYPE_DOCKER_MANIFEST
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
