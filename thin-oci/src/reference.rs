use std::fmt;

use crate::error::{OciError, Result};

/// Registry host prepended to locators that carry no host/repository part.
pub const DEFAULT_REGISTRY: &str = "docker.io";

/// Tag appended to locators that carry no tag or digest.
pub const DEFAULT_TAG: &str = "latest";

/// The API host that serves `docker.io` repositories.
const DOCKER_HUB_API: &str = "registry-1.docker.io";

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

/// Canonicalize a user-supplied locator.
///
/// A locator without any `/` gets `default_registry` prepended; a locator
/// without a tag (or digest) after its last path segment gets `:latest`
/// appended.  No network access and no validation of the repository.
pub fn normalize(raw: &str, default_registry: &str) -> String {
    let raw = raw.trim();
    let mut normalized = if raw.contains('/') {
        raw.to_string()
    } else {
        format!("{}/{}", default_registry, raw)
    };
    if tag_separator(&normalized).is_none() && !normalized.contains('@') {
        normalized.push(':');
        normalized.push_str(DEFAULT_TAG);
    }
    normalized
}

/// Extract the tag or digest a normalized locator points at.
///
/// Only the trailing segment is considered so that a registry port
/// (`localhost:5000/repo`) is never mistaken for a tag.
pub fn tag_of(normalized: &str) -> &str {
    if let Some(at) = normalized.find('@') {
        return &normalized[at + 1..];
    }
    match tag_separator(normalized) {
        Some(colon) => &normalized[colon + 1..],
        None => DEFAULT_TAG,
    }
}

/// Position of the `:` that separates the tag, if it follows the last `/`.
fn tag_separator(locator: &str) -> Option<usize> {
    let colon = locator.rfind(':')?;
    let after_last_slash = locator.rfind('/').map(|p| p + 1).unwrap_or(0);
    (colon > after_last_slash).then_some(colon)
}

// ---------------------------------------------------------------------------
// ImageRef
// ---------------------------------------------------------------------------

/// A parsed OCI image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    /// Registry API host (e.g. "ghcr.io" or "localhost:5000").
    pub registry: String,
    /// Repository path (e.g. "sourceplane/lite-ci").
    pub repository: String,
    /// Tag or digest reference (e.g. "v0.1.2" or "sha256:abc123").
    pub reference: String,
}

impl ImageRef {
    /// Parse a raw image reference string.
    ///
    /// Supported formats:
    /// - `alpine:latest`
    /// - `ubuntu`
    /// - `ghcr.io/foo/bar:v1`
    /// - `my.registry.io/org/repo@sha256:abc123`
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(OciError::Registry("empty image reference".to_string()));
        }

        let (name_part, reference) = if let Some(at_pos) = raw.find('@') {
            (&raw[..at_pos], raw[at_pos + 1..].to_string())
        } else if let Some(colon_pos) = tag_separator(raw) {
            (&raw[..colon_pos], raw[colon_pos + 1..].to_string())
        } else {
            (raw, DEFAULT_TAG.to_string())
        };

        if name_part.is_empty() || reference.is_empty() {
            return Err(OciError::Registry(format!(
                "invalid image reference: {}",
                raw
            )));
        }

        // A leading component is a registry host when it contains a dot or
        // a port, or is `localhost`.
        let (registry, repository) = match name_part.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (first.to_string(), rest.to_string())
            }
            _ => (DEFAULT_REGISTRY.to_string(), name_part.to_string()),
        };

        let registry = if registry == DEFAULT_REGISTRY {
            DOCKER_HUB_API.to_string()
        } else {
            registry
        };

        // Docker Hub official images live under "library/".
        let repository = if registry == DOCKER_HUB_API && !repository.contains('/') {
            format!("library/{}", repository)
        } else {
            repository
        };

        Ok(Self {
            registry,
            repository,
            reference,
        })
    }

    /// Whether the reference already pins a content digest.
    pub fn is_digest(&self) -> bool {
        self.reference.contains(':')
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sep = if self.is_digest() { '@' } else { ':' };
        write!(f, "{}/{}{}{}", self.registry, self.repository, sep, self.reference)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
