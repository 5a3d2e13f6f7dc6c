use tracing::{debug, info};

use crate::error::{OciError, Result};
use crate::manifest::{ManifestDocument, OciManifest};
use crate::platform::PlatformKey;
use crate::reference::{tag_of, ImageRef};
use crate::registry::Registry;

/// A manifest resolved from a normalized locator.
#[derive(Debug, Clone)]
pub struct ResolvedManifest {
    pub image: ImageRef,
    /// Digest of the manifest that was finally parsed.  For an image index
    /// this is the digest of the selected platform manifest.
    pub digest: String,
    pub manifest: OciManifest,
}

/// Resolve `normalized` to a digest, fetch the manifest and parse it.
///
/// Resolution failures are wrapped in [`OciError::Resolve`] so the caller
/// sees which tag was tried along with the credentials hint.  A manifest
/// that cannot be parsed is reported as [`OciError::Manifest`].
pub async fn resolve_manifest(
    registry: &dyn Registry,
    normalized: &str,
    platform: &PlatformKey,
) -> Result<ResolvedManifest> {
    let image = ImageRef::parse(normalized)?;
    let tag = tag_of(normalized);
    let resolve_error = |source: OciError| OciError::Resolve {
        reference: normalized.to_string(),
        tag: tag.to_string(),
        source: Box::new(source),
    };

    info!(
        registry = %image.registry,
        repository = %image.repository,
        reference = %image.reference,
        "resolving artifact",
    );
    let top = registry.resolve(&image).await.map_err(resolve_error)?;
    let bytes = registry
        .fetch_manifest(&image, &top.digest)
        .await
        .map_err(resolve_error)?;

    let (digest, manifest) = match ManifestDocument::from_slice(&bytes)? {
        ManifestDocument::Manifest(m) => (top.digest, m),
        ManifestDocument::Index(index) => {
            let entry = index.select_platform(platform)?;
            debug!(digest = %entry.digest, %platform, "selected manifest from index");
            let bytes = registry
                .fetch_manifest(&image, &entry.digest)
                .await
                .map_err(resolve_error)?;
            (entry.digest.clone(), OciManifest::from_slice(&bytes)?)
        }
    };

    debug!(%digest, layers = manifest.layers.len(), "manifest parsed");
    Ok(ResolvedManifest {
        image,
        digest,
        manifest,
    })
}
