//! Layer classification for provider artifacts.
//!
//! A single pass over the manifest layers picks the provider manifest
//! layer, the assets layer and the binary layer for the current platform.
//! Artifacts published before binaries were split per platform have no
//! such binary layer; for those every non-placeholder layer is selected and
//! the extractor tells the pieces apart by sniffing their content.

use tracing::{debug, warn};

use crate::error::{OciError, Result};
use crate::manifest::{Descriptor, MEDIA_TYPE_ASSETS, MEDIA_TYPE_BINARY_PREFIX, MEDIA_TYPE_PROVIDER};
use crate::platform::PlatformKey;

/// The role a layer plays in a provider artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerRole {
    /// `{}` placeholder, never downloaded.
    Empty,
    Provider,
    Assets,
    /// Binary built for the platform being classified for.
    PlatformBinary,
    /// Binary built for some other platform.
    ForeignBinary,
    /// Anything else (examples, docs, ...).
    Auxiliary,
}

impl LayerRole {
    pub fn of(desc: &Descriptor, binary_media_type: &str) -> Self {
        let mt = desc.media_type.as_str();
        if desc.is_empty_placeholder() {
            LayerRole::Empty
        } else if mt == MEDIA_TYPE_PROVIDER {
            LayerRole::Provider
        } else if mt == MEDIA_TYPE_ASSETS {
            LayerRole::Assets
        } else if mt == binary_media_type {
            LayerRole::PlatformBinary
        } else if mt.starts_with(MEDIA_TYPE_BINARY_PREFIX) {
            LayerRole::ForeignBinary
        } else {
            LayerRole::Auxiliary
        }
    }
}

/// Outcome of classifying a manifest's layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub provider: Option<Descriptor>,
    pub assets: Option<Descriptor>,
    pub platform_binary: Option<Descriptor>,
    /// Layers to fetch, in the order they should be queued.
    pub download_set: Vec<Descriptor>,
    /// Layers that were seen but will not be fetched.
    pub skipped: Vec<Descriptor>,
    /// Set when the artifact predates per-platform binary layers.
    pub legacy_fallback: bool,
}

/// Pick the layers required on `platform`.
///
/// In the regular case `download_set` is `[provider, assets, binary]`
/// (whichever of provider/assets exist).  When no binary layer matches the
/// platform the result switches to legacy mode and `download_set` holds
/// every non-placeholder layer in manifest order.
///
/// Fails with [`OciError::MissingProviderContent`] when the manifest has
/// neither a provider nor an assets layer.
pub fn classify(layers: &[Descriptor], platform: &PlatformKey) -> Result<Classification> {
    let binary_media_type = platform.binary_media_type();

    let mut provider = None;
    let mut assets = None;
    let mut platform_binary = None;

    for desc in layers {
        let role = LayerRole::of(desc, &binary_media_type);
        let slot = match role {
            LayerRole::Provider => &mut provider,
            LayerRole::Assets => &mut assets,
            LayerRole::PlatformBinary => &mut platform_binary,
            LayerRole::ForeignBinary | LayerRole::Auxiliary | LayerRole::Empty => {
                debug!(digest = %desc.digest, media_type = %desc.media_type, ?role, "not selected");
                continue;
            }
        };
        if let Some(previous) = slot.replace(desc.clone()) {
            warn!(
                digest = %desc.digest,
                replaced = %previous.digest,
                media_type = %desc.media_type,
                "duplicate layer for role {:?}; keeping the last",
                role,
            );
        }
    }

    if provider.is_none() && assets.is_none() {
        return Err(OciError::MissingProviderContent);
    }

    let legacy_fallback = platform_binary.is_none();
    let download_set: Vec<Descriptor> = if legacy_fallback {
        warn!(
            %platform,
            "platform-specific binary layer not found; falling back to multi-platform layers",
        );
        layers
            .iter()
            .filter(|d| !d.is_empty_placeholder())
            .cloned()
            .collect()
    } else {
        [&provider, &assets, &platform_binary]
            .into_iter()
            .flatten()
            .cloned()
            .collect()
    };

    let skipped = layers
        .iter()
        .filter(|d| !d.is_empty_placeholder() && !download_set.contains(d))
        .cloned()
        .collect();

    Ok(Classification {
        provider,
        assets,
        platform_binary,
        download_set,
        skipped,
        legacy_fallback,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
