pub mod classify;
pub mod error;
pub mod layer;
pub mod layout;
pub mod manifest;
pub mod platform;
pub mod progress;
pub mod reference;
pub mod registry;
pub mod resolve;
pub mod schedule;
pub mod unpack;

pub use error::{OciError, Result};
pub use layout::InstallationRoot;
pub use platform::PlatformKey;
pub use progress::{reporter_for, ProgressMode, ProgressReporter};
pub use registry::{Registry, RegistryClient};

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::StreamExt;
use tracing::{info, warn};

use crate::manifest::Descriptor;
use crate::reference::ImageRef;
use crate::schedule::DownloadScheduler;
use crate::unpack::PayloadKind;

/// Provider artifact puller -- resolves, downloads and installs a provider
/// into its installation root.
pub struct ProviderPuller {
    registry: Arc<dyn Registry>,
    reporter: Arc<dyn ProgressReporter>,
    platform: PlatformKey,
    default_registry: String,
    workers: usize,
}

/// Summary of a completed install.
#[derive(Debug, Clone)]
pub struct InstallReport {
    /// Normalized locator that was pulled.
    pub reference: String,
    /// Digest of the manifest that was installed.
    pub digest: String,
    pub root: PathBuf,
    /// Platform binary, if one could be resolved.
    pub binary: Option<PathBuf>,
    pub manifest: Option<PathBuf>,
    pub legacy_fallback: bool,
    /// Downloaded layers, in the order they were extracted.
    pub layers: Vec<Descriptor>,
    pub skipped: Vec<Descriptor>,
    /// Non-fatal problems found while installing.
    pub warnings: Vec<String>,
}

impl ProviderPuller {
    /// Create a puller for the host platform using `docker.io` as the
    /// default registry.
    pub fn new(registry: Arc<dyn Registry>, reporter: Arc<dyn ProgressReporter>) -> Self {
        Self {
            registry,
            reporter,
            platform: PlatformKey::host(),
            default_registry: reference::DEFAULT_REGISTRY.to_string(),
            workers: schedule::DOWNLOAD_WORKERS,
        }
    }

    pub fn with_platform(mut self, platform: PlatformKey) -> Self {
        self.platform = platform;
        self
    }

    pub fn with_default_registry(mut self, registry: impl Into<String>) -> Self {
        self.default_registry = registry.into();
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn platform(&self) -> &PlatformKey {
        &self.platform
    }

    /// Pull `image_ref` and install it at `root`.
    ///
    /// Nothing under `root` changes unless every layer was fetched and
    /// extracted; a previous installation is replaced only on success.  The
    /// reporter is shut down before returning, whatever the outcome.
    pub async fn pull(&self, image_ref: &str, root: &InstallationRoot) -> Result<InstallReport> {
        let result = self.install(image_ref, root).await;
        self.reporter.shutdown();
        result
    }

    async fn install(&self, image_ref: &str, root: &InstallationRoot) -> Result<InstallReport> {
        // 1. Normalize and resolve.
        let normalized = reference::normalize(image_ref, &self.default_registry);
        info!(provider = root.name(), reference = %normalized, "pulling provider");
        let resolved =
            resolve::resolve_manifest(self.registry.as_ref(), &normalized, &self.platform).await?;

        // 2. Decide what to fetch.
        let plan = classify::classify(&resolved.manifest.layers, &self.platform)?;
        if plan.legacy_fallback {
            info!(platform = %self.platform, "using legacy multi-platform layers");
        }
        for desc in &plan.skipped {
            self.reporter.skipped(desc);
        }

        // 3. Fetch and extract into a staging directory.
        let staging = root.stage()?;
        let staging_path = staging.path().to_path_buf();
        let scheduler = DownloadScheduler::new(Arc::clone(&self.registry), Arc::clone(&self.reporter))
            .with_workers(self.workers);
        let layers = scheduler
            .run(&resolved.image, plan.download_set.clone(), |layer| {
                let dest = staging_path.clone();
                async move { extract_in_background(layer.data, dest).await.map(|_| ()) }
            })
            .await?;

        let mut warnings = Vec::new();
        if resolved.manifest.has_config_payload() {
            if let Err(e) = self
                .apply_config(&resolved.image, &resolved.manifest.config, &staging_path)
                .await
            {
                let msg = format!("failed to process config blob: {}", e);
                warn!("{}", msg);
                warnings.push(msg);
            }
        }

        // 4. Normalize the tree, then swap it into place.
        let platform = self.platform.clone();
        let finalize_root = staging_path.clone();
        let report =
            tokio::task::spawn_blocking(move || layout::finalize(&finalize_root, &platform))
                .await
                .map_err(|e| OciError::Extract(format!("finalize task failed: {}", e)))??;
        warnings.extend(report.warnings);

        let installed = staging.commit()?;
        info!(provider = root.name(), path = %installed.display(), "provider installed");

        Ok(InstallReport {
            reference: normalized,
            digest: resolved.digest,
            binary: report.binary.map(|p| installed.join(p)),
            manifest: report.manifest.map(|p| installed.join(p)),
            root: installed,
            legacy_fallback: plan.legacy_fallback,
            layers,
            skipped: plan.skipped,
            warnings,
        })
    }

    /// Fetch the manifest's config blob and extract it like a layer.
    async fn apply_config(&self, image: &ImageRef, config: &Descriptor, dest: &Path) -> Result<()> {
        let mut stream = self.registry.fetch_blob(image, config).await?;
        let mut data = Vec::new();
        while let Some(chunk) = stream.next().await {
            data.extend_from_slice(&chunk?);
        }
        let kind = extract_in_background(data, dest.to_path_buf()).await?;
        info!(digest = %config.digest, ?kind, "processed config blob");
        Ok(())
    }
}

/// Extraction is CPU- and disk-bound; run it on the blocking pool.
async fn extract_in_background(data: Vec<u8>, dest: PathBuf) -> Result<PayloadKind> {
    tokio::task::spawn_blocking(move || unpack::extract_layer(&data, &dest))
        .await
        .map_err(|e| OciError::Extract(format!("extraction task failed: {}", e)))?
}
