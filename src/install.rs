use std::path::PathBuf;
use std::sync::Arc;

use thin_oci::{
    reporter_for, InstallReport, PlatformKey, ProgressMode, ProgressReporter, ProviderPuller,
    Registry, RegistryClient,
};
use tracing::info;

use crate::config::Config;
use crate::error::{Error, Result};

/// Install `image_ref` as provider `name` using the HTTP registry client and
/// the progress presentation selected by `progress`.
pub async fn install_provider(
    config: &Config,
    name: &str,
    image_ref: &str,
    progress: ProgressMode,
) -> Result<InstallReport> {
    let registry: Arc<dyn Registry> = Arc::new(RegistryClient::new()?);
    install_with(config, name, image_ref, registry, reporter_for(progress)).await
}

/// Install with explicit collaborators.
pub async fn install_with(
    config: &Config,
    name: &str,
    image_ref: &str,
    registry: Arc<dyn Registry>,
    reporter: Arc<dyn ProgressReporter>,
) -> Result<InstallReport> {
    let root = config.installation_root(name)?;
    let puller = ProviderPuller::new(registry, reporter)
        .with_default_registry(config.settings.default_registry.clone());
    info!(provider = name, image = image_ref, "installing provider");
    Ok(puller.pull(image_ref, &root).await?)
}

/// Path of the runnable binary of an installed provider on this host.
pub fn provider_binary(config: &Config, name: &str) -> Result<PathBuf> {
    let root = config.installation_root(name)?;
    if !root.is_installed() {
        return Err(Error::Provider(format!("provider {} is not installed", name)));
    }
    let platform = PlatformKey::host();
    root.resolve_binary(&platform).ok_or_else(|| {
        Error::Provider(format!(
            "provider {} has no binary for platform {}",
            name, platform
        ))
    })
}
