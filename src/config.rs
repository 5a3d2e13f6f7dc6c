//! Home directory and settings resolution.
//!
//! Everything here is resolved once at startup and passed down as plain
//! values; the pull pipeline never reads the environment itself.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thin_oci::reference::DEFAULT_REGISTRY;
use thin_oci::{InstallationRoot, ProgressMode};
use tracing::debug;

use crate::error::{Error, Result};

/// Environment variable that overrides the home directory.
pub const HOME_ENV: &str = "THIN_HOME";

const HOME_DIR_NAME: &str = ".thin";
const SETTINGS_FILE: &str = "config.yaml";
const PROVIDERS_DIR: &str = "providers";

/// Optional `<home>/config.yaml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Registry host used for locators without one.
    pub default_registry: String,
    pub progress: ProgressMode,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default_registry: DEFAULT_REGISTRY.to_string(),
            progress: ProgressMode::Auto,
        }
    }
}

/// Resolved configuration for one invocation.
#[derive(Debug, Clone)]
pub struct Config {
    pub home: PathBuf,
    pub settings: Settings,
}

impl Config {
    /// Load settings from `home`, falling back to defaults when the file is
    /// absent.
    pub fn load(home: PathBuf) -> Result<Self> {
        let path = home.join(SETTINGS_FILE);
        let settings = if path.is_file() {
            let raw = fs::read_to_string(&path).map_err(|e| {
                Error::Config(format!("failed to read {}: {}", path.display(), e))
            })?;
            parse_settings(&raw)
                .map_err(|e| Error::Config(format!("invalid settings {}: {}", path.display(), e)))?
        } else {
            Settings::default()
        };
        debug!(home = %home.display(), ?settings, "configuration loaded");
        Ok(Self { home, settings })
    }

    pub fn providers_root(&self) -> PathBuf {
        self.home.join(PROVIDERS_DIR)
    }

    pub fn installation_root(&self, name: &str) -> Result<InstallationRoot> {
        Ok(InstallationRoot::new(self.providers_root(), name)?)
    }

    /// Names of installed providers, sorted.  Staging leftovers and other
    /// hidden entries are not listed.
    pub fn installed_providers(&self) -> Result<Vec<String>> {
        let root = self.providers_root();
        if !root.is_dir() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in fs::read_dir(&root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if !name.starts_with('.') {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

fn parse_settings(raw: &str) -> std::result::Result<Settings, serde_yaml::Error> {
    if raw.trim().is_empty() {
        return Ok(Settings::default());
    }
    serde_yaml::from_str(raw)
}

/// Resolve the home directory for the current process.
///
/// `explicit` (from `--home` or `THIN_HOME`) wins; otherwise a `.thin`
/// directory in the working directory; otherwise `~/.thin`.
pub fn resolve_home(explicit: Option<PathBuf>) -> Result<PathBuf> {
    let explicit = explicit.or_else(|| std::env::var_os(HOME_ENV).map(PathBuf::from));
    let cwd = std::env::current_dir()?;
    resolve_home_from(explicit.as_deref(), &cwd, dirs::home_dir())
}

/// [`resolve_home`] without any process state.
pub fn resolve_home_from(
    explicit: Option<&Path>,
    cwd: &Path,
    user_home: Option<PathBuf>,
) -> Result<PathBuf> {
    if let Some(dir) = explicit.filter(|p| !p.as_os_str().is_empty()) {
        return Ok(dir.to_path_buf());
    }
    let local = cwd.join(HOME_DIR_NAME);
    if local.is_dir() {
        return Ok(local);
    }
    user_home
        .map(|home| home.join(HOME_DIR_NAME))
        .ok_or_else(|| {
            Error::Config(format!(
                "cannot determine home directory; set {}",
                HOME_ENV
            ))
        })
}
