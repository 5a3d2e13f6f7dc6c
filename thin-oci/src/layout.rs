//! On-disk layout of an installed provider.
//!
//! ```text
//! <providers-root>/<name>/
//!     thin.provider.yaml
//!     bin/entrypoint            (or bin/<os>/<arch>/entrypoint)
//!     assets/...
//! ```
//!
//! Installs are extracted into a staging directory next to the final
//! location and moved into place by [`Staging::commit`].

use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::error::{OciError, Result};
use crate::platform::PlatformKey;
use crate::unpack::{self, MANIFEST_FILE};

pub const BIN_DIR: &str = "bin";
pub const ASSETS_DIR: &str = "assets";

/// Nested root some older artifacts bundled their content under.
pub const NESTED_ROOT_DIR: &str = "oci";

const ENTRYPOINT: &str = "entrypoint";
const ALTERNATE_BINARIES: [&str; 2] = ["thin", "provider"];

// ---------------------------------------------------------------------------
// InstallationRoot
// ---------------------------------------------------------------------------

/// The directory owned by one installed provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallationRoot {
    name: String,
    path: PathBuf,
}

impl InstallationRoot {
    /// `<providers_root>/<name>`.  The name must be a single path segment.
    pub fn new(providers_root: impl AsRef<Path>, name: &str) -> Result<Self> {
        let valid = !name.is_empty()
            && name != "."
            && name != ".."
            && !name.contains(['/', '\\'])
            && !name.starts_with('.');
        if !valid {
            return Err(OciError::InvalidName(name.to_string()));
        }
        Ok(Self {
            name: name.to_string(),
            path: providers_root.as_ref().join(name),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.path.join(MANIFEST_FILE)
    }

    pub fn is_installed(&self) -> bool {
        self.path.is_dir()
    }

    /// Locate the executable for `platform` in the installed tree.
    pub fn resolve_binary(&self, platform: &PlatformKey) -> Option<PathBuf> {
        resolve_binary(&self.path, platform)
    }

    /// Create an empty staging directory beside the installation root.
    pub fn stage(&self) -> Result<Staging> {
        let parent = self.parent_dir();
        fs::create_dir_all(parent)?;
        let dir = tempfile::Builder::new()
            .prefix(&format!(".{}.staging-", self.name))
            .tempdir_in(parent)?;
        debug!(staging = %dir.path().display(), "created staging directory");
        Ok(Staging {
            dir,
            target: self.path.clone(),
        })
    }

    fn parent_dir(&self) -> &Path {
        self.path.parent().unwrap_or_else(|| Path::new("."))
    }
}

// ---------------------------------------------------------------------------
// Staging
// ---------------------------------------------------------------------------

/// A half-built installation.  Dropping it without [`commit`](Self::commit)
/// removes everything written so far.
#[derive(Debug)]
pub struct Staging {
    dir: TempDir,
    target: PathBuf,
}

impl Staging {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Move the staged tree to the installation root, replacing any
    /// previous installation.  Returns the final path.
    pub fn commit(self) -> Result<PathBuf> {
        let parent = self.target.parent().unwrap_or_else(|| Path::new("."));

        // Park the previous install so it can be put back if the swap fails.
        let backup = if self.target.exists() {
            let holder = tempfile::Builder::new().prefix(".previous-").tempdir_in(parent)?;
            let parked = holder.path().join("install");
            fs::rename(&self.target, &parked)?;
            Some((holder, parked))
        } else {
            None
        };

        if let Err(e) = fs::rename(self.dir.path(), &self.target) {
            if let Some((_, parked)) = &backup {
                if let Err(restore) = fs::rename(parked, &self.target) {
                    warn!(error = %restore, "failed to restore previous installation");
                }
            }
            return Err(e.into());
        }

        info!(path = %self.target.display(), "installation committed");
        // `backup` and the emptied `dir` handle are dropped here; the former
        // deletes the previous install.
        Ok(self.target)
    }
}

// ---------------------------------------------------------------------------
// Finalization
// ---------------------------------------------------------------------------

/// What the finalizer found.  Paths are relative to the finalized root.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FinalizeReport {
    pub binary: Option<PathBuf>,
    pub manifest: Option<PathBuf>,
    pub hoisted: bool,
    pub warnings: Vec<String>,
}

/// Normalize the extracted tree at `root` and make the platform binary
/// executable.  A missing manifest or binary is reported as a warning.
pub fn finalize(root: &Path, platform: &PlatformKey) -> Result<FinalizeReport> {
    let mut report = FinalizeReport::default();

    for dir in [BIN_DIR, ASSETS_DIR] {
        fs::create_dir_all(root.join(dir))?;
    }

    let nested = root.join(NESTED_ROOT_DIR);
    if nested.is_dir() {
        for dir in [BIN_DIR, ASSETS_DIR] {
            let src = nested.join(dir);
            if src.is_dir() {
                copy_dir(&src, &root.join(dir))?;
            }
        }
        fs::remove_dir_all(&nested)?;
        report.hoisted = true;
        debug!(root = %root.display(), "hoisted nested {}/ directory", NESTED_ROOT_DIR);
    }

    let manifest = root.join(MANIFEST_FILE);
    if manifest.is_file() {
        report.manifest = Some(PathBuf::from(MANIFEST_FILE));
    } else {
        let msg = format!("provider manifest not found at {}", manifest.display());
        warn!("{}", msg);
        report.warnings.push(msg);
    }

    match resolve_binary(root, platform) {
        Some(binary) => {
            unpack::set_mode(&binary, 0o755)?;
            report.binary = binary.strip_prefix(root).ok().map(Path::to_path_buf);
        }
        None => {
            let msg = format!(
                "binary not found for platform {} (checked bin/{} and bin/{}/{}/{})",
                platform, ENTRYPOINT, platform.os, platform.arch, ENTRYPOINT
            );
            warn!("{}", msg);
            report.warnings.push(msg);
        }
    }

    Ok(report)
}

/// Candidate binary locations for `platform`, in lookup order.
pub fn binary_candidates(root: &Path, platform: &PlatformKey) -> Vec<PathBuf> {
    let flat = root.join(BIN_DIR);
    let nested = flat.join(&platform.os).join(&platform.arch);

    let mut candidates = Vec::with_capacity(6);
    for dir in [flat, nested] {
        candidates.push(dir.join(ENTRYPOINT));
        candidates.extend(ALTERNATE_BINARIES.iter().map(|name| dir.join(name)));
    }
    candidates
}

/// First existing file among [`binary_candidates`].
pub fn resolve_binary(root: &Path, platform: &PlatformKey) -> Option<PathBuf> {
    binary_candidates(root, platform)
        .into_iter()
        .find(|p| p.is_file())
}

/// Recursively copy `src` into `dst`, keeping permission bits.
fn copy_dir(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&from, &to)?;
        } else {
            if fs::symlink_metadata(&to).is_ok_and(|m| !m.is_dir()) {
                fs::remove_file(&to)?;
            }
            // fs::copy carries the permission bits over.
            fs::copy(&from, &to)?;
        }
    }
    Ok(())
}
