use crate::error::{OciError, Result};
use flate2::read::GzDecoder;
use std::fs;
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};
use tar::Archive;
use tracing::{debug, info};

/// Payloads larger than this that are neither gzip nor tar are taken to be
/// a bare executable.
pub const LARGE_BINARY_THRESHOLD: usize = 4_000_000;

/// Top-level file that receives text payloads.
pub const MANIFEST_FILE: &str = "thin.provider.yaml";

/// Gzip magic bytes (1f 8b).
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Zstandard frame magic (28 b5 2f fd).
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

/// `ustar` signature and its offset inside the first tar header block.
const TAR_MAGIC: &[u8] = b"ustar";
const TAR_MAGIC_OFFSET: usize = 257;
const TAR_BLOCK: usize = 512;

// ---------------------------------------------------------------------------
// Sniffing
// ---------------------------------------------------------------------------

/// How a layer payload will be handled, decided from its bytes alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Gzip,
    Zstd,
    Tar,
    /// Unwrapped executable, written to `bin/entrypoint`.
    RawBinary,
    /// Text manifest, written to [`MANIFEST_FILE`].
    Text,
    /// No recognised structure; dropped.
    Unknown,
}

/// Classify a payload.  Media types are not consulted: legacy artifacts
/// carry none that can be trusted.
pub fn sniff(data: &[u8]) -> PayloadKind {
    if data.starts_with(&GZIP_MAGIC) {
        PayloadKind::Gzip
    } else if data.starts_with(&ZSTD_MAGIC) {
        PayloadKind::Zstd
    } else if is_tar(data) {
        PayloadKind::Tar
    } else if data.len() > LARGE_BINARY_THRESHOLD {
        PayloadKind::RawBinary
    } else if data.first().is_some_and(|b| (32..127).contains(b)) {
        PayloadKind::Text
    } else {
        PayloadKind::Unknown
    }
}

/// Returns `true` when `data` starts with a tar header block.
pub fn is_tar(data: &[u8]) -> bool {
    data.len() >= TAR_BLOCK
        && &data[TAR_MAGIC_OFFSET..TAR_MAGIC_OFFSET + TAR_MAGIC.len()] == TAR_MAGIC
}

/// Path of the flat entrypoint binary inside an installation root.
pub fn entrypoint_path(root: &Path) -> PathBuf {
    root.join("bin").join("entrypoint")
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Extract one layer payload into `root` and report how it was handled.
///
/// Re-extracting the same bytes over an earlier result yields the same
/// files with the same permissions.
pub fn extract_layer(data: &[u8], root: &Path) -> Result<PayloadKind> {
    let kind = sniff(data);
    debug!(?kind, size = data.len(), root = %root.display(), "extracting payload");

    match kind {
        PayloadKind::Gzip => {
            let mut tar_bytes = Vec::new();
            GzDecoder::new(data)
                .read_to_end(&mut tar_bytes)
                .map_err(|e| OciError::Extract(format!("gzip decode: {}", e)))?;
            unpack_tar_bytes(&tar_bytes, root)?;
        }
        PayloadKind::Zstd => {
            let tar_bytes = zstd::stream::decode_all(data)
                .map_err(|e| OciError::Extract(format!("zstd decode: {}", e)))?;
            unpack_tar_bytes(&tar_bytes, root)?;
        }
        PayloadKind::Tar => unpack_tar(data, root)?,
        PayloadKind::RawBinary => {
            let path = entrypoint_path(root);
            write_file(&path, data, 0o755)?;
            info!(path = %path.display(), size = data.len(), "wrote raw binary");
        }
        PayloadKind::Text => {
            let path = root.join(MANIFEST_FILE);
            write_file(&path, data, 0o644)?;
            info!(path = %path.display(), "wrote provider manifest");
        }
        PayloadKind::Unknown => {
            debug!(size = data.len(), "unrecognised payload; skipping");
        }
    }

    Ok(kind)
}

// ---------------------------------------------------------------------------
// Tar extraction
// ---------------------------------------------------------------------------

fn unpack_tar_bytes(data: &[u8], root: &Path) -> Result<()> {
    if !is_tar(data) {
        return Err(OciError::Extract(
            "compressed payload is not a tar archive".to_string(),
        ));
    }
    unpack_tar(data, root)
}

/// Walk the archive: directories are created, regular files are written
/// with the mode recorded in their header.  Other entry types are ignored.
fn unpack_tar<R: Read>(reader: R, root: &Path) -> Result<()> {
    let mut archive = Archive::new(reader);
    let entries = archive.entries().map_err(tar_error)?;

    for entry_result in entries {
        let mut entry = entry_result.map_err(tar_error)?;
        let raw_path = entry.path().map_err(tar_error)?.into_owned();
        let rel_path = sanitize(&raw_path)?;
        if rel_path.as_os_str().is_empty() {
            continue;
        }
        let target = root.join(&rel_path);
        let entry_type = entry.header().entry_type();

        if entry_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if entry_type.is_file() {
            let mode = entry.header().mode().map_err(tar_error)?;
            prepare_target(&target)?;
            let mut file = fs::File::create(&target)?;
            io::copy(&mut entry, &mut file)?;
            drop(file);
            set_mode(&target, mode & 0o7777)?;
        } else {
            debug!(path = %rel_path.display(), ?entry_type, "skipping tar entry");
        }
    }

    Ok(())
}

fn tar_error(e: io::Error) -> OciError {
    OciError::Extract(format!("failed to read tar archive: {}", e))
}

/// Reduce an archive path to a relative path below the extraction root.
fn sanitize(path: &Path) -> Result<PathBuf> {
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(OciError::Extract(format!(
                    "unsafe path in archive: {}",
                    path.display()
                )));
            }
        }
    }
    Ok(clean)
}

// ---------------------------------------------------------------------------
// File helpers
// ---------------------------------------------------------------------------

/// Create parent directories and clear a previous file at `path`, which may
/// be read-only from an earlier extraction.
fn prepare_target(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    match fs::symlink_metadata(path) {
        Ok(meta) if !meta.is_dir() => fs::remove_file(path)?,
        _ => {}
    }
    Ok(())
}

fn write_file(path: &Path, data: &[u8], mode: u32) -> Result<()> {
    prepare_target(path)?;
    fs::write(path, data)?;
    set_mode(path, mode)
}

#[cfg(unix)]
pub(crate) fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
pub(crate) fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
