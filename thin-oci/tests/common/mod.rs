//! Shared fixtures for pipeline tests: an in-memory registry, a recording
//! progress reporter and tar/gzip payload builders.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use futures_util::{stream, StreamExt};
use sha2::{Digest, Sha256};

use thin_oci::manifest::{Descriptor, MEDIA_TYPE_EMPTY, MEDIA_TYPE_OCI_MANIFEST};
use thin_oci::reference::ImageRef;
use thin_oci::registry::{BlobStream, Registry};
use thin_oci::{OciError, ProgressReporter, Result};

const CHUNK: usize = 64 * 1024;

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Registry that serves manifests and blobs from memory.
#[derive(Default)]
pub struct MemoryRegistry {
    tags: HashMap<String, String>,
    manifests: HashMap<String, Vec<u8>>,
    blobs: HashMap<String, Vec<u8>>,
    failing: HashSet<String>,
    hanging: HashSet<String>,
    /// Set once a hanging transfer has been dropped.
    pub hang_dropped: Arc<AtomicBool>,
    fetched: Mutex<Vec<String>>,
}

pub fn digest_of(data: &[u8]) -> String {
    let hash = Sha256::digest(data);
    format!(
        "sha256:{}",
        hash.iter().map(|b| format!("{:02x}", b)).collect::<String>()
    )
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a blob and return its descriptor.
    pub fn add_blob(&mut self, media_type: &str, data: Vec<u8>) -> Descriptor {
        let desc = Descriptor::new(media_type, digest_of(&data), data.len() as u64);
        self.blobs.insert(desc.digest.clone(), data);
        desc
    }

    /// Publish a manifest under `tag` with the empty config placeholder.
    pub fn publish(&mut self, tag: &str, layers: &[Descriptor]) -> String {
        let config = self.add_blob(MEDIA_TYPE_EMPTY, b"{}".to_vec());
        self.publish_with_config(tag, layers, &config)
    }

    pub fn publish_with_config(
        &mut self,
        tag: &str,
        layers: &[Descriptor],
        config: &Descriptor,
    ) -> String {
        let manifest = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": MEDIA_TYPE_OCI_MANIFEST,
            "config": config,
            "layers": layers,
        });
        let body = serde_json::to_vec(&manifest).unwrap();
        let digest = digest_of(&body);
        self.manifests.insert(digest.clone(), body);
        self.tags.insert(tag.to_string(), digest.clone());
        digest
    }

    pub fn fail_blob(&mut self, desc: &Descriptor) {
        self.failing.insert(desc.digest.clone());
    }

    pub fn hang_blob(&mut self, desc: &Descriptor) {
        self.hanging.insert(desc.digest.clone());
    }

    /// Digests passed to `fetch_blob`, in call order.
    pub fn fetched(&self) -> Vec<String> {
        self.fetched.lock().unwrap().clone()
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn resolve(&self, image: &ImageRef) -> Result<Descriptor> {
        let digest = self
            .tags
            .get(&image.reference)
            .ok_or_else(|| OciError::NotFound(image.to_string()))?;
        let size = self.manifests[digest].len() as u64;
        Ok(Descriptor::new(MEDIA_TYPE_OCI_MANIFEST, digest.clone(), size))
    }

    async fn fetch_manifest(&self, _image: &ImageRef, digest: &str) -> Result<Vec<u8>> {
        self.manifests
            .get(digest)
            .cloned()
            .ok_or_else(|| OciError::NotFound(digest.to_string()))
    }

    async fn fetch_blob(&self, _image: &ImageRef, desc: &Descriptor) -> Result<BlobStream> {
        self.fetched.lock().unwrap().push(desc.digest.clone());

        if self.failing.contains(&desc.digest) {
            return Err(OciError::Registry(format!(
                "GET blob {} returned 500 Internal Server Error",
                desc.digest
            )));
        }
        if self.hanging.contains(&desc.digest) {
            let guard = DropFlag(Arc::clone(&self.hang_dropped));
            return Ok(Box::pin(stream::pending::<Result<Bytes>>().map(move |item| {
                let _ = &guard;
                item
            })));
        }

        let data = self
            .blobs
            .get(&desc.digest)
            .ok_or_else(|| OciError::NotFound(desc.digest.clone()))?;
        let chunks: Vec<Result<Bytes>> = data
            .chunks(CHUNK)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        Ok(Box::pin(stream::iter(chunks)))
    }
}

// ---------------------------------------------------------------------------
// Reporter
// ---------------------------------------------------------------------------

/// Reporter that records every event as `"<event> <digest>"`.
#[derive(Default)]
pub struct RecordingReporter {
    events: Mutex<Vec<String>>,
    bytes: Mutex<HashMap<String, Vec<u64>>>,
    shutdowns: AtomicUsize,
}

impl RecordingReporter {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn events_for(&self, digest: &str) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| {
                let (event, d) = e.split_once(' ')?;
                (d == digest).then(|| event.to_string())
            })
            .collect()
    }

    pub fn bytes_for(&self, digest: &str) -> Vec<u64> {
        self.bytes
            .lock()
            .unwrap()
            .get(digest)
            .cloned()
            .unwrap_or_default()
    }

    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }

    fn push(&self, event: &str, desc: &Descriptor) {
        self.events
            .lock()
            .unwrap()
            .push(format!("{} {}", event, desc.digest));
    }
}

impl ProgressReporter for RecordingReporter {
    fn download_started(&self, desc: &Descriptor) {
        self.push("started", desc);
    }

    fn download_finished(&self, desc: &Descriptor) {
        self.push("downloaded", desc);
    }

    fn processing_started(&self, desc: &Descriptor) {
        self.push("processing", desc);
    }

    fn extraction_finished(&self, desc: &Descriptor) {
        self.push("extracted", desc);
    }

    fn skipped(&self, desc: &Descriptor) {
        self.push("skipped", desc);
    }

    fn bytes_read(&self, digest: &str, total: u64) {
        self.bytes
            .lock()
            .unwrap()
            .entry(digest.to_string())
            .or_default()
            .push(total);
    }

    fn shutdown(&self) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// Build a gzip-compressed tar from `(path, contents, mode)` entries.
pub fn tar_gz(entries: &[(&str, &[u8], u32)]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, data, mode) in entries {
        let mut header = tar::Header::new_ustar();
        header.set_path(path).unwrap();
        header.set_size(data.len() as u64);
        header.set_mode(*mode);
        header.set_cksum();
        builder.append(&header, *data).unwrap();
    }
    let tar = builder.into_inner().unwrap();
    let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
    encoder.write_all(&tar).unwrap();
    encoder.finish().unwrap()
}

/// A raw executable payload above the large-binary threshold.
pub fn raw_binary(seed: u8, len: usize) -> Vec<u8> {
    let mut data: Vec<u8> = (0..len).map(|i| (i as u8).wrapping_mul(31) ^ seed).collect();
    // Mach-O-ish magic: not gzip, not printable.
    data[..4].copy_from_slice(&[0xcf, 0xfa, 0xed, seed]);
    data
}

pub const PROVIDER_YAML: &str = "apiVersion: thin.io/v1\nkind: Provider\nmetadata:\n  name: lite-ci\n";

// ---------------------------------------------------------------------------
// Filesystem
// ---------------------------------------------------------------------------

#[cfg(unix)]
pub fn mode_of(path: &Path) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path).unwrap().permissions().mode() & 0o7777
}

/// Every file below `root` with its mode and contents, sorted by path.
pub fn snapshot(root: &Path) -> Vec<(PathBuf, u32, Vec<u8>)> {
    fn walk(dir: &Path, root: &Path, out: &mut Vec<(PathBuf, u32, Vec<u8>)>) {
        for entry in fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                walk(&path, root, out);
            } else {
                #[cfg(unix)]
                let mode = mode_of(&path);
                #[cfg(not(unix))]
                let mode = 0;
                out.push((
                    path.strip_prefix(root).unwrap().to_path_buf(),
                    mode,
                    fs::read(&path).unwrap(),
                ));
            }
        }
    }
    let mut out = Vec::new();
    walk(root, root, &mut out);
    out.sort();
    out
}

/// Entry names directly below `dir`, sorted.
pub fn list_dir(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .map(|rd| {
            rd.map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}
