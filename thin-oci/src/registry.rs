use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, WWW_AUTHENTICATE};
use reqwest::{Response, StatusCode};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{OciError, Result};
use crate::manifest::{
    Descriptor, MEDIA_TYPE_DOCKER_MANIFEST, MEDIA_TYPE_DOCKER_MANIFEST_LIST, MEDIA_TYPE_OCI_INDEX,
    MEDIA_TYPE_OCI_MANIFEST,
};
use crate::reference::ImageRef;

/// A blob transfer: chunks in arrival order, ending after the last byte.
pub type BlobStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

// ---------------------------------------------------------------------------
// Registry capability
// ---------------------------------------------------------------------------

/// Content-addressable storage the pull pipeline reads from.
///
/// Authentication and transport are the implementation's business; the
/// pipeline only decides what to fetch and what to do with the bytes.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Resolve the tag (or digest) of `image` to the manifest descriptor.
    async fn resolve(&self, image: &ImageRef) -> Result<Descriptor>;

    /// Fetch the raw manifest document stored under `digest`.
    async fn fetch_manifest(&self, image: &ImageRef, digest: &str) -> Result<Vec<u8>>;

    /// Open a streaming transfer of the blob described by `desc`.
    async fn fetch_blob(&self, image: &ImageRef, desc: &Descriptor) -> Result<BlobStream>;
}

// ---------------------------------------------------------------------------
// RegistryClient
// ---------------------------------------------------------------------------

/// OCI Distribution HTTP client with the anonymous bearer-token flow.
pub struct RegistryClient {
    client: reqwest::Client,
}

/// Return the base URL scheme for a registry host.
/// Localhost and loopback registries default to HTTP; everything else to HTTPS.
fn registry_scheme(registry: &str) -> &'static str {
    let host = registry.split(':').next().unwrap_or(registry);
    if host == "localhost" || host == "127.0.0.1" || host == "::1" {
        "http"
    } else {
        "https"
    }
}

fn manifest_accept() -> String {
    [
        MEDIA_TYPE_OCI_MANIFEST,
        MEDIA_TYPE_DOCKER_MANIFEST,
        MEDIA_TYPE_OCI_INDEX,
        MEDIA_TYPE_DOCKER_MANIFEST_LIST,
    ]
    .join(", ")
}

impl RegistryClient {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("thin/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }

    fn url(image_ref: &ImageRef, kind: &str, reference: &str) -> String {
        format!(
            "{}://{}/v2/{}/{}/{}",
            registry_scheme(&image_ref.registry),
            image_ref.registry,
            image_ref.repository,
            kind,
            reference,
        )
    }

    // -- internals ----------------------------------------------------------

    /// Perform a GET with anonymous-then-bearer-token auth flow and return
    /// the successful response.
    async fn authenticated_get(
        &self,
        url: &str,
        image_ref: &ImageRef,
        accept: Option<&str>,
    ) -> Result<Response> {
        let mut req = self.client.get(url);
        if let Some(a) = accept {
            req = req.header(ACCEPT, a);
        }

        let resp = req.send().await?;
        if resp.status() != StatusCode::UNAUTHORIZED {
            return check_status(url, resp).await;
        }

        let www_auth = resp
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        let token = self.fetch_bearer_token(&www_auth, image_ref).await?;

        let mut retry = self
            .client
            .get(url)
            .header(AUTHORIZATION, format!("Bearer {}", token));
        if let Some(a) = accept {
            retry = retry.header(ACCEPT, a);
        }
        check_status(url, retry.send().await?).await
    }

    /// Parse a `www-authenticate: Bearer realm="…",service="…",scope="…"`
    /// header and fetch an anonymous token.
    async fn fetch_bearer_token(&self, www_auth: &str, image_ref: &ImageRef) -> Result<String> {
        let realm = extract_param(www_auth, "realm").unwrap_or_default();
        let service = extract_param(www_auth, "service").unwrap_or_default();
        let scope = extract_param(www_auth, "scope")
            .unwrap_or_else(|| format!("repository:{}:pull", image_ref.repository));

        if realm.is_empty() {
            return Err(OciError::Unauthorized(
                "www-authenticate header missing realm".to_string(),
            ));
        }

        let token_url = format!("{}?service={}&scope={}", realm, service, scope);
        debug!(%token_url, "fetching bearer token");

        let resp = self.client.get(&token_url).send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(OciError::Unauthorized(format!(
                "token endpoint returned {}: {}",
                status, body
            )));
        }

        let body: serde_json::Value = resp.json().await?;
        let token = body
            .get("token")
            .or_else(|| body.get("access_token"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                OciError::Unauthorized("token response missing token field".to_string())
            })?;

        Ok(token.to_string())
    }
}

#[async_trait]
impl Registry for RegistryClient {
    async fn resolve(&self, image: &ImageRef) -> Result<Descriptor> {
        let url = Self::url(image, "manifests", &image.reference);
        let accept = manifest_accept();
        let resp = self.authenticated_get(&url, image, Some(&accept)).await?;

        let header_digest = resp
            .headers()
            .get("docker-content-digest")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_string());

        let body = resp.bytes().await?;
        let digest = match header_digest {
            Some(d) => d,
            None if image.is_digest() => image.reference.clone(),
            None => format!("sha256:{}", hex_digest(&body)),
        };
        let media_type = content_type
            .filter(|t| !t.is_empty() && t != "application/json")
            .or_else(|| peek_media_type(&body))
            .unwrap_or_else(|| MEDIA_TYPE_OCI_MANIFEST.to_string());

        debug!(%digest, %media_type, "resolved manifest");
        Ok(Descriptor::new(media_type, digest, body.len() as u64))
    }

    async fn fetch_manifest(&self, image: &ImageRef, digest: &str) -> Result<Vec<u8>> {
        let url = Self::url(image, "manifests", digest);
        let accept = manifest_accept();
        let resp = self.authenticated_get(&url, image, Some(&accept)).await?;
        Ok(resp.bytes().await?.to_vec())
    }

    async fn fetch_blob(&self, image: &ImageRef, desc: &Descriptor) -> Result<BlobStream> {
        let url = Self::url(image, "blobs", &desc.digest);
        let resp = self.authenticated_get(&url, image, None).await?;
        let inner: BlobStream = Box::pin(resp.bytes_stream().map(|r| r.map_err(OciError::from)));
        Ok(Box::pin(DigestVerifier::new(inner, &desc.digest)))
    }
}

/// Map a non-success response onto the error taxonomy.
async fn check_status(url: &str, resp: Response) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    match status {
        StatusCode::NOT_FOUND => Err(OciError::NotFound(url.to_string())),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(OciError::Unauthorized(format!(
            "GET {} returned {}",
            url, status
        ))),
        _ => Err(OciError::Registry(format!(
            "GET {} returned {}: {}",
            url, status, body
        ))),
    }
}

fn peek_media_type(body: &[u8]) -> Option<String> {
    let raw: serde_json::Value = serde_json::from_slice(body).ok()?;
    raw.get("mediaType")
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

// ---------------------------------------------------------------------------
// Digest verification
// ---------------------------------------------------------------------------

/// Passes chunks through while hashing them; yields a `DigestMismatch`
/// error instead of end-of-stream when the content does not match.
struct DigestVerifier {
    inner: BlobStream,
    hasher: Sha256,
    expected: Option<String>,
    finished: bool,
}

impl DigestVerifier {
    fn new(inner: BlobStream, digest: &str) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            expected: digest.strip_prefix("sha256:").map(str::to_string),
            finished: false,
        }
    }
}

impl Stream for DigestVerifier {
    type Item = Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        match this.inner.as_mut().poll_next(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(Ok(chunk))) => {
                this.hasher.update(&chunk);
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.finished = true;
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.finished = true;
                let Some(expected) = this.expected.take() else {
                    return Poll::Ready(None);
                };
                let actual = hex_encode(&std::mem::take(&mut this.hasher).finalize());
                if actual == expected {
                    Poll::Ready(None)
                } else {
                    Poll::Ready(Some(Err(OciError::DigestMismatch { expected, actual })))
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Compute the SHA-256 hex digest of `data`.
pub(crate) fn hex_digest(data: &[u8]) -> String {
    hex_encode(&Sha256::digest(data))
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Extract a parameter value from a `www-authenticate` header.
/// E.g. `extract_param(header, "realm")` returns the value of `realm="…"`.
fn extract_param(header: &str, param: &str) -> Option<String> {
    let search = format!("{}=\"", param);
    let start = header.find(&search)? + search.len();
    let end = header[start..].find('"')?;
    Some(header[start..start + end].to_string())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
