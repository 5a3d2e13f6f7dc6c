/// Errors produced while pulling and installing a provider artifact.
#[derive(Debug, thiserror::Error)]
pub enum OciError {
    #[error("registry error: {0}")]
    Registry(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error(
        "failed to resolve image {reference} with tag {tag}: {source}\n\
         Tip: make sure the image is public or provide credentials"
    )]
    Resolve {
        reference: String,
        tag: String,
        #[source]
        source: Box<OciError>,
    },

    #[error("manifest error: {0}")]
    Manifest(String),

    #[error("provider manifest layer not found in manifest")]
    MissingProviderContent,

    #[error("failed to fetch layer {digest}: {source}")]
    Fetch {
        digest: String,
        #[source]
        source: Box<OciError>,
    },

    #[error("download worker failed: {0}")]
    Worker(String),

    #[error("invalid provider name: {0:?}")]
    InvalidName(String),

    #[error("extract error: {0}")]
    Extract(String),

    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, OciError>;
