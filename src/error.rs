//! Error types for thin

use thiserror::Error;

/// Result type alias using thin Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in thin operations
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Artifact pull or install errors
    #[error(transparent)]
    Pull(#[from] thin_oci::OciError),

    /// Provider is not installed or has no runnable binary
    #[error("Provider error: {0}")]
    Provider(String),
}
