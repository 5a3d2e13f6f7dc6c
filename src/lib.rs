//! thin: install provider bundles from OCI registries
//!
//! A provider is a versioned bundle (a manifest, an `assets/` tree and a
//! per-platform binary) published as a registry artifact.  This crate holds
//! the application layer: home directory and settings resolution, and the
//! glue that hands them to the [`thin_oci`] pull pipeline.
//!
//! # Example
//!
//! ```no_run
//! use thin::config::{resolve_home, Config};
//! use thin::install::install_provider;
//! use thin_oci::ProgressMode;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::load(resolve_home(None)?)?;
//!     let report = install_provider(
//!         &config,
//!         "lite",
//!         "ghcr.io/sourceplane/lite-ci:v0.1.2",
//!         ProgressMode::Plain,
//!     )
//!     .await?;
//!     println!("installed into {}", report.root.display());
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod install;

pub use error::{Error, Result};
