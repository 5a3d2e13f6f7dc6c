use std::fmt;

use crate::manifest::{Platform, MEDIA_TYPE_BINARY_PREFIX};

/// The `{os, arch}` pair a provider binary is built for, spelled the way
/// registry artifacts spell it (`darwin`, `linux`, `amd64`, `arm64`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PlatformKey {
    pub os: String,
    pub arch: String,
}

impl PlatformKey {
    pub fn new(os: impl Into<String>, arch: impl Into<String>) -> Self {
        Self {
            os: os.into(),
            arch: arch.into(),
        }
    }

    /// Build a `PlatformKey` matching the current host.
    pub fn host() -> Self {
        Self::new(host_os(), host_arch())
    }

    /// Media type of the binary layer built for this platform, e.g.
    /// `application/vnd.sourceplane.bin.darwin-arm64`.
    pub fn binary_media_type(&self) -> String {
        format!("{}{}-{}", MEDIA_TYPE_BINARY_PREFIX, self.os, self.arch)
    }

    /// Whether an image-index platform entry targets this key.
    pub fn matches(&self, platform: &Platform) -> bool {
        platform.os == self.os && platform.architecture == self.arch
    }
}

impl fmt::Display for PlatformKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.arch)
    }
}

/// Map Rust `std::env::consts::OS` values to registry platform strings.
fn host_os() -> &'static str {
    match std::env::consts::OS {
        "macos" => "darwin",
        other => other,
    }
}

/// Map Rust `std::env::consts::ARCH` values to registry platform strings.
fn host_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "x86" => "386",
        "arm" => "arm",
        "s390x" => "s390x",
        "powerpc64" => "ppc64le",
        "riscv64" => "riscv64",
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_media_type_combines_os_and_arch() {
        let key = PlatformKey::new("darwin", "arm64");
        assert_eq!(
            key.binary_media_type(),
            "application/vnd.sourceplane.bin.darwin-arm64"
        );
    }

    #[test]
    fn host_uses_registry_spelling() {
        let key = PlatformKey::host();
        assert_ne!(key.os, "macos");
        assert_ne!(key.arch, "x86_64");
        assert_ne!(key.arch, "aarch64");
    }

    #[test]
    fn matches_index_platform() {
        let key = PlatformKey::new("linux", "amd64");
        let amd = Platform {
            architecture: "amd64".to_string(),
            os: "linux".to_string(),
            variant: None,
        };
        let arm = Platform {
            architecture: "arm64".to_string(),
            ..amd.clone()
        };
        assert!(key.matches(&amd));
        assert!(!key.matches(&arm));
    }

    #[test]
    fn display_is_os_slash_arch() {
        assert_eq!(PlatformKey::new("linux", "arm64").to_string(), "linux/arm64");
    }
}
