//! Host platform detection and the tags used in release asset names.
use std::fmt;

use strum::ParseError;
use strum_macros::{AsRefStr, EnumString};

use crate::error::ReleaseError;

/// Operating systems with published server builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, AsRefStr)]
pub enum Os {
    #[strum(to_string = "linux")]
    Linux,
    #[strum(to_string = "darwin", serialize = "macos")]
    Darwin,
    #[strum(to_string = "windows")]
    Windows,
}

/// CPU architectures with published server builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, AsRefStr)]
pub enum Arch {
    #[strum(to_string = "x86_64", serialize = "amd64")]
    X86_64,
    #[strum(to_string = "aarch64", serialize = "arm64")]
    Aarch64,
}

/// OS/architecture pair as it appears in release asset names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PlatformTag {
    pub os: Os,
    pub arch: Arch,
}

impl PlatformTag {
    pub fn new(os: Os, arch: Arch) -> Self {
        Self { os, arch }
    }

    /// Maps raw OS and architecture names onto a tag.
    pub fn from_parts(os: &str, arch: &str) -> Result<Self, ReleaseError> {
        let unsupported = || ReleaseError::UnsupportedPlatform {
            os: os.to_string(),
            arch: arch.to_string(),
        };

        let parsed_os: Result<Os, ParseError> = os.trim().to_ascii_lowercase().parse();
        let parsed_arch: Result<Arch, ParseError> = arch.trim().to_ascii_lowercase().parse();
        match (parsed_os, parsed_arch) {
            (Ok(os), Ok(arch)) => Ok(Self { os, arch }),
            _ => Err(unsupported()),
        }
    }

    /// Tag of the running host.
    pub fn detect() -> Result<Self, ReleaseError> {
        Self::from_parts(std::env::consts::OS, std::env::consts::ARCH)
    }

    /// Whether an asset name carries both halves of this tag.
    pub fn matches(&self, asset_name: &str) -> bool {
        asset_name.contains(self.os.as_ref()) && asset_name.contains(self.arch.as_ref())
    }
}

impl fmt::Display for PlatformTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os.as_ref(), self.arch.as_ref())
    }
}
