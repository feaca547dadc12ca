//! Well-known paths inside a site root.

use std::path::Path;

/// Fabric-managed files and directories within a site root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FabricPath {
    /// The `.fabric` directory (configuration root)
    ConfigDir,
    /// `.fabric/config.toml`
    Config,
    /// `.fabric/config.local.toml`, never deployed
    LocalConfig,
    /// The `.fabricignore` file
    IgnoreFile,
}

impl FabricPath {
    /// Get the site-relative string form of the path.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConfigDir => ".fabric",
            Self::Config => ".fabric/config.toml",
            Self::LocalConfig => ".fabric/config.local.toml",
            Self::IgnoreFile => ".fabricignore",
        }
    }
}

impl AsRef<Path> for FabricPath {
    fn as_ref(&self) -> &Path {
        Path::new(self.as_str())
    }
}

impl AsRef<str> for FabricPath {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}
