//! Layered configuration resolution

use std::fs;
use std::path::{Path, PathBuf};

use fabric_fs::{FabricPath, NormalizedPath};

use super::manifest::{ConfigLayer, DeployConfig};
use crate::Result;

/// Resolves the deploy configuration for a site root.
///
/// Layers, later overriding earlier:
/// 1. Global defaults (`<config_dir>/fabric/config.toml`)
/// 2. Site config (`.fabric/config.toml`)
/// 3. Local overrides (`.fabric/config.local.toml`)
pub struct ConfigResolver {
    root: NormalizedPath,
    /// Override for the global config directory (used for testing).
    global_config_dir_override: Option<PathBuf>,
}

impl ConfigResolver {
    pub fn new(root: NormalizedPath) -> Self {
        Self {
            root,
            global_config_dir_override: None,
        }
    }

    /// Create a resolver with a custom global config directory.
    pub fn with_global_config_dir(root: NormalizedPath, global_config_dir: PathBuf) -> Self {
        Self {
            root,
            global_config_dir_override: Some(global_config_dir),
        }
    }

    fn global_config_dir(&self) -> Option<PathBuf> {
        if let Some(ref override_dir) = self.global_config_dir_override {
            return Some(override_dir.clone());
        }
        dirs::config_dir().map(|d| d.join("fabric"))
    }

    fn apply_layer(config: &mut DeployConfig, path: &Path, layer: &str) -> Result<()> {
        if !path.is_file() {
            tracing::debug!(path = %path.display(), layer, "No config layer found, skipping");
            return Ok(());
        }
        tracing::debug!(path = %path.display(), layer, "Loading config layer");
        let content = fs::read_to_string(path)?;
        config.apply(&ConfigLayer::parse(&content)?);
        Ok(())
    }

    /// Resolve and validate the configuration.
    ///
    /// Missing layers are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if a present layer cannot be read or parsed, or the
    /// merged result fails [`DeployConfig::validate`].
    pub fn resolve(&self) -> Result<DeployConfig> {
        let mut config = DeployConfig::default();

        if let Some(global_dir) = self.global_config_dir() {
            Self::apply_layer(&mut config, &global_dir.join("config.toml"), "global")?;
        }
        Self::apply_layer(&mut config, &self.root.join(FabricPath::Config.as_str()).to_native(), "site")?;
        Self::apply_layer(
            &mut config,
            &self.root.join(FabricPath::LocalConfig.as_str()).to_native(),
            "local",
        )?;

        config.validate()?;
        Ok(config)
    }

    pub fn root(&self) -> &NormalizedPath {
        &self.root
    }

    /// Check if a site configuration exists
    pub fn has_config(&self) -> bool {
        self.root.join(FabricPath::Config.as_str()).is_file()
    }
}
