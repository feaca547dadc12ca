//! Deploy configuration parsed from `config.toml` layers
//!
//! Each file is parsed into a [`ConfigLayer`] where every field is optional,
//! and layers are applied in order onto [`DeployConfig::default`].

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

fn default_concurrency() -> usize {
    4
}

fn default_batch_size() -> usize {
    10
}

/// Which auxiliary metadata announcements to publish after the file
/// announcements. Each flag is independent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishFlags {
    #[serde(default)]
    pub profile: bool,
    #[serde(default)]
    pub relay_list: bool,
    #[serde(default)]
    pub server_list: bool,
    #[serde(default)]
    pub app_handler: bool,
}

impl PublishFlags {
    /// Number of enabled metadata announcements.
    pub fn enabled_count(&self) -> usize {
        [self.profile, self.relay_list, self.server_list, self.app_handler]
            .iter()
            .filter(|f| **f)
            .count()
    }

    pub fn any(&self) -> bool {
        self.enabled_count() > 0
    }
}

/// Profile metadata announced when `publish.profile` is set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileMetadata {
    pub name: Option<String>,
    pub about: Option<String>,
    pub picture: Option<String>,
}

/// Application handler metadata announced when `publish.app_handler` is set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppHandlerMetadata {
    pub name: Option<String>,
    pub description: Option<String>,
    /// Event kinds the site can handle
    #[serde(default)]
    pub kinds: Vec<u32>,
}

/// The effective deploy configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployConfig {
    /// Relay URLs (`ws://` or `wss://`)
    pub relays: Vec<String>,
    /// Blob server URLs (`http://` or `https://`)
    pub servers: Vec<String>,
    /// Maximum concurrent (file, server) uploads
    pub concurrency: usize,
    /// Delete remote announcements for files removed locally
    pub purge: bool,
    /// Re-hash transferred files before announcing them
    pub verify_before_publish: bool,
    /// Files per availability check batch
    pub availability_batch_size: usize,
    pub publish: PublishFlags,
    pub profile: Option<ProfileMetadata>,
    pub app_handler: Option<AppHandlerMetadata>,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            relays: Vec::new(),
            servers: Vec::new(),
            concurrency: default_concurrency(),
            purge: false,
            verify_before_publish: true,
            availability_batch_size: default_batch_size(),
            publish: PublishFlags::default(),
            profile: None,
            app_handler: None,
        }
    }
}

/// Publish flags as written in one layer.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PublishLayer {
    pub profile: Option<bool>,
    pub relay_list: Option<bool>,
    pub server_list: Option<bool>,
    pub app_handler: Option<bool>,
}

/// One configuration file; absent keys leave lower layers untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigLayer {
    #[serde(default)]
    pub relays: Vec<String>,
    #[serde(default)]
    pub servers: Vec<String>,
    pub concurrency: Option<usize>,
    pub purge: Option<bool>,
    pub verify_before_publish: Option<bool>,
    pub availability_batch_size: Option<usize>,
    #[serde(default)]
    pub publish: PublishLayer,
    pub profile: Option<ProfileMetadata>,
    pub app_handler: Option<AppHandlerMetadata>,
}

impl ConfigLayer {
    /// Parse a layer from TOML content.
    ///
    /// # Errors
    ///
    /// Returns an error if the content is not valid TOML for this schema.
    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }
}

fn extend_unique(base: &mut Vec<String>, other: &[String]) {
    for item in other {
        let item = item.trim_end_matches('/').to_string();
        if !base.contains(&item) {
            base.push(item);
        }
    }
}

impl DeployConfig {
    /// Parse a single TOML document on top of the defaults.
    ///
    /// # Example
    ///
    /// ```
    /// use fabric_core::config::DeployConfig;
    ///
    /// let config = DeployConfig::parse(r#"
    /// relays = ["wss://relay.example"]
    /// servers = ["https://blobs.example"]
    ///
    /// [publish]
    /// relay_list = true
    /// "#).unwrap();
    ///
    /// assert_eq!(config.concurrency, 4);
    /// assert!(config.publish.relay_list);
    /// ```
    ///
    /// # Errors
    ///
    /// Returns an error if the content is not valid TOML for this schema.
    pub fn parse(content: &str) -> Result<Self> {
        let mut config = Self::default();
        config.apply(&ConfigLayer::parse(content)?);
        Ok(config)
    }

    /// Apply a layer on top of this configuration.
    ///
    /// Scalars from `layer` win when present. Relay and server lists are
    /// unioned in order with trailing slashes stripped.
    pub fn apply(&mut self, layer: &ConfigLayer) {
        extend_unique(&mut self.relays, &layer.relays);
        extend_unique(&mut self.servers, &layer.servers);
        if let Some(concurrency) = layer.concurrency {
            self.concurrency = concurrency;
        }
        if let Some(purge) = layer.purge {
            self.purge = purge;
        }
        if let Some(verify) = layer.verify_before_publish {
            self.verify_before_publish = verify;
        }
        if let Some(batch) = layer.availability_batch_size {
            self.availability_batch_size = batch;
        }
        let publish = &layer.publish;
        self.publish.profile = publish.profile.unwrap_or(self.publish.profile);
        self.publish.relay_list = publish.relay_list.unwrap_or(self.publish.relay_list);
        self.publish.server_list = publish.server_list.unwrap_or(self.publish.server_list);
        self.publish.app_handler = publish.app_handler.unwrap_or(self.publish.app_handler);
        if layer.profile.is_some() {
            self.profile.clone_from(&layer.profile);
        }
        if layer.app_handler.is_some() {
            self.app_handler.clone_from(&layer.app_handler);
        }
    }

    /// Check the configuration for values a run cannot work with.
    ///
    /// Empty relay or server lists are allowed here; the deployment run
    /// reports those itself.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(Error::Config {
                message: "concurrency must be at least 1".to_string(),
            });
        }
        if self.availability_batch_size == 0 {
            return Err(Error::Config {
                message: "availability_batch_size must be at least 1".to_string(),
            });
        }
        if let Some(relay) = self
            .relays
            .iter()
            .find(|r| !(r.starts_with("wss://") || r.starts_with("ws://")))
        {
            return Err(Error::Config {
                message: format!("relay URL must use ws:// or wss://: {relay}"),
            });
        }
        if let Some(server) = self
            .servers
            .iter()
            .find(|s| !(s.starts_with("https://") || s.starts_with("http://")))
        {
            return Err(Error::Config {
                message: format!("server URL must use http:// or https://: {server}"),
            });
        }
        if self.publish.profile && self.profile.is_none() {
            return Err(Error::Config {
                message: "publish.profile is set but no [profile] section is configured".to_string(),
            });
        }
        Ok(())
    }
}
