//! Deploy configuration
//!
//! Configuration is merged from these sources (later sources override earlier):
//!
//! 1. **Global defaults** - `<config_dir>/fabric/config.toml`
//! 2. **Site config** - `.fabric/config.toml`
//! 3. **Local overrides** - `.fabric/config.local.toml`
//!
//! Relay and server lists are unioned across layers; scalar settings take
//! the value from the last layer that sets them.

mod manifest;
mod resolver;

pub use manifest::{
    AppHandlerMetadata, ConfigLayer, DeployConfig, ProfileMetadata, PublishFlags, PublishLayer,
};
pub use resolver::ConfigResolver;
