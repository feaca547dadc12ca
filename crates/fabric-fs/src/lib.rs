//! Filesystem support for Fabric Deploy
//!
//! Turns a local directory into the set of [`LocalFile`]s a deployment run
//! works with: paths normalized to forward-slash site paths, content hashed
//! with SHA-256, and entries filtered through the ignore rules.

pub mod checksum;
pub mod constants;
pub mod error;
pub mod ignore;
pub mod path;
pub mod scan;

pub use checksum::{compute_bytes_digest, compute_file_digest};
pub use constants::FabricPath;
pub use error::{Error, Result};
pub use ignore::IgnoreRules;
pub use path::{NormalizedPath, site_path};
pub use scan::{LocalFile, load_ignore_rules, scan_site};
