//! SHA-256 content digests
//!
//! Blob servers address content by the bare lowercase hex SHA-256 of the
//! file bytes, so that is the only digest format produced here.

use sha2::{Digest, Sha256};
use std::path::Path;

use crate::{Error, Result};

/// Compute the hex SHA-256 digest of a byte slice.
pub fn compute_bytes_digest(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    format!("{:x}", hasher.finalize())
}

/// Compute the hex SHA-256 digest of a file's contents.
///
/// # Errors
///
/// Returns an error if the file cannot be read.
pub fn compute_file_digest(path: &Path) -> Result<String> {
    let content = std::fs::read(path).map_err(|e| Error::io(path, e))?;
    Ok(compute_bytes_digest(&content))
}
