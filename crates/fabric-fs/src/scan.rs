//! Site scanning
//!
//! Walks a site root and produces one [`LocalFile`] per deployable file.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::checksum::compute_file_digest;
use crate::constants::FabricPath;
use crate::ignore::IgnoreRules;
use crate::path::NormalizedPath;
use crate::{Error, Result};

/// A file in the local site tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LocalFile {
    /// Site path, unique within a scan
    pub path: String,
    /// Size in bytes
    pub size: u64,
    /// Hex SHA-256 of the file contents
    pub sha256: String,
}

impl LocalFile {
    pub fn new(path: impl Into<String>, size: u64, sha256: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            size,
            sha256: sha256.into(),
        }
    }
}

/// Load the ignore rules for a site root.
///
/// Reads `.fabricignore` when present and layers it over the defaults.
///
/// # Errors
///
/// Returns an error if the ignore file exists but cannot be read or
/// contains an invalid pattern.
pub fn load_ignore_rules(root: &Path) -> Result<IgnoreRules> {
    let ignore_path = root.join(FabricPath::IgnoreFile);
    if !ignore_path.is_file() {
        return Ok(IgnoreRules::defaults());
    }
    let content = fs::read_to_string(&ignore_path).map_err(|e| Error::io(&ignore_path, e))?;
    let rules = IgnoreRules::with_defaults(&content)?;
    tracing::debug!(path = %ignore_path.display(), rules = rules.len(), "Loaded ignore rules");
    Ok(rules)
}

/// Scan a site root into a sorted list of local files.
///
/// Symlinks and entries whose names are not valid UTF-8 are skipped.
/// Ignored directories are pruned without descending into them.
///
/// # Errors
///
/// Returns an error if the root cannot be resolved or any directory or file
/// cannot be read.
pub fn scan_site(root: &Path, rules: &IgnoreRules) -> Result<Vec<LocalFile>> {
    let canonical = dunce::canonicalize(root).map_err(|e| Error::io(root, e))?;
    let base = NormalizedPath::new(&canonical);
    let mut files = Vec::new();
    walk(&base, &canonical, rules, &mut files)?;
    files.sort_by(|a, b| a.path.cmp(&b.path));
    tracing::debug!(root = %base, files = files.len(), "Scanned site");
    Ok(files)
}

fn walk(base: &NormalizedPath, dir: &Path, rules: &IgnoreRules, out: &mut Vec<LocalFile>) -> Result<()> {
    let entries = fs::read_dir(dir).map_err(|e| Error::io(dir, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| Error::io(dir, e))?;
        let path = entry.path();
        let metadata = fs::symlink_metadata(&path).map_err(|e| Error::io(&path, e))?;
        if metadata.file_type().is_symlink() {
            tracing::debug!(path = %path.display(), "Skipping symlink");
            continue;
        }
        if entry.file_name().to_str().is_none() {
            tracing::warn!(path = %path.display(), "Skipping entry with a non-UTF-8 name");
            continue;
        }

        let site = base
            .relative_site_path(&path)
            .ok_or_else(|| Error::OutsideRoot { path: path.clone() })?;

        if metadata.is_dir() {
            if rules.is_ignored(&site, true) {
                continue;
            }
            walk(base, &path, rules, out)?;
        } else if metadata.is_file() {
            if rules.is_ignored(&site, false) {
                continue;
            }
            let sha256 = compute_file_digest(&path)?;
            out.push(LocalFile::new(site, metadata.len(), sha256));
        }
    }
    Ok(())
}
