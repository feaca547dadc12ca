//! Reconciliation between the local site and discovered remote records
//!
//! [`compare`] partitions the local files into those that must be
//! transferred and those already replicated, and lists remote records that
//! no longer have a local counterpart.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::model::{LocalFile, RemoteFileRecord};

/// Result of comparing local files with remote records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcilePlan {
    /// Local files missing remotely or remote with a different digest
    pub to_transfer: Vec<LocalFile>,
    /// Local files whose exact content is already announced
    pub existing: Vec<LocalFile>,
    /// Remote records with no local file at the same path
    pub to_delete: Vec<RemoteFileRecord>,
}

/// Counts derived from a [`ReconcilePlan`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanSummary {
    pub to_transfer: usize,
    pub existing: usize,
    pub to_delete: usize,
    /// Bytes that need transferring
    pub transfer_bytes: u64,
}

impl ReconcilePlan {
    pub fn summary(&self) -> PlanSummary {
        PlanSummary {
            to_transfer: self.to_transfer.len(),
            existing: self.existing.len(),
            to_delete: self.to_delete.len(),
            transfer_bytes: self.to_transfer.iter().map(|f| f.size).sum(),
        }
    }

    /// Whether the local and remote sides already agree.
    pub fn is_noop(&self) -> bool {
        self.to_transfer.is_empty() && self.to_delete.is_empty()
    }
}

/// Index remote records by path.
///
/// When several announcements exist for one path the newest wins; on equal
/// timestamps the later record in discovery order wins.
pub fn index_remote(remote: &[RemoteFileRecord]) -> HashMap<&str, &RemoteFileRecord> {
    let mut by_path: HashMap<&str, &RemoteFileRecord> = HashMap::with_capacity(remote.len());
    for record in remote {
        match by_path.get(record.path.as_str()) {
            Some(current) if current.created_at > record.created_at => {}
            _ => {
                by_path.insert(record.path.as_str(), record);
            }
        }
    }
    by_path
}

/// Compare local files against remote records.
///
/// Pure and deterministic: the same inputs always yield the same plan.
/// `to_transfer` and `existing` keep the local order; `to_delete` is sorted
/// by path.
pub fn compare(local: &[LocalFile], remote: &[RemoteFileRecord]) -> ReconcilePlan {
    let by_path = index_remote(remote);

    let mut plan = ReconcilePlan::default();
    for file in local {
        match by_path.get(file.path.as_str()) {
            Some(record) if record.sha256 == file.sha256 => plan.existing.push(file.clone()),
            _ => plan.to_transfer.push(file.clone()),
        }
    }

    let local_paths: HashSet<&str> = local.iter().map(|f| f.path.as_str()).collect();
    let stale: BTreeMap<&str, &RemoteFileRecord> = by_path
        .into_iter()
        .filter(|(path, _)| !local_paths.contains(path))
        .collect();
    plan.to_delete = stale.into_values().cloned().collect();

    tracing::debug!(
        to_transfer = plan.to_transfer.len(),
        existing = plan.existing.len(),
        to_delete = plan.to_delete.len(),
        "Reconciled local and remote state"
    );
    plan
}
