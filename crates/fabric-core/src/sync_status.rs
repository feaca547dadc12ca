//! Per-file consistency classification
//!
//! Combines the remote discovery result for a path with the live status of
//! the current deployment run into one of four states.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::model::{DeploymentFileStatus, LocalFile, RemoteFileRecord};
use crate::reconcile::index_remote;

/// Consistency state of a single file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// Matching announcement, on at least one server and one relay
    Synced,
    /// Some remote trace, but not all of the above
    Partial,
    /// No remote trace at all
    Local,
    /// The current run recorded a transfer or publish error
    Error,
}

/// The local side of a classification.
#[derive(Debug, Clone, Copy)]
pub struct SyncSubject<'a> {
    pub path: &'a str,
    pub sha256: &'a str,
    /// Live status from the current run, if the file is part of one
    pub run: Option<&'a DeploymentFileStatus>,
}

impl<'a> SyncSubject<'a> {
    pub fn local(file: &'a LocalFile) -> Self {
        Self {
            path: &file.path,
            sha256: &file.sha256,
            run: None,
        }
    }

    pub fn from_run(status: &'a DeploymentFileStatus) -> Self {
        Self {
            path: &status.path,
            sha256: &status.sha256,
            run: Some(status),
        }
    }
}

/// Classify one file.
///
/// Run evidence is only consulted while `run_active` is set, so a finished
/// run's errors do not linger in the consistency signal.
pub fn classify(subject: SyncSubject<'_>, remote: Option<&RemoteFileRecord>, run_active: bool) -> SyncStatus {
    let run = subject.run.filter(|_| run_active);

    if run.is_some_and(|r| r.error.is_some()) {
        return SyncStatus::Error;
    }

    let run_published = run.is_some_and(|r| r.published_relays().next().is_some());
    let run_stored = run.is_some_and(|r| r.completed_servers().next().is_some());

    let matching = remote.is_some_and(|r| r.sha256 == subject.sha256) || run_published;
    let on_server = remote.is_some_and(|r| !r.servers.is_empty()) || run_stored;
    let on_relay = remote.is_some_and(|r| !r.relays.is_empty()) || run_published;

    match [matching, on_server, on_relay].iter().filter(|v| **v).count() {
        3 => SyncStatus::Synced,
        0 => SyncStatus::Local,
        _ => SyncStatus::Partial,
    }
}

/// Counts of each [`SyncStatus`] across a file set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSummary {
    pub synced: usize,
    pub partial: usize,
    pub local: usize,
    pub error: usize,
}

impl SyncSummary {
    pub fn from_statuses<'a>(statuses: impl IntoIterator<Item = &'a SyncStatus>) -> Self {
        let mut summary = Self::default();
        for status in statuses {
            match status {
                SyncStatus::Synced => summary.synced += 1,
                SyncStatus::Partial => summary.partial += 1,
                SyncStatus::Local => summary.local += 1,
                SyncStatus::Error => summary.error += 1,
            }
        }
        summary
    }

    pub fn total(&self) -> usize {
        self.synced + self.partial + self.local + self.error
    }
}

/// Classify a set of subjects against remote records, keyed by path.
pub fn classify_all<'a>(
    subjects: impl IntoIterator<Item = SyncSubject<'a>>,
    remote: &[RemoteFileRecord],
    run_active: bool,
) -> BTreeMap<String, SyncStatus> {
    let by_path = index_remote(remote);
    subjects
        .into_iter()
        .map(|subject| {
            let record = by_path.get(subject.path).copied();
            (subject.path.to_string(), classify(subject, record, run_active))
        })
        .collect()
}
