//! Shared data model: remote records, announcements, identities and
//! per-file deployment status.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

pub use fabric_fs::LocalFile;

/// A file as discovered on the remote fabric.
///
/// Produced by discovery; the core never mutates a record except through
/// the availability check, which fills in `servers`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFileRecord {
    pub path: String,
    pub sha256: String,
    /// Id of the announcement this record was read from
    pub event_id: String,
    /// Relays the announcement was observed on
    pub relays: BTreeSet<String>,
    /// Servers confirmed to hold the blob
    pub servers: BTreeSet<String>,
    /// Announcement timestamp, unix seconds
    pub created_at: i64,
}

impl RemoteFileRecord {
    pub fn new(path: impl Into<String>, sha256: impl Into<String>, event_id: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            sha256: sha256.into(),
            event_id: event_id.into(),
            relays: BTreeSet::new(),
            servers: BTreeSet::new(),
            created_at: 0,
        }
    }

    pub fn with_relays<I, S>(mut self, relays: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.relays.extend(relays.into_iter().map(Into::into));
        self
    }

    pub fn with_servers<I, S>(mut self, servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.servers.extend(servers.into_iter().map(Into::into));
        self
    }

    pub fn with_created_at(mut self, created_at: i64) -> Self {
        self.created_at = created_at;
        self
    }
}

/// How the signing key is held.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IdentityKind {
    /// Private key available in-process
    LocalKey,
    /// Signing delegated to a remote signer
    RemoteSigner,
}

/// The public side of the signing identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Hex public key
    pub public_key: String,
    pub kind: IdentityKind,
}

impl Identity {
    pub fn new(public_key: impl Into<String>, kind: IdentityKind) -> Self {
        Self {
            public_key: public_key.into(),
            kind,
        }
    }
}

/// A signed event binding a site path to a content digest.
///
/// Immutable once produced; a run signs each file at most once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedAnnouncement {
    pub event_id: String,
    pub path: String,
    pub sha256: String,
    /// Public key of the signer
    pub signer: String,
    pub signature: String,
    pub created_at: i64,
}

/// Overall status of one file in a deployment run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Pending,
    Uploading,
    Completed,
    Failed,
    Publishing,
    Published,
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Uploading => "uploading",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Publishing => "publishing",
            Self::Published => "published",
        };
        f.write_str(name)
    }
}

/// Status of one file on one server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerTransferStatus {
    Pending,
    Uploading,
    Completed,
    Failed,
}

/// Status of one file's announcement on one relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayPublishStatus {
    Pending,
    Publishing,
    Published,
    Failed,
}

/// Live status of one file for the duration of a run.
///
/// The status matrices are keyed by server and relay URL; only the run
/// driver writes to them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentFileStatus {
    pub path: String,
    pub size: u64,
    pub sha256: String,
    pub status: FileStatus,
    /// 0-100
    pub progress: u8,
    pub servers: BTreeMap<String, ServerTransferStatus>,
    pub relays: BTreeMap<String, RelayPublishStatus>,
    pub error: Option<String>,
    pub announcement: Option<SignedAnnouncement>,
}

impl DeploymentFileStatus {
    /// A pending entry with every target in its initial state.
    pub fn pending(file: &LocalFile, servers: &[String], relays: &[String]) -> Self {
        Self {
            path: file.path.clone(),
            size: file.size,
            sha256: file.sha256.clone(),
            status: FileStatus::Pending,
            progress: 0,
            servers: servers
                .iter()
                .map(|s| (s.clone(), ServerTransferStatus::Pending))
                .collect(),
            relays: relays
                .iter()
                .map(|r| (r.clone(), RelayPublishStatus::Pending))
                .collect(),
            error: None,
            announcement: None,
        }
    }

    /// An entry for a file that is already replicated.
    ///
    /// Targets confirmed by the remote record start out completed or
    /// published; the rest stay pending.
    pub fn already_deployed(
        file: &LocalFile,
        remote: Option<&RemoteFileRecord>,
        servers: &[String],
        relays: &[String],
    ) -> Self {
        let mut status = Self::pending(file, servers, relays);
        status.status = FileStatus::Completed;
        status.progress = 100;
        if let Some(record) = remote {
            for (server, entry) in status.servers.iter_mut() {
                if record.servers.contains(server) {
                    *entry = ServerTransferStatus::Completed;
                }
            }
            for (relay, entry) in status.relays.iter_mut() {
                if record.relays.contains(relay) {
                    *entry = RelayPublishStatus::Published;
                }
            }
        }
        status
    }

    /// Mark the file failed with an explicit error.
    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = FileStatus::Failed;
        self.error = Some(error.into());
    }

    pub fn is_failed(&self) -> bool {
        self.status == FileStatus::Failed
    }

    /// Servers on which this run confirmed the blob.
    pub fn completed_servers(&self) -> impl Iterator<Item = &str> {
        self.servers
            .iter()
            .filter(|(_, s)| **s == ServerTransferStatus::Completed)
            .map(|(k, _)| k.as_str())
    }

    /// Relays that accepted this file's announcement.
    pub fn published_relays(&self) -> impl Iterator<Item = &str> {
        self.relays
            .iter()
            .filter(|(_, s)| **s == RelayPublishStatus::Published)
            .map(|(k, _)| k.as_str())
    }

    /// Whether every server entry has reached a terminal state.
    pub fn servers_settled(&self) -> bool {
        self.servers.values().all(|s| {
            matches!(
                s,
                ServerTransferStatus::Completed | ServerTransferStatus::Failed
            )
        })
    }

    pub fn local_file(&self) -> LocalFile {
        LocalFile::new(self.path.clone(), self.size, self.sha256.clone())
    }
}
