//! Collaborator traits at the network and signer boundary
//!
//! The core never speaks a wire protocol itself. Relay resolution, discovery,
//! signing, blob upload and publishing are supplied through these traits;
//! local files come from [`LocalFileSource`], with [`FsFileSource`] as the
//! filesystem-backed default.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{DeployConfig, PublishFlags};
use crate::error::RemoteError;
use crate::model::{Identity, LocalFile, RemoteFileRecord, SignedAnnouncement};
use crate::{Error, Result};

/// Progress report from a collaborator or loader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    pub completed: usize,
    pub total: usize,
    pub message: Option<String>,
}

impl Progress {
    pub fn new(completed: usize, total: usize) -> Self {
        Self {
            completed,
            total,
            message: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Progress callback passed down to collaborators.
pub type ProgressFn = dyn Fn(Progress) + Send + Sync;

/// Inputs to relay resolution.
#[derive(Debug, Clone, Default)]
pub struct RelayOptions {
    /// Relays from configuration, if any
    pub configured: Vec<String>,
    /// Identity whose published relay list may be consulted
    pub identity_key: Option<String>,
}

#[async_trait]
pub trait RelayResolver: Send + Sync {
    async fn resolve_relays(&self, options: &RelayOptions) -> std::result::Result<Vec<String>, RemoteError>;
}

#[async_trait]
pub trait RemoteDiscovery: Send + Sync {
    /// Find the announcements published by `identity_key`.
    async fn discover_remote_files(
        &self,
        relays: &[String],
        identity_key: &str,
        silent: bool,
        on_progress: Option<&ProgressFn>,
    ) -> std::result::Result<Vec<RemoteFileRecord>, RemoteError>;

    /// Probe servers for each record's blob and fill in `servers`.
    async fn check_server_availability(
        &self,
        relays: &[String],
        identity_key: &str,
        files: &mut [RemoteFileRecord],
        on_progress: Option<&ProgressFn>,
        known_servers: Option<&[String]>,
    ) -> std::result::Result<(), RemoteError>;
}

#[async_trait]
pub trait AnnouncementSigner: Send + Sync {
    fn identity(&self) -> Identity;

    /// Sign an announcement binding `path` to `sha256`.
    async fn sign(
        &self,
        identity: &Identity,
        path: &str,
        sha256: &str,
    ) -> std::result::Result<SignedAnnouncement, RemoteError>;
}

/// One file headed for one server.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub path: String,
    pub sha256: String,
    pub size: u64,
    pub server: String,
    /// Absolute location of the bytes on disk
    pub source: PathBuf,
    pub announcement: SignedAnnouncement,
}

#[async_trait]
pub trait BlobUploader: Send + Sync {
    /// Store one blob on one server.
    ///
    /// `Ok` means the server confirmed it holds the blob.
    async fn upload(
        &self,
        request: &UploadRequest,
        signer: &dyn AnnouncementSigner,
    ) -> std::result::Result<(), RemoteError>;
}

/// Per-relay result of a publish call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishOutcome {
    pub accepted: BTreeSet<String>,
    /// Relay to rejection reason
    pub rejected: BTreeMap<String, String>,
}

impl PublishOutcome {
    pub fn all_accepted(relays: &[String]) -> Self {
        Self {
            accepted: relays.iter().cloned().collect(),
            rejected: BTreeMap::new(),
        }
    }

    pub fn all_rejected(relays: &[String], reason: &str) -> Self {
        Self {
            accepted: BTreeSet::new(),
            rejected: relays.iter().map(|r| (r.clone(), reason.to_string())).collect(),
        }
    }
}

/// Counts from a metadata publish.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataReport {
    pub published: usize,
    pub failed: usize,
}

/// Sink for user-facing status lines emitted by collaborators.
pub trait DisplaySink: Send + Sync {
    fn message(&self, text: &str);
}

/// Sink that forwards messages to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl DisplaySink for TracingSink {
    fn message(&self, text: &str) {
        tracing::info!(target: "fabric::display", "{text}");
    }
}

#[async_trait]
pub trait AnnouncementPublisher: Send + Sync {
    async fn publish_announcements(
        &self,
        relays: &[String],
        announcements: &[SignedAnnouncement],
    ) -> std::result::Result<PublishOutcome, RemoteError>;

    /// Publish the auxiliary announcements enabled in `flags`.
    async fn publish_metadata(
        &self,
        config: &DeployConfig,
        signer: &dyn AnnouncementSigner,
        relays: &[String],
        sink: &dyn DisplaySink,
        flags: PublishFlags,
        files: &[LocalFile],
    ) -> std::result::Result<MetadataReport, RemoteError>;

    /// Request deletion of previously published announcements.
    async fn publish_deletions(
        &self,
        relays: &[String],
        event_ids: &[String],
    ) -> std::result::Result<PublishOutcome, RemoteError> {
        let _ = (relays, event_ids);
        Err(RemoteError::Unsupported("announcement deletion".to_string()))
    }
}

#[async_trait]
pub trait LocalFileSource: Send + Sync {
    async fn load_local_files(&self, root: &Path) -> Result<Vec<LocalFile>>;

    /// Current digest of one site path.
    async fn rehash(&self, root: &Path, path: &str) -> Result<String>;
}

/// [`LocalFileSource`] backed by the filesystem and `.fabricignore`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsFileSource;

#[async_trait]
impl LocalFileSource for FsFileSource {
    async fn load_local_files(&self, root: &Path) -> Result<Vec<LocalFile>> {
        let root = root.to_path_buf();
        tokio::task::spawn_blocking(move || -> Result<Vec<LocalFile>> {
            let rules = fabric_fs::load_ignore_rules(&root)?;
            Ok(fabric_fs::scan_site(&root, &rules)?)
        })
        .await
        .map_err(|e| Error::Join(e.to_string()))?
    }

    async fn rehash(&self, root: &Path, path: &str) -> Result<String> {
        let full = fabric_fs::NormalizedPath::new(root).join(path).to_native();
        tokio::task::spawn_blocking(move || -> Result<String> {
            Ok(fabric_fs::compute_file_digest(&full)?)
        })
        .await
        .map_err(|e| Error::Join(e.to_string()))?
    }
}

/// The full set of collaborators a deployment needs.
#[derive(Clone)]
pub struct Collaborators {
    pub relay_resolver: Arc<dyn RelayResolver>,
    pub discovery: Arc<dyn RemoteDiscovery>,
    /// `None` when no key or remote signer is configured
    pub signer: Option<Arc<dyn AnnouncementSigner>>,
    pub uploader: Arc<dyn BlobUploader>,
    pub publisher: Arc<dyn AnnouncementPublisher>,
    pub files: Arc<dyn LocalFileSource>,
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators")
            .field("signer", &self.signer.as_ref().map(|s| s.identity()))
            .finish_non_exhaustive()
    }
}
