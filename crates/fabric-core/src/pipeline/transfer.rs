//! Fan-out of signed files to blob servers
//!
//! Every (file, server) pair runs as its own task on a [`JoinSet`], bounded
//! by a semaphore. Tasks never touch file statuses; they report
//! [`TransferEvent`]s and the receiving side applies them through a
//! [`TransferTracker`].

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;

use crate::collaborators::{AnnouncementSigner, BlobUploader, Progress, ProgressFn, UploadRequest};
use crate::error::RemoteError;
use crate::model::{
    DeploymentFileStatus, FileStatus, LocalFile, ServerTransferStatus, SignedAnnouncement,
};
use crate::operations::CancelFlag;

const EVENT_BUFFER: usize = 64;

/// A signed file ready to be stored.
#[derive(Debug, Clone)]
pub(crate) struct TransferJob {
    pub file: LocalFile,
    pub announcement: SignedAnnouncement,
}

#[derive(Debug)]
pub(crate) enum TransferEvent {
    Started {
        path: String,
        server: String,
    },
    Finished {
        path: String,
        server: String,
        result: Result<(), RemoteError>,
    },
    /// Not submitted because the run was cancelled
    Skipped {
        path: String,
        server: String,
    },
}

/// Outcome of one file in a [`transfer`] batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileTransferResult {
    pub status: DeploymentFileStatus,
}

impl FileTransferResult {
    /// Whether at least one server stored the file.
    pub fn succeeded(&self) -> bool {
        self.status.status == FileStatus::Completed
    }
}

/// Shared handles the transfer tasks need.
#[derive(Clone)]
pub(crate) struct TransferContext {
    pub root: PathBuf,
    pub uploader: Arc<dyn BlobUploader>,
    pub signer: Arc<dyn AnnouncementSigner>,
    pub cancel: Option<CancelFlag>,
}

/// Spawn one task per (job, server) pair.
///
/// Returns the task set and the event receiver. The receiver closes once
/// every task has finished.
pub(crate) fn spawn_transfers(
    jobs: &[TransferJob],
    servers: &[String],
    concurrency: usize,
    ctx: &TransferContext,
) -> (JoinSet<()>, mpsc::Receiver<TransferEvent>) {
    let (tx, rx) = mpsc::channel(EVENT_BUFFER);
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut set = JoinSet::new();

    for job in jobs {
        let source = fabric_fs::NormalizedPath::new(&ctx.root)
            .join(&job.file.path)
            .to_native();
        for server in servers {
            let request = UploadRequest {
                path: job.file.path.clone(),
                sha256: job.file.sha256.clone(),
                size: job.file.size,
                server: server.clone(),
                source: source.clone(),
                announcement: job.announcement.clone(),
            };
            let tx = tx.clone();
            let semaphore = Arc::clone(&semaphore);
            let uploader = Arc::clone(&ctx.uploader);
            let signer = Arc::clone(&ctx.signer);
            let cancel = ctx.cancel.clone();

            set.spawn(async move {
                let path = request.path.clone();
                let server = request.server.clone();
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return;
                };
                if cancel.as_ref().is_some_and(CancelFlag::is_cancelled) {
                    let _ = tx.send(TransferEvent::Skipped { path, server }).await;
                    return;
                }
                let _ = tx
                    .send(TransferEvent::Started {
                        path: path.clone(),
                        server: server.clone(),
                    })
                    .await;
                let result = uploader.upload(&request, signer.as_ref()).await;
                let _ = tx.send(TransferEvent::Finished { path, server, result }).await;
            });
        }
    }

    (set, rx)
}

/// Applies transfer events to file statuses and tracks file completion.
#[derive(Debug, Default)]
pub(crate) struct TransferTracker {
    /// Servers yet to report, per file
    remaining: HashMap<String, usize>,
    errors: HashMap<String, Vec<String>>,
    servers: usize,
    total: usize,
    processed: usize,
    uploaded: usize,
}

impl TransferTracker {
    pub fn new(jobs: &[TransferJob], servers: usize) -> Self {
        Self {
            remaining: jobs.iter().map(|j| (j.file.path.clone(), servers)).collect(),
            errors: HashMap::new(),
            servers,
            total: jobs.len(),
            processed: 0,
            uploaded: 0,
        }
    }

    pub fn total(&self) -> usize {
        self.total
    }

    /// Files whose servers have all reported.
    pub fn processed(&self) -> usize {
        self.processed
    }

    /// Files stored on at least one server.
    pub fn uploaded(&self) -> usize {
        self.uploaded
    }

    /// Apply one event. Returns `true` when it settled a file.
    pub fn apply(&mut self, files: &mut BTreeMap<String, DeploymentFileStatus>, event: TransferEvent) -> bool {
        let (path, server, outcome) = match event {
            TransferEvent::Started { path, server } => {
                if let Some(status) = files.get_mut(&path) {
                    status.servers.insert(server, ServerTransferStatus::Uploading);
                    if status.status == FileStatus::Pending {
                        status.status = FileStatus::Uploading;
                    }
                }
                return false;
            }
            TransferEvent::Finished { path, server, result } => (path, server, Some(result)),
            TransferEvent::Skipped { path, server } => (path, server, None),
        };

        let Some(status) = files.get_mut(&path) else {
            return false;
        };
        match outcome {
            Some(Ok(())) => {
                tracing::debug!(path = %path, server = %server, "Blob stored");
                status.servers.insert(server, ServerTransferStatus::Completed);
            }
            Some(Err(err)) => {
                tracing::warn!(path = %path, server = %server, error = %err, "Upload failed");
                status.servers.insert(server.clone(), ServerTransferStatus::Failed);
                self.errors
                    .entry(path.clone())
                    .or_default()
                    .push(format!("{server}: {err}"));
            }
            None => {}
        }

        let settled = self.servers > 0 && {
            let reported = status
                .servers
                .values()
                .filter(|s| matches!(s, ServerTransferStatus::Completed | ServerTransferStatus::Failed))
                .count();
            status.progress = (reported.min(self.servers) * 100 / self.servers) as u8;
            self.countdown(&path)
        };
        if settled {
            self.settle(status);
        }
        settled
    }

    fn countdown(&mut self, path: &str) -> bool {
        match self.remaining.get_mut(path) {
            Some(left) if *left > 0 => {
                *left -= 1;
                *left == 0
            }
            _ => false,
        }
    }

    fn settle(&mut self, status: &mut DeploymentFileStatus) {
        self.processed += 1;
        let stored = status.completed_servers().count();
        let errors = self.errors.remove(&status.path).unwrap_or_default();
        if stored > 0 {
            self.uploaded += 1;
            status.status = FileStatus::Completed;
            status.progress = 100;
            if !errors.is_empty() {
                tracing::warn!(
                    path = %status.path,
                    stored,
                    failed = errors.len(),
                    "File stored on some servers only"
                );
            }
        } else if !errors.is_empty() {
            status.fail(errors.join("; "));
        }
    }

    /// Fail the servers of files whose tasks ended without reporting.
    pub fn abandon_unsettled(&mut self, files: &mut BTreeMap<String, DeploymentFileStatus>) {
        let unsettled: Vec<String> = self
            .remaining
            .iter()
            .filter(|(_, left)| **left > 0)
            .map(|(path, _)| path.clone())
            .collect();
        for path in unsettled {
            let Some(status) = files.get_mut(&path) else {
                continue;
            };
            for entry in status.servers.values_mut() {
                if *entry == ServerTransferStatus::Uploading {
                    *entry = ServerTransferStatus::Failed;
                    self.errors
                        .entry(path.clone())
                        .or_default()
                        .push("transfer task ended without a result".to_string());
                }
            }
            self.remaining.insert(path, 0);
            self.settle(status);
        }
    }
}

/// Wait for every task, logging any that panicked.
pub(crate) async fn drain(set: &mut JoinSet<()>) {
    while let Some(joined) = set.join_next().await {
        if let Err(err) = joined {
            tracing::error!(error = %err, "Transfer task ended abnormally");
        }
    }
}

/// Sign and store a batch of files on every server.
///
/// Each file is signed once, then stored on each server independently with
/// at most `concurrency` uploads in flight. A file succeeds when at least
/// one server stores it. Results come back in the order of `files`, with
/// relay entries initialized from `relays` for a later publish.
#[allow(clippy::too_many_arguments)]
pub async fn transfer(
    files: &[LocalFile],
    root: &Path,
    servers: &[String],
    signer: Arc<dyn AnnouncementSigner>,
    uploader: Arc<dyn BlobUploader>,
    relays: &[String],
    concurrency: usize,
    on_progress: Option<&ProgressFn>,
) -> Vec<FileTransferResult> {
    let identity = signer.identity();
    let mut statuses = BTreeMap::new();
    let mut jobs = Vec::with_capacity(files.len());

    for file in files {
        let mut status = DeploymentFileStatus::pending(file, servers, relays);
        if servers.is_empty() {
            status.fail("no servers configured");
        } else {
            match signer.sign(&identity, &file.path, &file.sha256).await {
                Ok(announcement) => {
                    status.announcement = Some(announcement.clone());
                    jobs.push(TransferJob {
                        file: file.clone(),
                        announcement,
                    });
                }
                Err(err) => status.fail(format!("signing failed: {err}")),
            }
        }
        statuses.insert(file.path.clone(), status);
    }

    let ctx = TransferContext {
        root: root.to_path_buf(),
        uploader,
        signer,
        cancel: None,
    };
    let mut tracker = TransferTracker::new(&jobs, servers.len());
    let (mut set, mut events) = spawn_transfers(&jobs, servers, concurrency, &ctx);

    while let Some(event) = events.recv().await {
        if tracker.apply(&mut statuses, event) {
            if let Some(report) = on_progress {
                report(Progress::new(tracker.processed(), tracker.total()));
            }
        }
    }
    drain(&mut set).await;
    tracker.abandon_unsettled(&mut statuses);

    files
        .iter()
        .filter_map(|file| statuses.remove(&file.path))
        .map(|status| FileTransferResult { status })
        .collect()
}
