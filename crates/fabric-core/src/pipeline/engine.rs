//! Deployment run driver
//!
//! A run moves through preparing, signing, uploading and publishing. The
//! driver task is the only writer of the per-file statuses; after every
//! change it republishes a freshly derived [`DeploymentContext`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use tokio::task::JoinHandle;

use super::state::{
    DeployPhase, DeploymentContext, DeploymentStats, PUBLISHED_PROGRESS, SIGNED_PROGRESS,
    upload_progress,
};
use super::transfer::{TransferContext, TransferJob, TransferTracker, drain, spawn_transfers};
use crate::collaborators::{
    AnnouncementSigner, Collaborators, DisplaySink, PublishOutcome, RelayOptions, TracingSink,
};
use crate::config::DeployConfig;
use crate::context::{Context, ContextPayload, ContextStatus, ContextStore, ContextType, OperationsContext};
use crate::model::{
    DeploymentFileStatus, FileStatus, Identity, LocalFile, RelayPublishStatus, RemoteFileRecord,
    SignedAnnouncement,
};
use crate::operations::{CancelFlag, Operation, OperationKind, OperationRegistry, OperationStatus};
use crate::reconcile::{self, PlanSummary, index_remote};
use crate::{Error, Result};

/// Runs deployments of one site root.
pub struct DeploymentPipeline {
    store: ContextStore,
    registry: OperationRegistry,
    collaborators: Collaborators,
    root: PathBuf,
    sink: Arc<dyn DisplaySink>,
    runs: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
}

impl DeploymentPipeline {
    pub fn new(
        store: ContextStore,
        registry: OperationRegistry,
        collaborators: Collaborators,
        root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            registry,
            collaborators,
            root: root.into(),
            sink: Arc::new(TracingSink),
            runs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Route collaborator status lines to `sink` instead of the log.
    pub fn with_display_sink(mut self, sink: Arc<dyn DisplaySink>) -> Self {
        self.sink = sink;
        self
    }

    fn lock_runs(&self) -> MutexGuard<'_, HashMap<String, JoinHandle<()>>> {
        self.runs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start a deployment run in the background.
    ///
    /// Returns the operation id immediately. Progress and results are
    /// published to the deployment and operations contexts.
    ///
    /// # Errors
    ///
    /// [`Error::AlreadyRunning`] while an earlier run's driver is still
    /// working, and [`Error::Join`] when called outside a tokio runtime.
    pub fn start(&self) -> Result<String> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| Error::Join(e.to_string()))?;

        let mut runs = self.lock_runs();
        runs.retain(|_, handle| !handle.is_finished());
        if let Some(id) = runs.keys().next() {
            return Err(Error::AlreadyRunning { id: id.clone() });
        }

        let (id, cancel) = self.registry.create(OperationKind::Deploy, true);
        self.registry.start(&id);
        let run = Run::new(id.clone(), cancel, self);
        runs.insert(id.clone(), runtime.spawn(supervise(run)));
        drop(runs);

        publish_operations(&self.store, &self.registry);
        tracing::info!(operation_id = %id, root = %self.root.display(), "Deployment started");
        Ok(id)
    }

    /// Wait for a run to finish and return its final operation record.
    ///
    /// # Errors
    ///
    /// [`Error::OperationNotFound`] if the id is unknown.
    pub async fn join(&self, id: &str) -> Result<Operation> {
        let handle = self.lock_runs().remove(id);
        if let Some(handle) = handle {
            handle.await.map_err(|e| Error::Join(e.to_string()))?;
        }
        self.registry.get(id).ok_or_else(|| Error::OperationNotFound { id: id.to_string() })
    }

    /// Start a run and wait for it.
    pub async fn deploy(&self) -> Result<Operation> {
        let id = self.start()?;
        self.join(&id).await
    }

    /// Request cancellation of a run.
    ///
    /// The operation becomes cancelled at once. The driver stops submitting
    /// new work, records uploads already in flight, and skips publishing.
    ///
    /// # Errors
    ///
    /// [`Error::OperationNotFound`] or [`Error::NotCancelable`], in which
    /// case nothing changes.
    pub fn cancel(&self, id: &str) -> Result<()> {
        self.registry.cancel(id)?;
        publish_operations(&self.store, &self.registry);
        Ok(())
    }

    pub fn registry(&self) -> &OperationRegistry {
        &self.registry
    }

    pub fn store(&self) -> &ContextStore {
        &self.store
    }
}

fn publish_operations(store: &ContextStore, registry: &OperationRegistry) {
    store.publish(ContextPayload::Operations(OperationsContext {
        operations: registry.snapshot(),
    }));
}

/// Drive a run and turn any escaping error or panic into a failed run.
async fn supervise(run: Run) {
    let id = run.id.clone();
    let store = run.store.clone();
    let registry = run.registry.clone();

    let message = match tokio::spawn(run.execute()).await {
        Ok(Ok(())) => return,
        Ok(Err(err)) => err.to_string(),
        Err(err) if err.is_panic() => "deployment task panicked".to_string(),
        Err(err) => err.to_string(),
    };

    // A cancelled operation stays cancelled even if the run errors afterwards
    let cancelled = registry.fail(&id, message.clone()).is_none()
        && registry
            .get(&id)
            .is_some_and(|op| op.status == OperationStatus::Cancelled);
    let (phase, status) = if cancelled {
        tracing::warn!(operation_id = %id, error = %message, "Cancelled deployment stopped with an error");
        (DeployPhase::Cancelled, ContextStatus::Loaded)
    } else {
        tracing::error!(operation_id = %id, error = %message, "Deployment failed");
        (DeployPhase::Failed, ContextStatus::Error)
    };

    let mut deployment = store
        .get(ContextType::Deployment)
        .and_then(|ctx| ctx.deployment().cloned())
        .filter(|ctx| ctx.operation_id.as_deref() == Some(id.as_str()))
        .unwrap_or_else(|| DeploymentContext::derive(phase, &[], &[], &BTreeMap::new(), &[]).with_operation(&id));
    deployment.phase = phase;
    deployment.error = Some(message.clone());
    store.replace(Context {
        error: (!cancelled).then_some(message),
        ..Context::new(
            ContextType::Deployment,
            status,
            Some(ContextPayload::Deployment(Box::new(deployment))),
        )
    });
    publish_operations(&store, &registry);
}

/// Inputs settled by the preparing stage.
struct Prepared {
    config: DeployConfig,
    signer: Arc<dyn AnnouncementSigner>,
    to_transfer: Vec<LocalFile>,
    to_delete: Vec<RemoteFileRecord>,
}

/// State owned by one run's driver task.
struct Run {
    id: String,
    cancel: CancelFlag,
    store: ContextStore,
    registry: OperationRegistry,
    collaborators: Collaborators,
    root: PathBuf,
    sink: Arc<dyn DisplaySink>,
    started: Instant,
    phase: DeployPhase,
    progress: u8,
    relays: Vec<String>,
    servers: Vec<String>,
    files: BTreeMap<String, DeploymentFileStatus>,
    remote: Vec<RemoteFileRecord>,
    plan: PlanSummary,
    stats: DeploymentStats,
}

impl Run {
    fn new(id: String, cancel: CancelFlag, pipeline: &DeploymentPipeline) -> Self {
        Self {
            id,
            cancel,
            store: pipeline.store.clone(),
            registry: pipeline.registry.clone(),
            collaborators: pipeline.collaborators.clone(),
            root: pipeline.root.clone(),
            sink: Arc::clone(&pipeline.sink),
            started: Instant::now(),
            phase: DeployPhase::Preparing,
            progress: 0,
            relays: Vec::new(),
            servers: Vec::new(),
            files: BTreeMap::new(),
            remote: Vec::new(),
            plan: PlanSummary::default(),
            stats: DeploymentStats::default(),
        }
    }

    async fn execute(mut self) -> Result<()> {
        self.enter(DeployPhase::Preparing);
        let Some(prepared) = self.prepare().await? else {
            tracing::info!(operation_id = %self.id, "Nothing to deploy");
            self.finish(DeployPhase::Completed);
            return Ok(());
        };

        self.enter(DeployPhase::Signing);
        let jobs = self.sign(&prepared).await;
        if self.cancel.is_cancelled() {
            self.finish(DeployPhase::Cancelled);
            return Ok(());
        }
        self.advance(SIGNED_PROGRESS, "signed");

        self.enter(DeployPhase::Uploading);
        self.upload(&prepared, &jobs).await;
        if self.cancel.is_cancelled() {
            self.finish(DeployPhase::Cancelled);
            return Ok(());
        }

        self.enter(DeployPhase::Publishing);
        self.publish(&prepared).await;
        self.advance(PUBLISHED_PROGRESS, "published");
        if self.cancel.is_cancelled() {
            self.finish(DeployPhase::Cancelled);
            return Ok(());
        }
        self.prune(&prepared).await;
        if self.cancel.is_cancelled() {
            self.finish(DeployPhase::Cancelled);
            return Ok(());
        }
        self.publish_metadata(&prepared).await;
        self.advance(100, "metadata published");

        self.finish(DeployPhase::Completed);
        Ok(())
    }

    fn enter(&mut self, phase: DeployPhase) {
        tracing::debug!(operation_id = %self.id, %phase, "Entering phase");
        self.phase = phase;
        self.publish_state();
    }

    /// Raise run progress. Ignored by the registry once the operation is
    /// terminal.
    fn advance(&mut self, progress: u8, message: &str) {
        self.progress = self.progress.max(progress);
        self.registry.set_progress(&self.id, self.progress, Some(message));
        publish_operations(&self.store, &self.registry);
        self.publish_state();
    }

    fn publish_state(&self) {
        let ctx = DeploymentContext::derive(self.phase, &self.relays, &self.servers, &self.files, &self.remote)
            .with_operation(&self.id)
            .with_plan(self.plan)
            .with_progress(self.progress)
            .with_stats(self.stats);
        self.store.publish(ContextPayload::Deployment(Box::new(ctx)));
    }

    fn finish(&mut self, phase: DeployPhase) {
        self.stats.failed_files = self.files.values().filter(|s| s.is_failed()).count();
        self.stats.duration = self.started.elapsed();

        let phase = match phase {
            DeployPhase::Completed => match self.registry.complete(&self.id) {
                Some(_) => {
                    self.progress = 100;
                    DeployPhase::Completed
                }
                None => match self.registry.get(&self.id).map(|op| op.status) {
                    Some(OperationStatus::Cancelled) => DeployPhase::Cancelled,
                    _ => DeployPhase::Completed,
                },
            },
            other => other,
        };
        self.phase = phase;
        publish_operations(&self.store, &self.registry);
        self.publish_state();

        tracing::info!(
            operation_id = %self.id,
            %phase,
            uploaded = self.stats.uploaded_files,
            skipped = self.stats.skipped_files,
            failed = self.stats.failed_files,
            published_events = self.stats.published_events,
            failed_events = self.stats.failed_events,
            deleted_events = self.stats.deleted_events,
            duration_ms = self.stats.duration.as_millis() as u64,
            "Deployment finished"
        );
    }

    async fn configuration(&self) -> Result<DeployConfig> {
        let loaded = self
            .store
            .get(ContextType::Configuration)
            .is_some_and(|ctx| ctx.is_loaded());
        if !loaded {
            self.store.load(ContextType::Configuration, None).await;
        }

        let unavailable = |reason: String| Error::ContextUnavailable {
            context: ContextType::Configuration,
            reason,
        };
        let ctx = self
            .store
            .get(ContextType::Configuration)
            .ok_or_else(|| unavailable("not loaded".to_string()))?;
        match ctx.configuration() {
            Some(config) if ctx.is_loaded() => Ok(config.config.clone()),
            _ => Err(unavailable(
                ctx.error.clone().unwrap_or_else(|| "not loaded".to_string()),
            )),
        }
    }

    async fn resolve_relays(&self, config: &DeployConfig, identity: &Identity) -> Result<Vec<String>> {
        if !config.relays.is_empty() {
            return Ok(config.relays.clone());
        }
        let relays = self
            .collaborators
            .relay_resolver
            .resolve_relays(&RelayOptions {
                configured: Vec::new(),
                identity_key: Some(identity.public_key.clone()),
            })
            .await?;
        if relays.is_empty() {
            tracing::warn!(operation_id = %self.id, "No relays resolved; announcements cannot be published");
        }
        Ok(relays)
    }

    fn remote_records(&self) -> Vec<RemoteFileRecord> {
        match self.store.get(ContextType::RemoteDiscovery) {
            Some(ctx) if ctx.is_loaded() => ctx
                .remote_discovery()
                .map(|discovery| discovery.files.clone())
                .unwrap_or_default(),
            _ => {
                tracing::warn!(
                    operation_id = %self.id,
                    "Remote discovery not loaded; treating every file as new"
                );
                Vec::new()
            }
        }
    }

    async fn prepare(&mut self) -> Result<Option<Prepared>> {
        let config = self.configuration().await?;
        let signer = self.collaborators.signer.clone().ok_or(Error::NoSigner)?;
        if config.servers.is_empty() {
            return Err(Error::NoServers);
        }
        self.servers = config.servers.clone();
        self.relays = self.resolve_relays(&config, &signer.identity()).await?;

        let local = self.collaborators.files.load_local_files(&self.root).await?;
        let mut seen = HashSet::with_capacity(local.len());
        if let Some(duplicate) = local.iter().find(|f| !seen.insert(f.path.as_str())) {
            return Err(Error::DuplicatePath {
                path: duplicate.path.clone(),
            });
        }

        self.remote = self.remote_records();
        let plan = reconcile::compare(&local, &self.remote);
        self.plan = plan.summary();

        let by_path = index_remote(&self.remote);
        for file in &plan.to_transfer {
            self.files.insert(
                file.path.clone(),
                DeploymentFileStatus::pending(file, &self.servers, &self.relays),
            );
        }
        for file in &plan.existing {
            let record = by_path.get(file.path.as_str()).copied();
            self.files.insert(
                file.path.clone(),
                DeploymentFileStatus::already_deployed(file, record, &self.servers, &self.relays),
            );
        }
        self.stats.skipped_files = plan.existing.len();
        self.publish_state();

        tracing::info!(
            operation_id = %self.id,
            to_transfer = self.plan.to_transfer,
            existing = self.plan.existing,
            to_delete = self.plan.to_delete,
            servers = self.servers.len(),
            relays = self.relays.len(),
            "Deployment planned"
        );

        let prune = config.purge && !plan.to_delete.is_empty();
        if plan.to_transfer.is_empty() && !prune && !config.publish.any() {
            return Ok(None);
        }
        Ok(Some(Prepared {
            config,
            signer,
            to_transfer: plan.to_transfer,
            to_delete: plan.to_delete,
        }))
    }

    async fn sign(&mut self, prepared: &Prepared) -> Vec<TransferJob> {
        let identity = prepared.signer.identity();
        let mut jobs = Vec::with_capacity(prepared.to_transfer.len());

        for file in &prepared.to_transfer {
            if self.cancel.is_cancelled() {
                tracing::info!(operation_id = %self.id, "Cancelled during signing");
                break;
            }
            let signed = prepared.signer.sign(&identity, &file.path, &file.sha256).await;
            let Some(status) = self.files.get_mut(&file.path) else {
                continue;
            };
            match signed {
                Ok(announcement) => {
                    status.announcement = Some(announcement.clone());
                    jobs.push(TransferJob {
                        file: file.clone(),
                        announcement,
                    });
                }
                Err(err) => {
                    tracing::warn!(operation_id = %self.id, path = %file.path, error = %err, "Signing failed");
                    status.fail(format!("signing failed: {err}"));
                }
            }
            self.publish_state();
        }
        jobs
    }

    async fn upload(&mut self, prepared: &Prepared, jobs: &[TransferJob]) {
        let ctx = TransferContext {
            root: self.root.clone(),
            uploader: Arc::clone(&self.collaborators.uploader),
            signer: Arc::clone(&prepared.signer),
            cancel: Some(self.cancel.clone()),
        };
        let mut tracker = TransferTracker::new(jobs, self.servers.len());
        let (mut set, mut events) = spawn_transfers(jobs, &self.servers, prepared.config.concurrency, &ctx);

        while let Some(event) = events.recv().await {
            if tracker.apply(&mut self.files, event) {
                self.advance(upload_progress(tracker.processed(), tracker.total()), "uploading");
            } else {
                self.publish_state();
            }
        }
        drain(&mut set).await;
        tracker.abandon_unsettled(&mut self.files);

        self.stats.uploaded_files = tracker.uploaded();
        self.advance(upload_progress(tracker.processed(), tracker.total()), "uploaded");
    }

    /// Re-hash a stored file and fail it if the content moved on.
    async fn verify(&mut self, path: &str) {
        let Some(expected) = self.files.get(path).map(|s| s.sha256.clone()) else {
            return;
        };
        let current = self.collaborators.files.rehash(&self.root, path).await;
        let Some(status) = self.files.get_mut(path) else {
            return;
        };
        match current {
            Ok(digest) if digest == expected => {}
            Ok(_) => {
                tracing::warn!(operation_id = %self.id, path, "Content changed during deployment");
                status.fail("content changed during deployment");
            }
            Err(err) => {
                tracing::warn!(operation_id = %self.id, path, error = %err, "Could not re-hash file");
                status.fail(format!("content changed during deployment: {err}"));
            }
        }
    }

    async fn publish(&mut self, prepared: &Prepared) {
        let candidates: Vec<String> = prepared
            .to_transfer
            .iter()
            .filter(|file| {
                self.files
                    .get(&file.path)
                    .is_some_and(|s| s.status == FileStatus::Completed && s.announcement.is_some())
            })
            .map(|file| file.path.clone())
            .collect();

        if prepared.config.verify_before_publish {
            for path in &candidates {
                self.verify(path).await;
            }
        }

        let mut announcements = Vec::with_capacity(candidates.len());
        for path in &candidates {
            let Some(status) = self.files.get_mut(path) else {
                continue;
            };
            if status.is_failed() {
                continue;
            }
            if let Some(announcement) = &status.announcement {
                announcements.push(announcement.clone());
                status.status = FileStatus::Publishing;
                for entry in status.relays.values_mut() {
                    *entry = RelayPublishStatus::Publishing;
                }
            }
        }
        if announcements.is_empty() {
            return;
        }
        self.publish_state();

        let outcome = if self.relays.is_empty() {
            PublishOutcome::default()
        } else {
            match self
                .collaborators
                .publisher
                .publish_announcements(&self.relays, &announcements)
                .await
            {
                Ok(outcome) => outcome,
                Err(err) => {
                    tracing::warn!(operation_id = %self.id, error = %err, "Publishing announcements failed");
                    PublishOutcome::all_rejected(&self.relays, &err.to_string())
                }
            }
        };
        self.apply_publish_outcome(&announcements, &outcome);
    }

    fn apply_publish_outcome(&mut self, announcements: &[SignedAnnouncement], outcome: &PublishOutcome) {
        for announcement in announcements {
            let Some(status) = self.files.get_mut(&announcement.path) else {
                continue;
            };
            for (relay, entry) in status.relays.iter_mut() {
                *entry = if outcome.accepted.contains(relay) {
                    RelayPublishStatus::Published
                } else {
                    RelayPublishStatus::Failed
                };
            }

            if status.published_relays().next().is_some() {
                status.status = FileStatus::Published;
                self.stats.published_events += 1;
            } else {
                let reasons: Vec<String> = outcome
                    .rejected
                    .iter()
                    .map(|(relay, reason)| format!("{relay}: {reason}"))
                    .collect();
                let error = if reasons.is_empty() {
                    "no relay accepted the announcement".to_string()
                } else {
                    format!("no relay accepted the announcement: {}", reasons.join("; "))
                };
                tracing::warn!(operation_id = %self.id, path = %announcement.path, %error, "Publish failed");
                status.fail(error);
                self.stats.failed_events += 1;
            }
        }
        self.publish_state();
    }

    /// Remove announcements for files deleted locally.
    async fn prune(&mut self, prepared: &Prepared) {
        if !prepared.config.purge || prepared.to_delete.is_empty() {
            return;
        }
        let event_ids: Vec<String> = prepared.to_delete.iter().map(|r| r.event_id.clone()).collect();
        if self.relays.is_empty() {
            tracing::warn!(operation_id = %self.id, count = event_ids.len(), "No relays to purge from");
            self.stats.failed_events += event_ids.len();
            return;
        }

        match self
            .collaborators
            .publisher
            .publish_deletions(&self.relays, &event_ids)
            .await
        {
            Ok(outcome) if !outcome.accepted.is_empty() => {
                tracing::info!(operation_id = %self.id, count = event_ids.len(), "Purged stale announcements");
                self.stats.deleted_events += event_ids.len();
            }
            Ok(outcome) => {
                tracing::warn!(operation_id = %self.id, rejected = ?outcome.rejected, "No relay accepted the deletions");
                self.stats.failed_events += event_ids.len();
            }
            Err(err) => {
                tracing::warn!(operation_id = %self.id, error = %err, "Purge failed");
                self.stats.failed_events += event_ids.len();
            }
        }
        self.publish_state();
    }

    async fn publish_metadata(&mut self, prepared: &Prepared) {
        let flags = prepared.config.publish;
        if !flags.any() {
            return;
        }
        let files: Vec<LocalFile> = self.files.values().map(DeploymentFileStatus::local_file).collect();

        match self
            .collaborators
            .publisher
            .publish_metadata(
                &prepared.config,
                prepared.signer.as_ref(),
                &self.relays,
                self.sink.as_ref(),
                flags,
                &files,
            )
            .await
        {
            Ok(report) => {
                tracing::debug!(operation_id = %self.id, published = report.published, failed = report.failed, "Metadata published");
                self.stats.published_events += report.published;
                self.stats.failed_events += report.failed;
            }
            Err(err) => {
                tracing::warn!(operation_id = %self.id, error = %err, "Metadata publish failed");
                self.stats.failed_events += flags.enabled_count();
            }
        }
        self.publish_state();
    }
}
