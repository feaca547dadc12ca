//! Loaders that produce each context type

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use fabric_fs::NormalizedPath;

use super::types::{
    ConfigurationContext, ContextPayload, ContextType, IdentityContext, OperationsContext,
    RemoteDiscoveryContext,
};
use super::ContextStore;
use crate::collaborators::{AnnouncementSigner, Collaborators, Progress, ProgressFn, RelayOptions};
use crate::config::{ConfigResolver, DeployConfig};
use crate::model::{DeploymentFileStatus, Identity, RemoteFileRecord};
use crate::operations::OperationRegistry;
use crate::pipeline::{DeployPhase, DeploymentContext};
use crate::propagation::{self, FilePresence};
use crate::reconcile::{self, index_remote};
use crate::sync_status::{self, SyncSubject, SyncSummary};
use crate::{Error, Result};

/// Produces the payload for one context type.
#[async_trait]
pub trait ContextLoader: Send + Sync {
    fn context_type(&self) -> ContextType;

    /// Build a fresh payload. Loaders may read other contexts from `store`
    /// but never write to it.
    async fn load(&self, store: &ContextStore, on_progress: Option<&ProgressFn>) -> Result<ContextPayload>;
}

fn loaded_config(store: &ContextStore) -> Option<DeployConfig> {
    store
        .get(ContextType::Configuration)
        .filter(|ctx| ctx.is_loaded())
        .and_then(|ctx| ctx.configuration().map(|c| c.config.clone()))
}

/// The identity context, falling back to asking the signer directly.
fn resolve_identity(store: &ContextStore, signer: Option<&Arc<dyn AnnouncementSigner>>) -> Result<Identity> {
    if let Some(identity) = store
        .get(ContextType::Identity)
        .filter(|ctx| ctx.is_loaded())
        .and_then(|ctx| ctx.identity().map(|i| i.identity.clone()))
    {
        return Ok(identity);
    }
    signer
        .map(|s| s.identity())
        .ok_or_else(|| Error::ContextUnavailable {
            context: ContextType::Identity,
            reason: "no signer configured".to_string(),
        })
}

async fn resolve_relays(
    collaborators: &Collaborators,
    config: Option<&DeployConfig>,
    identity: &Identity,
) -> Result<Vec<String>> {
    if let Some(config) = config.filter(|c| !c.relays.is_empty()) {
        return Ok(config.relays.clone());
    }
    Ok(collaborators
        .relay_resolver
        .resolve_relays(&RelayOptions {
            configured: Vec::new(),
            identity_key: Some(identity.public_key.clone()),
        })
        .await?)
}

/// Resolves the layered deploy configuration for a site root.
#[derive(Debug, Clone)]
pub struct ConfigurationLoader {
    root: PathBuf,
    global_config_dir: Option<PathBuf>,
}

impl ConfigurationLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            global_config_dir: None,
        }
    }

    pub fn with_global_config_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.global_config_dir = Some(dir.into());
        self
    }
}

#[async_trait]
impl ContextLoader for ConfigurationLoader {
    fn context_type(&self) -> ContextType {
        ContextType::Configuration
    }

    async fn load(&self, _store: &ContextStore, _on_progress: Option<&ProgressFn>) -> Result<ContextPayload> {
        let root = NormalizedPath::new(&self.root);
        let resolver = match &self.global_config_dir {
            Some(dir) => ConfigResolver::with_global_config_dir(root, dir.clone()),
            None => ConfigResolver::new(root),
        };
        if !resolver.has_config() {
            tracing::debug!(root = %self.root.display(), "No site configuration, using defaults");
        }
        let config = resolver.resolve()?;
        Ok(ContextPayload::Configuration(ConfigurationContext {
            root: self.root.clone(),
            config,
        }))
    }
}

/// Reports the signing identity.
#[derive(Clone, Default)]
pub struct IdentityLoader {
    signer: Option<Arc<dyn AnnouncementSigner>>,
}

impl IdentityLoader {
    pub fn new(signer: Option<Arc<dyn AnnouncementSigner>>) -> Self {
        Self { signer }
    }
}

#[async_trait]
impl ContextLoader for IdentityLoader {
    fn context_type(&self) -> ContextType {
        ContextType::Identity
    }

    async fn load(&self, _store: &ContextStore, _on_progress: Option<&ProgressFn>) -> Result<ContextPayload> {
        let signer = self.signer.as_ref().ok_or(Error::NoSigner)?;
        Ok(ContextPayload::Identity(IdentityContext {
            identity: signer.identity(),
        }))
    }
}

/// Discovers the published files and checks which servers hold them.
///
/// Without a loaded configuration, relays come from the resolver and the
/// availability check is skipped.
#[derive(Debug, Clone)]
pub struct RemoteDiscoveryLoader {
    collaborators: Collaborators,
    root: PathBuf,
}

impl RemoteDiscoveryLoader {
    pub fn new(collaborators: Collaborators, root: impl Into<PathBuf>) -> Self {
        Self {
            collaborators,
            root: root.into(),
        }
    }

    /// Check availability in batches, yielding between them.
    ///
    /// Returns the number of batches whose check failed.
    async fn check_availability(
        &self,
        relays: &[String],
        identity_key: &str,
        files: &mut [RemoteFileRecord],
        config: &DeployConfig,
        on_progress: Option<&ProgressFn>,
    ) -> usize {
        let total = files.len();
        let mut checked = 0;
        let mut failed_batches = 0;
        for batch in files.chunks_mut(config.availability_batch_size.max(1)) {
            let size = batch.len();
            if let Err(err) = self
                .collaborators
                .discovery
                .check_server_availability(relays, identity_key, batch, None, Some(&config.servers))
                .await
            {
                tracing::warn!(error = %err, batch = size, "Server availability check failed");
                failed_batches += 1;
            }
            checked += size;
            if let Some(report) = on_progress {
                report(Progress::new(checked, total).with_message("checking server availability"));
            }
            tokio::task::yield_now().await;
        }
        failed_batches
    }
}

#[async_trait]
impl ContextLoader for RemoteDiscoveryLoader {
    fn context_type(&self) -> ContextType {
        ContextType::RemoteDiscovery
    }

    async fn load(&self, store: &ContextStore, on_progress: Option<&ProgressFn>) -> Result<ContextPayload> {
        let identity = resolve_identity(store, self.collaborators.signer.as_ref())?;
        let config = loaded_config(store);
        let relays = resolve_relays(&self.collaborators, config.as_ref(), &identity).await?;

        let mut files = self
            .collaborators
            .discovery
            .discover_remote_files(&relays, &identity.public_key, on_progress.is_none(), on_progress)
            .await?;

        let (servers, availability_failed_batches) = match &config {
            Some(config) => {
                let failed = self
                    .check_availability(&relays, &identity.public_key, &mut files, config, on_progress)
                    .await;
                (config.servers.clone(), Some(failed))
            }
            None => {
                tracing::debug!("No configuration loaded, skipping server availability check");
                let mut seen: Vec<String> = files.iter().flat_map(|f| f.servers.iter().cloned()).collect();
                seen.sort();
                seen.dedup();
                (seen, None)
            }
        };

        let latest = index_remote(&files);
        let presence: Vec<FilePresence> = latest
            .values()
            .map(|record| FilePresence::from_record(record, &relays, &servers))
            .collect();
        let propagation = propagation::compute(&presence, relays.len(), servers.len());

        let sync = match self.collaborators.files.load_local_files(&self.root).await {
            Ok(local) => sync_status::classify_all(local.iter().map(SyncSubject::local), &files, false),
            Err(err) => {
                tracing::warn!(error = %err, "Could not read local files for sync status");
                BTreeMap::new()
            }
        };

        tracing::info!(
            files = files.len(),
            relays = relays.len(),
            servers = servers.len(),
            strength = %propagation.overall(),
            "Remote discovery complete"
        );

        Ok(ContextPayload::RemoteDiscovery(RemoteDiscoveryContext {
            relays,
            servers,
            files,
            propagation,
            sync_summary: SyncSummary::from_statuses(sync.values()),
            sync,
            availability_checked: availability_failed_batches == Some(0),
            availability_failed_batches: availability_failed_batches.unwrap_or_default(),
        }))
    }
}

/// Builds a deployment plan preview without starting a run.
#[derive(Debug, Clone)]
pub struct DeploymentLoader {
    collaborators: Collaborators,
    root: PathBuf,
}

impl DeploymentLoader {
    pub fn new(collaborators: Collaborators, root: impl Into<PathBuf>) -> Self {
        Self {
            collaborators,
            root: root.into(),
        }
    }

    /// Relays and remote records when no discovery context is loaded.
    ///
    /// Failures degrade to an empty remote set.
    async fn discover_directly(
        &self,
        store: &ContextStore,
        config: Option<&DeployConfig>,
        on_progress: Option<&ProgressFn>,
    ) -> (Vec<String>, Vec<RemoteFileRecord>) {
        let identity = match resolve_identity(store, self.collaborators.signer.as_ref()) {
            Ok(identity) => identity,
            Err(err) => {
                tracing::warn!(error = %err, "Cannot discover remote files for preview");
                return (config.map(|c| c.relays.clone()).unwrap_or_default(), Vec::new());
            }
        };
        let relays = match resolve_relays(&self.collaborators, config, &identity).await {
            Ok(relays) => relays,
            Err(err) => {
                tracing::warn!(error = %err, "Relay resolution failed for preview");
                return (Vec::new(), Vec::new());
            }
        };
        match self
            .collaborators
            .discovery
            .discover_remote_files(&relays, &identity.public_key, true, on_progress)
            .await
        {
            Ok(files) => (relays, files),
            Err(err) => {
                tracing::warn!(error = %err, "Remote discovery failed for preview");
                (relays, Vec::new())
            }
        }
    }
}

#[async_trait]
impl ContextLoader for DeploymentLoader {
    fn context_type(&self) -> ContextType {
        ContextType::Deployment
    }

    async fn load(&self, store: &ContextStore, on_progress: Option<&ProgressFn>) -> Result<ContextPayload> {
        let config = loaded_config(store);
        let discovered = store
            .get(ContextType::RemoteDiscovery)
            .filter(|ctx| ctx.is_loaded())
            .and_then(|ctx| ctx.remote_discovery().map(|d| (d.relays.clone(), d.files.clone())));
        let (relays, remote) = match discovered {
            Some(found) => found,
            None => self.discover_directly(store, config.as_ref(), on_progress).await,
        };
        let servers = config.map(|c| c.servers).unwrap_or_default();

        let local = self.collaborators.files.load_local_files(&self.root).await?;
        let plan = reconcile::compare(&local, &remote);
        let by_path = index_remote(&remote);

        let mut files = BTreeMap::new();
        for file in &plan.to_transfer {
            files.insert(file.path.clone(), DeploymentFileStatus::pending(file, &servers, &relays));
        }
        for file in &plan.existing {
            let record = by_path.get(file.path.as_str()).copied();
            files.insert(
                file.path.clone(),
                DeploymentFileStatus::already_deployed(file, record, &servers, &relays),
            );
        }

        let preview = DeploymentContext::derive(DeployPhase::Idle, &relays, &servers, &files, &remote)
            .with_plan(plan.summary());
        Ok(ContextPayload::Deployment(Box::new(preview)))
    }
}

/// Snapshots the operation registry.
#[derive(Debug, Clone)]
pub struct OperationsLoader {
    registry: OperationRegistry,
}

impl OperationsLoader {
    pub fn new(registry: OperationRegistry) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl ContextLoader for OperationsLoader {
    fn context_type(&self) -> ContextType {
        ContextType::Operations
    }

    async fn load(&self, _store: &ContextStore, _on_progress: Option<&ProgressFn>) -> Result<ContextPayload> {
        Ok(ContextPayload::Operations(OperationsContext {
            operations: self.registry.snapshot(),
        }))
    }
}
