//! [`FakeFabric`]: every collaborator trait over shared in-memory state.
//!
//! Relays hold the announcements published to them and servers hold the
//! digests uploaded to them, so discovery after a deploy sees what the
//! deploy wrote. Failures are injected per server, relay, path or call.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use fabric_core::collaborators::{
    AnnouncementPublisher, AnnouncementSigner, BlobUploader, Collaborators, DisplaySink,
    FsFileSource, LocalFileSource, MetadataReport, Progress, ProgressFn, PublishOutcome,
    RelayOptions, RelayResolver, RemoteDiscovery, UploadRequest,
};
use fabric_core::config::{DeployConfig, PublishFlags};
use fabric_core::model::{Identity, IdentityKind, LocalFile, RemoteFileRecord, SignedAnnouncement};
use fabric_core::RemoteError;
use tokio::sync::Semaphore;

/// A recorded collaborator call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    ResolveRelays,
    Discover { relays: usize },
    CheckAvailability { files: usize },
    Sign { path: String },
    Upload { path: String, server: String },
    PublishAnnouncements { count: usize },
    PublishMetadata { flags: PublishFlags },
    PublishDeletions { event_ids: Vec<String> },
}

/// Holds uploads until permits are released.
#[derive(Debug, Clone)]
pub struct UploadGate(Arc<Semaphore>);

impl UploadGate {
    /// Let `n` more uploads through.
    pub fn release(&self, n: usize) {
        self.0.add_permits(n);
    }

    /// Let every upload through from now on.
    pub fn open(&self) {
        self.0.add_permits(1 << 20);
    }
}

#[derive(Default)]
struct FabricState {
    resolved_relays: Vec<String>,
    /// Relay to announcements it holds
    relay_events: BTreeMap<String, Vec<SignedAnnouncement>>,
    /// Server to digests it holds
    blobs: BTreeMap<String, BTreeSet<String>>,
    seeded: Vec<RemoteFileRecord>,
    failing_servers: BTreeSet<String>,
    failing_relays: BTreeSet<String>,
    failing_uploads: BTreeSet<String>,
    refused_paths: BTreeSet<String>,
    tampered_paths: BTreeSet<String>,
    extra_local: Vec<LocalFile>,
    publish_error: Option<RemoteError>,
    metadata_error: Option<RemoteError>,
    discovery_error: Option<RemoteError>,
    /// Availability check index to the error it returns
    availability_errors: BTreeMap<usize, RemoteError>,
    availability_checks: usize,
    deletions_supported: bool,
    panic_on_sign: bool,
    gate: Option<UploadGate>,
    next_event: u64,
    calls: Vec<Call>,
    messages: Vec<String>,
}

/// In-memory relay and server network.
///
/// Cloning yields another handle to the same network.
#[derive(Clone)]
pub struct FakeFabric {
    identity: Identity,
    state: Arc<Mutex<FabricState>>,
}

impl Default for FakeFabric {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeFabric {
    pub fn new() -> Self {
        Self {
            identity: Identity::new("npub-test", IdentityKind::LocalKey),
            state: Arc::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FabricState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Collaborators backed by this fabric and the real filesystem.
    pub fn collaborators(&self) -> Collaborators {
        let fabric = Arc::new(self.clone());
        Collaborators {
            relay_resolver: fabric.clone(),
            discovery: fabric.clone(),
            signer: Some(fabric.clone()),
            uploader: fabric.clone(),
            publisher: fabric.clone(),
            files: fabric,
        }
    }

    /// Collaborators with no signer available.
    pub fn collaborators_without_signer(&self) -> Collaborators {
        Collaborators {
            signer: None,
            ..self.collaborators()
        }
    }

    // Failure injection and seeding

    /// Relays returned by relay resolution when none are configured.
    pub fn resolve_relays_to(&self, relays: &[&str]) -> &Self {
        self.lock().resolved_relays = relays.iter().map(|r| r.to_string()).collect();
        self
    }

    pub fn fail_server(&self, server: &str) -> &Self {
        self.lock().failing_servers.insert(server.to_string());
        self
    }

    pub fn fail_relay(&self, relay: &str) -> &Self {
        self.lock().failing_relays.insert(relay.to_string());
        self
    }

    /// Fail every upload of `path`, on all servers.
    pub fn fail_upload(&self, path: &str) -> &Self {
        self.lock().failing_uploads.insert(path.to_string());
        self
    }

    pub fn refuse_signing(&self, path: &str) -> &Self {
        self.lock().refused_paths.insert(path.to_string());
        self
    }

    /// Report a different digest for `path` when it is re-hashed.
    pub fn tamper(&self, path: &str) -> &Self {
        self.lock().tampered_paths.insert(path.to_string());
        self
    }

    /// Append a file to every local listing, in addition to the disk scan.
    pub fn add_local_file(&self, file: LocalFile) -> &Self {
        self.lock().extra_local.push(file);
        self
    }

    pub fn fail_publish(&self, error: RemoteError) -> &Self {
        self.lock().publish_error = Some(error);
        self
    }

    pub fn fail_metadata(&self, error: RemoteError) -> &Self {
        self.lock().metadata_error = Some(error);
        self
    }

    pub fn fail_discovery(&self, error: RemoteError) -> &Self {
        self.lock().discovery_error = Some(error);
        self
    }

    /// Fail the availability check with the given zero-based call index.
    pub fn fail_availability_batch(&self, index: usize, error: RemoteError) -> &Self {
        self.lock().availability_errors.insert(index, error);
        self
    }

    pub fn support_deletions(&self) -> &Self {
        self.lock().deletions_supported = true;
        self
    }

    pub fn panic_on_sign(&self) -> &Self {
        self.lock().panic_on_sign = true;
        self
    }

    /// Add a record that discovery reports as-is.
    pub fn seed_remote(&self, record: RemoteFileRecord) -> &Self {
        self.lock().seeded.push(record);
        self
    }

    /// Place a blob on a server without going through an upload.
    pub fn seed_blob(&self, server: &str, sha256: &str) -> &Self {
        self.lock()
            .blobs
            .entry(server.to_string())
            .or_default()
            .insert(sha256.to_string());
        self
    }

    /// Hold every upload until the returned gate releases it.
    pub fn gate_uploads(&self) -> UploadGate {
        let gate = UploadGate(Arc::new(Semaphore::new(0)));
        self.lock().gate = Some(gate.clone());
        gate
    }

    // Inspection

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    /// Uploads attempted so far, as (path, server).
    pub fn uploads(&self) -> Vec<(String, String)> {
        self.lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                Call::Upload { path, server } => Some((path.clone(), server.clone())),
                _ => None,
            })
            .collect()
    }

    /// Wait until at least `n` uploads have been attempted.
    pub async fn wait_for_uploads(&self, n: usize) {
        while self.uploads().len() < n {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    pub fn stored_on(&self, server: &str, sha256: &str) -> bool {
        self.lock()
            .blobs
            .get(server)
            .is_some_and(|blobs| blobs.contains(sha256))
    }

    pub fn announcements_on(&self, relay: &str) -> Vec<SignedAnnouncement> {
        self.lock().relay_events.get(relay).cloned().unwrap_or_default()
    }

    pub fn messages(&self) -> Vec<String> {
        self.lock().messages.clone()
    }

    fn record(&self, call: Call) {
        self.lock().calls.push(call);
    }
}

#[async_trait]
impl RelayResolver for FakeFabric {
    async fn resolve_relays(&self, options: &RelayOptions) -> Result<Vec<String>, RemoteError> {
        self.record(Call::ResolveRelays);
        if !options.configured.is_empty() {
            return Ok(options.configured.clone());
        }
        Ok(self.lock().resolved_relays.clone())
    }
}

#[async_trait]
impl RemoteDiscovery for FakeFabric {
    async fn discover_remote_files(
        &self,
        relays: &[String],
        identity_key: &str,
        _silent: bool,
        on_progress: Option<&ProgressFn>,
    ) -> Result<Vec<RemoteFileRecord>, RemoteError> {
        self.record(Call::Discover { relays: relays.len() });
        let records = {
            let state = self.lock();
            if let Some(err) = &state.discovery_error {
                return Err(err.clone());
            }

            let mut by_event: BTreeMap<String, RemoteFileRecord> = BTreeMap::new();
            for relay in relays {
                let Some(events) = state.relay_events.get(relay) else {
                    continue;
                };
                for event in events.iter().filter(|e| e.signer == identity_key) {
                    by_event
                        .entry(event.event_id.clone())
                        .or_insert_with(|| {
                            RemoteFileRecord::new(&event.path, &event.sha256, &event.event_id)
                                .with_created_at(event.created_at)
                        })
                        .relays
                        .insert(relay.clone());
                }
            }
            let mut records = state.seeded.clone();
            records.extend(by_event.into_values());
            records
        };

        if let Some(report) = on_progress {
            report(Progress::new(relays.len(), relays.len()).with_message("discovered"));
        }
        Ok(records)
    }

    async fn check_server_availability(
        &self,
        _relays: &[String],
        _identity_key: &str,
        files: &mut [RemoteFileRecord],
        _on_progress: Option<&ProgressFn>,
        known_servers: Option<&[String]>,
    ) -> Result<(), RemoteError> {
        self.record(Call::CheckAvailability { files: files.len() });
        let mut state = self.lock();
        let index = state.availability_checks;
        state.availability_checks += 1;
        if let Some(err) = state.availability_errors.get(&index) {
            return Err(err.clone());
        }
        let servers: Vec<String> = match known_servers {
            Some(known) => known.to_vec(),
            None => state.blobs.keys().cloned().collect(),
        };
        for record in files.iter_mut() {
            for server in &servers {
                let held = !state.failing_servers.contains(server)
                    && state
                        .blobs
                        .get(server)
                        .is_some_and(|blobs| blobs.contains(&record.sha256));
                if held {
                    record.servers.insert(server.clone());
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl AnnouncementSigner for FakeFabric {
    fn identity(&self) -> Identity {
        self.identity.clone()
    }

    async fn sign(&self, identity: &Identity, path: &str, sha256: &str) -> Result<SignedAnnouncement, RemoteError> {
        self.record(Call::Sign {
            path: path.to_string(),
        });
        let mut state = self.lock();
        if state.panic_on_sign {
            drop(state);
            panic!("signer exploded while signing {path}");
        }
        if state.refused_paths.contains(path) {
            return Err(RemoteError::Signing(format!("refused to sign {path}")));
        }
        state.next_event += 1;
        Ok(SignedAnnouncement {
            event_id: format!("ev-{}", state.next_event),
            path: path.to_string(),
            sha256: sha256.to_string(),
            signer: identity.public_key.clone(),
            signature: format!("sig:{path}:{sha256}"),
            created_at: state.next_event as i64,
        })
    }
}

#[async_trait]
impl BlobUploader for FakeFabric {
    async fn upload(&self, request: &UploadRequest, _signer: &dyn AnnouncementSigner) -> Result<(), RemoteError> {
        self.record(Call::Upload {
            path: request.path.clone(),
            server: request.server.clone(),
        });
        let gate = self.lock().gate.clone();
        if let Some(UploadGate(semaphore)) = gate {
            if let Ok(permit) = semaphore.acquire().await {
                permit.forget();
            }
        }

        let mut state = self.lock();
        if state.failing_servers.contains(&request.server) {
            return Err(RemoteError::Network {
                endpoint: request.server.clone(),
                message: "server unavailable".to_string(),
            });
        }
        if state.failing_uploads.contains(&request.path) {
            return Err(RemoteError::Rejected {
                endpoint: request.server.clone(),
                reason: "blob rejected".to_string(),
            });
        }
        state
            .blobs
            .entry(request.server.clone())
            .or_default()
            .insert(request.sha256.clone());
        Ok(())
    }
}

#[async_trait]
impl AnnouncementPublisher for FakeFabric {
    async fn publish_announcements(
        &self,
        relays: &[String],
        announcements: &[SignedAnnouncement],
    ) -> Result<PublishOutcome, RemoteError> {
        self.record(Call::PublishAnnouncements {
            count: announcements.len(),
        });
        let mut state = self.lock();
        if let Some(err) = &state.publish_error {
            return Err(err.clone());
        }
        let mut outcome = PublishOutcome::default();
        for relay in relays {
            if state.failing_relays.contains(relay) {
                outcome.rejected.insert(relay.clone(), "relay offline".to_string());
                continue;
            }
            state
                .relay_events
                .entry(relay.clone())
                .or_default()
                .extend(announcements.iter().cloned());
            outcome.accepted.insert(relay.clone());
        }
        Ok(outcome)
    }

    async fn publish_metadata(
        &self,
        _config: &DeployConfig,
        _signer: &dyn AnnouncementSigner,
        relays: &[String],
        sink: &dyn DisplaySink,
        flags: PublishFlags,
        files: &[LocalFile],
    ) -> Result<MetadataReport, RemoteError> {
        self.record(Call::PublishMetadata { flags });
        let error = self.lock().metadata_error.clone();
        if let Some(err) = error {
            return Err(err);
        }
        let message = format!(
            "published {} metadata events for {} files to {} relays",
            flags.enabled_count(),
            files.len(),
            relays.len()
        );
        sink.message(&message);
        self.lock().messages.push(message);
        Ok(MetadataReport {
            published: flags.enabled_count(),
            failed: 0,
        })
    }

    async fn publish_deletions(&self, relays: &[String], event_ids: &[String]) -> Result<PublishOutcome, RemoteError> {
        self.record(Call::PublishDeletions {
            event_ids: event_ids.to_vec(),
        });
        let mut state = self.lock();
        if !state.deletions_supported {
            return Err(RemoteError::Unsupported("announcement deletion".to_string()));
        }
        let mut outcome = PublishOutcome::default();
        for relay in relays {
            if state.failing_relays.contains(relay) {
                outcome.rejected.insert(relay.clone(), "relay offline".to_string());
                continue;
            }
            if let Some(events) = state.relay_events.get_mut(relay) {
                events.retain(|e| !event_ids.contains(&e.event_id));
            }
            outcome.accepted.insert(relay.clone());
        }
        state.seeded.retain(|r| !event_ids.contains(&r.event_id));
        Ok(outcome)
    }
}

#[async_trait]
impl LocalFileSource for FakeFabric {
    async fn load_local_files(&self, root: &Path) -> fabric_core::Result<Vec<LocalFile>> {
        let mut files = FsFileSource.load_local_files(root).await?;
        files.extend(self.lock().extra_local.iter().cloned());
        Ok(files)
    }

    async fn rehash(&self, root: &Path, path: &str) -> fabric_core::Result<String> {
        if self.lock().tampered_paths.contains(path) {
            return Ok("0".repeat(64));
        }
        FsFileSource.rehash(root, path).await
    }
}
