//! Deployment context payload and run statistics

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::model::{DeploymentFileStatus, RemoteFileRecord};
use crate::propagation::{self, FilePresence, PropagationStats};
use crate::reconcile::{PlanSummary, index_remote};
use crate::sync_status::{self, SyncStatus, SyncSubject, SyncSummary};

/// Progress once every file is signed.
pub const SIGNED_PROGRESS: u8 = 20;
/// Progress once announcements are published.
pub const PUBLISHED_PROGRESS: u8 = 90;
const UPLOAD_SPAN: usize = 60;

/// Run progress for `processed` of `total` files transferred.
///
/// Maps linearly onto `[SIGNED_PROGRESS, SIGNED_PROGRESS + 60]`.
pub fn upload_progress(processed: usize, total: usize) -> u8 {
    if total == 0 {
        return SIGNED_PROGRESS + UPLOAD_SPAN as u8;
    }
    let span = UPLOAD_SPAN * processed.min(total) / total;
    SIGNED_PROGRESS + span as u8
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeployPhase {
    /// Plan preview, no run in progress
    Idle,
    Preparing,
    Signing,
    Uploading,
    Publishing,
    Completed,
    Failed,
    Cancelled,
}

impl DeployPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether a run is between start and a terminal phase.
    pub fn is_running(&self) -> bool {
        !self.is_terminal() && *self != Self::Idle
    }
}

impl fmt::Display for DeployPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Preparing => "preparing",
            Self::Signing => "signing",
            Self::Uploading => "uploading",
            Self::Publishing => "publishing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Counters for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentStats {
    /// Files stored on at least one server by this run
    pub uploaded_files: usize,
    /// Files already replicated before the run
    pub skipped_files: usize,
    pub failed_files: usize,
    /// File and metadata announcements accepted by a relay
    pub published_events: usize,
    pub failed_events: usize,
    /// Stale announcements removed by purge
    pub deleted_events: usize,
    pub duration: Duration,
}

/// Deployment state published to the context store.
///
/// `sync`, `sync_summary` and `propagation` are derived from `files` by
/// [`DeploymentContext::derive`] and never edited directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentContext {
    pub phase: DeployPhase,
    pub operation_id: Option<String>,
    pub relays: Vec<String>,
    pub servers: Vec<String>,
    pub files: BTreeMap<String, DeploymentFileStatus>,
    pub plan: PlanSummary,
    pub progress: u8,
    pub sync: BTreeMap<String, SyncStatus>,
    pub sync_summary: SyncSummary,
    pub propagation: PropagationStats,
    pub stats: DeploymentStats,
    pub error: Option<String>,
}

impl DeploymentContext {
    /// Build a context and compute its derived fields.
    pub fn derive(
        phase: DeployPhase,
        relays: &[String],
        servers: &[String],
        files: &BTreeMap<String, DeploymentFileStatus>,
        remote: &[RemoteFileRecord],
    ) -> Self {
        let by_path = index_remote(remote);
        let run_active = phase.is_running();

        let sync = sync_status::classify_all(
            files.values().map(SyncSubject::from_run),
            remote,
            run_active,
        );
        let presence: Vec<FilePresence> = files
            .values()
            .map(|status| {
                FilePresence::from_run(status, by_path.get(status.path.as_str()).copied(), relays, servers)
            })
            .collect();

        Self {
            phase,
            operation_id: None,
            relays: relays.to_vec(),
            servers: servers.to_vec(),
            files: files.clone(),
            plan: PlanSummary::default(),
            progress: 0,
            sync_summary: SyncSummary::from_statuses(sync.values()),
            sync,
            propagation: propagation::compute(&presence, relays.len(), servers.len()),
            stats: DeploymentStats::default(),
            error: None,
        }
    }

    pub fn with_operation(mut self, id: impl Into<String>) -> Self {
        self.operation_id = Some(id.into());
        self
    }

    pub fn with_plan(mut self, plan: PlanSummary) -> Self {
        self.plan = plan;
        self
    }

    pub fn with_progress(mut self, progress: u8) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_stats(mut self, stats: DeploymentStats) -> Self {
        self.stats = stats;
        self
    }
}
