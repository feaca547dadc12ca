//! Context types held by the [`ContextStore`](super::ContextStore)

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::DeployConfig;
use crate::model::{Identity, RemoteFileRecord};
use crate::operations::OperationsSnapshot;
use crate::pipeline::DeploymentContext;
use crate::propagation::PropagationStats;
use crate::sync_status::{SyncStatus, SyncSummary};

/// The subsystems tracked by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContextType {
    Identity,
    RemoteDiscovery,
    Configuration,
    Deployment,
    Operations,
}

impl ContextType {
    /// All types in dependency order: each type's loader may read the
    /// types listed before it.
    pub const LOAD_ORDER: [ContextType; 5] = [
        Self::Configuration,
        Self::Identity,
        Self::RemoteDiscovery,
        Self::Deployment,
        Self::Operations,
    ];
}

impl fmt::Display for ContextType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Identity => "identity",
            Self::RemoteDiscovery => "remote-discovery",
            Self::Configuration => "configuration",
            Self::Deployment => "deployment",
            Self::Operations => "operations",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextStatus {
    Pending,
    Loading,
    Loaded,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityContext {
    pub identity: Identity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigurationContext {
    pub root: PathBuf,
    pub config: DeployConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteDiscoveryContext {
    pub relays: Vec<String>,
    /// Servers the propagation figures are measured against
    pub servers: Vec<String>,
    pub files: Vec<RemoteFileRecord>,
    pub propagation: PropagationStats,
    /// Local files classified against `files`
    pub sync: BTreeMap<String, SyncStatus>,
    pub sync_summary: SyncSummary,
    /// Whether server availability was checked for every one of `files`
    pub availability_checked: bool,
    /// Availability batches whose check failed; their files keep the
    /// servers the relays reported
    #[serde(default)]
    pub availability_failed_batches: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationsContext {
    pub operations: OperationsSnapshot,
}

/// Type-specific context data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ContextPayload {
    Identity(IdentityContext),
    RemoteDiscovery(RemoteDiscoveryContext),
    Configuration(ConfigurationContext),
    Deployment(Box<DeploymentContext>),
    Operations(OperationsContext),
}

impl ContextPayload {
    pub fn context_type(&self) -> ContextType {
        match self {
            Self::Identity(_) => ContextType::Identity,
            Self::RemoteDiscovery(_) => ContextType::RemoteDiscovery,
            Self::Configuration(_) => ContextType::Configuration,
            Self::Deployment(_) => ContextType::Deployment,
            Self::Operations(_) => ContextType::Operations,
        }
    }

    /// Whether this is the snapshot of a deployment run still in flight.
    pub fn is_live_run(&self) -> bool {
        matches!(self, Self::Deployment(ctx) if ctx.phase.is_running())
    }
}

/// Snapshot of one subsystem's state.
///
/// Contexts handed to subscribers are shared, read-only snapshots; the
/// store replaces them wholesale on every update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Context {
    pub context_type: ContextType,
    pub status: ContextStatus,
    pub last_updated: DateTime<Utc>,
    pub error: Option<String>,
    pub payload: Option<ContextPayload>,
}

impl Context {
    pub fn new(context_type: ContextType, status: ContextStatus, payload: Option<ContextPayload>) -> Self {
        Self {
            context_type,
            status,
            last_updated: Utc::now(),
            error: None,
            payload,
        }
    }

    pub fn loaded(payload: ContextPayload) -> Self {
        Self::new(payload.context_type(), ContextStatus::Loaded, Some(payload))
    }

    pub fn failed(context_type: ContextType, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::new(context_type, ContextStatus::Error, None)
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.status == ContextStatus::Loaded
    }

    pub fn identity(&self) -> Option<&IdentityContext> {
        match &self.payload {
            Some(ContextPayload::Identity(ctx)) => Some(ctx),
            _ => None,
        }
    }

    pub fn configuration(&self) -> Option<&ConfigurationContext> {
        match &self.payload {
            Some(ContextPayload::Configuration(ctx)) => Some(ctx),
            _ => None,
        }
    }

    pub fn remote_discovery(&self) -> Option<&RemoteDiscoveryContext> {
        match &self.payload {
            Some(ContextPayload::RemoteDiscovery(ctx)) => Some(ctx),
            _ => None,
        }
    }

    pub fn deployment(&self) -> Option<&DeploymentContext> {
        match &self.payload {
            Some(ContextPayload::Deployment(ctx)) => Some(ctx),
            _ => None,
        }
    }

    pub fn operations(&self) -> Option<&OperationsContext> {
        match &self.payload {
            Some(ContextPayload::Operations(ctx)) => Some(ctx),
            _ => None,
        }
    }

    /// JSON view for presentation layers.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}
