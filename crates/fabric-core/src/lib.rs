//! Core deployment layer for Fabric Deploy
//!
//! This crate publishes a static site to a decentralized storage fabric of
//! relays (which carry signed announcements) and blob servers (which store
//! content-addressed files). It provides:
//!
//! - **Reconciliation**: compare local files with discovered remote records
//! - **Sync status**: per-file consistency between local, run and remote state
//! - **Propagation statistics**: coverage and strength grades per network
//! - **Deployment pipeline**: sign, transfer and publish with bounded
//!   concurrency, progress reporting and cooperative cancellation
//! - **Context store**: typed, observable snapshots of each subsystem
//!
//! Network access, signing and local file enumeration are supplied through
//! the traits in [`collaborators`].
//!
//! # Architecture
//!
//! ```text
//!          presentation layer
//!                  |
//!    ContextStore <---- DeploymentPipeline
//!        |                    |
//!     loaders       reconcile / sync_status / propagation
//!        |                    |
//!        +---- collaborators -+
//!                  |
//!              fabric-fs
//! ```
//!
//! # Example
//!
//! ```
//! use fabric_core::model::{LocalFile, RemoteFileRecord};
//! use fabric_core::reconcile;
//!
//! let local = vec![LocalFile::new("a.html", 3, "h1"), LocalFile::new("b.html", 3, "h2")];
//! let remote = vec![RemoteFileRecord::new("a.html", "h1", "ev1")];
//!
//! let plan = reconcile::compare(&local, &remote);
//! assert_eq!(plan.to_transfer.len(), 1);
//! assert_eq!(plan.existing.len(), 1);
//! ```

pub mod collaborators;
pub mod config;
pub mod context;
pub mod error;
pub mod model;
pub mod operations;
pub mod pipeline;
pub mod propagation;
pub mod reconcile;
pub mod sync_status;

pub use collaborators::{
    AnnouncementPublisher, AnnouncementSigner, BlobUploader, Collaborators, DisplaySink,
    FsFileSource, LocalFileSource, MetadataReport, Progress, ProgressFn, PublishOutcome,
    RelayOptions, RelayResolver, RemoteDiscovery, TracingSink, UploadRequest,
};
pub use config::{ConfigResolver, DeployConfig, PublishFlags};
pub use context::{Context, ContextPayload, ContextStatus, ContextStore, ContextType, Subscription};
pub use error::{Error, RemoteError, Result};
pub use model::{
    DeploymentFileStatus, FileStatus, Identity, IdentityKind, LocalFile, RelayPublishStatus,
    RemoteFileRecord, ServerTransferStatus, SignedAnnouncement,
};
pub use operations::{Operation, OperationKind, OperationRegistry, OperationStatus};
pub use pipeline::{DeployPhase, DeploymentContext, DeploymentPipeline, DeploymentStats};
pub use propagation::{PropagationStats, Strength};
pub use reconcile::{PlanSummary, ReconcilePlan};
pub use sync_status::{SyncStatus, SyncSummary};
