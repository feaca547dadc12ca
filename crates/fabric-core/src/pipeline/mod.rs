//! Deployment runs: sign, transfer, publish
//!
//! [`DeploymentPipeline`] owns the run lifecycle. [`transfer::transfer`]
//! exposes the sign-and-store stage on its own for callers that manage
//! publishing themselves.

mod engine;
mod state;
pub mod transfer;

pub use engine::DeploymentPipeline;
pub use state::{
    DeployPhase, DeploymentContext, DeploymentStats, PUBLISHED_PROGRESS, SIGNED_PROGRESS,
    upload_progress,
};
pub use transfer::{FileTransferResult, transfer};
