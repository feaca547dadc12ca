//! Shared test utilities for the fabric-deploy workspace.
//!
//! This crate provides standardised fixtures so crate test suites do not
//! each grow their own fakes. It is a dev-dependency only, never published.
//!
//! # Modules
//!
//! - [`fabric`]: [`FakeFabric`], an in-memory relay and server network
//! - [`site`]: [`TestSite`] temporary site directories and [`DeployHarness`]

pub mod fabric;
pub mod site;

pub use fabric::{Call, FakeFabric, UploadGate};
pub use site::{DeployHarness, TestSite};

/// Install a fmt subscriber filtered by `RUST_LOG`.
///
/// Safe to call from every test; only the first call installs.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
