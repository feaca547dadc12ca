//! [`TestSite`] temporary site directories and the [`DeployHarness`]
//! wiring a site to a [`FakeFabric`].

use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};

use fabric_core::context::{
    ConfigurationLoader, Context, ContextStore, ContextType, DeploymentLoader, IdentityLoader,
    OperationsLoader, RemoteDiscoveryLoader, Subscription,
};
use fabric_core::model::LocalFile;
use fabric_core::operations::OperationRegistry;
use fabric_core::pipeline::{DeploymentContext, DeploymentPipeline};
use tempfile::TempDir;

use crate::fabric::FakeFabric;

/// A temporary site root plus an empty global config directory.
pub struct TestSite {
    temp_dir: TempDir,
    global_dir: TempDir,
}

impl Default for TestSite {
    fn default() -> Self {
        Self::new()
    }
}

impl TestSite {
    pub fn new() -> Self {
        Self {
            temp_dir: TempDir::new().unwrap(),
            global_dir: TempDir::new().unwrap(),
        }
    }

    pub fn root(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Directory standing in for the user's global config directory.
    pub fn global_config_dir(&self) -> &Path {
        self.global_dir.path()
    }

    /// Write a site file and return its expected [`LocalFile`].
    pub fn write(&self, path: &str, content: &str) -> LocalFile {
        let full = self.root().join(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&full, content).unwrap();
        LocalFile::new(
            path,
            content.len() as u64,
            fabric_fs::compute_bytes_digest(content.as_bytes()),
        )
    }

    /// Write `.fabric/config.toml`.
    pub fn configure(&self, toml: &str) {
        let dir = self.root().join(".fabric");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("config.toml"), toml).unwrap();
    }

    /// Write `.fabricignore`.
    pub fn ignore(&self, rules: &str) {
        fs::write(self.root().join(".fabricignore"), rules).unwrap();
    }
}

/// A site, a fake fabric and a fully wired store and pipeline.
pub struct DeployHarness {
    pub site: TestSite,
    pub fabric: FakeFabric,
    pub registry: OperationRegistry,
    pub store: ContextStore,
    pub pipeline: DeploymentPipeline,
}

impl DeployHarness {
    /// Harness whose site is configured with `config`.
    pub fn new(config: &str) -> Self {
        Self::with_fabric(config, FakeFabric::new(), true)
    }

    /// Harness whose collaborators have no signer.
    pub fn without_signer(config: &str) -> Self {
        Self::with_fabric(config, FakeFabric::new(), false)
    }

    fn with_fabric(config: &str, fabric: FakeFabric, signer: bool) -> Self {
        let site = TestSite::new();
        site.configure(config);
        let registry = OperationRegistry::new();
        let collaborators = if signer {
            fabric.collaborators()
        } else {
            fabric.collaborators_without_signer()
        };

        let store = ContextStore::new()
            .with_loader(Arc::new(
                ConfigurationLoader::new(site.root()).with_global_config_dir(site.global_config_dir()),
            ))
            .with_loader(Arc::new(IdentityLoader::new(collaborators.signer.clone())))
            .with_loader(Arc::new(RemoteDiscoveryLoader::new(collaborators.clone(), site.root())))
            .with_loader(Arc::new(DeploymentLoader::new(collaborators.clone(), site.root())))
            .with_loader(Arc::new(OperationsLoader::new(registry.clone())));
        let pipeline = DeploymentPipeline::new(store.clone(), registry.clone(), collaborators, site.root());

        Self {
            site,
            fabric,
            registry,
            store,
            pipeline,
        }
    }

    /// Current deployment context payload.
    pub fn deployment(&self) -> Option<DeploymentContext> {
        self.store
            .get(ContextType::Deployment)
            .and_then(|ctx| ctx.deployment().cloned())
    }

    /// Record every deployment snapshot published from now on.
    pub fn record_deployments(&self) -> (Subscription, Arc<Mutex<Vec<Context>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let sub = self.store.subscribe(ContextType::Deployment, move |ctx| {
            sink.lock().unwrap().push(ctx.clone());
        });
        (sub, seen)
    }
}
