//! Context store integration tests
//!
//! Exercises the registered loaders against a real site directory and the
//! in-memory network: dependency fallbacks, batched availability checks,
//! subscription delivery and the interaction with a running deployment.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use fabric_core::collaborators::{Progress, ProgressFn};
use fabric_core::context::{Context, ContextStatus, ContextType};
use fabric_core::model::{RemoteFileRecord, ServerTransferStatus};
use fabric_core::pipeline::DeployPhase;
use fabric_core::sync_status::SyncStatus;
use fabric_test_utils::{Call, DeployHarness, init_tracing};
use pretty_assertions::assert_eq;

const SITE_CONFIG: &str = r#"
relays = ["wss://r1", "wss://r2"]
servers = ["https://s1", "https://s2"]
availability_batch_size = 10
"#;

fn harness(config: &str) -> DeployHarness {
    init_tracing();
    let harness = DeployHarness::new(config);
    harness.site.write("index.html", "<h1>home</h1>");
    harness.site.write("about.html", "<h1>about</h1>");
    harness
}

// =============================================================================
// Loading
// =============================================================================

#[tokio::test]
async fn refresh_all_loads_every_context() {
    let harness = harness(SITE_CONFIG);

    harness.store.refresh_all().await;

    for ty in ContextType::LOAD_ORDER {
        assert_eq!(harness.store.status(ty), ContextStatus::Loaded, "{ty} not loaded");
    }
    let identity = harness.store.get(ContextType::Identity).unwrap();
    assert_eq!(identity.identity().unwrap().identity.public_key, "npub-test");

    let preview = harness.deployment().unwrap();
    assert_eq!(preview.phase, DeployPhase::Idle);
    assert_eq!(preview.operation_id, None);
    assert_eq!(preview.plan.to_transfer, 2);
    assert_eq!(preview.sync.get("index.html"), Some(&SyncStatus::Local));

    let json = harness.store.get(ContextType::Deployment).unwrap().to_json();
    assert_eq!(json["status"], "loaded");
    assert_eq!(json["payload"]["type"], "deployment");
}

#[tokio::test]
async fn missing_signer_leaves_identity_in_error() {
    init_tracing();
    let harness = DeployHarness::without_signer(SITE_CONFIG);

    harness.store.refresh_all().await;

    let identity = harness.store.get(ContextType::Identity).unwrap();
    assert_eq!(identity.status, ContextStatus::Error);
    assert!(identity.error.as_deref().unwrap().contains("No signer available"));
    assert_eq!(harness.store.status(ContextType::RemoteDiscovery), ContextStatus::Error);
    // The preview degrades to an empty remote set instead of failing
    assert_eq!(harness.store.status(ContextType::Deployment), ContextStatus::Loaded);
}

#[tokio::test]
async fn discovery_failure_is_surfaced_and_previous_payload_kept() {
    let harness = harness(SITE_CONFIG);
    harness.store.refresh_all().await;
    let before = harness.store.get(ContextType::RemoteDiscovery).unwrap();

    harness.fabric.fail_discovery(fabric_core::RemoteError::Network {
        endpoint: "wss://r1".to_string(),
        message: "timeout".to_string(),
    });
    harness.store.refresh(ContextType::RemoteDiscovery).await;

    let after = harness.store.get(ContextType::RemoteDiscovery).unwrap();
    assert_eq!(after.status, ContextStatus::Error);
    assert!(after.error.as_deref().unwrap().contains("timeout"));
    assert_eq!(after.payload, before.payload);
}

// =============================================================================
// Remote Discovery
// =============================================================================

#[tokio::test]
async fn availability_is_checked_in_batches() {
    let harness = harness(SITE_CONFIG);
    for i in 0..25 {
        harness.fabric.seed_remote(
            RemoteFileRecord::new(format!("page-{i}.html"), format!("{i:064}"), format!("ev-{i}"))
                .with_relays(["wss://r1"]),
        );
    }
    harness.fabric.seed_blob("https://s1", &format!("{:064}", 3));
    harness.store.refresh(ContextType::Configuration).await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let report: &ProgressFn = &move |progress: Progress| sink.lock().unwrap().push(progress);
    harness.store.load(ContextType::RemoteDiscovery, Some(report)).await;

    let batches: Vec<Call> = harness
        .fabric
        .calls()
        .into_iter()
        .filter(|c| matches!(c, Call::CheckAvailability { .. }))
        .collect();
    assert_eq!(
        batches,
        vec![
            Call::CheckAvailability { files: 10 },
            Call::CheckAvailability { files: 10 },
            Call::CheckAvailability { files: 5 },
        ]
    );

    let checked: Vec<usize> = seen
        .lock()
        .unwrap()
        .iter()
        .filter(|p| p.message.as_deref() == Some("checking server availability"))
        .map(|p| p.completed)
        .collect();
    assert_eq!(checked, vec![10, 20, 25]);

    let ctx = harness.store.get(ContextType::RemoteDiscovery).unwrap();
    let discovery = ctx.remote_discovery().unwrap();
    assert_eq!(discovery.files.len(), 25);
    let checked_file = discovery.files.iter().find(|f| f.path == "page-3.html").unwrap();
    assert!(checked_file.servers.contains("https://s1"));
    assert!(discovery.availability_checked);
    assert_eq!(discovery.availability_failed_batches, 0);
    // Local pages have no remote trace
    assert_eq!(discovery.sync_summary.local, 2);
}

#[tokio::test]
async fn failed_availability_batch_is_not_reported_as_checked() {
    let harness = harness(SITE_CONFIG);
    for i in 0..25 {
        harness.fabric.seed_remote(
            RemoteFileRecord::new(format!("page-{i}.html"), format!("{i:064}"), format!("ev-{i}"))
                .with_relays(["wss://r1"]),
        );
    }
    harness.fabric.seed_blob("https://s1", &format!("{:064}", 3));
    harness.fabric.seed_blob("https://s1", &format!("{:064}", 13));
    harness.fabric.fail_availability_batch(
        1,
        fabric_core::RemoteError::Network {
            endpoint: "https://s1".to_string(),
            message: "connection reset".to_string(),
        },
    );
    harness.store.refresh(ContextType::Configuration).await;

    harness.store.refresh(ContextType::RemoteDiscovery).await;

    let ctx = harness.store.get(ContextType::RemoteDiscovery).unwrap();
    assert_eq!(ctx.status, ContextStatus::Loaded);
    let discovery = ctx.remote_discovery().unwrap();
    assert!(!discovery.availability_checked);
    assert_eq!(discovery.availability_failed_batches, 1);
    // The later batch is still checked after the failed one
    let checks = harness
        .fabric
        .calls()
        .into_iter()
        .filter(|c| matches!(c, Call::CheckAvailability { .. }))
        .count();
    assert_eq!(checks, 3);
    let held = |path: &str| {
        discovery
            .files
            .iter()
            .find(|f| f.path == path)
            .is_some_and(|f| f.servers.contains("https://s1"))
    };
    assert!(held("page-3.html"));
    assert!(!held("page-13.html"));
}

#[tokio::test]
async fn discovery_without_configuration_resolves_relays_and_skips_availability_check() {
    let harness = harness(SITE_CONFIG);
    harness.fabric.resolve_relays_to(&["wss://resolved"]);
    harness
        .fabric
        .seed_remote(RemoteFileRecord::new("index.html", "h1", "ev-1").with_servers(["https://old"]));

    harness.store.load(ContextType::RemoteDiscovery, None).await;

    let ctx = harness.store.get(ContextType::RemoteDiscovery).unwrap();
    let discovery = ctx.remote_discovery().unwrap();
    assert_eq!(discovery.relays, vec!["wss://resolved".to_string()]);
    assert_eq!(discovery.servers, vec!["https://old".to_string()]);
    assert!(!discovery.availability_checked);
    assert!(
        harness
            .fabric
            .calls()
            .iter()
            .all(|c| !matches!(c, Call::CheckAvailability { .. }))
    );
    // Digest differs from the local file, so only partial evidence exists
    assert_eq!(discovery.sync.get("index.html"), Some(&SyncStatus::Partial));
}

// =============================================================================
// Deployment Preview
// =============================================================================

#[tokio::test]
async fn deployment_preview_discovers_on_its_own() {
    let harness = harness(SITE_CONFIG);

    harness.store.load(ContextType::Deployment, None).await;

    assert!(
        harness
            .fabric
            .calls()
            .iter()
            .any(|c| matches!(c, Call::Discover { .. }))
    );
    let preview = harness.deployment().unwrap();
    assert_eq!(preview.phase, DeployPhase::Idle);
    // Configuration was never loaded, so no servers are known
    assert!(preview.servers.is_empty());
    assert_eq!(preview.plan.to_transfer, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn deployment_refresh_does_not_clobber_a_running_deploy() {
    let harness = harness(SITE_CONFIG);
    let gate = harness.fabric.gate_uploads();

    let id = harness.pipeline.start().unwrap();
    harness.fabric.wait_for_uploads(1).await;

    harness.store.refresh(ContextType::Deployment).await;
    let during = harness.deployment().unwrap();
    assert_eq!(during.phase, DeployPhase::Uploading);
    assert_eq!(during.operation_id.as_deref(), Some(id.as_str()));

    gate.open();
    harness.pipeline.join(&id).await.unwrap();
    assert_eq!(harness.deployment().unwrap().phase, DeployPhase::Completed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_refreshes_never_regress_a_running_deploy() {
    let harness = harness(SITE_CONFIG);
    for i in 0..40 {
        harness.site.write(&format!("page-{i}.html"), &format!("<p>{i}</p>"));
    }
    let (_sub, seen) = harness.record_deployments();
    let gate = harness.fabric.gate_uploads();

    let stop = Arc::new(AtomicBool::new(false));
    let refresher = {
        let store = harness.store.clone();
        let stop = Arc::clone(&stop);
        tokio::spawn(async move {
            while !stop.load(Ordering::SeqCst) {
                store.refresh(ContextType::Deployment).await;
                tokio::task::yield_now().await;
            }
        })
    };

    let id = harness.pipeline.start().unwrap();
    harness.fabric.wait_for_uploads(1).await;
    gate.open();
    harness.pipeline.join(&id).await.unwrap();
    stop.store(true, Ordering::SeqCst);
    refresher.await.unwrap();

    let snapshots = seen.lock().unwrap();
    let owns = |ctx: &Context| {
        ctx.deployment().and_then(|d| d.operation_id.as_deref()) == Some(id.as_str())
    };
    let first = snapshots.iter().position(|c| owns(c)).unwrap();
    let last = first
        + snapshots[first..]
            .iter()
            .position(|c| c.deployment().is_some_and(|d| d.phase.is_terminal()))
            .unwrap();

    // Between the first and the terminal snapshot only the run writes
    let run = &snapshots[first..=last];
    assert!(run.iter().all(|c| owns(c) && c.status == ContextStatus::Loaded));
    let progress: Vec<u8> = run.iter().map(|c| c.deployment().unwrap().progress).collect();
    assert!(progress.windows(2).all(|w| w[0] <= w[1]), "progress regressed: {progress:?}");
    assert_eq!(run[run.len() - 1].deployment().unwrap().phase, DeployPhase::Completed);
}

// =============================================================================
// Subscriptions
// =============================================================================

#[tokio::test]
async fn subscriber_receives_current_value_then_updates() {
    let harness = harness(SITE_CONFIG);
    harness.store.refresh(ContextType::Configuration).await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let sub = harness.store.subscribe(ContextType::Configuration, move |ctx| {
        sink.lock().unwrap().push(ctx.status);
    });
    assert_eq!(*seen.lock().unwrap(), vec![ContextStatus::Loaded]);

    harness.store.refresh(ContextType::Configuration).await;
    assert_eq!(
        *seen.lock().unwrap(),
        vec![ContextStatus::Loaded, ContextStatus::Loading, ContextStatus::Loaded]
    );

    sub.unsubscribe();
    harness.store.refresh(ContextType::Configuration).await;
    assert_eq!(seen.lock().unwrap().len(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn live_deployment_snapshots_show_per_server_progress() {
    let harness = harness(SITE_CONFIG);
    let (_sub, seen) = harness.record_deployments();

    harness.pipeline.deploy().await.unwrap();

    let snapshots = seen.lock().unwrap();
    let uploading = snapshots
        .iter()
        .filter_map(|c| c.deployment())
        .filter(|d| d.phase == DeployPhase::Uploading)
        .flat_map(|d| d.files.values())
        .flat_map(|f| f.servers.values())
        .any(|s| *s == ServerTransferStatus::Uploading);
    assert!(uploading);

    // While the run is active, stored-but-unannounced files read as partial
    let partial = snapshots
        .iter()
        .filter_map(|c| c.deployment())
        .filter(|d| d.phase == DeployPhase::Uploading)
        .any(|d| d.sync.values().any(|s| *s == SyncStatus::Partial));
    assert!(partial);
}
