//! Mission-based Integration Tests
//!
//! Each mission drives a full deployment through [`DeployHarness`]: a real
//! site directory on disk, the context store with every loader registered,
//! and the pipeline talking to an in-memory relay and server network.
//!
//! Missions are grouped by the behaviour they pin down: the happy path,
//! per-file failures that must not abort a run, fatal errors that must,
//! cooperative cancellation, and the optional purge and metadata stages.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use fabric_core::context::{ContextStatus, ContextType, Subscription};
use fabric_core::model::{
    DeploymentFileStatus, FileStatus, LocalFile, RelayPublishStatus, RemoteFileRecord,
    ServerTransferStatus,
};
use fabric_core::operations::{OperationKind, OperationStatus};
use fabric_core::pipeline::{DeployPhase, DeploymentContext};
use fabric_core::propagation::Strength;
use fabric_core::sync_status::SyncStatus;
use fabric_core::{Error, RemoteError};
use fabric_test_utils::{Call, DeployHarness, init_tracing};
use pretty_assertions::assert_eq;

// =============================================================================
// Test Infrastructure
// =============================================================================

const SITE_CONFIG: &str = r#"
relays = ["wss://r1", "wss://r2", "wss://r3"]
servers = ["https://s1", "https://s2"]
concurrency = 2
"#;

/// Harness over a two-page site.
fn two_page_site(config: &str) -> DeployHarness {
    init_tracing();
    let harness = DeployHarness::new(config);
    harness.site.write("index.html", "<h1>home</h1>");
    harness.site.write("css/site.css", "body { margin: 0 }");
    harness
}

fn file<'a>(ctx: &'a DeploymentContext, path: &str) -> &'a DeploymentFileStatus {
    ctx.files
        .get(path)
        .unwrap_or_else(|| panic!("{path} missing from deployment context"))
}

fn published_paths(harness: &DeployHarness, relay: &str) -> Vec<String> {
    let mut paths: Vec<String> = harness
        .fabric
        .announcements_on(relay)
        .into_iter()
        .map(|a| a.path)
        .collect();
    paths.sort();
    paths
}

fn count_calls(harness: &DeployHarness, matches: impl Fn(&Call) -> bool) -> usize {
    harness.fabric.calls().iter().filter(|c| matches(c)).count()
}

// =============================================================================
// Mission 1: Happy Path
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn m1_deploy_stores_and_announces_every_file() {
    let harness = two_page_site(SITE_CONFIG);
    let index = LocalFile::new(
        "index.html",
        13,
        fabric_fs::compute_bytes_digest(b"<h1>home</h1>"),
    );

    let op = harness.pipeline.deploy().await.unwrap();

    assert_eq!(op.kind, OperationKind::Deploy);
    assert_eq!(op.status, OperationStatus::Completed);
    assert_eq!(op.progress, 100);

    let ctx = harness.deployment().unwrap();
    assert_eq!(ctx.phase, DeployPhase::Completed);
    assert_eq!(ctx.progress, 100);
    assert_eq!(ctx.plan.to_transfer, 2);
    assert_eq!(ctx.stats.uploaded_files, 2);
    assert_eq!(ctx.stats.skipped_files, 0);
    assert_eq!(ctx.stats.failed_files, 0);
    assert_eq!(ctx.stats.published_events, 2);
    assert_eq!(ctx.stats.failed_events, 0);

    for status in ctx.files.values() {
        assert_eq!(status.status, FileStatus::Published);
        assert!(status.error.is_none());
        assert!(status.servers.values().all(|s| *s == ServerTransferStatus::Completed));
        assert!(status.relays.values().all(|r| *r == RelayPublishStatus::Published));
    }
    assert!(harness.fabric.stored_on("https://s1", &index.sha256));
    assert!(harness.fabric.stored_on("https://s2", &index.sha256));
    for relay in ["wss://r1", "wss://r2", "wss://r3"] {
        assert_eq!(published_paths(&harness, relay), vec!["css/site.css", "index.html"]);
    }

    assert_eq!(ctx.propagation.relays.fully_propagated, 2);
    assert_eq!(ctx.propagation.relays.strength, Strength::Nominal);
    assert_eq!(ctx.propagation.servers.strength, Strength::Weak);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn m1_progress_is_monotonic_through_checkpoints() {
    let harness = two_page_site(SITE_CONFIG);
    let (_sub, seen) = harness.record_deployments();

    let op = harness.pipeline.deploy().await.unwrap();

    let snapshots: Vec<DeploymentContext> = seen
        .lock()
        .unwrap()
        .iter()
        .filter_map(|c| c.deployment().cloned())
        .filter(|d| d.operation_id.as_deref() == Some(op.id.as_str()))
        .collect();
    let progress: Vec<u8> = snapshots.iter().map(|d| d.progress).collect();

    assert!(progress.windows(2).all(|w| w[0] <= w[1]), "progress went backwards: {progress:?}");
    assert!(progress.contains(&20));
    assert!(progress.contains(&90));
    assert_eq!(progress.last(), Some(&100));
    for snapshot in snapshots.iter().filter(|d| d.phase == DeployPhase::Uploading) {
        assert!((20..=80).contains(&snapshot.progress));
    }

    // Phases are observed in pipeline order
    let mut phases: Vec<DeployPhase> = snapshots.iter().map(|d| d.phase).collect();
    phases.dedup();
    assert_eq!(
        phases,
        vec![
            DeployPhase::Preparing,
            DeployPhase::Signing,
            DeployPhase::Uploading,
            DeployPhase::Publishing,
            DeployPhase::Completed,
        ]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn m1_discovery_after_deploy_reports_files_synced() {
    let harness = two_page_site(SITE_CONFIG);
    harness.pipeline.deploy().await.unwrap();

    harness.store.refresh(ContextType::Configuration).await;
    harness.store.refresh(ContextType::RemoteDiscovery).await;

    let ctx = harness.store.get(ContextType::RemoteDiscovery).unwrap();
    let discovery = ctx.remote_discovery().unwrap();
    assert_eq!(discovery.files.len(), 2);
    assert!(discovery.availability_checked);
    assert_eq!(discovery.sync.get("index.html"), Some(&SyncStatus::Synced));
    assert_eq!(discovery.sync_summary.synced, 2);
    assert_eq!(discovery.propagation.servers.fully_propagated, 2);
}

// =============================================================================
// Mission 2: Per-File Failures Do Not Abort The Run
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn m2_failed_transfer_is_excluded_from_publishing() {
    let harness = two_page_site(SITE_CONFIG);
    harness.site.write("broken.js", "throw 1");
    harness.fabric.fail_upload("broken.js");

    let op = harness.pipeline.deploy().await.unwrap();
    assert_eq!(op.status, OperationStatus::Completed);

    let ctx = harness.deployment().unwrap();
    let broken = file(&ctx, "broken.js");
    assert_eq!(broken.status, FileStatus::Failed);
    assert!(broken.error.as_deref().unwrap().contains("blob rejected"));
    assert!(broken.servers.values().all(|s| *s == ServerTransferStatus::Failed));

    assert_eq!(ctx.stats.uploaded_files, 2);
    assert_eq!(ctx.stats.failed_files, 1);
    assert_eq!(ctx.stats.published_events, 2);
    assert_eq!(published_paths(&harness, "wss://r1"), vec!["css/site.css", "index.html"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn m2_one_server_down_still_completes_files() {
    let harness = two_page_site(SITE_CONFIG);
    harness.fabric.fail_server("https://s2");

    harness.pipeline.deploy().await.unwrap();

    let ctx = harness.deployment().unwrap();
    let index = file(&ctx, "index.html");
    assert_eq!(index.status, FileStatus::Published);
    assert!(index.error.is_none());
    assert_eq!(index.servers["https://s1"], ServerTransferStatus::Completed);
    assert_eq!(index.servers["https://s2"], ServerTransferStatus::Failed);
    assert_eq!(ctx.stats.failed_files, 0);
    assert_eq!(ctx.propagation.servers.fully_propagated, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn m2_signing_refusal_skips_the_file() {
    let harness = two_page_site(SITE_CONFIG);
    harness.fabric.refuse_signing("index.html");

    let op = harness.pipeline.deploy().await.unwrap();
    assert_eq!(op.status, OperationStatus::Completed);

    let ctx = harness.deployment().unwrap();
    let index = file(&ctx, "index.html");
    assert_eq!(index.status, FileStatus::Failed);
    assert!(index.error.as_deref().unwrap().starts_with("signing failed"));
    assert!(harness.fabric.uploads().iter().all(|(path, _)| path != "index.html"));
    assert_eq!(file(&ctx, "css/site.css").status, FileStatus::Published);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn m2_content_changed_before_publish_fails_file() {
    let harness = two_page_site(SITE_CONFIG);
    harness.fabric.tamper("index.html");

    harness.pipeline.deploy().await.unwrap();

    let ctx = harness.deployment().unwrap();
    let index = file(&ctx, "index.html");
    assert_eq!(index.status, FileStatus::Failed);
    assert_eq!(index.error.as_deref(), Some("content changed during deployment"));
    assert_eq!(ctx.stats.published_events, 1);
    assert_eq!(published_paths(&harness, "wss://r2"), vec!["css/site.css"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn m2_publish_error_fails_every_candidate() {
    let harness = two_page_site(SITE_CONFIG);
    harness.fabric.fail_publish(RemoteError::Network {
        endpoint: "wss://r1".to_string(),
        message: "connection reset".to_string(),
    });

    let op = harness.pipeline.deploy().await.unwrap();
    assert_eq!(op.status, OperationStatus::Completed);

    let ctx = harness.deployment().unwrap();
    assert_eq!(ctx.stats.published_events, 0);
    assert_eq!(ctx.stats.failed_events, 2);
    assert_eq!(ctx.stats.failed_files, 2);
    for status in ctx.files.values() {
        assert_eq!(status.status, FileStatus::Failed);
        assert!(status.relays.values().all(|r| *r == RelayPublishStatus::Failed));
        assert!(
            status
                .error
                .as_deref()
                .unwrap()
                .starts_with("no relay accepted the announcement")
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn m2_rejecting_relay_is_recorded_per_file() {
    let harness = two_page_site(SITE_CONFIG);
    harness.fabric.fail_relay("wss://r3");

    harness.pipeline.deploy().await.unwrap();

    let ctx = harness.deployment().unwrap();
    let index = file(&ctx, "index.html");
    assert_eq!(index.status, FileStatus::Published);
    assert_eq!(index.relays["wss://r1"], RelayPublishStatus::Published);
    assert_eq!(index.relays["wss://r3"], RelayPublishStatus::Failed);
    assert_eq!(ctx.propagation.relays.fully_propagated, 0);
    assert!(harness.fabric.announcements_on("wss://r3").is_empty());
}

// =============================================================================
// Mission 3: Fatal Errors Abort The Run
// =============================================================================

async fn assert_run_failed(harness: &DeployHarness, expected: &str) {
    let op = harness.pipeline.deploy().await.unwrap();
    assert_eq!(op.status, OperationStatus::Failed);
    let error = op.error.clone().unwrap();
    assert!(error.contains(expected), "unexpected error: {error}");

    let ctx = harness.store.get(ContextType::Deployment).unwrap();
    assert_eq!(ctx.status, ContextStatus::Error);
    assert_eq!(ctx.error.as_deref(), Some(error.as_str()));
    let deployment = ctx.deployment().unwrap();
    assert_eq!(deployment.phase, DeployPhase::Failed);
    assert_eq!(deployment.operation_id.as_deref(), Some(op.id.as_str()));
    assert_eq!(deployment.error.as_deref(), Some(error.as_str()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn m3_missing_signer_fails_run() {
    init_tracing();
    let harness = DeployHarness::without_signer(SITE_CONFIG);
    harness.site.write("index.html", "<h1>home</h1>");

    assert_run_failed(&harness, "No signer available").await;
    assert!(harness.fabric.uploads().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn m3_no_servers_fails_run() {
    let harness = two_page_site("relays = [\"wss://r1\"]\n");
    assert_run_failed(&harness, "No servers configured").await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn m3_invalid_config_fails_run() {
    let harness = two_page_site("servers = [\"ftp://nope\"]\n");
    assert_run_failed(&harness, "Context configuration is unavailable").await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn m3_duplicate_path_fails_run() {
    let harness = two_page_site(SITE_CONFIG);
    harness
        .fabric
        .add_local_file(LocalFile::new("index.html", 1, "f".repeat(64)));

    assert_run_failed(&harness, "Duplicate path in local file set: index.html").await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn m3_panicking_stage_fails_run() {
    let harness = two_page_site(SITE_CONFIG);
    harness.fabric.panic_on_sign();

    assert_run_failed(&harness, "deployment task panicked").await;

    // The pipeline accepts a new run afterwards
    assert!(harness.pipeline.start().is_ok());
}

// =============================================================================
// Mission 4: Cooperative Cancellation
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn m4_cancel_unknown_or_finished_operation_is_rejected() {
    let harness = two_page_site(SITE_CONFIG);

    let err = harness.pipeline.cancel("no-such-operation").unwrap_err();
    assert!(matches!(err, Error::OperationNotFound { .. }));

    let (discover_id, _flag) = harness.registry.create(OperationKind::Discover, false);
    let before = harness.registry.snapshot();
    let err = harness.pipeline.cancel(&discover_id).unwrap_err();
    assert!(matches!(err, Error::NotCancelable { .. }));
    assert_eq!(harness.registry.snapshot(), before);

    let op = harness.pipeline.deploy().await.unwrap();
    let err = harness.pipeline.cancel(&op.id).unwrap_err();
    assert!(matches!(err, Error::NotCancelable { .. }));
    assert_eq!(harness.registry.get(&op.id).unwrap().status, OperationStatus::Completed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn m4_cancel_mid_upload_stops_new_work_and_skips_publishing() {
    let harness = two_page_site(SITE_CONFIG);
    harness.site.write("app.js", "main()");
    let gate = harness.fabric.gate_uploads();

    let id = harness.pipeline.start().unwrap();
    // Both concurrency slots are now held by uploads waiting on the gate
    harness.fabric.wait_for_uploads(2).await;
    harness.pipeline.cancel(&id).unwrap();
    gate.open();

    let op = harness.pipeline.join(&id).await.unwrap();
    assert_eq!(op.status, OperationStatus::Cancelled);

    let ctx = harness.deployment().unwrap();
    assert_eq!(ctx.phase, DeployPhase::Cancelled);
    assert_eq!(harness.fabric.uploads().len(), 2);
    assert_eq!(
        count_calls(&harness, |c| matches!(c, Call::PublishAnnouncements { .. })),
        0
    );
    assert!(harness.fabric.announcements_on("wss://r1").is_empty());

    // In-flight results are kept; never-started entries stay pending
    let completed = ctx
        .files
        .values()
        .flat_map(|f| f.servers.values())
        .filter(|s| **s == ServerTransferStatus::Completed)
        .count();
    let pending = ctx
        .files
        .values()
        .flat_map(|f| f.servers.values())
        .filter(|s| **s == ServerTransferStatus::Pending)
        .count();
    assert_eq!(completed, 2);
    assert_eq!(pending, 4);
    assert!(ctx.files.values().all(|f| f.error.is_none()));
}

/// Cancel the run from inside the first snapshot that enters `phase`.
fn cancel_on_phase(harness: &DeployHarness, phase: DeployPhase) -> Subscription {
    let registry = harness.registry.clone();
    let fired = AtomicBool::new(false);
    harness.store.subscribe(ContextType::Deployment, move |ctx| {
        let Some(id) = ctx
            .deployment()
            .filter(|d| d.phase == phase)
            .and_then(|d| d.operation_id.as_deref())
        else {
            return;
        };
        if !fired.swap(true, Ordering::SeqCst) {
            registry.cancel(id).unwrap();
        }
    })
}

const LATE_STAGES_CONFIG: &str = r#"
relays = ["wss://r1"]
servers = ["https://s1"]
purge = true

[publish]
relay_list = true
server_list = true
"#;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn m4_cancel_while_publishing_skips_purge_and_metadata() {
    let harness = two_page_site(LATE_STAGES_CONFIG);
    harness.fabric.support_deletions();
    harness.pipeline.deploy().await.unwrap();

    std::fs::remove_file(harness.site.root().join("css/site.css")).unwrap();
    harness.site.write("index.html", "<h1>home v2</h1>");
    harness.store.refresh_all().await;
    let metadata_before = count_calls(&harness, |c| matches!(c, Call::PublishMetadata { .. }));

    let _cancel = cancel_on_phase(&harness, DeployPhase::Publishing);
    let op = harness.pipeline.deploy().await.unwrap();

    assert_eq!(op.status, OperationStatus::Cancelled);
    let ctx = harness.deployment().unwrap();
    assert_eq!(ctx.phase, DeployPhase::Cancelled);
    assert_eq!(ctx.plan.to_delete, 1);
    assert_eq!(ctx.stats.deleted_events, 0);
    assert_eq!(
        count_calls(&harness, |c| matches!(c, Call::PublishDeletions { .. })),
        0
    );
    assert_eq!(
        count_calls(&harness, |c| matches!(c, Call::PublishMetadata { .. })),
        metadata_before
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn m4_error_after_cancel_keeps_the_run_cancelled() {
    let harness = two_page_site("relays = [\"wss://r1\"]\n");
    let _cancel = cancel_on_phase(&harness, DeployPhase::Preparing);

    let op = harness.pipeline.deploy().await.unwrap();

    assert_eq!(op.status, OperationStatus::Cancelled);
    let ctx = harness.store.get(ContextType::Deployment).unwrap();
    assert_eq!(ctx.status, ContextStatus::Loaded);
    let deployment = ctx.deployment().unwrap();
    assert_eq!(deployment.phase, DeployPhase::Cancelled);
    assert_eq!(deployment.operation_id.as_deref(), Some(op.id.as_str()));
    assert!(deployment.error.as_deref().unwrap().contains("No servers configured"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn m4_second_start_while_running_is_rejected() {
    let harness = two_page_site(SITE_CONFIG);
    let gate = harness.fabric.gate_uploads();

    let id = harness.pipeline.start().unwrap();
    harness.fabric.wait_for_uploads(1).await;

    match harness.pipeline.start() {
        Err(Error::AlreadyRunning { id: running }) => assert_eq!(running, id),
        other => panic!("expected AlreadyRunning, got {other:?}"),
    }

    gate.open();
    let op = harness.pipeline.join(&id).await.unwrap();
    assert_eq!(op.status, OperationStatus::Completed);
}

// =============================================================================
// Mission 5: Redeploys And Reconciliation
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn m5_unchanged_site_short_circuits() {
    let harness = two_page_site(SITE_CONFIG);
    harness.pipeline.deploy().await.unwrap();
    let signed_before = count_calls(&harness, |c| matches!(c, Call::Sign { .. }));
    let uploads_before = harness.fabric.uploads().len();

    harness.store.refresh_all().await;
    let op = harness.pipeline.deploy().await.unwrap();

    assert_eq!(op.status, OperationStatus::Completed);
    assert_eq!(op.progress, 100);
    let ctx = harness.deployment().unwrap();
    assert_eq!(ctx.phase, DeployPhase::Completed);
    assert_eq!(ctx.plan.existing, 2);
    assert_eq!(ctx.stats.skipped_files, 2);
    assert_eq!(ctx.stats.uploaded_files, 0);
    assert_eq!(count_calls(&harness, |c| matches!(c, Call::Sign { .. })), signed_before);
    assert_eq!(harness.fabric.uploads().len(), uploads_before);

    for status in ctx.files.values() {
        assert_eq!(status.status, FileStatus::Completed);
        assert_eq!(status.progress, 100);
    }
    assert_eq!(ctx.sync_summary.synced, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn m5_changed_file_is_the_only_one_redeployed() {
    let harness = two_page_site(SITE_CONFIG);
    harness.pipeline.deploy().await.unwrap();

    harness.site.write("index.html", "<h1>home v2</h1>");
    harness.store.refresh_all().await;
    let uploads_before = harness.fabric.uploads().len();

    harness.pipeline.deploy().await.unwrap();

    let ctx = harness.deployment().unwrap();
    assert_eq!(ctx.plan.to_transfer, 1);
    assert_eq!(ctx.plan.existing, 1);
    assert_eq!(ctx.stats.uploaded_files, 1);
    assert_eq!(ctx.stats.skipped_files, 1);
    let new_uploads = &harness.fabric.uploads()[uploads_before..];
    assert!(new_uploads.iter().all(|(path, _)| path == "index.html"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn m5_seeded_remote_state_counts_as_deployed() {
    let harness = two_page_site(SITE_CONFIG);
    let digest = fabric_fs::compute_bytes_digest(b"<h1>home</h1>");
    harness
        .fabric
        .seed_remote(
            RemoteFileRecord::new("index.html", &digest, "ev-seed")
                .with_relays(["wss://r1"])
                .with_created_at(1),
        )
        .seed_blob("https://s1", &digest);
    harness.store.refresh_all().await;

    harness.pipeline.deploy().await.unwrap();

    let ctx = harness.deployment().unwrap();
    let index = file(&ctx, "index.html");
    assert_eq!(index.status, FileStatus::Completed);
    assert_eq!(index.servers["https://s1"], ServerTransferStatus::Completed);
    assert_eq!(index.servers["https://s2"], ServerTransferStatus::Pending);
    assert_eq!(index.relays["wss://r1"], RelayPublishStatus::Published);
    assert_eq!(ctx.stats.uploaded_files, 1);
    assert!(harness.fabric.uploads().iter().all(|(path, _)| path != "index.html"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn m5_relays_fall_back_to_resolution() {
    init_tracing();
    let harness = DeployHarness::new("servers = [\"https://s1\"]\n");
    harness.site.write("index.html", "<h1>home</h1>");
    harness.fabric.resolve_relays_to(&["wss://fallback"]);

    harness.pipeline.deploy().await.unwrap();

    let ctx = harness.deployment().unwrap();
    assert_eq!(ctx.relays, vec!["wss://fallback".to_string()]);
    assert_eq!(published_paths(&harness, "wss://fallback"), vec!["index.html"]);
    assert!(count_calls(&harness, |c| *c == Call::ResolveRelays) >= 1);
}

// =============================================================================
// Mission 6: Purge And Metadata
// =============================================================================

const PURGE_CONFIG: &str = r#"
relays = ["wss://r1", "wss://r2"]
servers = ["https://s1"]
purge = true
"#;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn m6_purge_removes_announcements_for_deleted_files() {
    let harness = two_page_site(PURGE_CONFIG);
    harness.fabric.support_deletions();
    harness.pipeline.deploy().await.unwrap();

    std::fs::remove_file(harness.site.root().join("css/site.css")).unwrap();
    harness.store.refresh_all().await;
    harness.pipeline.deploy().await.unwrap();

    let ctx = harness.deployment().unwrap();
    assert_eq!(ctx.phase, DeployPhase::Completed);
    assert_eq!(ctx.plan.to_delete, 1);
    assert_eq!(ctx.stats.deleted_events, 1);
    assert_eq!(ctx.stats.failed_events, 0);
    assert_eq!(published_paths(&harness, "wss://r1"), vec!["index.html"]);
    assert_eq!(
        count_calls(&harness, |c| matches!(c, Call::PublishDeletions { event_ids } if event_ids.len() == 1)),
        1
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn m6_unsupported_purge_counts_failed_events() {
    let harness = two_page_site(PURGE_CONFIG);
    harness.pipeline.deploy().await.unwrap();

    std::fs::remove_file(harness.site.root().join("css/site.css")).unwrap();
    harness.store.refresh_all().await;
    let op = harness.pipeline.deploy().await.unwrap();

    assert_eq!(op.status, OperationStatus::Completed);
    let ctx = harness.deployment().unwrap();
    assert_eq!(ctx.stats.deleted_events, 0);
    assert_eq!(ctx.stats.failed_events, 1);
    assert_eq!(published_paths(&harness, "wss://r1"), vec!["css/site.css", "index.html"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn m6_without_purge_stale_announcements_stay() {
    let harness = two_page_site(SITE_CONFIG);
    harness.fabric.support_deletions();
    harness.pipeline.deploy().await.unwrap();

    std::fs::remove_file(harness.site.root().join("css/site.css")).unwrap();
    harness.store.refresh_all().await;
    harness.pipeline.deploy().await.unwrap();

    assert_eq!(
        count_calls(&harness, |c| matches!(c, Call::PublishDeletions { .. })),
        0
    );
    assert_eq!(harness.deployment().unwrap().stats.deleted_events, 0);
}

const METADATA_CONFIG: &str = r#"
relays = ["wss://r1"]
servers = ["https://s1"]

[publish]
relay_list = true
server_list = true
"#;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn m6_metadata_flags_publish_after_files() {
    let harness = two_page_site(METADATA_CONFIG);

    harness.pipeline.deploy().await.unwrap();

    let ctx = harness.deployment().unwrap();
    assert_eq!(ctx.stats.published_events, 4);
    assert_eq!(
        harness.fabric.messages(),
        vec!["published 2 metadata events for 2 files to 1 relays".to_string()]
    );

    let calls = harness.fabric.calls();
    let announce = calls
        .iter()
        .position(|c| matches!(c, Call::PublishAnnouncements { .. }))
        .unwrap();
    let metadata = calls
        .iter()
        .position(|c| matches!(c, Call::PublishMetadata { .. }))
        .unwrap();
    assert!(announce < metadata);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn m6_metadata_failure_is_not_fatal() {
    let harness = two_page_site(METADATA_CONFIG);
    harness.fabric.fail_metadata(RemoteError::Rejected {
        endpoint: "wss://r1".to_string(),
        reason: "rate limited".to_string(),
    });

    let op = harness.pipeline.deploy().await.unwrap();

    assert_eq!(op.status, OperationStatus::Completed);
    let ctx = harness.deployment().unwrap();
    assert_eq!(ctx.phase, DeployPhase::Completed);
    assert_eq!(ctx.stats.published_events, 2);
    assert_eq!(ctx.stats.failed_events, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn m6_metadata_alone_keeps_an_unchanged_site_running() {
    let harness = two_page_site(METADATA_CONFIG);
    harness.pipeline.deploy().await.unwrap();
    harness.store.refresh_all().await;

    harness.pipeline.deploy().await.unwrap();

    assert_eq!(
        count_calls(&harness, |c| matches!(c, Call::PublishMetadata { .. })),
        2
    );
    let ctx = harness.deployment().unwrap();
    assert_eq!(ctx.stats.skipped_files, 2);
    assert_eq!(ctx.stats.published_events, 2);
}

// =============================================================================
// Mission 7: Operations Context
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn m7_operations_context_tracks_the_run() {
    let harness = two_page_site(SITE_CONFIG);
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let _sub = harness.store.subscribe(ContextType::Operations, move |ctx| {
        if let Some(ops) = ctx.operations() {
            sink.lock().unwrap().push(ops.operations.clone());
        }
    });

    let op = harness.pipeline.deploy().await.unwrap();

    let snapshots = seen.lock().unwrap().clone();
    assert!(
        snapshots
            .iter()
            .any(|s| s.active.iter().any(|a| a.id == op.id && a.status == OperationStatus::Running))
    );
    assert!(snapshots.iter().any(|s| {
        s.active.is_empty()
            && s
                .completed
                .iter()
                .any(|o| o.id == op.id && o.status == OperationStatus::Completed)
    }));
}
