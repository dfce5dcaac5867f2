//! Integration tests for cluster provisioning.
//!
//! These tests create real kind clusters and need kind, kubectl and a
//! container runtime on PATH.
//! Run with: cargo test --test provisioning_integration -- --ignored

use std::time::Duration;

use clusterforge::cluster::{ClusterState, LifecycleManager};
use clusterforge::config::HarnessConfig;
use clusterforge::runtime::{ensure_dependencies, RuntimeKind};
use clusterforge::scheduler::{BatchPlan, BatchScheduler};

async fn test_manager(workspace: &std::path::Path) -> LifecycleManager {
    let runtime = RuntimeKind::resolve(None)
        .await
        .expect("a container runtime must be installed for integration tests");
    ensure_dependencies(runtime)
        .await
        .expect("kind, kubectl and helm must be on PATH for integration tests");
    LifecycleManager::new(HarnessConfig::new(workspace), runtime)
}

#[tokio::test]
#[ignore] // Run with: cargo test --test provisioning_integration -- --ignored
async fn create_verify_delete_roundtrip() {
    let workspace = tempfile::tempdir().expect("tempdir");
    let manager = test_manager(workspace.path()).await;

    let mut handle = manager
        .create("forge-itest")
        .await
        .expect("cluster creation should succeed on a clean host");
    assert!(handle.credentials_path.exists());

    let report = manager.verify(&mut handle).await.expect("verify");
    assert_eq!(handle.state, ClusterState::Ready);
    assert!(!report.node_summary.is_empty());

    manager.delete("forge-itest").await.expect("delete");
    assert!(!handle.credentials_path.exists());
}

#[tokio::test]
#[ignore]
async fn teardown_of_absent_cluster_is_a_noop() {
    let workspace = tempfile::tempdir().expect("tempdir");
    let manager = test_manager(workspace.path()).await;

    manager
        .delete("forge-never-created")
        .await
        .expect("deleting an absent cluster must succeed");
    assert!(!workspace
        .path()
        .join("cluster-configs/forge-never-created-config")
        .exists());
}

#[tokio::test]
#[ignore]
async fn repeated_start_yields_fresh_credentials() {
    let workspace = tempfile::tempdir().expect("tempdir");
    let manager = test_manager(workspace.path()).await;

    let first = manager.create("forge-idem").await.expect("first create");
    let first_content =
        std::fs::read_to_string(&first.credentials_path).expect("first credentials");

    let second = manager.create("forge-idem").await.expect("second create");
    let second_content =
        std::fs::read_to_string(&second.credentials_path).expect("second credentials");

    // Same deterministic path, fresh endpoint.
    assert_eq!(first.credentials_path, second.credentials_path);
    assert_ne!(first_content, second_content);

    manager.delete("forge-idem").await.expect("delete");
}

#[tokio::test]
#[ignore]
async fn batch_of_one_provisions_one_cluster() {
    let workspace = tempfile::tempdir().expect("tempdir");
    let manager = test_manager(workspace.path()).await;

    let plan = BatchPlan::new(1, 1).with_inter_unit_delay(Duration::from_secs(5));
    let scheduler = BatchScheduler::new(plan, manager);
    let outcome = scheduler.run(|_| "forge-batch".to_string()).await;

    assert_eq!(outcome.stats.success_count, 1);
    assert_eq!(outcome.stats.failure_count, 0);
    assert!(outcome
        .live_clusters
        .iter()
        .any(|name| name == "forge-batch"));

    // Cleanup through a fresh manager; scheduler consumed the first one.
    let manager = test_manager(workspace.path()).await;
    manager.delete("forge-batch").await.expect("cleanup");
}
