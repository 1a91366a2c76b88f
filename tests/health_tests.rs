//! Tests for node health monitoring.
//!
//! Verifies the status transition rules (maintenance on one failure, offline
//! after three, restore on a single success), EMA load smoothing, the busy
//! threshold, and that probe timeouts count as failures.


use std::sync::Arc;
use std::time::Duration;

use test_harness::{assert_eventually, registry_with_nodes, ProbeScript, ScriptedDispatcher};
use tokio_util::sync::CancellationToken;
use workgrid::config::HealthConfig;
use workgrid::health::HealthMonitor;
use workgrid::registry::NodeStatus;

fn fast_health() -> HealthConfig {
    HealthConfig {
        probe_interval: Duration::from_millis(30),
        probe_timeout: Duration::from_millis(80),
        ..HealthConfig::default()
    }
}

#[tokio::test]
async fn single_failure_demotes_to_maintenance() {
    let registry = registry_with_nodes(&[("n1", "us-east", 4)]).await;
    let dispatcher = Arc::new(ScriptedDispatcher::new(Duration::from_millis(1)));
    dispatcher.set_probe("n1", ProbeScript::Fail);

    let monitor = HealthMonitor::new(registry.clone(), dispatcher, fast_health());
    monitor.sweep().await;

    let reg = registry.read().await;
    let node = reg.get("n1").unwrap();
    assert_eq!(node.status, NodeStatus::Maintenance);
    assert_eq!(node.consecutive_probe_failures, 1);
}

#[tokio::test]
async fn three_failures_demote_to_offline() {
    let registry = registry_with_nodes(&[("n1", "us-east", 4)]).await;
    let dispatcher = Arc::new(ScriptedDispatcher::new(Duration::from_millis(1)));
    dispatcher.set_probe("n1", ProbeScript::Fail);

    let monitor = HealthMonitor::new(registry.clone(), dispatcher, fast_health());
    for _ in 0..3 {
        monitor.sweep().await;
    }

    assert_eq!(
        registry.read().await.get("n1").unwrap().status,
        NodeStatus::Offline
    );
}

#[tokio::test]
async fn one_success_restores_active() {
    let registry = registry_with_nodes(&[("n1", "us-east", 4)]).await;
    let dispatcher = Arc::new(ScriptedDispatcher::new(Duration::from_millis(1)));
    let monitor = HealthMonitor::new(registry.clone(), dispatcher.clone(), fast_health());

    dispatcher.set_probe("n1", ProbeScript::Fail);
    monitor.sweep().await;
    assert_eq!(
        registry.read().await.get("n1").unwrap().status,
        NodeStatus::Maintenance
    );

    dispatcher.set_probe("n1", ProbeScript::Ok(30.0));
    monitor.sweep().await;

    let reg = registry.read().await;
    let node = reg.get("n1").unwrap();
    assert_eq!(node.status, NodeStatus::Active);
    assert_eq!(node.consecutive_probe_failures, 0);
}

#[tokio::test]
async fn offline_node_recovers_on_success() {
    let registry = registry_with_nodes(&[("n1", "us-east", 4)]).await;
    let dispatcher = Arc::new(ScriptedDispatcher::new(Duration::from_millis(1)));
    let monitor = HealthMonitor::new(registry.clone(), dispatcher.clone(), fast_health());

    dispatcher.set_probe("n1", ProbeScript::Fail);
    for _ in 0..4 {
        monitor.sweep().await;
    }
    assert_eq!(
        registry.read().await.get("n1").unwrap().status,
        NodeStatus::Offline
    );

    dispatcher.set_probe("n1", ProbeScript::Ok(10.0));
    monitor.sweep().await;
    assert_eq!(
        registry.read().await.get("n1").unwrap().status,
        NodeStatus::Active
    );
}

#[tokio::test]
async fn load_estimates_are_smoothed() {
    let registry = registry_with_nodes(&[("n1", "us-east", 4)]).await;
    let dispatcher = Arc::new(ScriptedDispatcher::new(Duration::from_millis(1)));
    let monitor = HealthMonitor::new(registry.clone(), dispatcher.clone(), fast_health());

    // First reading seeds the average directly.
    dispatcher.set_probe("n1", ProbeScript::Ok(40.0));
    monitor.sweep().await;
    assert!((registry.read().await.get("n1").unwrap().load_pct - 40.0).abs() < 1e-9);

    // Second reading is smoothed: 0.3 * 80 + 0.7 * 40 = 52.
    dispatcher.set_probe("n1", ProbeScript::Ok(80.0));
    monitor.sweep().await;
    assert!((registry.read().await.get("n1").unwrap().load_pct - 52.0).abs() < 1e-9);
}

#[tokio::test]
async fn saturated_node_marked_busy() {
    let registry = registry_with_nodes(&[("n1", "us-east", 4)]).await;
    let dispatcher = Arc::new(ScriptedDispatcher::new(Duration::from_millis(1)));
    let monitor = HealthMonitor::new(registry.clone(), dispatcher.clone(), fast_health());

    dispatcher.set_probe("n1", ProbeScript::Ok(99.0));
    monitor.sweep().await;

    let reg = registry.read().await;
    let node = reg.get("n1").unwrap();
    assert_eq!(node.status, NodeStatus::Busy);
    assert!(!node.status.is_allocatable());
}

#[tokio::test]
async fn hanging_probe_counts_as_failure() {
    let registry = registry_with_nodes(&[("n1", "us-east", 4)]).await;
    let dispatcher = Arc::new(ScriptedDispatcher::new(Duration::from_millis(1)));
    dispatcher.set_probe("n1", ProbeScript::Hang);

    let monitor = HealthMonitor::new(registry.clone(), dispatcher, fast_health());
    monitor.sweep().await;

    assert_eq!(
        registry.read().await.get("n1").unwrap().status,
        NodeStatus::Maintenance
    );
}

/// The background loop keeps sweeping until cancelled.
#[tokio::test]
async fn background_loop_probes_and_stops() {
    let registry = registry_with_nodes(&[("n1", "us-east", 4)]).await;
    let dispatcher = Arc::new(ScriptedDispatcher::new(Duration::from_millis(1)));
    dispatcher.set_probe("n1", ProbeScript::Fail);

    let monitor = HealthMonitor::new(registry.clone(), dispatcher, fast_health());
    let cancel = CancellationToken::new();
    let handle = tokio::spawn({
        let cancel = cancel.clone();
        async move { monitor.run(cancel).await }
    });

    assert_eventually(
        || {
            let registry = registry.clone();
            async move { registry.read().await.get("n1").unwrap().status == NodeStatus::Offline }
        },
        Duration::from_secs(2),
        "node should go offline after repeated failed sweeps",
    )
    .await;

    cancel.cancel();
    handle.await.expect("monitor task should exit cleanly");
}
