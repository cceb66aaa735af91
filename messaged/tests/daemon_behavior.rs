//! End-to-end scenarios exercising the orchestrator/manager/health/ipc
//! wiring together, not just one module in isolation.

use std::sync::Arc;

use messaged::adapter::fake::FakePlatformAdapter;
use messaged::adapter::PlatformAdapterError;
use messaged::{HealthMonitor, NotificationDispatcher, Orchestrator, PlatformManager};
use messages_core::{Normalizer, StateStore};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

fn build_manager(
    platforms: &[&str],
    backoff_schedule_ms: Vec<u64>,
) -> (
    Arc<PlatformManager>,
    tokio::sync::mpsc::Receiver<(String, messaged::AdapterEvent)>,
) {
    let (tx, rx) = tokio::sync::mpsc::channel(256);
    let manager = Arc::new(PlatformManager::new(
        platforms.iter().map(|s| s.to_string()).collect(),
        backoff_schedule_ms,
        3,
        tx,
    ));
    (manager, rx)
}

/// Scenario 4: with two authenticated platforms, one connects and one fails
/// to start — status summary reports healthy=1/total=2 and the aggregate
/// health is degraded, not healthy or fully unhealthy.
#[tokio::test]
async fn partial_daemon_health_reports_degraded() {
    // A long backoff keeps the failed platform's recovery timer from firing
    // mid-test and flipping it back to connected before the health check runs.
    let (manager, mut adapter_rx) = build_manager(&["signal", "telegram"], vec![60_000]);

    let good = FakePlatformAdapter::new("signal");
    let bad = FakePlatformAdapter::new("telegram");
    bad.fail_next_start(PlatformAdapterError::AuthRejected {
        platform: "telegram".to_string(),
        reason: "bad token".to_string(),
    });

    manager.register(Arc::new(good.clone())).await;
    manager.register(Arc::new(bad.clone())).await;

    manager.clone().start_platform("signal").await;
    manager.clone().start_platform("telegram").await;

    // Drain a few events so the manager's post-start state mutations land.
    for _ in 0..2 {
        let _ = tokio::time::timeout(std::time::Duration::from_secs(1), adapter_rx.recv()).await;
    }
    tokio::task::yield_now().await;

    let (health_tx, _health_rx) = tokio::sync::mpsc::channel(16);
    let monitor = HealthMonitor::new(manager.clone(), 60_000, 60_000, 3, health_tx);
    let report = monitor.check_once(chrono::Utc::now().timestamp_millis()).await;

    let healthy_count = report.platforms.iter().filter(|p| !p.unhealthy).count();
    assert_eq!(healthy_count, 1);
    assert_eq!(report.platforms.len(), 2);
    assert_eq!(report.overall, messaged::AggregateHealth::Degraded);
}

/// Scenario 5: two requests on one connection get two responses in order,
/// and restart-platform on an unknown platform fails cleanly without
/// closing the connection.
#[tokio::test]
async fn ipc_dispatch_handles_multiple_requests_on_one_connection() {
    let dir = tempfile::tempdir().unwrap();
    let socket_path = dir.path().join("messaged.sock");
    let db_path = dir.path().join("state.db");

    let store = Arc::new(StateStore::open(&db_path).unwrap());
    let normalizer = Arc::new(Normalizer::new(store.clone()));
    let notify = Arc::new(NotificationDispatcher::new(
        dir.path().join("daemon.log"),
        60_000,
        10 * 1024 * 1024,
        None,
    ));

    let (manager, _adapter_rx) = build_manager(&["signal"], vec![10_000, 30_000, 60_000]);
    manager
        .register(Arc::new(FakePlatformAdapter::new("signal")))
        .await;

    let (health_tx, _health_rx) = tokio::sync::mpsc::channel(16);
    let health_monitor = Arc::new(HealthMonitor::new(manager.clone(), 60_000, 60_000, 3, health_tx));

    let (shutting_down_tx, shutting_down_rx) = tokio::sync::watch::channel(false);
    let orchestrator = Arc::new(Orchestrator::new(
        manager.clone(),
        health_monitor,
        notify,
        store,
        normalizer,
        std::process::id(),
        shutting_down_tx.clone(),
    ));

    let serve_socket = socket_path.clone();
    let serve_orchestrator = orchestrator.clone();
    let serve_rx = shutting_down_rx.clone();
    let serve_handle = tokio::spawn(async move {
        messaged::ipc::serve(serve_socket, serve_orchestrator, serve_rx).await
    });

    // Give the listener a moment to bind.
    for _ in 0..50 {
        if socket_path.exists() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    let stream = UnixStream::connect(&socket_path).await.unwrap();
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    write_half.write_all(b"{\"type\":\"status\"}\n").await.unwrap();
    let first: serde_json::Value =
        serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
    assert_eq!(first["success"], true);

    write_half
        .write_all(b"{\"type\":\"restart-platform\",\"platform\":\"does-not-exist\"}\n")
        .await
        .unwrap();
    let second: serde_json::Value =
        serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
    assert_eq!(second["success"], false);

    let _ = shutting_down_tx.send(true);
    drop(write_half);
    let _ = tokio::time::timeout(std::time::Duration::from_secs(2), serve_handle).await;
}
