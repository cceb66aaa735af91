//! Top-level supervisor: wires the platform manager, health monitor, and
//! notification dispatcher together and owns daemon-wide status.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use messages_core::{DaemonState, DaemonStatus, Normalizer, StateStore};
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, mpsc, watch};

use crate::adapter::AdapterEvent;
use crate::health::{AggregateHealth, HealthEvent, HealthMonitor, HealthReport};
use crate::manager::PlatformManager;
use crate::notify::{NotificationDispatcher, NotifyLevel};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonStatusView {
    pub status: String,
    pub pid: u32,
    pub uptime_seconds: i64,
    pub started_at_iso: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformStatusView {
    pub id: String,
    pub status: String,
    pub message_count: i64,
    pub last_message_iso: Option<String>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSummary {
    pub healthy: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub daemon: DaemonStatusView,
    pub platforms: Vec<PlatformStatusView>,
    pub summary: StatusSummary,
}

pub struct Orchestrator {
    pub manager: Arc<PlatformManager>,
    pub health_monitor: Arc<HealthMonitor>,
    pub notify: Arc<NotificationDispatcher>,
    pub store: Arc<StateStore>,
    pub normalizer: Arc<Normalizer>,
    started_at_ms: i64,
    pid: u32,
    status: RwLock<DaemonStatus>,
    shutting_down: watch::Sender<bool>,
    running: AtomicBool,
}

impl Orchestrator {
    pub fn new(
        manager: Arc<PlatformManager>,
        health_monitor: Arc<HealthMonitor>,
        notify: Arc<NotificationDispatcher>,
        store: Arc<StateStore>,
        normalizer: Arc<Normalizer>,
        pid: u32,
        shutting_down: watch::Sender<bool>,
    ) -> Self {
        Self {
            manager,
            health_monitor,
            notify,
            store,
            normalizer,
            started_at_ms: chrono::Utc::now().timestamp_millis(),
            pid,
            status: RwLock::new(DaemonStatus::Stopped),
            shutting_down,
            running: AtomicBool::new(false),
        }
    }

    pub async fn start(self: &Arc<Self>) {
        self.store
            .record_start(self.pid, self.started_at_ms)
            .await
            .ok();

        let mut authenticated = Vec::new();
        for platform in self.manager.priority().to_vec() {
            if self.manager.is_authenticated(&platform).await {
                authenticated.push(platform);
            }
        }

        self.manager.start_all().await;
        self.running.store(true, Ordering::SeqCst);

        let initial = if authenticated.is_empty() {
            DaemonStatus::Stopped
        } else {
            DaemonStatus::Starting
        };
        *self.status.write().await = initial;

        self.notify
            .notify(
                NotifyLevel::Info,
                "daemon",
                "messaged started",
                None,
                chrono::Utc::now().timestamp_millis(),
            )
            .await;
    }

    pub async fn stop(self: &Arc<Self>) {
        *self.status.write().await = DaemonStatus::Stopping;
        let _ = self.shutting_down.send(true);
        self.manager.stop_all().await;
        self.running.store(false, Ordering::SeqCst);

        self.store
            .record_shutdown(true, chrono::Utc::now().timestamp_millis())
            .await
            .ok();
        *self.status.write().await = DaemonStatus::Stopped;

        self.notify
            .notify(
                NotifyLevel::Info,
                "daemon",
                "messaged stopped",
                None,
                chrono::Utc::now().timestamp_millis(),
            )
            .await;
    }

    pub async fn restart_platform(self: &Arc<Self>, platform: &str) -> bool {
        if !self.manager.priority().iter().any(|p| p == platform) {
            return false;
        }
        self.manager.stop_platform(platform).await;
        self.manager.start_platform(platform).await;
        true
    }

    pub async fn status_response(&self) -> StatusResponse {
        let states = self.manager.all_states().await;
        let healthy = states.iter().filter(|s| s.status == "connected").count();
        let total = states.len();

        let daemon_state = DaemonState {
            status: *self.status.read().await,
            pid: self.pid,
            started_at: self.started_at_ms,
            platforms: states.clone(),
            healthy,
            total,
        };

        StatusResponse {
            daemon: DaemonStatusView {
                status: daemon_state.status.as_str().to_string(),
                pid: self.pid,
                uptime_seconds: daemon_state.uptime_seconds(chrono::Utc::now().timestamp_millis()),
                started_at_iso: millis_to_iso(self.started_at_ms),
            },
            platforms: states
                .into_iter()
                .map(|s| PlatformStatusView {
                    id: s.platform,
                    status: s.status,
                    message_count: s.message_count,
                    last_message_iso: s.last_message.map(millis_to_iso),
                    last_error: s.last_error,
                })
                .collect(),
            summary: StatusSummary { healthy, total },
        }
    }

    pub async fn health_report(&self) -> HealthReport {
        self.health_monitor
            .check_once(chrono::Utc::now().timestamp_millis())
            .await
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Consumes adapter events forever, persisting platform state and
    /// routing to the notification dispatcher and normalizer.
    pub async fn run_event_loop(
        self: Arc<Self>,
        mut adapter_events: mpsc::Receiver<(String, AdapterEvent)>,
        mut health_events: mpsc::Receiver<HealthEvent>,
    ) {
        loop {
            tokio::select! {
                Some((platform, event)) = adapter_events.recv() => {
                    self.handle_adapter_event(&platform, event).await;
                }
                Some(event) = health_events.recv() => {
                    self.handle_health_event(event).await;
                }
                else => break,
            }
        }
    }

    async fn handle_adapter_event(self: &Arc<Self>, platform: &str, event: AdapterEvent) {
        let now = chrono::Utc::now().timestamp_millis();
        match event {
            AdapterEvent::Connected => {
                if let Some(mut state) = self.manager.state_of(platform).await {
                    state.last_connected = Some(now);
                    state.updated_at = now;
                    self.store.save_platform_state(&state).await.ok();
                }
                self.notify
                    .notify(NotifyLevel::Info, platform, "connected", Some(platform.to_string()), now)
                    .await;
                self.recompute_status().await;
            }
            AdapterEvent::Disconnected { reason } => {
                if let Some(mut state) = self.manager.state_of(platform).await {
                    state.updated_at = now;
                    self.store.save_platform_state(&state).await.ok();
                }
                self.notify
                    .notify(NotifyLevel::Warning, platform, &reason, Some(platform.to_string()), now)
                    .await;
                self.recompute_status().await;
            }
            AdapterEvent::Error { error, retryable } => {
                if let Some(mut state) = self.manager.state_of(platform).await {
                    state.last_error = Some(error.clone());
                    state.updated_at = now;
                    self.store.save_platform_state(&state).await.ok();
                }
                let level = if retryable { NotifyLevel::Warning } else { NotifyLevel::Error };
                self.notify
                    .notify(level, platform, &error, Some(platform.to_string()), now)
                    .await;
                self.recompute_status().await;
            }
            AdapterEvent::Message(payload) => {
                // manager.rs already bumped message_count/last_message on
                // this platform's in-memory state before forwarding the
                // event here; just persist it.
                if let Some(state) = self.manager.state_of(platform).await {
                    self.store.save_platform_state(&state).await.ok();
                }

                match crate::ingest::parse(&payload, now) {
                    Some(parsed) => {
                        let input = parsed.to_ingest_input(platform, now);
                        match self.normalizer.ingest(input).await {
                            Ok((message_id, was_new)) => {
                                tracing::debug!(platform, message_id, was_new, "ingested message");
                            }
                            Err(err) => {
                                tracing::warn!(platform, error = %err, "failed to ingest message");
                                self.notify
                                    .notify(
                                        NotifyLevel::Error,
                                        platform,
                                        &format!("ingest failed: {err}"),
                                        Some(platform.to_string()),
                                        now,
                                    )
                                    .await;
                            }
                        }
                    }
                    None => {
                        tracing::debug!(
                            platform,
                            payload = payload.platform_name(),
                            "payload is not an ingestible message, dropping"
                        );
                    }
                }
            }
        }
    }

    async fn handle_health_event(self: &Arc<Self>, event: HealthEvent) {
        let now = chrono::Utc::now().timestamp_millis();
        match event {
            HealthEvent::Unhealthy { platform } => {
                self.notify
                    .notify(NotifyLevel::Warning, &platform, "health check failed", Some(platform.clone()), now)
                    .await;
            }
            HealthEvent::Recovered { platform } => {
                self.notify
                    .notify(NotifyLevel::Info, &platform, "recovered", Some(platform.clone()), now)
                    .await;
            }
        }
        self.recompute_status().await;
    }

    async fn recompute_status(&self) {
        let report = self.health_report().await;
        let new_status = match report.overall {
            AggregateHealth::Healthy => DaemonStatus::Running,
            AggregateHealth::Degraded => DaemonStatus::Degraded,
            AggregateHealth::Unhealthy => DaemonStatus::Degraded,
        };
        *self.status.write().await = new_status;
    }
}

fn millis_to_iso(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| "unknown".to_string())
}
