//! Health monitor: ticks every `check_interval_ms`, computing staleness and
//! recent-error-window health per platform, and an aggregate daemon-wide
//! status.

use std::collections::HashMap;
use std::sync::Arc;

use messages_core::PlatformState;
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, mpsc, watch};

use crate::manager::PlatformManager;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AggregateHealth {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformHealth {
    pub platform: String,
    pub connected: bool,
    pub stale: bool,
    pub recent_errors: u32,
    pub unhealthy: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub overall: AggregateHealth,
    pub platforms: Vec<PlatformHealth>,
}

#[derive(Debug, Clone)]
pub enum HealthEvent {
    Unhealthy { platform: String },
    Recovered { platform: String },
}

pub struct HealthMonitor {
    manager: Arc<PlatformManager>,
    stale_threshold_ms: i64,
    error_window_ms: i64,
    max_errors_before_unhealthy: u32,
    was_unhealthy: RwLock<HashMap<String, bool>>,
    events: mpsc::Sender<HealthEvent>,
}

impl HealthMonitor {
    pub fn new(
        manager: Arc<PlatformManager>,
        stale_threshold_ms: i64,
        error_window_ms: i64,
        max_errors_before_unhealthy: u32,
        events: mpsc::Sender<HealthEvent>,
    ) -> Self {
        Self {
            manager,
            stale_threshold_ms,
            error_window_ms,
            max_errors_before_unhealthy,
            was_unhealthy: RwLock::new(HashMap::new()),
            events,
        }
    }

    pub async fn check_once(&self, now_ms: i64) -> HealthReport {
        let states = self.manager.all_states().await;
        let mut platforms = Vec::with_capacity(states.len());

        for state in &states {
            let health = self.evaluate(state, now_ms);

            let mut was_unhealthy = self.was_unhealthy.write().await;
            let previously = was_unhealthy.get(&state.platform).copied().unwrap_or(false);
            if health.unhealthy && !previously {
                let _ = self
                    .events
                    .send(HealthEvent::Unhealthy {
                        platform: state.platform.clone(),
                    })
                    .await;
            } else if !health.unhealthy && previously {
                let _ = self
                    .events
                    .send(HealthEvent::Recovered {
                        platform: state.platform.clone(),
                    })
                    .await;
            }
            was_unhealthy.insert(state.platform.clone(), health.unhealthy);

            platforms.push(health);
        }

        let healthy_count = platforms.iter().filter(|p| !p.unhealthy).count();
        let overall = if healthy_count == platforms.len() && !platforms.is_empty() {
            AggregateHealth::Healthy
        } else if healthy_count > 0 {
            AggregateHealth::Degraded
        } else {
            AggregateHealth::Unhealthy
        };

        HealthReport { overall, platforms }
    }

    fn evaluate(&self, state: &PlatformState, now_ms: i64) -> PlatformHealth {
        let connected = state.status == "connected";
        let last_activity = state.last_message.max(state.last_connected);
        let stale = match last_activity {
            Some(ts) => (now_ms - ts) > self.stale_threshold_ms,
            None => false,
        };

        // The store keeps a cumulative error_count, not per-error timestamps;
        // treat it as "recent" only while the platform's last state change
        // falls inside the error window.
        let recent_errors = if (now_ms - state.updated_at) <= self.error_window_ms {
            state.error_count as u32
        } else {
            0
        };

        let unhealthy =
            !connected || stale || recent_errors >= self.max_errors_before_unhealthy;

        PlatformHealth {
            platform: state.platform.clone(),
            connected,
            stale,
            recent_errors,
            unhealthy,
        }
    }

    pub async fn run(self: Arc<Self>, check_interval_ms: u64, mut shutting_down: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(std::time::Duration::from_millis(check_interval_ms));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let now = chrono::Utc::now().timestamp_millis();
                    self.check_once(now).await;
                }
                _ = shutting_down.changed() => {
                    if *shutting_down.borrow() {
                        return;
                    }
                }
            }
        }
    }
}
