//! Owns every platform adapter, its live status, and its recovery timer.
//! Startup/shutdown follow the configured priority list (most reliable
//! first; shutdown is the reverse). Recovery timers are gated-sleep tasks
//! (`tokio::select!` over a timer and a shutdown watch).

use std::collections::HashMap;
use std::sync::Arc;

use messages_core::{PlatformState, PlatformStatus};
use tokio::sync::{Mutex, RwLock, mpsc, watch};
use tokio::task::JoinHandle;

use crate::adapter::{AdapterEvent, PlatformAdapter};

pub struct PlatformEntry {
    pub adapter: Arc<dyn PlatformAdapter>,
    pub state: Mutex<PlatformState>,
    pub transition_lock: Mutex<()>,
    pub recovery_timer: Mutex<Option<JoinHandle<()>>>,
}

pub struct PlatformManager {
    entries: RwLock<HashMap<String, Arc<PlatformEntry>>>,
    priority: Vec<String>,
    backoff_schedule_ms: Vec<u64>,
    max_reconnect_attempts: u32,
    events: mpsc::Sender<(String, AdapterEvent)>,
    shutting_down: watch::Sender<bool>,
}

impl PlatformManager {
    pub fn new(
        priority: Vec<String>,
        backoff_schedule_ms: Vec<u64>,
        max_reconnect_attempts: u32,
        events: mpsc::Sender<(String, AdapterEvent)>,
    ) -> Self {
        let (shutting_down, _) = watch::channel(false);
        Self {
            entries: RwLock::new(HashMap::new()),
            priority,
            backoff_schedule_ms,
            max_reconnect_attempts,
            events,
            shutting_down,
        }
    }

    pub async fn register(&self, adapter: Arc<dyn PlatformAdapter>) {
        let platform = adapter.platform().to_string();
        let now = now_ms();
        let entry = Arc::new(PlatformEntry {
            adapter,
            state: Mutex::new(PlatformState {
                platform: platform.clone(),
                status: PlatformStatus::Stopped.as_str().to_string(),
                updated_at: now,
                ..Default::default()
            }),
            transition_lock: Mutex::new(()),
            recovery_timer: Mutex::new(None),
        });
        self.entries.write().await.insert(platform, entry);
    }

    pub async fn state_of(&self, platform: &str) -> Option<PlatformState> {
        let entries = self.entries.read().await;
        let entry = entries.get(platform)?;
        Some(entry.state.lock().await.clone())
    }

    pub async fn all_states(&self) -> Vec<PlatformState> {
        let entries = self.entries.read().await;
        let mut out = Vec::new();
        for name in &self.priority {
            if let Some(entry) = entries.get(name) {
                out.push(entry.state.lock().await.clone());
            }
        }
        out
    }

    pub async fn start_all(self: &Arc<Self>) {
        for platform in self.priority.clone() {
            self.start_platform(&platform).await;
        }
    }

    pub async fn stop_all(self: &Arc<Self>) {
        let _ = self.shutting_down.send(true);
        for platform in self.priority.iter().rev().cloned().collect::<Vec<_>>() {
            self.stop_platform(&platform).await;
        }
    }

    pub async fn start_platform(self: &Arc<Self>, platform: &str) {
        let Some(entry) = self.entries.read().await.get(platform).cloned() else {
            return;
        };
        let _guard = entry.transition_lock.lock().await;

        {
            let state = entry.state.lock().await;
            if state.status == PlatformStatus::Connected.as_str()
                || state.status == PlatformStatus::Starting.as_str()
            {
                return;
            }
        }

        {
            let mut state = entry.state.lock().await;
            state.status = PlatformStatus::Starting.as_str().to_string();
            state.updated_at = now_ms();
        }
        let (adapter_events_tx, mut adapter_events_rx) = mpsc::channel::<AdapterEvent>(64);
        let adapter = entry.adapter.clone();
        let manager = self.clone();
        let entry_for_events = entry.clone();
        let platform_owned = platform.to_string();

        tokio::spawn(async move {
            let start_result = adapter.start(adapter_events_tx).await;
            while let Some(event) = adapter_events_rx.recv().await {
                update_state_on_event(&entry_for_events, &event).await;
                let _ = manager
                    .events
                    .send((platform_owned.clone(), event))
                    .await;
            }
            manager
                .handle_adapter_exit(&platform_owned, start_result)
                .await;
        });
    }

    async fn handle_adapter_exit(
        self: &Arc<Self>,
        platform: &str,
        result: Result<(), crate::adapter::PlatformAdapterError>,
    ) {
        let Some(entry) = self.entries.read().await.get(platform).cloned() else {
            return;
        };
        let _guard = entry.transition_lock.lock().await;

        if *self.shutting_down.borrow() {
            return;
        }

        let mut state = entry.state.lock().await;
        match result {
            Ok(()) => {
                if state.status == PlatformStatus::Stopped.as_str() {
                    return;
                }
                state.status = PlatformStatus::Disconnected.as_str().to_string();
            }
            Err(e) => {
                state.status = PlatformStatus::Error.as_str().to_string();
                state.error_count += 1;
                state.last_error = Some(e.to_string());
            }
        }
        state.updated_at = now_ms();
        let attempt = state.reconnect_attempts;
        drop(state);
        drop(_guard);

        self.schedule_recovery(platform, attempt).await;
    }

    async fn schedule_recovery(self: &Arc<Self>, platform: &str, attempt: u32) {
        let Some(entry) = self.entries.read().await.get(platform).cloned() else {
            return;
        };

        if attempt >= self.max_reconnect_attempts {
            let mut state = entry.state.lock().await;
            state.status = PlatformStatus::Error.as_str().to_string();
            state.updated_at = now_ms();
            drop(state);
            let _ = self
                .events
                .send((
                    platform.to_string(),
                    AdapterEvent::Error {
                        error: "max reconnect attempts exhausted".to_string(),
                        retryable: false,
                    },
                ))
                .await;
            return;
        }

        let delay_ms = backoff_delay_ms(&self.backoff_schedule_ms, attempt);

        {
            let mut state = entry.state.lock().await;
            state.status = PlatformStatus::Recovering.as_str().to_string();
            state.reconnect_attempts += 1;
            state.updated_at = now_ms();
        }

        let manager = self.clone();
        let platform_owned = platform.to_string();
        let mut shutting_down = self.shutting_down.subscribe();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(std::time::Duration::from_millis(delay_ms)) => {
                    if !*shutting_down.borrow() {
                        manager.start_platform(&platform_owned).await;
                    }
                }
                _ = shutting_down.changed() => {}
            }
        });
        *entry.recovery_timer.lock().await = Some(handle);
    }

    pub async fn stop_platform(self: &Arc<Self>, platform: &str) {
        let Some(entry) = self.entries.read().await.get(platform).cloned() else {
            return;
        };
        let _guard = entry.transition_lock.lock().await;

        if let Some(handle) = entry.recovery_timer.lock().await.take() {
            handle.abort();
        }

        let stop_future = entry.adapter.stop();
        if tokio::time::timeout(std::time::Duration::from_secs(5), stop_future)
            .await
            .is_err()
        {
            tracing::warn!(platform, "adapter stop() exceeded timeout, proceeding anyway");
        }

        let mut state = entry.state.lock().await;
        state.status = PlatformStatus::Stopped.as_str().to_string();
        state.reconnect_attempts = 0;
        state.updated_at = now_ms();
        drop(state);

        let _ = self
            .events
            .send((
                platform.to_string(),
                AdapterEvent::Disconnected {
                    reason: "stopped".to_string(),
                },
            ))
            .await;
    }

    pub async fn is_authenticated(&self, platform: &str) -> bool {
        let entries = self.entries.read().await;
        match entries.get(platform) {
            Some(entry) => entry.adapter.is_authenticated().await,
            None => false,
        }
    }

    pub fn priority(&self) -> &[String] {
        &self.priority
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Keeps `PlatformEntry::state` in sync with what the adapter reports, ahead
/// of forwarding the same event upstream. `all_states`/health checks read
/// only this local copy, so it must not lag behind what subscribers see.
async fn update_state_on_event(entry: &PlatformEntry, event: &AdapterEvent) {
    let mut state = entry.state.lock().await;
    match event {
        AdapterEvent::Connected => {
            state.status = PlatformStatus::Connected.as_str().to_string();
            state.reconnect_attempts = 0;
        }
        AdapterEvent::Disconnected { reason } => {
            state.status = PlatformStatus::Disconnected.as_str().to_string();
            state.last_error = Some(reason.clone());
        }
        AdapterEvent::Error { error, .. } => {
            state.status = PlatformStatus::Error.as_str().to_string();
            state.error_count += 1;
            state.last_error = Some(error.clone());
        }
        AdapterEvent::Message(_) => {
            state.message_count += 1;
            state.last_message = Some(now_ms());
        }
    }
    state.updated_at = now_ms();
}

/// Delay before reconnect attempt number `attempt` (0-indexed), clamped to
/// the last entry once the schedule runs out.
fn backoff_delay_ms(schedule: &[u64], attempt: u32) -> u64 {
    let idx = (attempt as usize).min(schedule.len().saturating_sub(1));
    schedule.get(idx).copied().unwrap_or(300_000)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_delay_follows_schedule_then_clamps() {
        let schedule = vec![10_000, 30_000, 60_000, 120_000, 300_000];
        assert_eq!(backoff_delay_ms(&schedule, 0), 10_000);
        assert_eq!(backoff_delay_ms(&schedule, 1), 30_000);
        assert_eq!(backoff_delay_ms(&schedule, 2), 60_000);
        assert_eq!(backoff_delay_ms(&schedule, 4), 300_000);
        // Beyond the schedule's length, clamp to the last entry.
        assert_eq!(backoff_delay_ms(&schedule, 10), 300_000);
    }

    #[test]
    fn backoff_delay_handles_empty_schedule() {
        assert_eq!(backoff_delay_ms(&[], 0), 300_000);
    }

    #[tokio::test]
    async fn start_all_registers_platforms_in_priority_order() {
        let (tx, _rx) = mpsc::channel(16);
        let manager = Arc::new(PlatformManager::new(
            vec!["signal".to_string(), "telegram".to_string()],
            vec![10, 20],
            3,
            tx,
        ));
        manager
            .register(Arc::new(crate::adapter::fake::FakePlatformAdapter::new("signal")))
            .await;
        manager
            .register(Arc::new(crate::adapter::fake::FakePlatformAdapter::new("telegram")))
            .await;

        let states = manager.all_states().await;
        assert_eq!(states.len(), 2);
        assert_eq!(states[0].platform, "signal");
        assert_eq!(states[1].platform, "telegram");
    }
}
