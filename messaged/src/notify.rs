//! Notification dispatcher: structured JSON log line per notification, plus
//! an optional desktop notification. Grounded on
//! `alfredjeanlab-oddjobs/crates/adapters/src/notify.rs`'s `NotifyAdapter` /
//! `DesktopNotifyAdapter` / `FakeNotifyAdapter` split.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("send failed: {0}")]
    SendFailed(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NotifyLevel {
    Info,
    Warning,
    Error,
}

impl NotifyLevel {
    fn as_str(&self) -> &'static str {
        match self {
            NotifyLevel::Info => "info",
            NotifyLevel::Warning => "warning",
            NotifyLevel::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NotifyPayload {
    pub level: NotifyLevel,
    pub title: String,
    pub body: String,
    pub platform: Option<String>,
    pub ts: i64,
}

#[async_trait]
pub trait NotifyAdapter: Send + Sync + 'static {
    async fn notify(&self, title: &str, message: &str) -> Result<(), NotifyError>;
}

/// Desktop notification adapter using `notify-rust`, dispatched via
/// `spawn_blocking` so the synchronous OS call never blocks the runtime.
#[derive(Clone, Copy, Debug, Default)]
pub struct DesktopNotifyAdapter;

#[async_trait]
impl NotifyAdapter for DesktopNotifyAdapter {
    async fn notify(&self, title: &str, message: &str) -> Result<(), NotifyError> {
        let title = title.to_string();
        let message = message.to_string();
        tokio::task::spawn_blocking(move || {
            match notify_rust::Notification::new().summary(&title).body(&message).show() {
                Ok(_) => tracing::info!(%title, "desktop notification sent"),
                Err(e) => tracing::warn!(%title, error = %e, "desktop notification failed"),
            }
        });
        Ok(())
    }
}

struct DedupEntry {
    last_sent_ms: i64,
}

/// Writes notifications as JSON lines to a log file, optionally forwarding
/// to a desktop adapter, with a dedup window and size-based rotation.
pub struct NotificationDispatcher {
    log_path: PathBuf,
    dedup_window_ms: i64,
    rotate_bytes: u64,
    desktop: Option<Arc<dyn NotifyAdapter>>,
    recent: Mutex<HashMap<(String, String, Option<String>), DedupEntry>>,
}

impl NotificationDispatcher {
    pub fn new(
        log_path: impl Into<PathBuf>,
        dedup_window_ms: i64,
        rotate_bytes: u64,
        desktop: Option<Arc<dyn NotifyAdapter>>,
    ) -> Self {
        Self {
            log_path: log_path.into(),
            dedup_window_ms,
            rotate_bytes,
            desktop,
            recent: Mutex::new(HashMap::new()),
        }
    }

    pub async fn notify(
        &self,
        level: NotifyLevel,
        title: impl Into<String>,
        body: impl Into<String>,
        platform: Option<String>,
        now_ms: i64,
    ) {
        let title = title.into();
        let body = body.into();
        let key = (level.as_str().to_string(), title.clone(), platform.clone());

        {
            let mut recent = self.recent.lock().await;
            if let Some(entry) = recent.get(&key) {
                if now_ms - entry.last_sent_ms < self.dedup_window_ms {
                    return;
                }
            }
            recent.insert(key, DedupEntry { last_sent_ms: now_ms });
        }

        let payload = NotifyPayload {
            level,
            title: title.clone(),
            body: body.clone(),
            platform: platform.clone(),
            ts: now_ms,
        };

        if let Err(e) = self.write_log_line(&payload).await {
            tracing::error!(error = %e, "notification log write failed, falling back to stderr");
        }

        if let Some(desktop) = &self.desktop {
            if let Err(e) = desktop.notify(&title, &body).await {
                tracing::warn!(error = %e, "desktop notification dispatch failed");
            }
        }
    }

    async fn write_log_line(&self, payload: &NotifyPayload) -> std::io::Result<()> {
        if let Some(parent) = self.log_path.parent() {
            tokio::fs::create_dir_all(parent).await.ok();
        }
        self.rotate_if_needed().await;

        let line = serde_json::to_string(payload).unwrap_or_else(|_| "{}".to_string());
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        Ok(())
    }

    async fn rotate_if_needed(&self) {
        let Ok(metadata) = tokio::fs::metadata(&self.log_path).await else {
            return;
        };
        if metadata.len() >= self.rotate_bytes {
            let rotated = rotated_path(&self.log_path);
            let _ = tokio::fs::rename(&self.log_path, rotated).await;
        }
    }
}

fn rotated_path(path: &Path) -> PathBuf {
    let mut rotated = path.as_os_str().to_owned();
    rotated.push(".old");
    PathBuf::from(rotated)
}

#[cfg(any(test, feature = "test-support"))]
pub mod fake {
    use super::*;
    use std::sync::Arc as StdArc;

    #[derive(Debug, Clone)]
    pub struct NotifyCall {
        pub title: String,
        pub message: String,
    }

    #[derive(Clone, Default)]
    pub struct FakeNotifyAdapter {
        calls: StdArc<Mutex<Vec<NotifyCall>>>,
    }

    impl FakeNotifyAdapter {
        pub fn new() -> Self {
            Self::default()
        }

        pub async fn calls(&self) -> Vec<NotifyCall> {
            self.calls.lock().await.clone()
        }
    }

    #[async_trait]
    impl NotifyAdapter for FakeNotifyAdapter {
        async fn notify(&self, title: &str, message: &str) -> Result<(), NotifyError> {
            self.calls.lock().await.push(NotifyCall {
                title: title.to_string(),
                message: message.to_string(),
            });
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dedup_window_suppresses_repeat_notifications() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = NotificationDispatcher::new(dir.path().join("daemon.log"), 60_000, 10 * 1024 * 1024, None);

        dispatcher.notify(NotifyLevel::Info, "signal", "connected", Some("signal".to_string()), 1_000).await;
        dispatcher.notify(NotifyLevel::Info, "signal", "connected", Some("signal".to_string()), 1_500).await;

        let contents = tokio::fs::read_to_string(dir.path().join("daemon.log")).await.unwrap();
        assert_eq!(contents.lines().count(), 1);
    }

    #[tokio::test]
    async fn notification_outside_window_is_not_deduped() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = NotificationDispatcher::new(dir.path().join("daemon.log"), 60_000, 10 * 1024 * 1024, None);

        dispatcher.notify(NotifyLevel::Info, "signal", "connected", Some("signal".to_string()), 1_000).await;
        dispatcher.notify(NotifyLevel::Info, "signal", "connected", Some("signal".to_string()), 70_000).await;

        let contents = tokio::fs::read_to_string(dir.path().join("daemon.log")).await.unwrap();
        assert_eq!(contents.lines().count(), 2);
    }
}
