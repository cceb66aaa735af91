//! The contract every platform implements.
//!
//! Grounded on `AgentAdapter` in `alfredjeanlab-oddjobs`'s
//! `crates/daemon/src/adapters/agent/mod.rs`: an `async_trait` lifecycle
//! interface plus an event channel handed to the adapter at construction,
//! with a `Fake` test double behind `#[cfg(test)]`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum PlatformAdapterError {
    #[error("{platform}: not authenticated")]
    NotAuthenticated { platform: String },
    #[error("{platform}: timed out talking to remote service")]
    Timeout { platform: String },
    #[error("{platform}: connection dropped: {reason}")]
    Disconnected { platform: String, reason: String },
    #[error("{platform}: credentials rejected: {reason}")]
    AuthRejected { platform: String, reason: String },
    #[error("{platform}: unparsable payload: {reason}")]
    Protocol { platform: String, reason: String },
    #[error("adapter error: {0}")]
    Other(String),
}

/// Point-in-time counters surfaced by `status`/`health`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdapterStats {
    pub message_count: u64,
    pub error_count: u64,
    pub last_message: Option<i64>,
    pub last_error: Option<String>,
    pub is_connected: bool,
}

/// Emitted by an adapter to its owning `PlatformManager` as things happen.
/// Delivery is FIFO per adapter via `mpsc`'s ordering guarantee, so
/// emissions are never lost or reordered on the way to the manager.
#[derive(Debug, Clone)]
pub enum AdapterEvent {
    Connected,
    Disconnected { reason: String },
    Error { error: String, retryable: bool },
    Message(Box<RawPlatformPayload>),
}

/// The untyped payload an adapter hands upstream; tagged by platform so the
/// normalizer can dispatch without a middle translation layer per platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "platform", rename_all = "snake_case")]
pub enum RawPlatformPayload {
    Signal(serde_json::Value),
    Whatsapp(serde_json::Value),
    Discord(serde_json::Value),
    Telegram(serde_json::Value),
    Gmail(serde_json::Value),
}

impl RawPlatformPayload {
    pub fn platform_name(&self) -> &'static str {
        match self {
            RawPlatformPayload::Signal(_) => "signal",
            RawPlatformPayload::Whatsapp(_) => "whatsapp",
            RawPlatformPayload::Discord(_) => "discord",
            RawPlatformPayload::Telegram(_) => "telegram",
            RawPlatformPayload::Gmail(_) => "gmail",
        }
    }
}

/// Per-platform adapter lifecycle. Implementations own their own
/// reconnection for transient faults; they only surface to the manager once
/// local retries are exhausted or the fault looks non-transient.
#[async_trait]
pub trait PlatformAdapter: Send + Sync + 'static {
    fn platform(&self) -> &'static str;

    /// Cheap check, may perform a lightweight handshake.
    async fn is_authenticated(&self) -> bool;

    /// Begins streaming. Must emit `Connected` once ready and
    /// `Error` + return on terminal failure.
    async fn start(&self, events: mpsc::Sender<AdapterEvent>) -> Result<(), PlatformAdapterError>;

    /// Closes resources. Idempotent; must not throw after the first call.
    async fn stop(&self);

    async fn is_connected(&self) -> bool;

    async fn get_stats(&self) -> AdapterStats;
}

#[cfg(any(test, feature = "test-support"))]
pub mod fake {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    #[derive(Debug, Clone)]
    pub enum FakeCall {
        Start,
        Stop,
    }

    struct FakeState {
        calls: Vec<FakeCall>,
        connected: bool,
        stats: AdapterStats,
        start_result: Option<PlatformAdapterError>,
    }

    #[derive(Clone)]
    pub struct FakePlatformAdapter {
        platform: &'static str,
        inner: Arc<Mutex<FakeState>>,
        stop_signal: Arc<tokio::sync::Notify>,
    }

    impl FakePlatformAdapter {
        pub fn new(platform: &'static str) -> Self {
            Self {
                platform,
                inner: Arc::new(Mutex::new(FakeState {
                    calls: Vec::new(),
                    connected: false,
                    stats: AdapterStats::default(),
                    start_result: None,
                })),
                stop_signal: Arc::new(tokio::sync::Notify::new()),
            }
        }

        pub fn fail_next_start(&self, error: PlatformAdapterError) {
            if let Ok(mut guard) = self.inner.try_lock() {
                guard.start_result = Some(error);
            }
        }

        pub async fn calls(&self) -> Vec<FakeCall> {
            self.inner.lock().await.calls.clone()
        }
    }

    #[async_trait]
    impl PlatformAdapter for FakePlatformAdapter {
        fn platform(&self) -> &'static str {
            self.platform
        }

        async fn is_authenticated(&self) -> bool {
            true
        }

        async fn start(
            &self,
            events: mpsc::Sender<AdapterEvent>,
        ) -> Result<(), PlatformAdapterError> {
            let mut guard = self.inner.lock().await;
            guard.calls.push(FakeCall::Start);
            if let Some(err) = guard.start_result.take() {
                let _ = events
                    .send(AdapterEvent::Error {
                        error: err.to_string(),
                        retryable: true,
                    })
                    .await;
                return Err(err);
            }
            guard.connected = true;
            drop(guard);
            let _ = events.send(AdapterEvent::Connected).await;
            // Mirrors a real adapter's connection loop: stay "started" until
            // told to stop, rather than returning as soon as connected.
            self.stop_signal.notified().await;
            Ok(())
        }

        async fn stop(&self) {
            let mut guard = self.inner.lock().await;
            guard.calls.push(FakeCall::Stop);
            guard.connected = false;
            drop(guard);
            self.stop_signal.notify_one();
        }

        async fn is_connected(&self) -> bool {
            self.inner.lock().await.connected
        }

        async fn get_stats(&self) -> AdapterStats {
            self.inner.lock().await.stats.clone()
        }
    }
}
