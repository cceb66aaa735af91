//! Signal adapter: JSON-RPC over a local Unix stream socket to `signal-cli`
//! running in daemon mode.
//!
//! Thread ids are the group's canonical base64 id, or a normalized phone
//! number for 1:1 chats. Base64 is canonical everywhere a thread is looked
//! up; the hex form below exists only to make log lines short and must
//! never be used as a lookup key.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::{Mutex, mpsc};

use crate::adapter::{AdapterEvent, AdapterStats, PlatformAdapter, PlatformAdapterError, RawPlatformPayload};

/// Base64 group id → shortened hex, for trace logging only.
pub fn group_id_debug_hex(base64_group_id: &str) -> String {
    use base64::Engine;
    match base64::engine::general_purpose::STANDARD.decode(base64_group_id) {
        Ok(bytes) => hex::encode(&bytes)[..bytes.len().min(8) * 2].to_string(),
        Err(_) => "invalid-base64".to_string(),
    }
}

pub struct SignalAdapter {
    socket_path: String,
    connected: Arc<AtomicBool>,
    stats: Arc<Mutex<AdapterStats>>,
}

impl SignalAdapter {
    pub fn new(socket_path: impl Into<String>) -> Self {
        Self {
            socket_path: socket_path.into(),
            connected: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(Mutex::new(AdapterStats::default())),
        }
    }

    pub fn from_env(default_path: &str) -> Self {
        let path = std::env::var("SIGNAL_CLI_SOCKET").unwrap_or_else(|_| default_path.to_string());
        Self::new(path)
    }
}

#[async_trait]
impl PlatformAdapter for SignalAdapter {
    fn platform(&self) -> &'static str {
        "signal"
    }

    async fn is_authenticated(&self) -> bool {
        UnixStream::connect(&self.socket_path).await.is_ok()
    }

    async fn start(&self, events: mpsc::Sender<AdapterEvent>) -> Result<(), PlatformAdapterError> {
        let stream = UnixStream::connect(&self.socket_path).await.map_err(|e| {
            PlatformAdapterError::Disconnected {
                platform: "signal".to_string(),
                reason: format!("connect to {}: {e}", self.socket_path),
            }
        })?;

        self.connected.store(true, Ordering::SeqCst);
        let _ = events.send(AdapterEvent::Connected).await;

        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half).lines();

        // "subscribeReceive" keeps signal-cli streaming envelopes on this connection.
        let subscribe = serde_json::json!({"jsonrpc": "2.0", "method": "subscribeReceive", "id": "messaged-subscribe"});
        if write_half
            .write_all(format!("{subscribe}\n").as_bytes())
            .await
            .is_err()
        {
            self.connected.store(false, Ordering::SeqCst);
            let _ = events
                .send(AdapterEvent::Disconnected {
                    reason: "failed to send subscribeReceive".to_string(),
                })
                .await;
            return Ok(());
        }

        loop {
            match reader.next_line().await {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<Value>(&line) {
                        Ok(value) => {
                            let mut stats = self.stats.lock().await;
                            stats.message_count += 1;
                            stats.last_message = Some(chrono::Utc::now().timestamp_millis());
                            drop(stats);
                            let _ = events
                                .send(AdapterEvent::Message(Box::new(RawPlatformPayload::Signal(
                                    value,
                                ))))
                                .await;
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "signal: unparsable line from signal-cli");
                            let mut stats = self.stats.lock().await;
                            stats.error_count += 1;
                        }
                    }
                }
                Ok(None) => {
                    self.connected.store(false, Ordering::SeqCst);
                    let _ = events
                        .send(AdapterEvent::Disconnected {
                            reason: "signal-cli closed the socket".to_string(),
                        })
                        .await;
                    return Ok(());
                }
                Err(e) => {
                    self.connected.store(false, Ordering::SeqCst);
                    let _ = events
                        .send(AdapterEvent::Disconnected {
                            reason: format!("socket read error: {e}"),
                        })
                        .await;
                    return Ok(());
                }
            }
        }
    }

    async fn stop(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn get_stats(&self) -> AdapterStats {
        let mut stats = self.stats.lock().await;
        stats.is_connected = self.connected.load(Ordering::SeqCst);
        stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_hex_is_short_and_deterministic() {
        let a = group_id_debug_hex("c29tZS1ncm91cC1pZA==");
        let b = group_id_debug_hex("c29tZS1ncm91cC1pZA==");
        assert_eq!(a, b);
    }

    #[test]
    fn invalid_base64_does_not_panic() {
        assert_eq!(group_id_debug_hex("***not base64***"), "invalid-base64");
    }
}
