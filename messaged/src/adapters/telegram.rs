//! Telegram adapter: Bot API long-poll ingress, no webhook server required.
//! Thread ids are derived from the chat id. Outbound sends are chunked at
//! the Bot API's 4096-character limit by `TELEGRAM_MAX_TEXT_CHARS` and
//! `split_for_telegram` below.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Mutex, mpsc};

use crate::adapter::{AdapterEvent, AdapterStats, PlatformAdapter, PlatformAdapterError, RawPlatformPayload};

pub const TELEGRAM_MAX_TEXT_CHARS: usize = 4096;
const LONG_POLL_TIMEOUT_SECS: u64 = 30;

pub fn split_for_telegram(text: &str, max_chars: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut chars_in_current = 0_usize;

    for ch in text.chars() {
        if chars_in_current >= max_chars {
            chunks.push(current);
            current = String::new();
            chars_in_current = 0;
        }
        current.push(ch);
        chars_in_current += 1;
    }

    if !current.is_empty() {
        chunks.push(current);
    }

    chunks
}

pub struct TelegramAdapter {
    bot_token: String,
    client: reqwest::Client,
    connected: Arc<AtomicBool>,
    stats: Arc<Mutex<AdapterStats>>,
    last_update_id: Arc<AtomicI64>,
}

impl TelegramAdapter {
    pub fn new(bot_token: impl Into<String>) -> Self {
        Self {
            bot_token: bot_token.into(),
            client: reqwest::Client::new(),
            connected: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(Mutex::new(AdapterStats::default())),
            last_update_id: Arc::new(AtomicI64::new(0)),
        }
    }

    pub fn from_env() -> Option<Self> {
        std::env::var("TELEGRAM_BOT_TOKEN").ok().map(Self::new)
    }

    fn api_url(&self, method: &str) -> String {
        format!("https://api.telegram.org/bot{}/{method}", self.bot_token)
    }

    pub async fn send_text(&self, chat_id: i64, text: &str) -> Result<(), PlatformAdapterError> {
        for chunk in split_for_telegram(text, TELEGRAM_MAX_TEXT_CHARS) {
            self.client
                .post(self.api_url("sendMessage"))
                .json(&serde_json::json!({"chat_id": chat_id, "text": chunk}))
                .send()
                .await
                .map_err(|e| PlatformAdapterError::Disconnected {
                    platform: "telegram".to_string(),
                    reason: e.to_string(),
                })?;
        }
        Ok(())
    }
}

#[async_trait]
impl PlatformAdapter for TelegramAdapter {
    fn platform(&self) -> &'static str {
        "telegram"
    }

    async fn is_authenticated(&self) -> bool {
        let response = self.client.get(self.api_url("getMe")).send().await;
        matches!(response, Ok(r) if r.status().is_success())
    }

    async fn start(&self, events: mpsc::Sender<AdapterEvent>) -> Result<(), PlatformAdapterError> {
        if self.bot_token.trim().is_empty() {
            return Err(PlatformAdapterError::NotAuthenticated {
                platform: "telegram".to_string(),
            });
        }

        self.connected.store(true, Ordering::SeqCst);
        let _ = events.send(AdapterEvent::Connected).await;

        loop {
            let offset = self.last_update_id.load(Ordering::SeqCst) + 1;
            let response = self
                .client
                .get(self.api_url("getUpdates"))
                .query(&[
                    ("offset", offset.to_string()),
                    ("timeout", LONG_POLL_TIMEOUT_SECS.to_string()),
                ])
                .timeout(std::time::Duration::from_secs(LONG_POLL_TIMEOUT_SECS + 10))
                .send()
                .await;

            let body: Value = match response {
                Ok(r) => match r.json().await {
                    Ok(v) => v,
                    Err(e) => {
                        let mut stats = self.stats.lock().await;
                        stats.error_count += 1;
                        stats.last_error = Some(e.to_string());
                        continue;
                    }
                },
                Err(e) => {
                    self.connected.store(false, Ordering::SeqCst);
                    let _ = events
                        .send(AdapterEvent::Disconnected {
                            reason: format!("getUpdates failed: {e}"),
                        })
                        .await;
                    return Ok(());
                }
            };

            let Some(results) = body.get("result").and_then(Value::as_array) else {
                continue;
            };

            for update in results {
                if let Some(update_id) = update.get("update_id").and_then(Value::as_i64) {
                    self.last_update_id.store(update_id, Ordering::SeqCst);
                }
                let mut stats = self.stats.lock().await;
                stats.message_count += 1;
                stats.last_message = Some(chrono::Utc::now().timestamp_millis());
                drop(stats);
                let _ = events
                    .send(AdapterEvent::Message(Box::new(RawPlatformPayload::Telegram(
                        update.clone(),
                    ))))
                    .await;
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
    fn split_for_telegram_keeps_chunks_within_limit() {
        let text = "a".repeat(9005);
        let chunks = split_for_telegram(&text, TELEGRAM_MAX_TEXT_CHARS);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.chars().count() <= TELEGRAM_MAX_TEXT_CHARS));
        assert_eq!(
            chunks.iter().map(|c| c.chars().count()).sum::<usize>(),
            text.chars().count()
        );
    }
}
