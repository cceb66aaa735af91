//! Discord adapter: gateway WebSocket session with heartbeat/resume
//! semantics. Thread ids are derived from the channel id. Reconnection
//! honors the gateway's resume-vs-reidentify distinction: a resume token is
//! reused while it is still considered valid, otherwise a full `IDENTIFY`
//! is sent.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::adapter::{AdapterEvent, AdapterStats, PlatformAdapter, PlatformAdapterError, RawPlatformPayload};

const GATEWAY_URL: &str = "wss://gateway.discord.gg/?v=10&encoding=json";

const OP_DISPATCH: i64 = 0;
const OP_HEARTBEAT: i64 = 1;
const OP_IDENTIFY: i64 = 2;
const OP_RESUME: i64 = 6;
const OP_RECONNECT: i64 = 7;
const OP_INVALID_SESSION: i64 = 9;
const OP_HELLO: i64 = 10;
const OP_HEARTBEAT_ACK: i64 = 11;

#[derive(Default)]
struct ResumeState {
    session_id: Option<String>,
    resume_gateway_url: Option<String>,
    sequence: Option<i64>,
}

pub struct DiscordAdapter {
    bot_token: String,
    connected: Arc<AtomicBool>,
    stats: Arc<Mutex<AdapterStats>>,
    resume: Arc<Mutex<ResumeState>>,
}

impl DiscordAdapter {
    pub fn new(bot_token: impl Into<String>) -> Self {
        Self {
            bot_token: bot_token.into(),
            connected: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(Mutex::new(AdapterStats::default())),
            resume: Arc::new(Mutex::new(ResumeState::default())),
        }
    }

    pub fn from_env() -> Option<Self> {
        std::env::var("DISCORD_BOT_TOKEN").ok().map(Self::new)
    }
}

#[async_trait]
impl PlatformAdapter for DiscordAdapter {
    fn platform(&self) -> &'static str {
        "discord"
    }

    async fn is_authenticated(&self) -> bool {
        !self.bot_token.trim().is_empty()
    }

    async fn start(&self, events: mpsc::Sender<AdapterEvent>) -> Result<(), PlatformAdapterError> {
        if !self.is_authenticated().await {
            return Err(PlatformAdapterError::NotAuthenticated {
                platform: "discord".to_string(),
            });
        }

        let resume_snapshot = {
            let guard = self.resume.lock().await;
            (guard.session_id.clone(), guard.resume_gateway_url.clone())
        };
        let url = resume_snapshot
            .1
            .clone()
            .unwrap_or_else(|| GATEWAY_URL.to_string());

        let (ws_stream, _) = connect_async(&url).await.map_err(|e| {
            PlatformAdapterError::Disconnected {
                platform: "discord".to_string(),
                reason: format!("gateway connect failed: {e}"),
            }
        })?;
        let (mut write, mut read) = ws_stream.split();

        let hello_text = match read.next().await {
            Some(Ok(WsMessage::Text(text))) => text,
            _ => {
                return Err(PlatformAdapterError::Protocol {
                    platform: "discord".to_string(),
                    reason: "gateway closed before HELLO".to_string(),
                });
            }
        };
        let hello: Value = serde_json::from_str(&hello_text).map_err(|e| {
            PlatformAdapterError::Protocol {
                platform: "discord".to_string(),
                reason: format!("malformed HELLO: {e}"),
            }
        })?;
        if hello.get("op").and_then(Value::as_i64) != Some(OP_HELLO) {
            return Err(PlatformAdapterError::Protocol {
                platform: "discord".to_string(),
                reason: "expected HELLO as first frame".to_string(),
            });
        }
        let heartbeat_interval_ms = hello["d"]["heartbeat_interval"].as_u64().unwrap_or(41_250);

        if let (Some(session_id), Some(sequence)) =
            (resume_snapshot.0, self.resume.lock().await.sequence)
        {
            let resume_payload = json!({
                "op": OP_RESUME,
                "d": { "token": self.bot_token, "session_id": session_id, "seq": sequence },
            });
            write
                .send(WsMessage::Text(resume_payload.to_string()))
                .await
                .ok();
        } else {
            let identify_payload = json!({
                "op": OP_IDENTIFY,
                "d": {
                    "token": self.bot_token,
                    "intents": 33280, // GUILD_MESSAGES | MESSAGE_CONTENT
                    "properties": { "os": "linux", "browser": "messaged", "device": "messaged" },
                },
            });
            write
                .send(WsMessage::Text(identify_payload.to_string()))
                .await
                .ok();
        }

        self.connected.store(true, Ordering::SeqCst);
        let _ = events.send(AdapterEvent::Connected).await;

        let mut heartbeat = tokio::time::interval(Duration::from_millis(heartbeat_interval_ms));
        heartbeat.tick().await; // first tick fires immediately

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    let seq = self.resume.lock().await.sequence;
                    if write.send(WsMessage::Text(json!({"op": OP_HEARTBEAT, "d": seq}).to_string())).await.is_err() {
                        self.connected.store(false, Ordering::SeqCst);
                        let _ = events.send(AdapterEvent::Disconnected { reason: "heartbeat send failed".to_string() }).await;
                        return Ok(());
                    }
                }
                frame = read.next() => {
                    match frame {
                        Some(Ok(WsMessage::Text(text))) => {
                            let Ok(parsed) = serde_json::from_str::<Value>(&text) else {
                                let mut stats = self.stats.lock().await;
                                stats.error_count += 1;
                                continue;
                            };
                            let op = parsed.get("op").and_then(Value::as_i64);
                            match op {
                                Some(OP_DISPATCH) => {
                                    if let Some(seq) = parsed.get("s").and_then(Value::as_i64) {
                                        self.resume.lock().await.sequence = Some(seq);
                                    }
                                    if parsed.get("t").and_then(Value::as_str) == Some("READY") {
                                        let mut resume = self.resume.lock().await;
                                        resume.session_id = parsed["d"]["session_id"].as_str().map(str::to_string);
                                        resume.resume_gateway_url = parsed["d"]["resume_gateway_url"].as_str().map(str::to_string);
                                    }
                                    let mut stats = self.stats.lock().await;
                                    stats.message_count += 1;
                                    stats.last_message = Some(chrono::Utc::now().timestamp_millis());
                                    drop(stats);
                                    let _ = events.send(AdapterEvent::Message(Box::new(RawPlatformPayload::Discord(parsed)))).await;
                                }
                                Some(OP_HEARTBEAT_ACK) => {}
                                Some(OP_RECONNECT) | Some(OP_INVALID_SESSION) => {
                                    if op == Some(OP_INVALID_SESSION) {
                                        let mut resume = self.resume.lock().await;
                                        resume.session_id = None;
                                        resume.resume_gateway_url = None;
                                    }
                                    self.connected.store(false, Ordering::SeqCst);
                                    let _ = events.send(AdapterEvent::Disconnected { reason: "gateway requested reconnect".to_string() }).await;
                                    return Ok(());
                                }
                                _ => {}
                            }
                        }
                        Some(Ok(WsMessage::Close(frame))) => {
                            self.connected.store(false, Ordering::SeqCst);
                            let _ = events.send(AdapterEvent::Disconnected { reason: format!("gateway closed: {frame:?}") }).await;
                            return Ok(());
                        }
                        Some(Err(e)) => {
                            self.connected.store(false, Ordering::SeqCst);
                            let _ = events.send(AdapterEvent::Disconnected { reason: format!("websocket error: {e}") }).await;
                            return Ok(());
                        }
                        None => {
                            self.connected.store(false, Ordering::SeqCst);
                            let _ = events.send(AdapterEvent::Disconnected { reason: "gateway stream ended".to_string() }).await;
                            return Ok(());
                        }
                        _ => {}
                    }
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
