//! Gmail/IMAP adapter.
//!
//! Two-phase fetch per poll cycle: batch ENVELOPE (≈50 at a time) to collect
//! Message-IDs and skip ones already seen, then batch RFC-822 (≈15 at a
//! time) for the new ones, each with up to 2 attempts. Servers that reject
//! range syntax get a one-by-one fallback. An IDLE watcher — grounded on
//! `other_examples/.../rs_mail_client/daemon/mod.rs`'s `idle_watch_loop` —
//! runs on a blocking thread and wakes the poll cycle early on mailbox
//! change, with the scheduled interval as a fallback floor.
//!
//! `imap`/`native-tls` are synchronous, so the session lives entirely on a
//! `tokio::task::spawn_blocking` thread; only parsed results and wake
//! signals cross back into the async world.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use imap::extensions::idle::WaitOutcome;
use native_tls::TlsConnector;
use tokio::sync::{Mutex, mpsc};

use crate::adapter::{AdapterEvent, AdapterStats, PlatformAdapter, PlatformAdapterError, RawPlatformPayload};

const ENVELOPE_BATCH_SIZE: usize = 50;
const FETCH_BATCH_SIZE: usize = 15;
const FETCH_RETRY_ATTEMPTS: usize = 2;
const POLL_FLOOR: Duration = Duration::from_secs(120);

#[derive(Clone)]
pub struct GmailConfig {
    pub host: String,
    pub user: String,
    pub password: String,
    pub mailbox: String,
}

impl GmailConfig {
    pub fn from_env() -> Option<Self> {
        Some(Self {
            host: std::env::var("GMAIL_IMAP_HOST").ok()?,
            user: std::env::var("GMAIL_IMAP_USER").ok()?,
            password: std::env::var("GMAIL_IMAP_PASSWORD").ok()?,
            mailbox: std::env::var("GMAIL_IMAP_MAILBOX").unwrap_or_else(|_| "INBOX".to_string()),
        })
    }
}

pub struct GmailAdapter {
    config: GmailConfig,
    connected: Arc<AtomicBool>,
    stats: Arc<Mutex<AdapterStats>>,
    seen_message_ids: Arc<Mutex<std::collections::HashSet<String>>>,
}

impl GmailAdapter {
    pub fn new(config: GmailConfig) -> Self {
        Self {
            config,
            connected: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(Mutex::new(AdapterStats::default())),
            seen_message_ids: Arc::new(Mutex::new(std::collections::HashSet::new())),
        }
    }

}

fn connect_session(
    config: &GmailConfig,
) -> Result<imap::Session<native_tls::TlsStream<std::net::TcpStream>>, String> {
    let tls = TlsConnector::builder()
        .build()
        .map_err(|e| format!("tls builder: {e}"))?;
    let client = imap::connect((config.host.as_str(), 993), &config.host, &tls)
        .map_err(|e| format!("connect: {e}"))?;
    client
        .login(&config.user, &config.password)
        .map_err(|e| format!("login: {}", e.0))
}

/// One poll cycle: ENVELOPE scan then RFC-822 fetch of anything new.
/// Runs entirely on a blocking thread; `seen` is owned by the caller and
/// mutated in place with every Message-ID this cycle newly observed.
fn poll_cycle_blocking(
    config: &GmailConfig,
    seen: &mut std::collections::HashSet<String>,
) -> Result<Vec<String>, String> {
    let mut session = connect_session(config)?;
    session
        .select(&config.mailbox)
        .map_err(|e| format!("select {}: {e}", config.mailbox))?;

    let uids = session.search("ALL").map_err(|e| format!("search: {e}"))?;
    let mut uid_list: Vec<u32> = uids.into_iter().collect();
    uid_list.sort_unstable();

    let mut new_message_ids: Vec<(u32, String)> = Vec::new();
    for chunk in uid_list.chunks(ENVELOPE_BATCH_SIZE) {
        let set = join_uid_set(chunk);
        let fetched = session
            .fetch(&set, "ENVELOPE")
            .map_err(|e| format!("envelope fetch: {e}"))?;
        for (uid, fetch) in chunk.iter().zip(fetched.iter()) {
            if let Some(envelope) = fetch.envelope() {
                if let Some(message_id) = envelope.message_id.as_ref() {
                    let message_id = String::from_utf8_lossy(message_id).to_string();
                    if !seen.contains(&message_id) {
                        new_message_ids.push((*uid, message_id));
                    }
                }
            }
        }
    }

    let mut raw_messages = Vec::new();
    for chunk in new_message_ids.chunks(FETCH_BATCH_SIZE) {
        let uids: Vec<u32> = chunk.iter().map(|(uid, _)| *uid).collect();
        let set = join_uid_set(&uids);

        let mut attempt = 0;
        loop {
            attempt += 1;
            match session.fetch(&set, "RFC822") {
                Ok(fetched) => {
                    for fetch in fetched.iter() {
                        if let Some(body) = fetch.body() {
                            raw_messages.push(String::from_utf8_lossy(body).to_string());
                        }
                    }
                    break;
                }
                Err(_) if attempt < FETCH_RETRY_ATTEMPTS => continue,
                Err(_) => {
                    // Range syntax rejected or retries exhausted — fall
                    // back to fetching each message individually.
                    for uid in &uids {
                        if let Ok(fetched) = session.fetch(uid.to_string(), "RFC822") {
                            for fetch in fetched.iter() {
                                if let Some(body) = fetch.body() {
                                    raw_messages.push(String::from_utf8_lossy(body).to_string());
                                }
                            }
                        }
                    }
                    break;
                }
            }
        }
    }

    for (_, message_id) in &new_message_ids {
        seen.insert(message_id.clone());
    }

    let _ = session.logout();
    Ok(raw_messages)
}

fn join_uid_set(uids: &[u32]) -> String {
    uids.iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

#[async_trait]
impl PlatformAdapter for GmailAdapter {
    fn platform(&self) -> &'static str {
        "gmail"
    }

    async fn is_authenticated(&self) -> bool {
        let config = self.config.clone();
        tokio::task::spawn_blocking(move || {
            let tls = match TlsConnector::builder().build() {
                Ok(t) => t,
                Err(_) => return false,
            };
            let client = match imap::connect((config.host.as_str(), 993), &config.host, &tls) {
                Ok(c) => c,
                Err(_) => return false,
            };
            client.login(&config.user, &config.password).is_ok()
        })
        .await
        .unwrap_or(false)
    }

    async fn start(&self, events: mpsc::Sender<AdapterEvent>) -> Result<(), PlatformAdapterError> {
        if self.config.host.is_empty() {
            return Err(PlatformAdapterError::NotAuthenticated {
                platform: "gmail".to_string(),
            });
        }

        self.connected.store(true, Ordering::SeqCst);
        let _ = events.send(AdapterEvent::Connected).await;

        let (idle_tx, mut idle_rx) = mpsc::unbounded_channel::<()>();
        {
            let config = self.config.clone();
            std::thread::spawn(move || idle_watch_loop_blocking(config, idle_tx));
        }

        loop {
            let config = self.config.clone();
            let mut seen_snapshot = self.seen_message_ids.lock().await.clone();
            let outcome = tokio::task::spawn_blocking(move || {
                let result = poll_cycle_blocking(&config, &mut seen_snapshot);
                (seen_snapshot, result)
            })
            .await;

            let result = match outcome {
                Ok((updated_seen, Ok(messages))) => {
                    *self.seen_message_ids.lock().await = updated_seen;
                    Some(messages)
                }
                Ok((_, Err(e))) => {
                    let mut stats = self.stats.lock().await;
                    stats.error_count += 1;
                    stats.last_error = Some(e);
                    None
                }
                Err(e) => {
                    let mut stats = self.stats.lock().await;
                    stats.error_count += 1;
                    stats.last_error = Some(format!("poll task panicked: {e}"));
                    None
                }
            };

            if let Some(raw_messages) = result {
                for raw in raw_messages {
                    match mailparse::parse_mail(raw.as_bytes()) {
                        Ok(parsed) => {
                            let payload = serde_json::json!({
                                "subject": parsed.headers.get_first_value("Subject"),
                                "from": parsed.headers.get_first_value("From"),
                                "message_id": parsed.headers.get_first_value("Message-ID"),
                                "in_reply_to": parsed.headers.get_first_value("In-Reply-To"),
                                "references": parsed.headers.get_first_value("References"),
                                "body": parsed.get_body().unwrap_or_default(),
                            });
                            let mut stats = self.stats.lock().await;
                            stats.message_count += 1;
                            stats.last_message = Some(chrono::Utc::now().timestamp_millis());
                            drop(stats);
                            let _ = events
                                .send(AdapterEvent::Message(Box::new(RawPlatformPayload::Gmail(
                                    payload,
                                ))))
                                .await;
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "gmail: failed to parse RFC-822 body");
                        }
                    }
                }
            }

            if !self.connected.load(Ordering::SeqCst) {
                return Ok(());
            }

            tokio::select! {
                _ = idle_rx.recv() => {}
                _ = tokio::time::sleep(POLL_FLOOR) => {}
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

fn idle_watch_loop_blocking(config: GmailConfig, tx: mpsc::UnboundedSender<()>) {
    loop {
        let tls = match TlsConnector::builder().build() {
            Ok(t) => t,
            Err(_) => {
                std::thread::sleep(Duration::from_secs(30));
                continue;
            }
        };
        let client = match imap::connect((config.host.as_str(), 993), &config.host, &tls) {
            Ok(c) => c,
            Err(_) => {
                std::thread::sleep(Duration::from_secs(30));
                continue;
            }
        };
        let mut session = match client.login(&config.user, &config.password) {
            Ok(s) => s,
            Err(_) => {
                std::thread::sleep(Duration::from_secs(30));
                continue;
            }
        };
        if session.select(&config.mailbox).is_err() {
            let _ = session.logout();
            std::thread::sleep(Duration::from_secs(30));
            continue;
        }

        loop {
            match session.idle() {
                Ok(idle) => match idle.wait_with_timeout(Duration::from_secs(60)) {
                    Ok(WaitOutcome::MailboxChanged) => {
                        if tx.send(()).is_err() {
                            return;
                        }
                    }
                    Ok(WaitOutcome::TimedOut) => {}
                    Err(_) => break,
                },
                Err(_) => break,
            }
        }
        let _ = session.logout();
        std::thread::sleep(Duration::from_secs(5));
    }
}
