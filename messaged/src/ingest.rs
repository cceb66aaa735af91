//! Translates a platform's raw payload into the normalizer's `IngestInput`.
//! Each platform decides independently whether a given payload is a user
//! message worth ingesting; anything else (typing indicators, read
//! receipts, gateway control frames) parses to `None` and is dropped.

use messages_core::model::{ThreadType, kind};
use messages_core::normalizer::{IngestInput, ThreadDescriptor};
use serde_json::Value;

use crate::adapter::RawPlatformPayload;

const DISCORD_MESSAGE_CREATE: &str = "MESSAGE_CREATE";

/// Fully-owned form of an inbound message. `IngestInput` borrows from this
/// rather than from the parsed JSON directly, so the borrow only has to
/// live as long as one `ingest()` call.
pub struct ParsedMessage {
    pub platform_message_id: Option<String>,
    pub author_handle: String,
    pub author_name: Option<String>,
    pub created_at: i64,
    pub content: String,
    pub title: Option<String>,
    pub thread: ParsedThread,
}

pub enum ParsedThread {
    Chat {
        conversation_id: String,
        thread_type: ThreadType,
        room_id: Option<String>,
    },
    Email {
        message_id: String,
        in_reply_to: Option<String>,
        references: Vec<String>,
        subject: String,
        participants: Vec<String>,
    },
}

impl ParsedMessage {
    pub fn to_ingest_input<'a>(&'a self, platform: &'a str, imported_at: i64) -> IngestInput<'a> {
        let thread = match &self.thread {
            ParsedThread::Chat { conversation_id, thread_type, room_id } => ThreadDescriptor::Chat {
                platform,
                conversation_id,
                thread_type: *thread_type,
                title: self.title.as_deref(),
                room_id: room_id.as_deref(),
            },
            ParsedThread::Email {
                message_id,
                in_reply_to,
                references,
                subject,
                participants,
            } => ThreadDescriptor::Email {
                message_id,
                in_reply_to: in_reply_to.as_deref(),
                references,
                subject,
                participants,
            },
        };
        IngestInput {
            platform,
            platform_message_id: self.platform_message_id.as_deref(),
            url: None,
            author_handle: &self.author_handle,
            author_name: self.author_name.as_deref(),
            created_at: self.created_at,
            imported_at,
            kind: kind::PLAIN_TEXT,
            content: &self.content,
            title: self.title.as_deref(),
            tags: Vec::new(),
            mentions: Vec::new(),
            thread,
        }
    }
}

/// Parses one adapter payload, or `None` if it isn't a user-authored
/// message (a receipt, a non-dispatch gateway frame, an empty body, ...).
pub fn parse(payload: &RawPlatformPayload, received_at_ms: i64) -> Option<ParsedMessage> {
    match payload {
        RawPlatformPayload::Signal(value) => parse_signal(value, received_at_ms),
        RawPlatformPayload::Whatsapp(value) => parse_whatsapp(value, received_at_ms),
        RawPlatformPayload::Discord(value) => parse_discord(value, received_at_ms),
        RawPlatformPayload::Telegram(value) => parse_telegram(value, received_at_ms),
        RawPlatformPayload::Gmail(value) => parse_gmail(value, received_at_ms),
    }
}

fn parse_signal(value: &Value, received_at_ms: i64) -> Option<ParsedMessage> {
    let envelope = value
        .pointer("/params/envelope")
        .or_else(|| value.get("envelope"))?;
    let data_message = envelope.get("dataMessage")?;
    let text = data_message.get("message").and_then(Value::as_str)?;
    if text.is_empty() {
        return None;
    }

    let source = envelope.get("source").and_then(Value::as_str)?.to_string();
    let author_name = envelope
        .get("sourceName")
        .and_then(Value::as_str)
        .map(str::to_string);
    let created_at = envelope
        .get("timestamp")
        .and_then(Value::as_i64)
        .unwrap_or(received_at_ms);
    let group_id = data_message
        .get("groupInfo")
        .and_then(|g| g.get("groupId"))
        .and_then(Value::as_str);

    let thread = match group_id {
        Some(group_id) => ParsedThread::Chat {
            conversation_id: group_id.to_string(),
            thread_type: ThreadType::Group,
            room_id: Some(group_id.to_string()),
        },
        None => ParsedThread::Chat {
            conversation_id: source.clone(),
            thread_type: ThreadType::Dm,
            room_id: None,
        },
    };

    Some(ParsedMessage {
        platform_message_id: None,
        author_handle: source,
        author_name,
        created_at,
        content: text.to_string(),
        title: None,
        thread,
    })
}

/// No adapter produces this payload yet (`whatsapp.rs` only models the QR
/// pairing lifecycle); kept so the match over `RawPlatformPayload` stays
/// exhaustive once a bridge starts emitting chat events.
fn parse_whatsapp(value: &Value, received_at_ms: i64) -> Option<ParsedMessage> {
    let text = value.get("text").and_then(Value::as_str)?;
    if text.is_empty() {
        return None;
    }
    let from = value.get("from").and_then(Value::as_str)?.to_string();
    let author_name = value
        .get("author_name")
        .and_then(Value::as_str)
        .map(str::to_string);
    let chat_id = value
        .get("chat_id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| from.clone());
    let created_at = value
        .get("timestamp")
        .and_then(Value::as_i64)
        .unwrap_or(received_at_ms);

    Some(ParsedMessage {
        platform_message_id: value
            .get("message_id")
            .and_then(Value::as_str)
            .map(str::to_string),
        author_handle: from,
        author_name,
        created_at,
        content: text.to_string(),
        title: None,
        thread: ParsedThread::Chat {
            conversation_id: chat_id.clone(),
            thread_type: ThreadType::Dm,
            room_id: Some(chat_id),
        },
    })
}

fn parse_discord(value: &Value, received_at_ms: i64) -> Option<ParsedMessage> {
    if value.get("t").and_then(Value::as_str) != Some(DISCORD_MESSAGE_CREATE) {
        return None;
    }
    let d = value.get("d")?;
    let content = d.get("content").and_then(Value::as_str)?;
    if content.is_empty() {
        return None;
    }
    let author = d.get("author")?;
    if author.get("bot").and_then(Value::as_bool).unwrap_or(false) {
        return None;
    }
    let author_handle = author.get("id").and_then(Value::as_str)?.to_string();
    let author_name = author
        .get("username")
        .and_then(Value::as_str)
        .map(str::to_string);
    let channel_id = d.get("channel_id").and_then(Value::as_str)?.to_string();
    let platform_message_id = d.get("id").and_then(Value::as_str).map(str::to_string);
    let created_at = d
        .get("timestamp")
        .and_then(Value::as_str)
        .and_then(|ts| chrono::DateTime::parse_from_rfc3339(ts).ok())
        .map(|dt| dt.timestamp_millis())
        .unwrap_or(received_at_ms);

    Some(ParsedMessage {
        platform_message_id,
        author_handle,
        author_name,
        created_at,
        content: content.to_string(),
        title: None,
        thread: ParsedThread::Chat {
            conversation_id: channel_id.clone(),
            thread_type: ThreadType::Channel,
            room_id: Some(channel_id),
        },
    })
}

fn parse_telegram(value: &Value, received_at_ms: i64) -> Option<ParsedMessage> {
    let message = value.get("message")?;
    let text = message.get("text").and_then(Value::as_str)?;
    if text.is_empty() {
        return None;
    }
    let from = message.get("from")?;
    let author_handle = from.get("id").and_then(Value::as_i64)?.to_string();
    let author_name = from
        .get("username")
        .and_then(Value::as_str)
        .or_else(|| from.get("first_name").and_then(Value::as_str))
        .map(str::to_string);
    let chat_id = message
        .get("chat")
        .and_then(|c| c.get("id"))
        .and_then(Value::as_i64)?
        .to_string();
    let created_at = message
        .get("date")
        .and_then(Value::as_i64)
        .map(|secs| secs * 1000)
        .unwrap_or(received_at_ms);
    let platform_message_id = message
        .get("message_id")
        .and_then(Value::as_i64)
        .map(|id| id.to_string());

    Some(ParsedMessage {
        platform_message_id,
        author_handle,
        author_name,
        created_at,
        content: text.to_string(),
        title: None,
        thread: ParsedThread::Chat {
            conversation_id: chat_id.clone(),
            thread_type: ThreadType::Dm,
            room_id: Some(chat_id),
        },
    })
}

fn parse_gmail(value: &Value, received_at_ms: i64) -> Option<ParsedMessage> {
    let subject = value
        .get("subject")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    let from_header = value.get("from").and_then(Value::as_str).unwrap_or("");
    let (author_name, author_handle) = split_display_name_and_address(from_header);
    if author_handle.is_empty() {
        return None;
    }
    let body = value
        .get("body")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();

    let message_id = value
        .get("message_id")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| synthesize_message_id(received_at_ms, &subject, &body));

    let in_reply_to = value
        .get("in_reply_to")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    let references = value
        .get("references")
        .and_then(Value::as_str)
        .map(split_references)
        .unwrap_or_default();

    let title = if subject.is_empty() { None } else { Some(subject.clone()) };

    Some(ParsedMessage {
        platform_message_id: Some(message_id.clone()),
        author_handle: author_handle.clone(),
        author_name,
        created_at: received_at_ms,
        content: body,
        title,
        thread: ParsedThread::Email {
            message_id,
            in_reply_to,
            references,
            subject,
            participants: vec![author_handle],
        },
    })
}

/// References header is a whitespace-separated, oldest-first list of
/// `<id>` tokens.
fn split_references(raw: &str) -> Vec<String> {
    raw.split_whitespace().map(str::to_string).collect()
}

/// Pulls the bare address out of a `"Display Name <addr@host>"` From
/// header, falling back to treating the whole value as the address.
fn split_display_name_and_address(raw: &str) -> (Option<String>, String) {
    let trimmed = raw.trim();
    if let (Some(start), Some(end)) = (trimmed.find('<'), trimmed.find('>')) {
        if end > start {
            let name = trimmed[..start].trim().trim_matches('"');
            let addr = trimmed[start + 1..end].trim().to_lowercase();
            let name = if name.is_empty() { None } else { Some(name.to_string()) };
            return (name, addr);
        }
    }
    (None, trimmed.to_lowercase())
}

/// `"generated_{ts}_{digest}"` for messages missing a Message-ID header.
/// Deterministic on `(ts, subject, body)` rather than truly random, so
/// re-fetching the same header-less message during a retry or restart
/// synthesizes the same id instead of a fresh one each time.
fn synthesize_message_id(ts: i64, subject: &str, body: &str) -> String {
    let digest = messages_core::blob_hash(format!("{ts}:{subject}:{body}").as_bytes());
    format!("generated_{ts}_{}", &digest[..12.min(digest.len())])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_dm_parses_into_a_dm_thread() {
        let value: Value = serde_json::from_str(
            r#"{"jsonrpc":"2.0","method":"receive","params":{"envelope":{
                "source":"+15551234567","sourceName":"Alice","timestamp":1000,
                "dataMessage":{"message":"hello"}
            }}}"#,
        )
        .unwrap();
        let parsed = parse_signal(&value, 0).expect("should parse");
        assert_eq!(parsed.author_handle, "+15551234567");
        assert!(matches!(parsed.thread, ParsedThread::Chat { thread_type: ThreadType::Dm, .. }));
    }

    #[test]
    fn signal_group_message_uses_group_id_as_room() {
        let value: Value = serde_json::from_str(
            r#"{"envelope":{
                "source":"+15551234567","timestamp":1000,
                "dataMessage":{"message":"hi all","groupInfo":{"groupId":"Z3JvdXAtaWQ="}}
            }}"#,
        )
        .unwrap();
        let parsed = parse_signal(&value, 0).expect("should parse");
        assert!(matches!(parsed.thread, ParsedThread::Chat { thread_type: ThreadType::Group, .. }));
    }

    #[test]
    fn signal_receipt_without_data_message_is_ignored() {
        let value: Value = serde_json::from_str(
            r#"{"envelope":{"source":"+15551234567","timestamp":1000,"receiptMessage":{}}}"#,
        )
        .unwrap();
        assert!(parse_signal(&value, 0).is_none());
    }

    #[test]
    fn discord_message_create_parses() {
        let value: Value = serde_json::from_str(
            r#"{"op":0,"t":"MESSAGE_CREATE","d":{
                "id":"123","channel_id":"456","content":"hey",
                "author":{"id":"789","username":"bob","bot":false},
                "timestamp":"2024-01-01T00:00:00.000000+00:00"
            }}"#,
        )
        .unwrap();
        let parsed = parse_discord(&value, 0).expect("should parse");
        assert_eq!(parsed.author_handle, "789");
        assert_eq!(parsed.content, "hey");
    }

    #[test]
    fn discord_non_dispatch_frame_is_ignored() {
        let value: Value = serde_json::from_str(r#"{"op":11}"#).unwrap();
        assert!(parse_discord(&value, 0).is_none());
    }

    #[test]
    fn discord_bot_authored_message_is_ignored() {
        let value: Value = serde_json::from_str(
            r#"{"op":0,"t":"MESSAGE_CREATE","d":{
                "id":"1","channel_id":"2","content":"beep",
                "author":{"id":"3","username":"other-bot","bot":true}
            }}"#,
        )
        .unwrap();
        assert!(parse_discord(&value, 0).is_none());
    }

    #[test]
    fn telegram_update_without_message_is_ignored() {
        let value: Value = serde_json::from_str(r#"{"update_id":1}"#).unwrap();
        assert!(parse_telegram(&value, 0).is_none());
    }

    #[test]
    fn telegram_text_message_parses() {
        let value: Value = serde_json::from_str(
            r#"{"update_id":1,"message":{
                "message_id":42,"date":1000,
                "from":{"id":99,"username":"carol"},
                "chat":{"id":555},
                "text":"hi there"
            }}"#,
        )
        .unwrap();
        let parsed = parse_telegram(&value, 0).expect("should parse");
        assert_eq!(parsed.author_handle, "99");
        assert_eq!(parsed.created_at, 1_000_000);
    }

    #[test]
    fn gmail_missing_message_id_is_synthesized_deterministically() {
        let value: Value = serde_json::from_str(
            r#"{"subject":"hi","from":"Alice <alice@example.com>","body":"hello"}"#,
        )
        .unwrap();
        let a = parse_gmail(&value, 1000).expect("should parse");
        let b = parse_gmail(&value, 1000).expect("should parse");
        assert_eq!(a.platform_message_id, b.platform_message_id);
        assert!(a.platform_message_id.unwrap().starts_with("generated_1000_"));
    }

    #[test]
    fn gmail_references_split_oldest_first() {
        let value: Value = serde_json::from_str(
            r#"{"from":"a@example.com","references":"<a@x> <b@x> <c@x>"}"#,
        )
        .unwrap();
        let parsed = parse_gmail(&value, 0).expect("should parse");
        match parsed.thread {
            ParsedThread::Email { references, .. } => {
                assert_eq!(references, vec!["<a@x>", "<b@x>", "<c@x>"]);
            }
            _ => panic!("expected email thread"),
        }
    }

    #[test]
    fn gmail_display_name_is_stripped_from_address() {
        let (name, addr) = split_display_name_and_address("\"Alice Smith\" <Alice@Example.com>");
        assert_eq!(name.as_deref(), Some("Alice Smith"));
        assert_eq!(addr, "alice@example.com");
    }
}
