//! Turns raw per-platform payloads into the canonical `Message`/`Account`/
//! `Thread` rows: resolves (or creates) the account an author belongs to,
//! resolves (or creates) the thread a message belongs to, derives the
//! content-addressed message id, and performs the idempotent insert.

use std::sync::Arc;

use crate::error::NormalizationError;
use crate::hash::message_content_hash;
use crate::model::{Author, MessageRefs, MessageSource, ThreadType};
use crate::store::StateStore;
use crate::threading::{EmailThreadingInput, ThreadingEngine};

/// How a message's thread should be resolved. Chat platforms address a
/// conversation directly; email has no stable conversation id and must be
/// threaded from headers.
pub enum ThreadDescriptor<'a> {
    Chat {
        platform: &'a str,
        conversation_id: &'a str,
        thread_type: ThreadType,
        title: Option<&'a str>,
        room_id: Option<&'a str>,
    },
    Email {
        message_id: &'a str,
        in_reply_to: Option<&'a str>,
        references: &'a [String],
        subject: &'a str,
        participants: &'a [String],
    },
}

pub struct IngestInput<'a> {
    pub platform: &'a str,
    pub platform_message_id: Option<&'a str>,
    pub url: Option<&'a str>,
    pub author_handle: &'a str,
    pub author_name: Option<&'a str>,
    pub created_at: i64,
    pub imported_at: i64,
    pub kind: i32,
    pub content: &'a str,
    pub title: Option<&'a str>,
    pub tags: Vec<Vec<String>>,
    pub mentions: Vec<String>,
    pub thread: ThreadDescriptor<'a>,
}

pub struct Normalizer {
    store: Arc<StateStore>,
    threading: ThreadingEngine,
}

impl Normalizer {
    pub fn new(store: Arc<StateStore>) -> Self {
        let threading = ThreadingEngine::new(store.clone());
        Self { store, threading }
    }

    /// Resolves the account id for `(platform, handle)`, creating the
    /// account if this is the first time the identity has been seen.
    pub async fn resolve_account(
        &self,
        platform: &str,
        handle: &str,
        display_name: Option<&str>,
    ) -> Result<String, NormalizationError> {
        let normalized_handle = normalize_handle(platform, handle);
        if normalized_handle.is_empty() {
            return Err(NormalizationError::AccountUnresolved {
                platform: platform.to_string(),
                handle: handle.to_string(),
            });
        }

        if let Some(existing) = self
            .store
            .find_account_by_identity(platform, &normalized_handle)
            .await?
        {
            return Ok(existing);
        }

        let account_id = format!("{platform}_{normalized_handle}");
        let name = display_name.unwrap_or(&normalized_handle);
        self.store
            .create_account(&account_id, name, platform, &normalized_handle)
            .await?;
        Ok(account_id)
    }

    /// Resolves (creating if necessary) the thread a message belongs to.
    pub async fn resolve_thread(
        &self,
        descriptor: &ThreadDescriptor<'_>,
        created_at: i64,
    ) -> Result<String, NormalizationError> {
        match descriptor {
            ThreadDescriptor::Chat {
                platform,
                conversation_id,
                thread_type,
                title,
                room_id,
            } => {
                let thread_id = format!("{platform}_{conversation_id}");
                let type_str = serde_json::to_value(thread_type)
                    .ok()
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_else(|| "dm".to_string());
                self.store
                    .ensure_thread(
                        &thread_id,
                        *title,
                        &type_str,
                        platform,
                        Some(conversation_id),
                        *room_id,
                        created_at,
                    )
                    .await?;
                Ok(thread_id)
            }
            ThreadDescriptor::Email {
                message_id,
                in_reply_to,
                references,
                subject,
                participants,
            } => {
                let input = EmailThreadingInput {
                    message_id,
                    in_reply_to: *in_reply_to,
                    references,
                    subject,
                    participants,
                };
                let thread_id = self.threading.resolve(&input).await?;
                self.store
                    .ensure_thread(
                        &thread_id,
                        Some(subject),
                        "dm",
                        "gmail",
                        None,
                        None,
                        created_at,
                    )
                    .await?;
                Ok(thread_id)
            }
        }
    }

    /// Resolves account and thread, derives the content-addressed id, and
    /// performs the idempotent insert. Returns `(message_id, was_new)`.
    pub async fn ingest(&self, input: IngestInput<'_>) -> Result<(String, bool), NormalizationError> {
        let account_id = self
            .resolve_account(input.platform, input.author_handle, input.author_name)
            .await?;
        let thread_id = self.resolve_thread(&input.thread, input.created_at).await?;

        let platform_id = input.platform_message_id.unwrap_or_default();
        let message_id = message_content_hash(
            input.kind,
            input.author_handle,
            input.created_at,
            input.content,
            input.platform,
            platform_id,
        );

        let author = Author {
            name: input.author_name.map(str::to_string),
            handle: Some(input.author_handle.to_string()),
            did: None,
        };
        let refs = MessageRefs {
            thread_id: Some(thread_id.clone()),
            reply_to: None,
            room_id: match &input.thread {
                ThreadDescriptor::Chat { room_id, .. } => room_id.map(str::to_string),
                ThreadDescriptor::Email { .. } => None,
            },
            mentions: input.mentions,
        };
        let source = MessageSource {
            platform: input.platform.to_string(),
            platform_id: input.platform_message_id.map(str::to_string),
            url: input.url.map(str::to_string),
        };

        let author_json = serde_json::to_string(&author).unwrap_or_else(|_| "{}".to_string());
        let refs_json = serde_json::to_string(&refs).unwrap_or_else(|_| "{}".to_string());
        let source_json = serde_json::to_string(&source).unwrap_or_else(|_| "{}".to_string());
        let tags_json = serde_json::to_string(&input.tags).unwrap_or_else(|_| "[]".to_string());

        let inserted = self
            .store
            .idempotent_insert_message(
                &message_id,
                &account_id,
                &author_json,
                input.created_at,
                input.imported_at,
                input.kind,
                input.content,
                input.title,
                &refs_json,
                &source_json,
                &tags_json,
            )
            .await?;

        if inserted {
            self.store
                .bump_thread_on_new_message(&thread_id, input.created_at)
                .await?;
        }

        Ok((message_id, inserted))
    }
}

/// Phone-number-addressed platforms (Signal, WhatsApp) strip everything
/// but digits so `+1 (555) 123-4567` and `15551234567` resolve to the same
/// account. Other platforms are lowercased only.
fn normalize_handle(platform: &str, handle: &str) -> String {
    let trimmed = handle.trim();
    match platform {
        "signal" | "whatsapp" => trimmed
            .chars()
            .filter(|c| c.is_ascii_digit())
            .collect::<String>(),
        _ => trimmed.to_lowercase(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ThreadType;

    #[tokio::test]
    async fn resolve_account_is_idempotent_across_handle_formats() {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let normalizer = Normalizer::new(store);

        let a = normalizer
            .resolve_account("signal", "+1 (555) 123-4567", Some("Alice"))
            .await
            .unwrap();
        let b = normalizer
            .resolve_account("signal", "15551234567", Some("Alice"))
            .await
            .unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn ingest_same_content_twice_does_not_duplicate() {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let normalizer = Normalizer::new(store);

        let make_input = || IngestInput {
            platform: "signal",
            platform_message_id: Some("p1"),
            url: None,
            author_handle: "15551234567",
            author_name: Some("Alice"),
            created_at: 1000,
            imported_at: 1000,
            kind: crate::model::kind::PLAIN_TEXT,
            content: "hello",
            title: None,
            tags: vec![],
            mentions: vec![],
            thread: ThreadDescriptor::Chat {
                platform: "signal",
                conversation_id: "room1",
                thread_type: ThreadType::Dm,
                title: None,
                room_id: Some("room1"),
            },
        };

        let (id1, inserted1) = normalizer.ingest(make_input()).await.unwrap();
        assert!(inserted1);
        let (id2, inserted2) = normalizer.ingest(make_input()).await.unwrap();
        assert_eq!(id1, id2);
        assert!(!inserted2);
    }

    #[tokio::test]
    async fn email_messages_thread_by_subject_fallback() {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let normalizer = Normalizer::new(store);

        let first = IngestInput {
            platform: "gmail",
            platform_message_id: Some("<m1@example.com>"),
            url: None,
            author_handle: "alice@example.com",
            author_name: Some("Alice"),
            created_at: 1000,
            imported_at: 1000,
            kind: crate::model::kind::PLAIN_TEXT,
            content: "let's sync",
            title: Some("weekly sync"),
            tags: vec![],
            mentions: vec![],
            thread: ThreadDescriptor::Email {
                message_id: "<m1@example.com>",
                in_reply_to: None,
                references: &[],
                subject: "weekly sync",
                participants: &["alice@example.com".into(), "bob@example.com".into()],
            },
        };
        let (_, _) = normalizer.ingest(first).await.unwrap();

        let second = IngestInput {
            platform: "gmail",
            platform_message_id: Some("<m2@example.com>"),
            url: None,
            author_handle: "bob@example.com",
            author_name: Some("Bob"),
            created_at: 2000,
            imported_at: 2000,
            kind: crate::model::kind::PLAIN_TEXT,
            content: "sounds good",
            title: Some("Re: weekly sync"),
            tags: vec![],
            mentions: vec![],
            thread: ThreadDescriptor::Email {
                message_id: "<m2@example.com>",
                in_reply_to: Some("<missing@example.com>"),
                references: &[],
                subject: "Re: weekly sync",
                participants: &["bob@example.com".into(), "alice@example.com".into()],
            },
        };
        let (_, _) = normalizer.ingest(second).await.unwrap();
    }
}
