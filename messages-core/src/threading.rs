//! Email conversation threading.
//!
//! Resolution order per incoming message: In-Reply-To link, then
//! References chain, then a subject+participant fallback, then a brand new
//! thread. Every link that resolution discovers is persisted immediately so
//! a restart mid-conversation does not re-derive (and potentially diverge
//! from) an earlier decision.

use std::sync::Arc;
use std::sync::OnceLock;

use regex::Regex;

use crate::error::NormalizationError;
use crate::hash::hash_prefix;
use crate::store::StateStore;

fn reply_prefix_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^\s*(re|fwd|fw)\s*:\s*").unwrap_or_else(|_| Regex::new(r"^$").unwrap())
    })
}

fn list_prefix_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*\[[^\]]*\]\s*").unwrap_or_else(|_| Regex::new(r"^$").unwrap()))
}

/// The headers threading needs from an inbound email. `message_id` is
/// synthesized by the caller (`"generated_{ts}_{rand}"`) if the message
/// lacks one.
pub struct EmailThreadingInput<'a> {
    pub message_id: &'a str,
    pub in_reply_to: Option<&'a str>,
    pub references: &'a [String],
    pub subject: &'a str,
    pub participants: &'a [String],
}

pub struct ThreadingEngine {
    store: Arc<StateStore>,
}

impl ThreadingEngine {
    pub fn new(store: Arc<StateStore>) -> Self {
        Self { store }
    }

    /// Resolves (and persists) the thread id for an inbound email message.
    pub async fn resolve(
        &self,
        input: &EmailThreadingInput<'_>,
    ) -> Result<String, NormalizationError> {
        if let Some(in_reply_to) = input.in_reply_to {
            if let Some(thread_id) = self
                .store
                .lookup_email_thread_by_message_id(in_reply_to)
                .await?
            {
                self.link(input.message_id, &thread_id).await?;
                return Ok(thread_id);
            }
        }

        for reference in input.references.iter() {
            if let Some(thread_id) = self
                .store
                .lookup_email_thread_by_message_id(reference)
                .await?
            {
                self.link(input.message_id, &thread_id).await?;
                return Ok(thread_id);
            }
        }

        let subject_key = normalize_subject(input.subject);
        let participants_key = participants_key(input.participants);
        if !subject_key.is_empty() {
            if let Some(thread_id) = self
                .store
                .lookup_email_thread_by_subject_participants(&subject_key, &participants_key)
                .await?
            {
                self.link(input.message_id, &thread_id).await?;
                self.store
                    .link_email_subject_participants_to_thread(
                        &subject_key,
                        &participants_key,
                        &thread_id,
                    )
                    .await?;
                return Ok(thread_id);
            }
        }

        let root = input
            .references
            .first()
            .map(String::as_str)
            .unwrap_or(input.message_id);
        let thread_id = format!("email_{}", hash_prefix(root));
        self.link(input.message_id, &thread_id).await?;
        if !subject_key.is_empty() {
            self.store
                .link_email_subject_participants_to_thread(
                    &subject_key,
                    &participants_key,
                    &thread_id,
                )
                .await?;
        }
        Ok(thread_id)
    }

    async fn link(&self, message_id: &str, thread_id: &str) -> Result<(), NormalizationError> {
        self.store
            .link_email_message_to_thread(message_id, thread_id)
            .await?;
        Ok(())
    }
}

/// Strips repeated `Re:`/`Fwd:`/`Fw:` and `[list-name]` prefixes, then
/// trims and lowercases what remains. Empty after stripping means "no
/// usable subject" — the caller skips the subject fallback entirely.
pub fn normalize_subject(subject: &str) -> String {
    let mut s = subject.trim();
    loop {
        let stripped = strip_one_prefix(s);
        if stripped == s {
            break;
        }
        s = stripped;
    }
    s.trim().to_lowercase()
}

fn strip_one_prefix(s: &str) -> &str {
    if let Some(m) = reply_prefix_re().find(s) {
        return &s[m.end()..];
    }
    if let Some(m) = list_prefix_re().find(s) {
        return &s[m.end()..];
    }
    s
}

/// Canonical key for a participant set: sorted, deduplicated, lowercased
/// addresses joined by `,`. Order of the input list never matters.
pub fn participants_key(participants: &[String]) -> String {
    let mut normalized: Vec<String> = participants.iter().map(|p| p.trim().to_lowercase()).collect();
    normalized.sort();
    normalized.dedup();
    normalized.join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_repeated_reply_and_forward_prefixes() {
        assert_eq!(normalize_subject("Re: Fwd: Re: lunch?"), "lunch?");
    }

    #[test]
    fn strips_list_name_prefix() {
        assert_eq!(normalize_subject("[team-x] Re: lunch?"), "lunch?");
    }

    #[test]
    fn participants_key_ignores_order_and_case() {
        let a = participants_key(&["Bob@Example.com".into(), "alice@example.com".into()]);
        let b = participants_key(&["alice@example.com".into(), "bob@example.com".into()]);
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn falls_back_to_new_thread_when_nothing_links() {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let engine = ThreadingEngine::new(store);
        let input = EmailThreadingInput {
            message_id: "<msg1@example.com>",
            in_reply_to: None,
            references: &[],
            subject: "hello",
            participants: &["a@example.com".into()],
        };
        let thread_id = engine.resolve(&input).await.unwrap();
        assert!(thread_id.starts_with("email_"));
    }

    #[tokio::test]
    async fn in_reply_to_wins_over_subject_fallback() {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let engine = ThreadingEngine::new(store.clone());

        let first = EmailThreadingInput {
            message_id: "<root@example.com>",
            in_reply_to: None,
            references: &[],
            subject: "project x",
            participants: &["a@example.com".into(), "b@example.com".into()],
        };
        let root_thread = engine.resolve(&first).await.unwrap();

        let reply = EmailThreadingInput {
            message_id: "<reply@example.com>",
            in_reply_to: Some("<root@example.com>"),
            references: &[],
            subject: "Re: project x",
            participants: &["a@example.com".into(), "b@example.com".into()],
        };
        let reply_thread = engine.resolve(&reply).await.unwrap();

        assert_eq!(root_thread, reply_thread);
    }

    #[tokio::test]
    async fn subject_and_participants_link_when_headers_missing() {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let engine = ThreadingEngine::new(store.clone());

        let first = EmailThreadingInput {
            message_id: "<m1@example.com>",
            in_reply_to: None,
            references: &[],
            subject: "weekly sync",
            participants: &["a@example.com".into(), "b@example.com".into()],
        };
        let first_thread = engine.resolve(&first).await.unwrap();

        // A later message referencing an unknown message id, same subject
        // line and participants, with no References chain intact.
        let second = EmailThreadingInput {
            message_id: "<m2@example.com>",
            in_reply_to: Some("<missing@example.com>"),
            references: &[],
            subject: "Re: weekly sync",
            participants: &["b@example.com".into(), "a@example.com".into()],
        };
        let second_thread = engine.resolve(&second).await.unwrap();

        assert_eq!(first_thread, second_thread);
    }
}
