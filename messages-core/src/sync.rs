//! Per-source sync watermarks: the durable cursor each platform adapter
//! resumes ingestion from after a restart or reconnect.
//!
//! Ids are the triple `platform:source:scope` — e.g. `signal:main:messages`,
//! `gmail:INBOX:uids`, `telegram:bot:updates` — stored as plain strings so a
//! new platform never needs a schema migration to get a cursor slot.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StorageError;
use crate::store::StateStore;

/// The shape a watermark takes varies by platform transport; all variants
/// round-trip through the same JSON column so the store stays platform-agnostic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Watermark {
    Timestamp(i64),
    MessageId {
        id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        ts: Option<i64>,
    },
    Uid {
        value: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        validity: Option<u32>,
    },
    Sequence(u64),
    Cursor(String),
    Composite(Value),
}

/// Parses a sync-state id of the form `platform:source:scope`. The scope
/// portion may itself contain colons (e.g. a room id with a namespace), so
/// only the first two separators are significant.
pub fn parse_sync_id(id: &str) -> Option<(String, String, String)> {
    let mut parts = id.splitn(3, ':');
    let platform = parts.next()?;
    let source = parts.next()?;
    let scope = parts.next()?;
    if platform.is_empty() || source.is_empty() || scope.is_empty() {
        return None;
    }
    Some((platform.to_string(), source.to_string(), scope.to_string()))
}

pub fn make_sync_id(platform: &str, source: &str, scope: &str) -> String {
    format!("{platform}:{source}:{scope}")
}

#[derive(Clone)]
pub struct SyncStateManager {
    store: Arc<StateStore>,
}

impl SyncStateManager {
    pub fn new(store: Arc<StateStore>) -> Self {
        Self { store }
    }

    pub async fn get(&self, id: &str) -> Result<Option<Watermark>, StorageError> {
        let Some((watermark_json, _metadata, _updated_at)) = self.store.load_sync_state(id).await?
        else {
            return Ok(None);
        };
        let watermark = serde_json::from_str(&watermark_json)
            .map_err(|e| StorageError::WriteFailed(format!("corrupt watermark for {id}: {e}")))?;
        Ok(Some(watermark))
    }

    pub async fn set(
        &self,
        id: &str,
        watermark: &Watermark,
        now_ms: i64,
    ) -> Result<(), StorageError> {
        let json = serde_json::to_string(watermark)
            .map_err(|e| StorageError::WriteFailed(e.to_string()))?;
        self.store.save_sync_state(id, &json, None, now_ms).await
    }

    pub async fn clear(&self, id: &str) -> Result<(), StorageError> {
        self.store.delete_sync_state(id).await
    }

    /// All watermarks for a platform, e.g. to resume every tracked source on
    /// adapter startup.
    pub async fn for_platform(
        &self,
        platform: &str,
    ) -> Result<Vec<(String, Watermark)>, StorageError> {
        let prefix = format!("{platform}:");
        let rows = self.store.load_sync_states_for_prefix(&prefix).await?;
        let mut out = Vec::with_capacity(rows.len());
        for (id, watermark_json, _metadata, _updated_at) in rows {
            let watermark = serde_json::from_str(&watermark_json).map_err(|e| {
                StorageError::WriteFailed(format!("corrupt watermark for {id}: {e}"))
            })?;
            out.push((id, watermark));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_three_part_id() {
        let parsed = parse_sync_id("signal:main:messages").unwrap();
        assert_eq!(parsed, ("signal".into(), "main".into(), "messages".into()));
    }

    #[test]
    fn scope_may_contain_colons() {
        let parsed = parse_sync_id("gmail:INBOX:thread:abc123").unwrap();
        assert_eq!(parsed.2, "thread:abc123");
    }

    #[test]
    fn rejects_fewer_than_three_parts() {
        assert!(parse_sync_id("signal:main").is_none());
        assert!(parse_sync_id("signal").is_none());
    }

    #[tokio::test]
    async fn watermark_round_trips_through_store() {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let mgr = SyncStateManager::new(store);
        let id = make_sync_id("gmail", "INBOX", "uids");
        mgr.set(&id, &Watermark::Uid { value: 42, validity: Some(7) }, 1000)
            .await
            .unwrap();

        let got = mgr.get(&id).await.unwrap().unwrap();
        assert_eq!(got, Watermark::Uid { value: 42, validity: Some(7) });
    }

    #[tokio::test]
    async fn for_platform_returns_only_matching_prefix() {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let mgr = SyncStateManager::new(store);
        mgr.set(&make_sync_id("gmail", "INBOX", "uids"), &Watermark::Uid { value: 1, validity: None }, 1)
            .await
            .unwrap();
        mgr.set(&make_sync_id("telegram", "bot", "updates"), &Watermark::Sequence(9), 1)
            .await
            .unwrap();

        let gmail_only = mgr.for_platform("gmail").await.unwrap();
        assert_eq!(gmail_only.len(), 1);
        assert_eq!(gmail_only[0].0, "gmail:INBOX:uids");
    }
}
