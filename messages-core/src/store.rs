//! The state store: a single embedded SQLite database (WAL mode) holding
//! daemon lifecycle, per-platform state, sync watermarks, and the
//! normalizer's messages/accounts/threads tables plus their FTS5 index.
//!
//! `rusqlite::Connection` is not safely shared across threads without
//! synchronization, so it is held behind a `tokio::sync::Mutex` and every
//! query method takes the lock for its duration — "serialize at the method
//! boundary" rather than exposing the raw connection to callers.

use std::path::Path;
use std::sync::Arc;

use rusqlite::{Connection, OptionalExtension, params};
use tokio::sync::Mutex;

use crate::error::StorageError;
use crate::model::PlatformState;

#[derive(Clone)]
pub struct StateStore {
    conn: Arc<Mutex<Connection>>,
}

impl StateStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", true)?;
        ensure_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        ensure_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // -----------------------------------------------------------------
    // Daemon lifecycle
    // -----------------------------------------------------------------

    pub async fn record_start(&self, pid: u32, started_at: i64) -> Result<(), StorageError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO daemon_lifecycle (id, pid, started_at, clean_shutdown, recorded_at)
             VALUES (1, ?1, ?2, NULL, ?2)
             ON CONFLICT(id) DO UPDATE SET pid = excluded.pid, started_at = excluded.started_at,
               clean_shutdown = NULL, recorded_at = excluded.recorded_at",
            params![pid, started_at],
        )
        .map_err(|e| StorageError::WriteFailed(e.to_string()))?;
        Ok(())
    }

    pub async fn record_shutdown(&self, clean: bool, at: i64) -> Result<(), StorageError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE daemon_lifecycle SET clean_shutdown = ?1, recorded_at = ?2 WHERE id = 1",
            params![clean, at],
        )
        .map_err(|e| StorageError::WriteFailed(e.to_string()))?;
        Ok(())
    }

    // -----------------------------------------------------------------
    // Platform state — upsert only, never deletes error_count history
    // -----------------------------------------------------------------

    pub async fn save_platform_state(&self, state: &PlatformState) -> Result<(), StorageError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO platform_state
               (platform, status, last_connected, last_message, last_error,
                error_count, message_count, reconnect_attempts, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(platform) DO UPDATE SET
               status = excluded.status,
               last_connected = COALESCE(excluded.last_connected, platform_state.last_connected),
               last_message = COALESCE(excluded.last_message, platform_state.last_message),
               last_error = COALESCE(excluded.last_error, platform_state.last_error),
               error_count = excluded.error_count,
               message_count = excluded.message_count,
               reconnect_attempts = excluded.reconnect_attempts,
               updated_at = excluded.updated_at",
            params![
                state.platform,
                state.status,
                state.last_connected,
                state.last_message,
                state.last_error,
                state.error_count,
                state.message_count,
                state.reconnect_attempts,
                state.updated_at,
            ],
        )
        .map_err(|e| StorageError::WriteFailed(e.to_string()))?;
        Ok(())
    }

    pub async fn load_platform_state(
        &self,
        platform: &str,
    ) -> Result<Option<PlatformState>, StorageError> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT platform, status, last_connected, last_message, last_error,
                    error_count, message_count, reconnect_attempts, updated_at
             FROM platform_state WHERE platform = ?1",
            params![platform],
            row_to_platform_state,
        )
        .optional()
        .map_err(StorageError::from)
    }

    pub async fn load_all_platform_states(&self) -> Result<Vec<PlatformState>, StorageError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT platform, status, last_connected, last_message, last_error,
                    error_count, message_count, reconnect_attempts, updated_at
             FROM platform_state ORDER BY platform",
        )?;
        let rows = stmt.query_map([], row_to_platform_state)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    // -----------------------------------------------------------------
    // Sync state — raw key/value, typed by the sync-state manager layer
    // -----------------------------------------------------------------

    pub async fn save_sync_state(
        &self,
        id: &str,
        watermark_json: &str,
        metadata_json: Option<&str>,
        updated_at: i64,
    ) -> Result<(), StorageError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO sync_state (id, watermark, metadata, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
               watermark = excluded.watermark,
               metadata = excluded.metadata,
               updated_at = excluded.updated_at",
            params![id, watermark_json, metadata_json, updated_at],
        )
        .map_err(|e| StorageError::WriteFailed(e.to_string()))?;
        Ok(())
    }

    pub async fn load_sync_state(
        &self,
        id: &str,
    ) -> Result<Option<(String, Option<String>, i64)>, StorageError> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT watermark, metadata, updated_at FROM sync_state WHERE id = ?1",
            params![id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()
        .map_err(StorageError::from)
    }

    pub async fn delete_sync_state(&self, id: &str) -> Result<(), StorageError> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM sync_state WHERE id = ?1", params![id])?;
        Ok(())
    }

    pub async fn load_sync_states_for_prefix(
        &self,
        prefix: &str,
    ) -> Result<Vec<(String, String, Option<String>, i64)>, StorageError> {
        let conn = self.conn.lock().await;
        let like_pattern = format!("{prefix}%");
        let mut stmt = conn.prepare(
            "SELECT id, watermark, metadata, updated_at FROM sync_state
             WHERE id LIKE ?1 ESCAPE '\\' ORDER BY id",
        )?;
        let rows = stmt.query_map(params![like_pattern], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    // -----------------------------------------------------------------
    // Email threading maps — persisted so threading survives restarts
    // -----------------------------------------------------------------

    pub async fn link_email_message_to_thread(
        &self,
        message_id: &str,
        thread_id: &str,
    ) -> Result<(), StorageError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO email_thread_links (message_id, thread_id) VALUES (?1, ?2)
             ON CONFLICT(message_id) DO UPDATE SET thread_id = excluded.thread_id",
            params![message_id, thread_id],
        )?;
        Ok(())
    }

    pub async fn lookup_email_thread_by_message_id(
        &self,
        message_id: &str,
    ) -> Result<Option<String>, StorageError> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT thread_id FROM email_thread_links WHERE message_id = ?1",
            params![message_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(StorageError::from)
    }

    pub async fn link_email_subject_participants_to_thread(
        &self,
        subject_key: &str,
        participants_key: &str,
        thread_id: &str,
    ) -> Result<(), StorageError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO email_subject_links (subject_key, participants_key, thread_id)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(subject_key, participants_key) DO UPDATE SET thread_id = excluded.thread_id",
            params![subject_key, participants_key, thread_id],
        )?;
        Ok(())
    }

    pub async fn lookup_email_thread_by_subject_participants(
        &self,
        subject_key: &str,
        participants_key: &str,
    ) -> Result<Option<String>, StorageError> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT thread_id FROM email_subject_links
             WHERE subject_key = ?1 AND participants_key = ?2",
            params![subject_key, participants_key],
            |row| row.get(0),
        )
        .optional()
        .map_err(StorageError::from)
    }

    // -----------------------------------------------------------------
    // Accounts
    // -----------------------------------------------------------------

    pub async fn find_account_by_identity(
        &self,
        platform: &str,
        handle: &str,
    ) -> Result<Option<String>, StorageError> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT account_id FROM account_identities WHERE platform = ?1 AND handle = ?2",
            params![platform, handle],
            |row| row.get(0),
        )
        .optional()
        .map_err(StorageError::from)
    }

    pub async fn create_account(
        &self,
        id: &str,
        name: &str,
        platform: &str,
        handle: &str,
    ) -> Result<(), StorageError> {
        let mut conn = self.conn.lock().await;
        let tx = conn
            .transaction()
            .map_err(|e| StorageError::WriteFailed(e.to_string()))?;
        tx.execute(
            "INSERT INTO accounts (id, did, name) VALUES (?1, NULL, ?2)
             ON CONFLICT(id) DO NOTHING",
            params![id, name],
        )?;
        tx.execute(
            "INSERT INTO account_identities (account_id, platform, handle, verified)
             VALUES (?1, ?2, ?3, NULL)
             ON CONFLICT(platform, handle) DO NOTHING",
            params![id, platform, handle],
        )?;
        tx.commit()
            .map_err(|e| StorageError::WriteFailed(e.to_string()))?;
        Ok(())
    }

    // -----------------------------------------------------------------
    // Threads
    // -----------------------------------------------------------------

    pub async fn get_thread(&self, id: &str) -> Result<Option<(i64, i64)>, StorageError> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT created_at, message_count FROM threads WHERE id = ?1",
            params![id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .map_err(StorageError::from)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn ensure_thread(
        &self,
        id: &str,
        title: Option<&str>,
        thread_type: &str,
        platform: &str,
        platform_id: Option<&str>,
        room_id: Option<&str>,
        created_at: i64,
    ) -> Result<(), StorageError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO threads
               (id, title, participants, type, platform, platform_id, room_id,
                created_at, last_message_at, message_count)
             VALUES (?1, ?2, '[]', ?3, ?4, ?5, ?6, ?7, NULL, 0)
             ON CONFLICT(id) DO NOTHING",
            params![id, title, thread_type, platform, platform_id, room_id, created_at],
        )?;
        Ok(())
    }

    pub async fn bump_thread_on_new_message(
        &self,
        id: &str,
        created_at: i64,
    ) -> Result<(), StorageError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE threads SET message_count = message_count + 1,
               last_message_at = MAX(COALESCE(last_message_at, 0), ?2)
             WHERE id = ?1",
            params![id, created_at],
        )?;
        Ok(())
    }

    // -----------------------------------------------------------------
    // Messages — idempotent insert
    // -----------------------------------------------------------------

    /// Returns `true` if a new row was inserted, `false` if the message
    /// already existed (in which case only `imported_at`/tags are updated).
    pub async fn idempotent_insert_message(
        &self,
        id: &str,
        account_id: &str,
        author_json: &str,
        created_at: i64,
        imported_at: i64,
        kind: i32,
        content: &str,
        title: Option<&str>,
        refs_json: &str,
        source_json: &str,
        tags_json: &str,
    ) -> Result<bool, StorageError> {
        let conn = self.conn.lock().await;
        let existing: Option<String> = conn
            .query_row(
                "SELECT tags FROM messages WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;

        match existing {
            None => {
                conn.execute(
                    "INSERT INTO messages
                       (id, account_id, author, created_at, imported_at, kind, content,
                        title, refs, source, tags)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                    params![
                        id, account_id, author_json, created_at, imported_at, kind, content,
                        title, refs_json, source_json, tags_json
                    ],
                )?;
                conn.execute(
                    "INSERT INTO messages_fts (rowid, content, title, tags)
                     SELECT rowid, ?2, ?3, ?4 FROM messages WHERE id = ?1",
                    params![id, content, title, tags_json],
                )?;
                Ok(true)
            }
            Some(existing_tags) => {
                let merged = merge_additive_tags(&existing_tags, tags_json);
                conn.execute(
                    "UPDATE messages SET imported_at = ?2, tags = ?3 WHERE id = ?1",
                    params![id, imported_at, merged],
                )?;
                Ok(false)
            }
        }
    }
}

fn merge_additive_tags(existing_json: &str, incoming_json: &str) -> String {
    let mut existing: Vec<Vec<String>> = serde_json::from_str(existing_json).unwrap_or_default();
    let incoming: Vec<Vec<String>> = serde_json::from_str(incoming_json).unwrap_or_default();
    for tag in incoming {
        if !existing.contains(&tag) {
            existing.push(tag);
        }
    }
    serde_json::to_string(&existing).unwrap_or_else(|_| "[]".to_string())
}

fn row_to_platform_state(row: &rusqlite::Row) -> rusqlite::Result<PlatformState> {
    Ok(PlatformState {
        platform: row.get(0)?,
        status: row.get(1)?,
        last_connected: row.get(2)?,
        last_message: row.get(3)?,
        last_error: row.get(4)?,
        error_count: row.get(5)?,
        message_count: row.get(6)?,
        reconnect_attempts: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

fn ensure_schema(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS daemon_lifecycle (
          id INTEGER PRIMARY KEY CHECK (id = 1),
          pid INTEGER NOT NULL,
          started_at INTEGER NOT NULL,
          clean_shutdown INTEGER,
          recorded_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS platform_state (
          platform TEXT PRIMARY KEY,
          status TEXT NOT NULL,
          last_connected INTEGER,
          last_message INTEGER,
          last_error TEXT,
          error_count INTEGER NOT NULL DEFAULT 0,
          message_count INTEGER NOT NULL DEFAULT 0,
          reconnect_attempts INTEGER NOT NULL DEFAULT 0,
          updated_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS sync_state (
          id TEXT PRIMARY KEY,
          watermark TEXT NOT NULL,
          metadata TEXT,
          updated_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS accounts (
          id TEXT PRIMARY KEY,
          did TEXT,
          name TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS account_identities (
          account_id TEXT NOT NULL REFERENCES accounts(id),
          platform TEXT NOT NULL,
          handle TEXT NOT NULL,
          verified INTEGER,
          PRIMARY KEY (platform, handle)
        );

        CREATE TABLE IF NOT EXISTS threads (
          id TEXT PRIMARY KEY,
          title TEXT,
          participants TEXT NOT NULL DEFAULT '[]',
          type TEXT NOT NULL,
          platform TEXT NOT NULL,
          platform_id TEXT,
          room_id TEXT,
          created_at INTEGER NOT NULL,
          last_message_at INTEGER,
          message_count INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS messages (
          id TEXT PRIMARY KEY,
          account_id TEXT NOT NULL,
          author TEXT NOT NULL,
          created_at INTEGER NOT NULL,
          imported_at INTEGER NOT NULL,
          kind INTEGER NOT NULL,
          content TEXT NOT NULL,
          title TEXT,
          refs TEXT NOT NULL,
          source TEXT NOT NULL,
          tags TEXT NOT NULL DEFAULT '[]'
        );
        CREATE INDEX IF NOT EXISTS idx_messages_created_at ON messages(created_at);

        CREATE VIRTUAL TABLE IF NOT EXISTS messages_fts USING fts5(
          content, title, tags, tokenize = 'porter'
        );

        CREATE TABLE IF NOT EXISTS content_blobs (
          hash TEXT PRIMARY KEY,
          path TEXT NOT NULL,
          byte_len INTEGER NOT NULL,
          created_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS email_thread_links (
          message_id TEXT PRIMARY KEY,
          thread_id TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS email_subject_links (
          subject_key TEXT NOT NULL,
          participants_key TEXT NOT NULL,
          thread_id TEXT NOT NULL,
          PRIMARY KEY (subject_key, participants_key)
        );
        ",
    )
    .map_err(StorageError::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn idempotent_insert_is_idempotent() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .create_account("signal_alice", "Alice", "signal", "alice")
            .await
            .unwrap();

        let inserted_first = store
            .idempotent_insert_message(
                "msg1", "signal_alice", "{}", 1000, 1000, 0, "hi", None, "{}", "{}", "[]",
            )
            .await
            .unwrap();
        assert!(inserted_first);

        let inserted_second = store
            .idempotent_insert_message(
                "msg1", "signal_alice", "{}", 1000, 2000, 0, "hi", None, "{}", "{}",
                r#"[["import","2"]]"#,
            )
            .await
            .unwrap();
        assert!(!inserted_second);
    }

    #[tokio::test]
    async fn platform_state_round_trips() {
        let store = StateStore::open_in_memory().unwrap();
        let state = PlatformState {
            platform: "signal".to_string(),
            status: "connected".to_string(),
            last_connected: Some(100),
            last_message: None,
            last_error: None,
            error_count: 0,
            message_count: 0,
            reconnect_attempts: 0,
            updated_at: 100,
        };
        store.save_platform_state(&state).await.unwrap();
        let loaded = store.load_platform_state("signal").await.unwrap().unwrap();
        assert_eq!(loaded.status, "connected");
    }

    #[tokio::test]
    async fn sync_state_round_trips() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .save_sync_state("signal:main:messages", r#"{"type":"timestamp","ms":5}"#, None, 5)
            .await
            .unwrap();
        let (watermark, _meta, updated_at) = store
            .load_sync_state("signal:main:messages")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated_at, 5);
        assert!(watermark.contains("timestamp"));
    }
}
