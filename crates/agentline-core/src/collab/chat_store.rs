//! SQLite-backed chat persistence

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use super::{ChatMessage, ChatSession, ChatStore, MessageRole};
use crate::types::Principal;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS chat_sessions (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    org_id TEXT,
    title TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    last_message_at TEXT,
    message_count INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_chat_sessions_user ON chat_sessions(user_id);

CREATE TABLE IF NOT EXISTS chat_messages (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL REFERENCES chat_sessions(id) ON DELETE CASCADE,
    user_id TEXT NOT NULL,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_chat_messages_session ON chat_messages(session_id, created_at);
";

pub struct SqliteChatStore {
    conn: Mutex<Connection>,
}

impl SqliteChatStore {
    /// Open (or create) the database at `path` and apply the schema
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open chat database {}", path.display()))?;
        Self::with_connection(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Messages of a session, oldest first
    pub fn list_messages(&self, session_id: &str) -> Result<Vec<ChatMessage>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT session_id, user_id, role, content, metadata
             FROM chat_messages WHERE session_id = ?1
             ORDER BY created_at ASC, rowid ASC",
        )?;
        let rows = stmt
            .query_map([session_id], |row| {
                let role: String = row.get(2)?;
                let metadata: String = row.get(4)?;
                Ok(ChatMessage {
                    session_id: row.get(0)?,
                    user_id: row.get(1)?,
                    role: if role == "assistant" {
                        MessageRole::Assistant
                    } else {
                        MessageRole::User
                    },
                    content: row.get(3)?,
                    metadata: serde_json::from_str(&metadata).unwrap_or_default(),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn map_session_row(row: &rusqlite::Row) -> rusqlite::Result<ChatSession> {
        let created_at: String = row.get(4)?;
        let updated_at: String = row.get(5)?;
        Ok(ChatSession {
            id: row.get(0)?,
            user_id: row.get(1)?,
            org_id: row.get(2)?,
            title: row.get(3)?,
            created_at: parse_timestamp(&created_at),
            updated_at: parse_timestamp(&updated_at),
            message_count: row.get(6)?,
        })
    }
}

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

impl ChatStore for SqliteChatStore {
    fn create_session(
        &self,
        owner: &Principal,
        title: &str,
        session_id: Option<&str>,
    ) -> Result<ChatSession> {
        let id = session_id
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let now = Utc::now();
        let stamp = now.to_rfc3339();

        self.conn.lock().execute(
            "INSERT INTO chat_sessions (id, user_id, org_id, title, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![id, owner.user_id, owner.org_id, title, stamp, stamp],
        )?;

        Ok(ChatSession {
            id,
            user_id: owner.user_id.clone(),
            org_id: owner.org_id.clone(),
            title: title.to_string(),
            created_at: now,
            updated_at: now,
            message_count: 0,
        })
    }

    fn get_session(&self, session_id: &str) -> Result<Option<ChatSession>> {
        let session = self
            .conn
            .lock()
            .query_row(
                "SELECT id, user_id, org_id, title, created_at, updated_at, message_count
                 FROM chat_sessions WHERE id = ?1",
                [session_id],
                Self::map_session_row,
            )
            .optional()?;
        Ok(session)
    }

    fn save_message(&self, message: &ChatMessage) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let id = uuid::Uuid::new_v4().to_string();
        let metadata = serde_json::to_string(&message.metadata)?;

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO chat_messages (id, session_id, user_id, role, content, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                id,
                message.session_id,
                message.user_id,
                message.role.as_str(),
                message.content,
                metadata,
                now
            ],
        )?;
        tx.execute(
            "UPDATE chat_sessions
             SET updated_at = ?1, last_message_at = ?1, message_count = message_count + 1
             WHERE id = ?2",
            params![now, message.session_id],
        )?;
        tx.commit()?;
        Ok(())
    }
}
