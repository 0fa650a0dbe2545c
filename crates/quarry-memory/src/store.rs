use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;

use quarry_core::error::{QuarryError, Result};
use quarry_core::traits::ConversationStore;
use quarry_core::types::{ChatMessage, Role, SessionId, TurnRecord};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS messages (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id TEXT NOT NULL,
        role TEXT NOT NULL,
        content TEXT NOT NULL,
        timestamp TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_messages_session
        ON messages(session_id, id);

    CREATE TABLE IF NOT EXISTS turns (
        session_id TEXT NOT NULL,
        turn_id INTEGER NOT NULL,
        record TEXT NOT NULL,
        timestamp TEXT NOT NULL,
        PRIMARY KEY (session_id, turn_id)
    );";

fn db_err(e: impl std::fmt::Display) -> QuarryError {
    QuarryError::Database(e.to_string())
}

fn parse_timestamp(ts: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(ts)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// SQLite-backed conversation history and research turn log.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| db_err(format!("Failed to create db directory: {}", e)))?;
        }

        let conn = Connection::open(path).map_err(db_err)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        debug!(path = %path.display(), "SQLite store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Session ids ordered by most recent activity.
    pub fn list_sessions(&self, limit: usize) -> Result<Vec<(SessionId, DateTime<Utc>)>> {
        let conn = self.conn.lock().map_err(db_err)?;
        let mut stmt = conn
            .prepare(
                "SELECT session_id, MAX(timestamp) AS last FROM (
                     SELECT session_id, timestamp FROM messages
                     UNION ALL
                     SELECT session_id, timestamp FROM turns
                 )
                 GROUP BY session_id
                 ORDER BY last DESC
                 LIMIT ?1",
            )
            .map_err(db_err)?;

        let rows = stmt
            .query_map(params![limit as i64], |row| {
                let sid: String = row.get(0)?;
                let ts: String = row.get(1)?;
                Ok((sid, ts))
            })
            .map_err(db_err)?;

        let mut sessions = Vec::new();
        for row in rows {
            let (sid, ts) = row.map_err(db_err)?;
            if let Some(ts) = parse_timestamp(&ts) {
                sessions.push((SessionId(sid), ts));
            }
        }
        Ok(sessions)
    }
}

impl ConversationStore for SqliteStore {
    fn append_message(&self, sid: &SessionId, role: Role, text: &str) -> BoxFuture<'_, Result<()>> {
        let sid = sid.0.clone();
        let text = text.to_string();
        let timestamp = Utc::now().to_rfc3339();

        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            conn.execute(
                "INSERT INTO messages (session_id, role, content, timestamp) VALUES (?1, ?2, ?3, ?4)",
                params![sid, role.as_str(), text, timestamp],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn load_recent_messages(
        &self,
        sid: &SessionId,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<ChatMessage>>> {
        let sid = sid.0.clone();

        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            let mut stmt = conn
                .prepare(
                    "SELECT role, content, timestamp FROM messages
                     WHERE session_id = ?1
                     ORDER BY id DESC
                     LIMIT ?2",
                )
                .map_err(db_err)?;

            let rows = stmt
                .query_map(params![sid, limit as i64], |row| {
                    let role: String = row.get(0)?;
                    let content: String = row.get(1)?;
                    let ts: String = row.get(2)?;
                    Ok((role, content, ts))
                })
                .map_err(db_err)?;

            let mut messages = Vec::new();
            for row in rows {
                let (role, content, ts) = row.map_err(db_err)?;
                messages.push(ChatMessage {
                    role: Role::parse(&role).unwrap_or(Role::User),
                    content,
                    timestamp: parse_timestamp(&ts),
                });
            }
            messages.reverse();
            Ok(messages)
        })
    }

    fn record_turn(&self, sid: &SessionId, turn: &TurnRecord) -> BoxFuture<'_, Result<()>> {
        let sid = sid.0.clone();
        let turn_id = turn.turn_id;
        let timestamp = turn.timestamp.to_rfc3339();
        let record = serde_json::to_string(turn);

        Box::pin(async move {
            let record = record?;
            let conn = self.conn.lock().map_err(db_err)?;
            conn.execute(
                "INSERT OR REPLACE INTO turns (session_id, turn_id, record, timestamp)
                 VALUES (?1, ?2, ?3, ?4)",
                params![sid, turn_id, record, timestamp],
            )
            .map_err(db_err)?;
            debug!(session = %sid, turn_id, "Research turn recorded");
            Ok(())
        })
    }

    fn turn_count(&self, sid: &SessionId) -> BoxFuture<'_, Result<u32>> {
        let sid = sid.0.clone();

        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            let count: u32 = conn
                .query_row(
                    "SELECT COUNT(*) FROM turns WHERE session_id = ?1",
                    params![sid],
                    |row| row.get(0),
                )
                .map_err(db_err)?;
            Ok(count)
        })
    }

    fn load_turns(&self, sid: &SessionId) -> BoxFuture<'_, Result<Vec<TurnRecord>>> {
        let sid = sid.0.clone();

        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            let mut stmt = conn
                .prepare("SELECT record FROM turns WHERE session_id = ?1 ORDER BY turn_id ASC")
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![sid], |row| row.get::<_, String>(0))
                .map_err(db_err)?;

            let mut turns = Vec::new();
            for row in rows {
                let record = row.map_err(db_err)?;
                turns.push(serde_json::from_str(&record)?);
            }
            Ok(turns)
        })
    }

    fn last_activity(&self, sid: &SessionId) -> BoxFuture<'_, Result<Option<DateTime<Utc>>>> {
        let sid = sid.0.clone();

        Box::pin(async move {
            let conn = self.conn.lock().map_err(db_err)?;
            let last: Option<String> = conn
                .query_row(
                    "SELECT MAX(timestamp) FROM (
                         SELECT timestamp FROM messages WHERE session_id = ?1
                         UNION ALL
                         SELECT timestamp FROM turns WHERE session_id = ?1
                     )",
                    params![sid],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_err)?
                .flatten();
            Ok(last.as_deref().and_then(parse_timestamp))
        })
    }
}
