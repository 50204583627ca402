//! SQLite-based session storage

use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::SecondsFormat;
use rusqlite::{Connection, OptionalExtension, params};
use rusqlite_migration::{M, Migrations};

use super::SessionStore;
use crate::models::{DownloadSession, SessionId};

/// Database migrations
///
/// Each migration is applied in order. The user_version pragma tracks which
/// migrations have been applied.
fn migrations() -> Migrations<'static> {
    Migrations::new(vec![
        // Migration 1: Initial schema
        M::up(
            r#"
            -- One row per download session; `data` holds the full session JSON
            CREATE TABLE download_sessions (
                id TEXT PRIMARY KEY,
                user_identity TEXT NOT NULL,
                status TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                data TEXT NOT NULL
            );

            CREATE INDEX idx_sessions_user_updated
                ON download_sessions(user_identity, updated_at DESC);
            "#,
        ),
    ])
}

/// SQLite-backed [`SessionStore`]
///
/// Indexed columns are duplicated out of the JSON blob so lookups by user and
/// recency don't have to deserialize every row.
pub struct SqliteSessionStore {
    conn: Mutex<Connection>,
}

impl SqliteSessionStore {
    /// Open (or create) the session database at `db_path`
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref())
            .with_context(|| format!("Failed to open database at {:?}", db_path.as_ref()))?;

        // WAL keeps readers (status queries) from blocking the download loop.
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            "#,
        )?;

        Self::with_connection(conn)
    }

    /// Open a private in-memory database
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::with_connection(conn)
    }

    fn with_connection(mut conn: Connection) -> Result<Self> {
        migrations()
            .to_latest(&mut conn)
            .context("Failed to run database migrations")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn decode(data: String) -> Result<DownloadSession> {
        serde_json::from_str(&data).context("Failed to decode stored session")
    }
}

impl SessionStore for SqliteSessionStore {
    fn put(&self, session: &DownloadSession) -> Result<()> {
        let data = serde_json::to_string(session).context("Failed to encode session")?;
        // Fixed-width timestamps so ORDER BY on the text column is chronological
        let updated_at = session
            .updated_at
            .to_rfc3339_opts(SecondsFormat::Micros, true);

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO download_sessions (id, user_identity, status, updated_at, data)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                session.id.as_str(),
                session.user_identity,
                session.status.as_str(),
                updated_at,
                data
            ],
        )
        .with_context(|| format!("Failed to save session {}", session.id))?;
        Ok(())
    }

    fn get(&self, id: &SessionId) -> Result<Option<DownloadSession>> {
        let conn = self.conn.lock().unwrap();
        let data: Option<String> = conn
            .query_row(
                "SELECT data FROM download_sessions WHERE id = ?",
                [id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        data.map(Self::decode).transpose()
    }

    fn latest_for_user(&self, user_identity: &str) -> Result<Option<DownloadSession>> {
        let conn = self.conn.lock().unwrap();
        let data: Option<String> = conn
            .query_row(
                "SELECT data FROM download_sessions
                 WHERE user_identity = ?1 AND status NOT IN ('completed', 'cancelled')
                 ORDER BY updated_at DESC
                 LIMIT 1",
                [user_identity],
                |row| row.get(0),
            )
            .optional()?;
        data.map(Self::decode).transpose()
    }

    fn list(&self) -> Result<Vec<DownloadSession>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT data FROM download_sessions ORDER BY updated_at DESC")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut sessions = Vec::new();
        for data in rows {
            sessions.push(Self::decode(data?)?);
        }
        Ok(sessions)
    }

    fn delete(&self, id: &SessionId) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM download_sessions WHERE id = ?", [id.as_str()])?;
        Ok(())
    }
}
