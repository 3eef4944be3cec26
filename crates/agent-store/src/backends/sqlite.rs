//! Embedded SQLite backend. A single persistent connection guarded by a
//! `parking_lot::Mutex`; every operation hops to a blocking thread via
//! `spawn_blocking` since `rusqlite` is synchronous.

use std::sync::Arc;

use ag_domain::error::{Error, Result};
use ag_domain::session::{Session, SessionFilter, SessionStatus};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use crate::MetadataStore;

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .map_err(|e| Error::StorageBroken(format!("opening sqlite db {path}: {e}")))?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA temp_store=MEMORY;
             PRAGMA cache_size=-65536;",
        )
        .map_err(|e| Error::StorageBroken(format!("configuring sqlite pragmas: {e}")))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS sessions (
                session_id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                cwd TEXT NOT NULL,
                created_at TEXT NOT NULL,
                last_active_at TEXT NOT NULL,
                message_count INTEGER NOT NULL,
                status TEXT NOT NULL,
                metadata TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_sessions_user_last_active
                ON sessions(user_id, last_active_at DESC);",
        )
        .map_err(|e| Error::StorageBroken(format!("creating sessions table: {e}")))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    #[allow(clippy::type_complexity)]
    fn row_to_session(
        row: (String, String, String, String, String, i64, String, String),
    ) -> Result<Session> {
        let (session_id, user_id, cwd, created_at, last_active_at, message_count, status, metadata) = row;
        let message_count = message_count as u64;
        let status = match status.as_str() {
            "active" => SessionStatus::Active,
            "closed" => SessionStatus::Closed,
            other => {
                return Err(Error::StorageBroken(format!(
                    "unknown session status in db: {other}"
                )))
            }
        };
        Ok(Session {
            session_id,
            user_id,
            cwd,
            created_at: created_at
                .parse::<DateTime<Utc>>()
                .map_err(|e| Error::StorageBroken(format!("parsing created_at: {e}")))?,
            last_active_at: last_active_at
                .parse::<DateTime<Utc>>()
                .map_err(|e| Error::StorageBroken(format!("parsing last_active_at: {e}")))?,
            message_count,
            status,
            metadata: serde_json::from_str(&metadata)
                .map_err(|e| Error::StorageBroken(format!("parsing metadata json: {e}")))?,
        })
    }

    async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            f(&conn)
        })
        .await
        .map_err(|e| Error::StorageUnavailable(format!("sqlite worker panicked: {e}")))?
    }
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn save(&self, session: &Session) -> Result<()> {
        let session = session.clone();
        self.with_conn(move |conn| {
            let metadata = serde_json::to_string(&session.metadata)?;
            conn.execute(
                "INSERT INTO sessions
                    (session_id, user_id, cwd, created_at, last_active_at, message_count, status, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(session_id) DO UPDATE SET
                    user_id = excluded.user_id,
                    cwd = excluded.cwd,
                    last_active_at = excluded.last_active_at,
                    message_count = excluded.message_count,
                    status = excluded.status,
                    metadata = excluded.metadata",
                params![
                    session.session_id,
                    session.user_id,
                    session.cwd,
                    session.created_at.to_rfc3339(),
                    session.last_active_at.to_rfc3339(),
                    session.message_count as i64,
                    session.status.as_str(),
                    metadata,
                ],
            )
            .map_err(|e| Error::StorageUnavailable(format!("insert session: {e}")))?;
            Ok(())
        })
        .await
    }

    async fn get(&self, session_id: &str) -> Result<Option<Session>> {
        let session_id = session_id.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT session_id, user_id, cwd, created_at, last_active_at, message_count, status, metadata
                 FROM sessions WHERE session_id = ?1",
                params![session_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, i64>(5)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, String>(7)?,
                    ))
                },
            )
            .optional()
            .map_err(|e| Error::StorageUnavailable(format!("get session: {e}")))?
            .map(Self::row_to_session)
            .transpose()
        })
        .await
    }

    async fn delete(&self, session_id: &str) -> Result<()> {
        let session_id = session_id.to_string();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM sessions WHERE session_id = ?1", params![session_id])
                .map_err(|e| Error::StorageUnavailable(format!("delete session: {e}")))?;
            Ok(())
        })
        .await
    }

    async fn touch(&self, session_id: &str, now: DateTime<Utc>) -> Result<()> {
        let session_id = session_id.to_string();
        self.with_conn(move |conn| {
            let updated = conn
                .execute(
                    "UPDATE sessions SET last_active_at = ?1, message_count = message_count + 1
                     WHERE session_id = ?2",
                    params![now.to_rfc3339(), session_id],
                )
                .map_err(|e| Error::StorageUnavailable(format!("touch session: {e}")))?;
            if updated == 0 {
                return Err(Error::NotFound(format!("session {session_id}")));
            }
            Ok(())
        })
        .await
    }

    async fn list(&self, filter: &SessionFilter) -> Result<Vec<Session>> {
        let filter = filter.clone();
        self.with_conn(move |conn| {
            let mut stmt = if filter.user_id.is_some() {
                conn.prepare(
                    "SELECT session_id, user_id, cwd, created_at, last_active_at, message_count, status, metadata
                     FROM sessions WHERE user_id = ?1",
                )
            } else {
                conn.prepare(
                    "SELECT session_id, user_id, cwd, created_at, last_active_at, message_count, status, metadata
                     FROM sessions",
                )
            }
            .map_err(|e| Error::StorageUnavailable(format!("prepare list query: {e}")))?;

            let map_row = |row: &rusqlite::Row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, String>(7)?,
                ))
            };

            let rows = match &filter.user_id {
                Some(user_id) => stmt
                    .query_map(params![user_id], map_row)
                    .map_err(|e| Error::StorageUnavailable(format!("list sessions: {e}")))?
                    .collect::<std::result::Result<Vec<_>, _>>(),
                None => stmt
                    .query_map([], map_row)
                    .map_err(|e| Error::StorageUnavailable(format!("list sessions: {e}")))?
                    .collect::<std::result::Result<Vec<_>, _>>(),
            }
            .map_err(|e| Error::StorageUnavailable(format!("list sessions: {e}")))?;

            rows.into_iter()
                .map(Self::row_to_session)
                .collect()
        })
        .await
    }

    async fn sweep_expired(&self, now: DateTime<Utc>, ttl: Duration) -> Result<Vec<String>> {
        if ttl.is_zero() {
            return Ok(Vec::new());
        }
        let cutoff = now - ttl;
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare("SELECT session_id FROM sessions WHERE last_active_at < ?1")
                .map_err(|e| Error::StorageUnavailable(format!("prepare sweep query: {e}")))?;
            let ids: Vec<String> = stmt
                .query_map(params![cutoff.to_rfc3339()], |row| row.get(0))
                .map_err(|e| Error::StorageUnavailable(format!("sweep query: {e}")))?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| Error::StorageUnavailable(format!("sweep query rows: {e}")))?;

            conn.execute(
                "DELETE FROM sessions WHERE last_active_at < ?1",
                params![cutoff.to_rfc3339()],
            )
            .map_err(|e| Error::StorageUnavailable(format!("sweep delete: {e}")))?;

            Ok(ids)
        })
        .await
    }
}
