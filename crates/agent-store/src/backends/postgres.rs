//! External PostgreSQL backend, for deployments that share metadata
//! across multiple gateway processes. Built on a lazy `sqlx` pool so
//! startup never blocks on database availability; the first query
//! surfaces connection failures as `StorageUnavailable`.

use ag_domain::error::{Error, Result};
use ag_domain::session::{Session, SessionFilter, SessionStatus};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{Row, Transaction};

use crate::MetadataStore;

pub struct PostgresStore {
    pool: sqlx::PgPool,
}

impl PostgresStore {
    pub fn connect(
        host: &str,
        port: u16,
        database: &str,
        user: &str,
        password: &str,
        max_connections: u32,
    ) -> Result<Self> {
        let url = format!("postgres://{user}:{password}@{host}:{port}/{database}");
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_lazy(&url)
            .map_err(|e| Error::StorageBroken(format!("building postgres pool: {e}")))?;
        Ok(Self { pool })
    }

    /// Idempotent schema setup. Exposed both as an inherent method and as
    /// `MetadataStore::ensure_schema` below.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS sessions (
                session_id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                cwd TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                last_active_at TIMESTAMPTZ NOT NULL,
                message_count BIGINT NOT NULL,
                status TEXT NOT NULL,
                metadata JSONB NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| Error::StorageBroken(format!("creating sessions table: {e}")))?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_sessions_user_id ON sessions(user_id)")
            .execute(&self.pool)
            .await
            .map_err(|e| Error::StorageBroken(format!("creating user_id index: {e}")))?;
        Ok(())
    }

    fn row_to_session(row: PgRow) -> Result<Session> {
        let status_str: String = row.try_get("status").map_err(storage_err)?;
        let status = match status_str.as_str() {
            "active" => SessionStatus::Active,
            "closed" => SessionStatus::Closed,
            other => return Err(Error::StorageBroken(format!("unknown status: {other}"))),
        };
        let metadata_json: serde_json::Value = row.try_get("metadata").map_err(storage_err)?;
        Ok(Session {
            session_id: row.try_get("session_id").map_err(storage_err)?,
            user_id: row.try_get("user_id").map_err(storage_err)?,
            cwd: row.try_get("cwd").map_err(storage_err)?,
            created_at: row.try_get("created_at").map_err(storage_err)?,
            last_active_at: row.try_get("last_active_at").map_err(storage_err)?,
            message_count: row.try_get::<i64, _>("message_count").map_err(storage_err)? as u64,
            status,
            metadata: serde_json::from_value(metadata_json)
                .map_err(|e| Error::StorageBroken(format!("parsing metadata jsonb: {e}")))?,
        })
    }
}

fn storage_err(e: sqlx::Error) -> Error {
    Error::StorageUnavailable(e.to_string())
}

#[async_trait]
impl MetadataStore for PostgresStore {
    async fn save(&self, session: &Session) -> Result<()> {
        let metadata = serde_json::to_value(&session.metadata)?;
        sqlx::query(
            "INSERT INTO sessions
                (session_id, user_id, cwd, created_at, last_active_at, message_count, status, metadata)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             ON CONFLICT (session_id) DO UPDATE SET
                user_id = excluded.user_id,
                cwd = excluded.cwd,
                last_active_at = excluded.last_active_at,
                message_count = excluded.message_count,
                status = excluded.status,
                metadata = excluded.metadata",
        )
        .bind(&session.session_id)
        .bind(&session.user_id)
        .bind(&session.cwd)
        .bind(session.created_at)
        .bind(session.last_active_at)
        .bind(session.message_count as i64)
        .bind(session.status.as_str())
        .bind(metadata)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    async fn get(&self, session_id: &str) -> Result<Option<Session>> {
        let row = sqlx::query("SELECT * FROM sessions WHERE session_id = $1")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        row.map(Self::row_to_session).transpose()
    }

    async fn delete(&self, session_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM sessions WHERE session_id = $1")
            .bind(session_id)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn touch(&self, session_id: &str, now: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(
            "UPDATE sessions SET last_active_at = $1, message_count = message_count + 1
             WHERE session_id = $2",
        )
        .bind(now)
        .bind(session_id)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("session {session_id}")));
        }
        Ok(())
    }

    async fn list(&self, filter: &SessionFilter) -> Result<Vec<Session>> {
        let rows = match &filter.user_id {
            Some(user_id) => sqlx::query("SELECT * FROM sessions WHERE user_id = $1")
                .bind(user_id)
                .fetch_all(&self.pool)
                .await
                .map_err(storage_err)?,
            None => sqlx::query("SELECT * FROM sessions")
                .fetch_all(&self.pool)
                .await
                .map_err(storage_err)?,
        };
        rows.into_iter().map(Self::row_to_session).collect()
    }

    async fn sweep_expired(&self, now: DateTime<Utc>, ttl: Duration) -> Result<Vec<String>> {
        if ttl.is_zero() {
            return Ok(Vec::new());
        }
        let cutoff = now
            - ttl
                .to_std()
                .map(|_| ttl)
                .unwrap_or_else(|_| Duration::zero());
        let mut tx: Transaction<'_, sqlx::Postgres> =
            self.pool.begin().await.map_err(storage_err)?;
        let rows = sqlx::query("SELECT session_id FROM sessions WHERE last_active_at < $1")
            .bind(cutoff)
            .fetch_all(&mut *tx)
            .await
            .map_err(storage_err)?;
        let ids: Vec<String> = rows
            .into_iter()
            .map(|r| r.try_get::<String, _>("session_id"))
            .collect::<std::result::Result<_, _>>()
            .map_err(storage_err)?;
        sqlx::query("DELETE FROM sessions WHERE last_active_at < $1")
            .bind(cutoff)
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;
        tx.commit().await.map_err(storage_err)?;
        Ok(ids)
    }

    async fn ensure_schema(&self) -> Result<()> {
        self.migrate().await
    }
}

// Exercised against a real Postgres instance via `sqlx::test`-style
// integration tests is out of scope for unit tests here — `PostgresStore`
// is covered indirectly through `MetadataStore` contract tests run
// against `MemoryStore` and `SqliteStore`; see `backends::sqlite::tests`.
