//! `ag-store` — the Metadata Store abstraction.
//!
//! Provides the [`MetadataStore`] trait that abstracts over where session
//! records live, a memory-backed implementation ([`MemoryStore`]), an
//! embedded SQLite implementation ([`SqliteStore`]), and an external
//! PostgreSQL implementation ([`PostgresStore`]). Use [`create_store`] to
//! build the right one from [`ag_domain::config::StorageConfig`].

pub mod backends;

pub use backends::memory::MemoryStore;
pub use backends::postgres::PostgresStore;
pub use backends::sqlite::SqliteStore;

use std::sync::Arc;

use ag_domain::config::StorageConfig;
use ag_domain::error::{Error, Result};
use ag_domain::session::{Session, SessionFilter};
use async_trait::async_trait;

/// Persistence contract for session metadata. Never holds agent
/// subprocess handles or stream state — only the data the spec calls
/// durable.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Insert or overwrite a session record in full.
    async fn save(&self, session: &Session) -> Result<()>;

    async fn get(&self, session_id: &str) -> Result<Option<Session>>;

    async fn delete(&self, session_id: &str) -> Result<()>;

    /// Bump `last_active_at` to `now` and increment `message_count` by one.
    /// No-op error (`NotFound`) if the session is absent.
    async fn touch(&self, session_id: &str, now: chrono::DateTime<chrono::Utc>) -> Result<()>;

    async fn list(&self, filter: &SessionFilter) -> Result<Vec<Session>>;

    /// Delete every session whose `last_active_at + ttl < now`. Returns
    /// the ids removed. `ttl` of zero means "never expires" — callers
    /// must not invoke this with a zero ttl but the contract tolerates it
    /// by returning an empty vec.
    async fn sweep_expired(
        &self,
        now: chrono::DateTime<chrono::Utc>,
        ttl: chrono::Duration,
    ) -> Result<Vec<String>>;

    /// Idempotent schema setup, run once at startup after the backend is
    /// constructed. `MemoryStore` and `SqliteStore` create their schema
    /// synchronously in their constructors, so this is a no-op for them;
    /// `PostgresStore` needs a connection round-trip, hence async.
    async fn ensure_schema(&self) -> Result<()> {
        Ok(())
    }
}

/// Build the store configured by `storage` and run its startup schema
/// setup. Contract errors here (e.g. an unreachable database) surface as
/// fatal `StorageBroken` — this is meant to be called once at process
/// startup, not per-request.
pub async fn create_store(storage: &StorageConfig) -> Result<Arc<dyn MetadataStore>> {
    let store: Arc<dyn MetadataStore> = match storage {
        StorageConfig::Memory => Arc::new(MemoryStore::new()),
        StorageConfig::Sqlite { path } => {
            tracing::info!(path, "opening sqlite metadata store");
            Arc::new(SqliteStore::open(path)?)
        }
        StorageConfig::Postgresql {
            host,
            port,
            database,
            user,
            password_env,
            max_connections,
        } => {
            let password = std::env::var(password_env).map_err(|_| {
                Error::StorageBroken(format!(
                    "environment variable {password_env} is not set for postgres backend"
                ))
            })?;
            tracing::info!(host, port, database, user, "connecting to postgres metadata store");
            Arc::new(PostgresStore::connect(
                host,
                *port,
                database,
                user,
                &password,
                *max_connections,
            )?)
        }
    };
    store.ensure_schema().await?;
    Ok(store)
}
