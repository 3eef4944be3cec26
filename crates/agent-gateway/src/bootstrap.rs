//! [`AppState`] construction, extracted from `main.rs` so `serve` and
//! `doctor` share the same boot path.

use std::sync::Arc;
use std::time::Instant;

use ag_domain::config::{Config, StorageConfig};

use crate::auth::compute_token_hash;
use crate::session_manager::SessionManager;
use crate::state::AppState;

const DEFAULT_AGENT_PROGRAM: &str = "claude-code";

/// Validate config, construct the metadata store and session manager,
/// and return a fully-wired [`AppState`].
pub async fn build_app_state(config: Arc<Config>) -> anyhow::Result<AppState> {
    let store = ag_store::create_store(&config.storage).await?;
    tracing::info!(backend = storage_label(&config.storage), "metadata store ready");

    let agent_program = std::env::var("AGENT_GATEWAY_AGENT_BIN")
        .unwrap_or_else(|_| DEFAULT_AGENT_PROGRAM.to_string());
    let agent_env: std::collections::HashMap<String, String> = std::env::vars().collect();

    let sessions = Arc::new(SessionManager::new(
        store,
        config.sessions.clone(),
        config.agent.clone(),
        agent_program,
        agent_env,
    ));

    let api_token_env = config
        .server
        .api_token_env
        .clone()
        .unwrap_or_else(|| "AGENT_GATEWAY_API_TOKEN".to_string());
    let api_token_hash = Arc::new(compute_token_hash(&api_token_env));
    let storage_label = storage_label(&config.storage);

    Ok(AppState {
        config,
        sessions,
        api_token_hash,
        started_at: Instant::now(),
        storage_label,
    })
}

fn storage_label(storage: &StorageConfig) -> &'static str {
    match storage {
        StorageConfig::Memory => "memory",
        StorageConfig::Sqlite { .. } => "sqlite",
        StorageConfig::Postgresql { .. } => "postgresql",
    }
}
