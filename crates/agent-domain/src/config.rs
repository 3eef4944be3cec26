//! Top-level configuration, loaded as TOML with `#[serde(default = ...)]`
//! on every field so a partial file, or no file at all, still produces a
//! usable `Config`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub sessions: SessionsConfig,
    #[serde(default)]
    pub agent: AgentDefaultsConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Storage backend selection
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageConfig {
    #[default]
    Memory,
    Sqlite {
        #[serde(default = "d_sqlite_path")]
        path: String,
    },
    Postgresql {
        #[serde(default = "d_pg_host")]
        host: String,
        #[serde(default = "d_pg_port")]
        port: u16,
        #[serde(default = "d_pg_database")]
        database: String,
        #[serde(default = "d_pg_user")]
        user: String,
        /// Read from `$<password_env>` at startup, never stored in the file.
        #[serde(default = "d_pg_password_env")]
        password_env: String,
        #[serde(default = "d_pg_max_connections")]
        max_connections: u32,
    },
}

fn d_sqlite_path() -> String {
    "agent-sessions.db".into()
}
fn d_pg_host() -> String {
    "127.0.0.1".into()
}
fn d_pg_port() -> u16 {
    5432
}
fn d_pg_database() -> String {
    "agent_gateway".into()
}
fn d_pg_user() -> String {
    "agent_gateway".into()
}
fn d_pg_password_env() -> String {
    "AGENT_GATEWAY_DB_PASSWORD".into()
}
fn d_pg_max_connections() -> u32 {
    5
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session lifecycle and fleet caps
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsConfig {
    /// Root directory under which every `user_id` gets its own subtree.
    #[serde(default = "d_base_dir")]
    pub base_dir: String,
    #[serde(default = "d_true")]
    pub auto_create_dir: bool,
    /// Idle TTL in seconds. 0 disables TTL eviction.
    #[serde(default = "d_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "d_max_sessions")]
    pub max_sessions: usize,
    #[serde(default = "d_max_sessions_per_user")]
    pub max_sessions_per_user: usize,
    #[serde(default = "d_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
    /// Soft RSS budget across all live agent subprocesses. 0 disables the check.
    #[serde(default)]
    pub memory_limit_mb: u64,
    /// How long a live client may sit unused before the maintainer evicts
    /// it (metadata is retained; the session stays resumable). 0 disables
    /// idle eviction.
    #[serde(default = "d_idle_session_timeout_secs")]
    pub idle_session_timeout_secs: u64,
    /// How often the background maintainer sweeps for expired/idle sessions.
    #[serde(default = "d_maintainer_tick_secs")]
    pub maintainer_tick_secs: u64,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            base_dir: d_base_dir(),
            auto_create_dir: true,
            ttl_secs: d_ttl_secs(),
            max_sessions: d_max_sessions(),
            max_sessions_per_user: d_max_sessions_per_user(),
            max_concurrent_requests: d_max_concurrent_requests(),
            memory_limit_mb: 0,
            idle_session_timeout_secs: d_idle_session_timeout_secs(),
            maintainer_tick_secs: d_maintainer_tick_secs(),
        }
    }
}

fn d_base_dir() -> String {
    "./agent-users".into()
}
fn d_true() -> bool {
    true
}
fn d_ttl_secs() -> u64 {
    3600
}
fn d_max_sessions() -> usize {
    500
}
fn d_max_sessions_per_user() -> usize {
    10
}
fn d_max_concurrent_requests() -> usize {
    32
}
fn d_maintainer_tick_secs() -> u64 {
    30
}
fn d_idle_session_timeout_secs() -> u64 {
    1800
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Agent subprocess defaults
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PermissionMode {
    #[default]
    Default,
    AcceptEdits,
    BypassPermissions,
    Plan,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "lowercase")]
pub enum McpServerConfig {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    Sse {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDefaultsConfig {
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub permission_mode: PermissionMode,
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    /// `setting_sources` wins over `plugins` on conflicting settings keys.
    #[serde(default)]
    pub setting_sources: Vec<String>,
    #[serde(default)]
    pub plugins: Vec<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "d_max_turns")]
    pub max_turns: u32,
    #[serde(default)]
    pub max_budget_usd: Option<f64>,
    #[serde(default)]
    pub mcp_servers: HashMap<String, McpServerConfig>,
    /// Per-turn timeout. On expiry the turn is abandoned (an `Error` then
    /// `Done` event is synthesized) but the subprocess is left running.
    #[serde(default = "d_turn_timeout_secs")]
    pub turn_timeout_secs: u64,
}

impl Default for AgentDefaultsConfig {
    // `#[serde(default = "...")]` only feeds partial deserialization, not
    // the plain `Default` impl a derive would give us — so it's spelled
    // out by hand to keep `AgentDefaultsConfig::default()` (used by tests
    // and by `Config::default()`) matching the documented field defaults.
    fn default() -> Self {
        Self {
            system_prompt: None,
            permission_mode: PermissionMode::default(),
            allowed_tools: Vec::new(),
            setting_sources: Vec::new(),
            plugins: Vec::new(),
            model: None,
            max_turns: d_max_turns(),
            max_budget_usd: None,
            mcp_servers: HashMap::new(),
            turn_timeout_secs: d_turn_timeout_secs(),
        }
    }
}

fn d_max_turns() -> u32 {
    50
}
fn d_turn_timeout_secs() -> u64 {
    120
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "d_port")]
    pub port: u16,
    #[serde(default = "d_host")]
    pub host: String,
    #[serde(default)]
    pub cors: CorsConfig,
    /// Name of the environment variable holding the bearer token clients
    /// must present. If unset, auth is disabled (local/dev only).
    #[serde(default)]
    pub api_token_env: Option<String>,
    #[serde(default = "d_log_format")]
    pub log_format: LogFormat,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: d_port(),
            host: d_host(),
            cors: CorsConfig::default(),
            api_token_env: None,
            log_format: d_log_format(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

fn d_log_format() -> LogFormat {
    LogFormat::Pretty
}

fn d_port() -> u16 {
    8080
}
fn d_host() -> String {
    "127.0.0.1".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    #[serde(default = "d_cors_origins")]
    pub allowed_origins: Vec<String>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: d_cors_origins(),
        }
    }
}

fn d_cors_origins() -> Vec<String> {
    vec!["http://localhost:3000".into()]
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Loading
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

impl Config {
    /// Resolve `$AGENT_GATEWAY_CONFIG` (defaulting to `config.toml`) and
    /// load it if present; otherwise fall back to defaults. Missing file
    /// is not an error, a malformed one is. Environment variables are
    /// then applied on top, per key — the precedence spec.md §6 calls
    /// for is "environment variables > file > defaults", not a choice of
    /// one source for the whole document.
    pub fn load() -> anyhow::Result<(Config, String)> {
        let config_path =
            std::env::var("AGENT_GATEWAY_CONFIG").unwrap_or_else(|_| "config.toml".into());

        let mut config = if std::path::Path::new(&config_path).exists() {
            let raw = std::fs::read_to_string(&config_path)
                .map_err(|e| anyhow::anyhow!("reading {config_path}: {e}"))?;
            toml::from_str(&raw).map_err(|e| anyhow::anyhow!("parsing {config_path}: {e}"))?
        } else {
            Config::default()
        };

        apply_env_overrides(&mut config)?;

        Ok((config, config_path))
    }

    /// Sanity-check the resolved configuration. Returns every issue found
    /// rather than bailing on the first one, so `doctor`/`config validate`
    /// can report the full list in one pass.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        if self.sessions.max_sessions == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                message: "sessions.max_sessions must be greater than zero".into(),
            });
        }
        if self.sessions.max_sessions_per_user > self.sessions.max_sessions {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                message: "sessions.max_sessions_per_user exceeds sessions.max_sessions — the per-user cap can never bind".into(),
            });
        }
        if self.sessions.max_concurrent_requests == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                message: "sessions.max_concurrent_requests must be greater than zero".into(),
            });
        }
        if self.sessions.base_dir.trim().is_empty() {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                message: "sessions.base_dir must not be empty".into(),
            });
        }
        if !self.sessions.auto_create_dir && !std::path::Path::new(&self.sessions.base_dir).is_dir() {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                message: format!(
                    "sessions.base_dir {:?} does not exist and sessions.auto_create_dir is false",
                    self.sessions.base_dir
                ),
            });
        }
        if self.server.api_token_env.is_none() {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                message: "server.api_token_env is unset — the API will run without bearer-token auth".into(),
            });
        }
        if let StorageConfig::Postgresql { password_env, .. } = &self.storage {
            if std::env::var(password_env).is_err() {
                issues.push(ConfigIssue {
                    severity: ConfigSeverity::Error,
                    message: format!("storage backend is postgresql but ${password_env} is not set"),
                });
            }
        }

        issues
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub message: String,
}

impl std::fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

fn env_str(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> anyhow::Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match env_str(key) {
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("{key}={raw:?} is not valid: {e}")),
        None => Ok(None),
    }
}

/// Apply the documented `AGENT_GATEWAY_*` environment overrides on top of
/// whatever the file/defaults produced. Each key is independent; unset
/// variables leave the file/default value untouched.
fn apply_env_overrides(config: &mut Config) -> anyhow::Result<()> {
    if let Some(v) = env_str("AGENT_GATEWAY_BASE_DIR") {
        config.sessions.base_dir = v;
    }
    if let Some(v) = env_parse::<bool>("AGENT_GATEWAY_AUTO_CREATE_DIR")? {
        config.sessions.auto_create_dir = v;
    }
    if let Some(v) = env_parse::<u64>("AGENT_GATEWAY_TTL_SECS")? {
        config.sessions.ttl_secs = v;
    }
    if let Some(v) = env_parse::<usize>("AGENT_GATEWAY_MAX_SESSIONS")? {
        config.sessions.max_sessions = v;
    }
    if let Some(v) = env_parse::<usize>("AGENT_GATEWAY_MAX_SESSIONS_PER_USER")? {
        config.sessions.max_sessions_per_user = v;
    }
    if let Some(v) = env_parse::<usize>("AGENT_GATEWAY_MAX_CONCURRENT_REQUESTS")? {
        config.sessions.max_concurrent_requests = v;
    }
    if let Some(v) = env_parse::<u64>("AGENT_GATEWAY_MEMORY_LIMIT_MB")? {
        config.sessions.memory_limit_mb = v;
    }
    if let Some(v) = env_parse::<u64>("AGENT_GATEWAY_IDLE_SESSION_TIMEOUT_SECS")? {
        config.sessions.idle_session_timeout_secs = v;
    }

    if let Some(v) = env_str("AGENT_GATEWAY_STORAGE") {
        config.storage = match v.as_str() {
            "memory" => StorageConfig::Memory,
            "sqlite" => StorageConfig::Sqlite {
                path: env_str("AGENT_GATEWAY_SQLITE_PATH").unwrap_or_else(d_sqlite_path),
            },
            "postgresql" => StorageConfig::Postgresql {
                host: env_str("AGENT_GATEWAY_PG_HOST").unwrap_or_else(d_pg_host),
                port: match env_parse::<u16>("AGENT_GATEWAY_PG_PORT")? {
                    Some(p) => p,
                    None => d_pg_port(),
                },
                database: env_str("AGENT_GATEWAY_PG_DATABASE").unwrap_or_else(d_pg_database),
                user: env_str("AGENT_GATEWAY_PG_USER").unwrap_or_else(d_pg_user),
                password_env: d_pg_password_env(),
                max_connections: d_pg_max_connections(),
            },
            other => anyhow::bail!("AGENT_GATEWAY_STORAGE={other:?} is not one of memory|sqlite|postgresql"),
        };
    } else if let StorageConfig::Sqlite { path } = &mut config.storage {
        if let Some(v) = env_str("AGENT_GATEWAY_SQLITE_PATH") {
            *path = v;
        }
    }

    // The agent's own upstream model override, per spec.md §6's
    // "ANTHROPIC_MODEL" env var.
    if let Some(v) = env_str("ANTHROPIC_MODEL") {
        config.agent.model = Some(v);
    }

    if let Some(v) = env_parse::<u16>("AGENT_GATEWAY_PORT")? {
        config.server.port = v;
    }
    if let Some(v) = env_str("AGENT_GATEWAY_HOST") {
        config.server.host = v;
    }
    if let Some(v) = env_str("AGENT_GATEWAY_API_TOKEN_ENV") {
        config.server.api_token_env = Some(v);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_memory_backed() {
        let cfg = Config::default();
        assert!(matches!(cfg.storage, StorageConfig::Memory));
        assert_eq!(cfg.sessions.max_sessions, 500);
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let toml_str = r#"
            [sessions]
            max_sessions = 10

            [storage]
            backend = "sqlite"
            path = "/tmp/custom.db"
        "#;
        let cfg: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.sessions.max_sessions, 10);
        assert_eq!(cfg.sessions.max_sessions_per_user, 10);
        match cfg.storage {
            StorageConfig::Sqlite { path } => assert_eq!(path, "/tmp/custom.db"),
            _ => panic!("expected sqlite backend"),
        }
    }

    #[test]
    fn load_without_file_uses_defaults() {
        std::env::set_var("AGENT_GATEWAY_CONFIG", "/nonexistent/path/config.toml");
        let (cfg, _path) = Config::load().unwrap();
        assert!(matches!(cfg.storage, StorageConfig::Memory));
        std::env::remove_var("AGENT_GATEWAY_CONFIG");
    }

    #[test]
    fn env_override_wins_over_file_value() {
        let mut cfg = Config {
            sessions: SessionsConfig {
                max_sessions: 10,
                ..Config::default().sessions
            },
            ..Config::default()
        };
        std::env::set_var("AGENT_GATEWAY_MAX_SESSIONS", "42");
        apply_env_overrides(&mut cfg).unwrap();
        std::env::remove_var("AGENT_GATEWAY_MAX_SESSIONS");
        assert_eq!(cfg.sessions.max_sessions, 42);
    }

    #[test]
    fn env_storage_override_switches_backend() {
        let mut cfg = Config::default();
        std::env::set_var("AGENT_GATEWAY_STORAGE", "sqlite");
        std::env::set_var("AGENT_GATEWAY_SQLITE_PATH", "/tmp/from-env.db");
        apply_env_overrides(&mut cfg).unwrap();
        std::env::remove_var("AGENT_GATEWAY_STORAGE");
        std::env::remove_var("AGENT_GATEWAY_SQLITE_PATH");
        match cfg.storage {
            StorageConfig::Sqlite { path } => assert_eq!(path, "/tmp/from-env.db"),
            _ => panic!("expected sqlite backend"),
        }
    }
}
