//! `agent-gateway` — binary entry point.
//!
//! Dispatches the CLI surface defined in [`cli`], then either boots the
//! server (`serve`, the default) or runs a one-shot diagnostic/config
//! command.

use std::sync::Arc;

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use clap::Parser;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing_subscriber::EnvFilter;

use ag_domain::config::{Config, ConfigSeverity, LogFormat};
use ag_gateway::cli::{Cli, Command, ConfigCommand};
use ag_gateway::session_manager::SessionManager;
use ag_gateway::{api, bootstrap, maintainer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        None | Some(Command::Serve) => {
            let (config, _path) = Config::load()?;
            init_tracing(config.server.log_format);
            run_server(Arc::new(config)).await
        }
        Some(Command::Doctor) => {
            let (config, config_path) = Config::load()?;
            let passed = run_doctor(&config, &config_path);
            if !passed {
                std::process::exit(1);
            }
            Ok(())
        }
        Some(Command::Config(ConfigCommand::Validate)) => {
            let (config, config_path) = Config::load()?;
            let issues = config.validate();
            for issue in &issues {
                match issue.severity {
                    ConfigSeverity::Warning => println!("warning: {issue}"),
                    ConfigSeverity::Error => println!("error: {issue}"),
                }
            }
            let errors = issues
                .iter()
                .filter(|i| i.severity == ConfigSeverity::Error)
                .count();
            if errors > 0 {
                println!("{config_path}: {errors} error(s)");
                std::process::exit(1);
            }
            println!("{config_path}: ok ({} warning(s))", issues.len());
            Ok(())
        }
        Some(Command::Config(ConfigCommand::Show)) => {
            let (config, _path) = Config::load()?;
            println!(
                "{}",
                toml::to_string_pretty(&config).context("serializing resolved config")?
            );
            Ok(())
        }
        Some(Command::Version) => {
            println!("agent-gateway {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,ag_gateway=debug"));
    match format {
        LogFormat::Json => tracing_subscriber::fmt().with_env_filter(filter).json().init(),
        LogFormat::Pretty => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

/// Checks a real run would otherwise only discover at request time: is
/// the config well-formed, does the session base dir exist (or can it be
/// created), is the agent binary on `PATH`.
fn run_doctor(config: &Config, config_path: &str) -> bool {
    let mut passed = true;

    println!("agent-gateway doctor — {config_path}");

    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => println!("  [warn]  {issue}"),
            ConfigSeverity::Error => {
                println!("  [fail]  {issue}");
                passed = false;
            }
        }
    }
    if issues.is_empty() {
        println!("  [ok]    config");
    }

    let base_dir = std::path::Path::new(&config.sessions.base_dir);
    if base_dir.is_dir() {
        println!("  [ok]    sessions.base_dir exists ({})", base_dir.display());
    } else if config.sessions.auto_create_dir {
        println!(
            "  [ok]    sessions.base_dir does not exist yet, will be created ({})",
            base_dir.display()
        );
    } else {
        println!(
            "  [fail]  sessions.base_dir missing and auto_create_dir is false ({})",
            base_dir.display()
        );
        passed = false;
    }

    let agent_bin = std::env::var("AGENT_GATEWAY_AGENT_BIN").unwrap_or_else(|_| "claude-code".into());
    match which_on_path(&agent_bin) {
        Some(path) => println!("  [ok]    agent binary {agent_bin:?} found at {}", path.display()),
        None => {
            println!("  [fail]  agent binary {agent_bin:?} not found on $PATH");
            passed = false;
        }
    }

    passed
}

fn which_on_path(program: &str) -> Option<std::path::PathBuf> {
    if program.contains(std::path::MAIN_SEPARATOR) {
        let p = std::path::PathBuf::from(program);
        return p.is_file().then_some(p);
    }
    std::env::var_os("PATH").and_then(|paths| {
        std::env::split_paths(&paths)
            .map(|dir| dir.join(program))
            .find(|candidate| candidate.is_file())
    })
}

async fn run_server(config: Arc<Config>) -> anyhow::Result<()> {
    tracing::info!("agent gateway starting");

    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
        anyhow::bail!(
            "config validation failed with {} error(s)",
            issues.iter().filter(|i| i.severity == ConfigSeverity::Error).count()
        );
    }

    let storage_label = state_storage_label(&config);
    let state = bootstrap::build_app_state(config.clone()).await?;
    let sessions = state.sessions.clone();

    maintainer::spawn(sessions.clone(), config.sessions.clone());
    tracing::info!(
        tick_secs = config.sessions.maintainer_tick_secs,
        "background maintainer started"
    );

    let cors_layer = build_cors_layer(&config.server.cors);

    let app = api::router::build_router(state)
        .layer(cors_layer)
        .layer(tower_http::trace::TraceLayer::new_for_http());

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;

    tracing::info!(addr = %addr, storage = storage_label, "agent gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(sessions))
        .await
        .context("axum server error")?;

    Ok(())
}

fn state_storage_label(config: &Config) -> &'static str {
    match &config.storage {
        ag_domain::config::StorageConfig::Memory => "memory",
        ag_domain::config::StorageConfig::Sqlite { .. } => "sqlite",
        ag_domain::config::StorageConfig::Postgresql { .. } => "postgresql",
    }
}

/// Waits for SIGINT/SIGTERM, then drains every live agent subprocess
/// before axum finishes shutting down — so in-flight turns get a chance
/// to persist bookkeeping rather than being killed outright.
async fn shutdown_signal(sessions: Arc<SessionManager>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    tracing::info!("shutdown signal received, closing live sessions");
    sessions.close_all_live().await;
}

/// Builds a [`CorsLayer`] from the configured allowed origins. A literal
/// `"*"` allows all origins; anything else must parse as an exact
/// `Origin` header value.
fn build_cors_layer(cors: &ag_domain::config::CorsConfig) -> CorsLayer {
    use axum::http::header;

    if cors.allowed_origins.len() == 1 && cors.allowed_origins[0] == "*" {
        tracing::warn!("CORS configured with wildcard \"*\" — all origins allowed");
        return CorsLayer::new()
            .allow_origin(tower_http::cors::Any)
            .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
            .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);
    }

    let mut exact: Vec<HeaderValue> = Vec::new();
    for origin in &cors.allowed_origins {
        match origin.parse::<HeaderValue>() {
            Ok(hv) => exact.push(hv),
            Err(_) => tracing::warn!(origin = %origin, "invalid CORS origin, skipping"),
        }
    }

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(exact))
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .allow_credentials(true)
}
