//! Background Maintainer — periodic TTL sweep, idle eviction, and
//! RSS-pressure recovery. Runs on its own tick, independent of request
//! traffic.

use std::sync::Arc;
use std::time::Duration;

use ag_domain::config::SessionsConfig;

use crate::session_manager::SessionManager;

pub fn spawn(sessions: Arc<SessionManager>, config: SessionsConfig) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(config.maintainer_tick_secs));
        loop {
            interval.tick().await;
            run_tick(&sessions, &config).await;
        }
    })
}

async fn run_tick(sessions: &SessionManager, config: &SessionsConfig) {
    match sessions.sweep_expired(config.ttl_secs).await {
        Ok(removed) if !removed.is_empty() => {
            tracing::info!(count = removed.len(), "swept expired sessions");
        }
        Ok(_) => {}
        Err(e) => tracing::warn!(error = %e, "ttl sweep failed"),
    }

    let idle = sessions.evict_idle(config.idle_session_timeout_secs).await;
    if !idle.is_empty() {
        tracing::info!(count = idle.len(), "evicted idle live clients");
    }

    sessions.prune_session_locks();

    if config.memory_limit_mb > 0 {
        let rss = sessions.estimate_fleet_rss_mb();
        if rss > config.memory_limit_mb {
            tracing::warn!(
                rss_mb = rss,
                budget_mb = config.memory_limit_mb,
                "fleet RSS over budget, recovering"
            );
            let evicted = sessions.recover_pressure().await;
            tracing::info!(count = evicted.len(), "evicted sessions under memory pressure");
        }
    }
}
