//! The Session Manager — owns the live set of Agent Clients, enforces
//! per-session serialization, admission control, and LRU eviction.
//!
//! Generalizes the map-lock / per-entry-lock split the gateway uses
//! elsewhere for runs and schedules: `clients_lock` guards only the map's
//! structure and is never held across subprocess I/O; `session_locks`
//! linearizes turns within one session.

use std::collections::HashMap;
use std::sync::Arc;

use ag_client::{AgentClient, AgentEventStream, AgentOptions, ResumeToken};
use ag_domain::config::{AgentDefaultsConfig, SessionsConfig};
use ag_domain::error::{Error, Result};
use ag_domain::path_guard;
use ag_domain::session::{Session, SessionFilter};
use ag_store::MetadataStore;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::session_lock::{SessionBusy, SessionLockMap};

/// Information about a session returned to HTTP callers. Distinct from
/// `ag_domain::session::Session` only in that it never carries a live
/// subprocess handle — it is always safe to serialize.
pub type SessionInfo = Session;

struct LiveClients {
    clients: HashMap<String, Arc<AgentClient>>,
    per_user_counts: HashMap<String, usize>,
    /// Slots claimed by an in-progress `create`/`resume` that hasn't
    /// installed its client yet — counted alongside `clients`/
    /// `per_user_counts` so a concurrent admission check sees them.
    reserved_fleet: usize,
    reserved_per_user: HashMap<String, usize>,
}

/// An admission slot reserved under `clients_lock`, atomically with the
/// cap check that granted it. Must be resolved exactly once: either
/// folded into the real counts by `commit_reservation_locked` as part of
/// the same locked block that inserts the client, or rolled back by
/// `release_reservation` on any failure before that insert happens.
struct ReservedSlot {
    user_id: String,
}

enum ReserveAttempt {
    Reserved(ReservedSlot),
    UserCapExceeded,
    FleetCapExceeded,
}

pub struct SessionManager {
    store: Arc<dyn MetadataStore>,
    config: SessionsConfig,
    agent_defaults: AgentDefaultsConfig,
    agent_program: String,
    agent_env: HashMap<String, String>,
    live: Mutex<LiveClients>,
    session_locks: SessionLockMap,
    in_flight: Arc<Semaphore>,
}

pub struct ChatOutcome {
    pub session_id: String,
    pub stream: AgentEventStream,
    /// Held for the duration of the stream; releasing it (on drop) frees
    /// both the session lock and the fleet-wide concurrency permit.
    pub _permit: ChatPermit,
}

/// Bundles the per-session lock and the fleet-wide `in_flight` permit so
/// both release together when a turn's stream is dropped or exhausted.
pub struct ChatPermit {
    _session: OwnedSemaphorePermit,
    _fleet: OwnedSemaphorePermit,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        config: SessionsConfig,
        agent_defaults: AgentDefaultsConfig,
        agent_program: String,
        agent_env: HashMap<String, String>,
    ) -> Self {
        let in_flight = Arc::new(Semaphore::new(config.max_concurrent_requests));
        Self {
            store,
            config,
            agent_defaults,
            agent_program,
            agent_env,
            live: Mutex::new(LiveClients {
                clients: HashMap::new(),
                per_user_counts: HashMap::new(),
                reserved_fleet: 0,
                reserved_per_user: HashMap::new(),
            }),
            session_locks: SessionLockMap::new(),
            in_flight,
        }
    }

    pub fn live_client_count(&self) -> usize {
        self.live.lock().clients.len()
    }

    /// Create a new session: validate the working directory, admit it
    /// under the fleet caps, spawn its subprocess, and persist its
    /// metadata. Any failure after the subprocess is spawned unwinds by
    /// closing it — no leaked subprocess on a failed create.
    pub async fn create(
        &self,
        user_id: &str,
        subdir: Option<&str>,
        metadata: std::collections::HashMap<String, serde_json::Value>,
    ) -> Result<SessionInfo> {
        let cwd = path_guard::resolve_cwd(
            std::path::Path::new(&self.config.base_dir),
            user_id,
            subdir,
            self.config.auto_create_dir,
        )?;
        let cwd_str = cwd
            .to_str()
            .ok_or_else(|| Error::InvalidInput("cwd is not valid UTF-8".into()))?
            .to_string();

        let reservation = self.reserve_admission(user_id).await?;

        let options = AgentOptions::from_defaults(&self.agent_defaults, Vec::new(), None);
        let client = match AgentClient::spawn(
            &self.agent_program,
            &cwd_str,
            &self.agent_env,
            &options,
            std::time::Duration::from_secs(self.agent_defaults.turn_timeout_secs),
        ) {
            Ok(client) => Arc::new(client),
            Err(e) => {
                self.release_reservation(&reservation);
                return Err(e);
            }
        };

        let mut session = Session::new(user_id, cwd_str);
        session.metadata = metadata;

        if let Err(e) = self.store.save(&session).await {
            let _ = client.close().await;
            self.release_reservation(&reservation);
            return Err(e);
        }

        {
            let mut live = self.live.lock();
            Self::commit_reservation_locked(&mut live, &reservation);
            live.clients
                .insert(session.session_id.clone(), client.clone());
            *live.per_user_counts.entry(user_id.to_string()).or_insert(0) += 1;
        }

        Ok(session)
    }

    /// Claims one admission slot, atomically with the cap check that
    /// grants it — so two concurrent `create`/`resume` calls for the same
    /// user (or two at the fleet cap) can't both observe room and both
    /// install. On a fleet-cap miss, tries LRU pressure recovery once and
    /// retries the reservation before giving up.
    async fn reserve_admission(&self, user_id: &str) -> Result<ReservedSlot> {
        match self.try_reserve(user_id) {
            ReserveAttempt::Reserved(slot) => return self.check_memory_budget(slot).await,
            ReserveAttempt::UserCapExceeded => return Err(self.user_cap_error(user_id)),
            ReserveAttempt::FleetCapExceeded => {}
        }

        self.recover_pressure_for_admission().await;

        match self.try_reserve(user_id) {
            ReserveAttempt::Reserved(slot) => self.check_memory_budget(slot).await,
            ReserveAttempt::UserCapExceeded => Err(self.user_cap_error(user_id)),
            ReserveAttempt::FleetCapExceeded => Err(Error::Overloaded(format!(
                "fleet is at its {} session cap",
                self.config.max_sessions
            ))),
        }
    }

    /// Checks both caps and, if there's room, reserves the slot — all
    /// under one `clients_lock` acquisition, so nothing can slip in
    /// between the check and the reservation.
    fn try_reserve(&self, user_id: &str) -> ReserveAttempt {
        let mut live = self.live.lock();
        let user_count = live.per_user_counts.get(user_id).copied().unwrap_or(0)
            + live.reserved_per_user.get(user_id).copied().unwrap_or(0);
        if user_count >= self.config.max_sessions_per_user {
            return ReserveAttempt::UserCapExceeded;
        }
        if live.clients.len() + live.reserved_fleet >= self.config.max_sessions {
            return ReserveAttempt::FleetCapExceeded;
        }
        live.reserved_fleet += 1;
        *live.reserved_per_user.entry(user_id.to_string()).or_insert(0) += 1;
        ReserveAttempt::Reserved(ReservedSlot {
            user_id: user_id.to_string(),
        })
    }

    fn user_cap_error(&self, user_id: &str) -> Error {
        Error::QuotaExceeded(format!(
            "user {user_id} already has {} live sessions",
            self.config.max_sessions_per_user
        ))
    }

    async fn check_memory_budget(&self, slot: ReservedSlot) -> Result<ReservedSlot> {
        if self.config.memory_limit_mb == 0 {
            return Ok(slot);
        }
        let rss = self.estimate_fleet_rss_mb();
        if rss <= self.config.memory_limit_mb {
            return Ok(slot);
        }
        self.recover_pressure_to_threshold(self.config.memory_limit_mb)
            .await;
        if self.estimate_fleet_rss_mb() > self.config.memory_limit_mb {
            self.release_reservation(&slot);
            return Err(Error::Overloaded(format!(
                "fleet RSS {rss}MB exceeds the {}MB budget",
                self.config.memory_limit_mb
            )));
        }
        Ok(slot)
    }

    /// Folds a reservation into the real counts. Must be called inside
    /// the same locked block that inserts the client into `clients`.
    fn commit_reservation_locked(live: &mut LiveClients, slot: &ReservedSlot) {
        live.reserved_fleet = live.reserved_fleet.saturating_sub(1);
        if let Some(count) = live.reserved_per_user.get_mut(&slot.user_id) {
            *count = count.saturating_sub(1);
        }
    }

    /// Rolls back a reservation that never became a live client (spawn
    /// failure, store failure, or losing a concurrent-resume race).
    fn release_reservation(&self, slot: &ReservedSlot) {
        let mut live = self.live.lock();
        Self::commit_reservation_locked(&mut live, slot);
    }

    pub fn estimate_fleet_rss_mb(&self) -> u64 {
        self.live.lock().clients.values().map(|c| c.rss_mb()).sum()
    }

    /// LRU pressure recovery: evict live clients in ascending `last_used`
    /// order. Used both when admission hits the fleet cap and when the
    /// maintainer samples RSS above the budget.
    async fn recover_pressure_for_admission(&self) {
        self.evict_one_lru().await;
    }

    async fn recover_pressure_to_threshold(&self, threshold_mb: u64) {
        loop {
            if self.estimate_fleet_rss_mb() <= threshold_mb {
                return;
            }
            if !self.evict_one_lru().await {
                return;
            }
        }
    }

    async fn evict_one_lru(&self) -> bool {
        let victim = {
            let live = self.live.lock();
            live.clients
                .iter()
                .min_by_key(|(_, c)| c.last_used_millis())
                .map(|(id, _)| id.clone())
        };
        match victim {
            Some(id) => {
                let _ = self.evict_live_only(&id).await;
                true
            }
            None => false,
        }
    }

    /// Remove a client from the live set and close its subprocess, but
    /// leave its metadata record in the store (resumable later).
    async fn evict_live_only(&self, session_id: &str) -> Result<()> {
        let client = self.live.lock().clients.remove(session_id);
        if let Some(client) = client {
            client.close().await?;
            self.session_locks.remove(session_id);
            self.decrement_user_count_for(session_id).await;
        }
        Ok(())
    }

    async fn decrement_user_count_for(&self, session_id: &str) {
        if let Ok(Some(session)) = self.store.get(session_id).await {
            let mut live = self.live.lock();
            if let Some(count) = live.per_user_counts.get_mut(&session.user_id) {
                *count = count.saturating_sub(1);
            }
        }
    }

    /// Run one chat turn. Acquires the per-session lock (reject-fast) and
    /// one fleet-wide concurrency permit before looking up or resuming
    /// the live client.
    pub async fn chat(&self, session_id: &str, prompt: &str) -> Result<ChatOutcome> {
        let session_permit = self
            .session_locks
            .try_acquire(session_id)
            .map_err(|SessionBusy| Error::SessionBusy(session_id.to_string()))?;

        let fleet_permit = self.in_flight.clone().try_acquire_owned().map_err(|_| {
            Error::Overloaded("max_concurrent_requests fleet-wide cap reached".into())
        })?;

        let client = match self.live_client(session_id) {
            Some(client) => client,
            None => self.resume(session_id).await?,
        };

        let stream = client.ask(prompt).await?;

        Ok(ChatOutcome {
            session_id: session_id.to_string(),
            stream,
            _permit: ChatPermit {
                _session: session_permit,
                _fleet: fleet_permit,
            },
        })
    }

    /// Persist the bookkeeping side-effects of a completed turn:
    /// `message_count += 1`, `last_active_at = now`.
    pub async fn record_turn_completed(&self, session_id: &str) -> Result<()> {
        self.store.touch(session_id, Utc::now()).await
    }

    fn live_client(&self, session_id: &str) -> Option<Arc<AgentClient>> {
        self.live.lock().clients.get(session_id).cloned()
    }

    /// Recreate a live client for a session whose metadata still exists.
    /// The subprocess is seeded with the stored resume token so it
    /// restores its own on-disk conversation log.
    async fn resume(&self, session_id: &str) -> Result<Arc<AgentClient>> {
        let session = self
            .store
            .get(session_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("session {session_id}")))?;

        if matches!(session.status, ag_domain::session::SessionStatus::Closed) {
            return Err(Error::NotFound(format!("session {session_id} is closed")));
        }

        // A concurrent resume of the same id may have already completed
        // by the time we get here; if so, use it instead of spawning a
        // second subprocess for one session.
        if let Some(client) = self.live_client(session_id) {
            return Ok(client);
        }

        let reservation = self.reserve_admission(&session.user_id).await?;

        // Another resume of this same id may have won the race while we
        // were reserving a slot; if so, give ours back and use theirs.
        if let Some(client) = self.live_client(session_id) {
            self.release_reservation(&reservation);
            return Ok(client);
        }

        let options = AgentOptions::from_defaults(
            &self.agent_defaults,
            Vec::new(),
            Some(ResumeToken(session_id.to_string())),
        );
        let client = match AgentClient::spawn(
            &self.agent_program,
            &session.cwd,
            &self.agent_env,
            &options,
            std::time::Duration::from_secs(self.agent_defaults.turn_timeout_secs),
        ) {
            Ok(client) => Arc::new(client),
            Err(e) => {
                self.release_reservation(&reservation);
                return Err(e);
            }
        };

        // Re-check under the lock that installs: another resume may have
        // won between the check above and here. Scoped to a block so the
        // guard never spans the `.await` below.
        let winner = {
            let mut live = self.live.lock();
            if let Some(existing) = live.clients.get(session_id) {
                Some(existing.clone())
            } else {
                Self::commit_reservation_locked(&mut live, &reservation);
                live.clients.insert(session_id.to_string(), client.clone());
                *live
                    .per_user_counts
                    .entry(session.user_id.clone())
                    .or_insert(0) += 1;
                None
            }
        };

        if let Some(winner) = winner {
            self.release_reservation(&reservation);
            let _ = client.close().await;
            return Ok(winner);
        }

        Ok(client)
    }

    /// Remove a client from the live set, close its subprocess, and
    /// delete its metadata record entirely. Idempotent: closing a
    /// session that is already closed returns `NotFound`.
    pub async fn close(&self, session_id: &str) -> Result<()> {
        let session = self
            .store
            .get(session_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("session {session_id}")))?;

        let client = self.live.lock().clients.remove(session_id);
        if let Some(client) = client {
            client.close().await?;
        }
        self.session_locks.remove(session_id);

        {
            let mut live = self.live.lock();
            if let Some(count) = live.per_user_counts.get_mut(&session.user_id) {
                *count = count.saturating_sub(1);
            }
        }

        self.store.delete(session_id).await
    }

    /// Eagerly spawn a live client for a session that currently has
    /// none, instead of waiting for the next chat turn to do it lazily.
    pub async fn resume_eager(&self, session_id: &str) -> Result<SessionInfo> {
        self.resume(session_id).await?;
        self.get(session_id).await
    }

    pub async fn get(&self, session_id: &str) -> Result<SessionInfo> {
        self.store
            .get(session_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("session {session_id}")))
    }

    pub async fn list(&self, user_id: Option<&str>) -> Result<Vec<SessionInfo>> {
        self.store
            .list(&SessionFilter {
                user_id: user_id.map(|s| s.to_string()),
            })
            .await
    }

    /// Called by the Background Maintainer. Drops per-session lock
    /// entries with no turn in flight — `session_locks` lazily recreates
    /// them on next use, so this is pure memory housekeeping.
    pub fn prune_session_locks(&self) {
        self.session_locks.prune_idle();
    }

    /// Called by the Background Maintainer. Removes expired metadata,
    /// closing any live client for an id that was removed.
    pub async fn sweep_expired(&self, ttl_secs: u64) -> Result<Vec<String>> {
        if ttl_secs == 0 {
            return Ok(Vec::new());
        }
        let removed = self
            .store
            .sweep_expired(Utc::now(), chrono::Duration::seconds(ttl_secs as i64))
            .await?;
        for id in &removed {
            let client = self.live.lock().clients.remove(id);
            if let Some(client) = client {
                let _ = client.close().await;
                self.session_locks.remove(id);
            }
        }
        Ok(removed)
    }

    /// Called by the Background Maintainer. Evicts (closes, metadata
    /// retained) any live client idle longer than `idle_timeout_secs`.
    pub async fn evict_idle(&self, idle_timeout_secs: u64) -> Vec<String> {
        if idle_timeout_secs == 0 {
            return Vec::new();
        }
        let now_ms = Utc::now().timestamp_millis();
        let idle_ms = (idle_timeout_secs as i64) * 1000;

        let idle_ids: Vec<String> = {
            let live = self.live.lock();
            live.clients
                .iter()
                .filter(|(_, c)| now_ms - c.last_used_millis() > idle_ms)
                .map(|(id, _)| id.clone())
                .collect()
        };

        for id in &idle_ids {
            let _ = self.evict_live_only(id).await;
        }
        idle_ids
    }

    /// Called by the Background Maintainer when fleet RSS exceeds the
    /// budget. Evicts in ascending `last_used` order until under budget
    /// or the fleet is empty.
    pub async fn recover_pressure(&self) -> Vec<String> {
        if self.config.memory_limit_mb == 0 {
            return Vec::new();
        }
        let mut evicted = Vec::new();
        while self.estimate_fleet_rss_mb() > self.config.memory_limit_mb {
            let victim = {
                let live = self.live.lock();
                live.clients
                    .iter()
                    .min_by_key(|(_, c)| c.last_used_millis())
                    .map(|(id, _)| id.clone())
            };
            match victim {
                Some(id) => {
                    let _ = self.evict_live_only(&id).await;
                    evicted.push(id);
                }
                None => break,
            }
        }
        evicted
    }

    /// Close every live client in parallel, with a bounded grace window
    /// per client (enforced inside `AgentClient::close`). Used on
    /// process shutdown.
    pub async fn close_all_live(&self) {
        let clients: Vec<Arc<AgentClient>> = {
            let live = self.live.lock();
            live.clients.values().cloned().collect()
        };
        let closes = clients.iter().map(|c| c.close());
        futures_util::future::join_all(closes).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ag_domain::config::AgentDefaultsConfig;
    use ag_store::MemoryStore;

    /// A stand-in "agent" that echoes one `text_delta` then `done` per
    /// line of stdin — see `ag_client::process::tests::echo_script` for
    /// the original of this fixture.
    fn echo_script() -> (tempfile::TempDir, String) {
        let dir = tempfile::tempdir().unwrap();
        let script_path = dir.path().join("fake_agent.sh");
        std::fs::write(
            &script_path,
            "#!/bin/sh\nwhile IFS= read -r line; do\n  echo '{\"type\":\"text_delta\",\"text\":\"echo\"}'\n  echo '{\"type\":\"done\"}'\ndone\n",
        )
        .unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script_path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        (dir, script_path.to_str().unwrap().to_string())
    }

    fn sessions_config(base_dir: &std::path::Path) -> SessionsConfig {
        SessionsConfig {
            base_dir: base_dir.to_str().unwrap().to_string(),
            auto_create_dir: true,
            ttl_secs: 3600,
            max_sessions: 2,
            max_sessions_per_user: 1,
            max_concurrent_requests: 8,
            memory_limit_mb: 0,
            idle_session_timeout_secs: 1800,
            maintainer_tick_secs: 30,
        }
    }

    async fn manager_with(
        base_dir: &std::path::Path,
        config: SessionsConfig,
    ) -> (SessionManager, tempfile::TempDir, String) {
        let (script_dir, script) = echo_script();
        let store = Arc::new(MemoryStore::new());
        let manager = SessionManager::new(
            store,
            config,
            AgentDefaultsConfig::default(),
            script.clone(),
            HashMap::new(),
        );
        let _ = base_dir;
        (manager, script_dir, script)
    }

    async fn drain(outcome: ChatOutcome) {
        let ChatOutcome { mut stream, .. } = outcome;
        while let Some(event) = stream.next().await {
            if event.is_done() {
                break;
            }
        }
    }

    #[tokio::test]
    async fn chat_bumps_message_count_on_completion() {
        let tmp = tempfile::tempdir().unwrap();
        let (manager, _script_dir, _script) =
            manager_with(tmp.path(), sessions_config(tmp.path())).await;

        let session = manager.create("alice", None, HashMap::new()).await.unwrap();
        let outcome = manager.chat(&session.session_id, "hi").await.unwrap();
        drain(outcome).await;
        manager
            .record_turn_completed(&session.session_id)
            .await
            .unwrap();

        let info = manager.get(&session.session_id).await.unwrap();
        assert_eq!(info.message_count, 1);
    }

    #[tokio::test]
    async fn concurrent_chat_on_same_session_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let (manager, _script_dir, _script) =
            manager_with(tmp.path(), sessions_config(tmp.path())).await;

        let session = manager.create("alice", None, HashMap::new()).await.unwrap();
        let first = manager.chat(&session.session_id, "hi").await.unwrap();
        let second = manager.chat(&session.session_id, "again").await;

        assert!(matches!(second, Err(Error::SessionBusy(_))));
        drain(first).await;
    }

    #[tokio::test]
    async fn max_sessions_per_user_rejects_over_quota() {
        let tmp = tempfile::tempdir().unwrap();
        let (manager, _script_dir, _script) =
            manager_with(tmp.path(), sessions_config(tmp.path())).await;

        manager.create("alice", None, HashMap::new()).await.unwrap();
        let second = manager.create("alice", Some("other"), HashMap::new()).await;

        assert!(matches!(second, Err(Error::QuotaExceeded(_))));
    }

    #[tokio::test]
    async fn max_sessions_fleet_cap_rejects_when_no_eviction_helps() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = sessions_config(tmp.path());
        config.max_sessions = 1;
        config.max_sessions_per_user = 10;
        let (manager, _script_dir, _script) = manager_with(tmp.path(), config).await;

        manager.create("alice", None, HashMap::new()).await.unwrap();
        // The fleet is at cap; LRU eviction kicks the first session out
        // to admit the second rather than rejecting outright — so the
        // create succeeds but the first session's live client is gone.
        let second = manager.create("bob", None, HashMap::new()).await.unwrap();

        assert_eq!(manager.live_client_count(), 1);
        let _ = manager.close(&second.session_id).await;
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let (manager, _script_dir, _script) =
            manager_with(tmp.path(), sessions_config(tmp.path())).await;

        let session = manager.create("alice", None, HashMap::new()).await.unwrap();
        manager.close(&session.session_id).await.unwrap();

        let second = manager.close(&session.session_id).await;
        assert!(matches!(second, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn resume_after_eviction_spawns_a_fresh_client() {
        let tmp = tempfile::tempdir().unwrap();
        let (manager, _script_dir, _script) =
            manager_with(tmp.path(), sessions_config(tmp.path())).await;

        let session = manager.create("alice", None, HashMap::new()).await.unwrap();
        manager.evict_live_only(&session.session_id).await.unwrap();
        assert_eq!(manager.live_client_count(), 0);

        let info = manager.resume_eager(&session.session_id).await.unwrap();
        assert_eq!(info.session_id, session.session_id);
        assert_eq!(manager.live_client_count(), 1);
    }

    /// Two concurrent `create` calls for the same user, with a
    /// per-user cap of one, must not both install: admission has to be
    /// reserved atomically with the cap check, not just checked and
    /// registered later.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_create_for_same_user_admits_only_one() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = sessions_config(tmp.path());
        config.max_sessions_per_user = 1;
        let (manager, _script_dir, _script) = manager_with(tmp.path(), config).await;
        let manager = Arc::new(manager);

        let (m1, m2) = (manager.clone(), manager.clone());
        let (r1, r2) = tokio::join!(
            tokio::spawn(async move { m1.create("alice", Some("a"), HashMap::new()).await }),
            tokio::spawn(async move { m2.create("alice", Some("b"), HashMap::new()).await }),
        );
        let outcomes = [r1.unwrap(), r2.unwrap()];

        let ok_count = outcomes.iter().filter(|r| r.is_ok()).count();
        let quota_count = outcomes
            .iter()
            .filter(|r| matches!(r, Err(Error::QuotaExceeded(_))))
            .count();
        assert_eq!(ok_count, 1, "exactly one create should be admitted");
        assert_eq!(quota_count, 1, "the other should see the user cap");
        assert_eq!(manager.live_client_count(), 1);
    }

    /// Same race at the fleet-wide cap instead of the per-user cap. LRU
    /// pressure recovery means both calls may legitimately return `Ok`
    /// (one evicting the other's live client after the fact), so the
    /// invariant under test is that the live set never exceeds
    /// `max_sessions` — not that exactly one call wins.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_create_at_fleet_cap_never_exceeds_the_cap() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = sessions_config(tmp.path());
        config.max_sessions = 1;
        config.max_sessions_per_user = 10;
        let (manager, _script_dir, _script) = manager_with(tmp.path(), config).await;
        let manager = Arc::new(manager);

        let (m1, m2) = (manager.clone(), manager.clone());
        let (r1, r2) = tokio::join!(
            tokio::spawn(async move { m1.create("alice", None, HashMap::new()).await }),
            tokio::spawn(async move { m2.create("bob", None, HashMap::new()).await }),
        );
        let outcomes = [r1.unwrap(), r2.unwrap()];

        assert!(outcomes.iter().any(|r| r.is_ok()), "at least one admitted");
        assert!(
            manager.live_client_count() <= 1,
            "live set must never exceed max_sessions, got {}",
            manager.live_client_count()
        );
    }
}
