//! Per-session concurrency control.
//!
//! Deliberately stricter than a queueing `Semaphore(1)`: chat requests
//! must not block on each other for the same session, so `acquire` only
//! ever takes the uncontended fast path. A session with a turn already
//! in flight fails immediately with [`SessionBusy`] — there is no queue
//! of depth one to wait in.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

pub struct SessionLockMap {
    locks: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl Default for SessionLockMap {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionLockMap {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Try to acquire the run lock for `session_id`. Never waits: if a
    /// turn is already in flight for this session, returns
    /// `Err(SessionBusy)` immediately.
    pub fn try_acquire(&self, session_id: &str) -> Result<OwnedSemaphorePermit, SessionBusy> {
        let sem = {
            let mut locks = self.locks.lock();
            locks
                .entry(session_id.to_owned())
                .or_insert_with(|| Arc::new(Semaphore::new(1)))
                .clone()
        };

        sem.try_acquire_owned().map_err(|_| SessionBusy)
    }

    /// Drop the tracked lock for a session. Call on eviction/close —
    /// holding a stale entry around only wastes memory since `acquire`
    /// lazily recreates it.
    pub fn remove(&self, session_id: &str) {
        self.locks.lock().remove(session_id);
    }

    #[cfg(test)]
    fn session_count(&self) -> usize {
        self.locks.lock().len()
    }

    /// Drop lock entries with no turn in flight (idle housekeeping,
    /// called by the background maintainer).
    pub fn prune_idle(&self) {
        let mut locks = self.locks.lock();
        locks.retain(|_, sem| sem.available_permits() == 0);
    }
}

#[derive(Debug)]
pub struct SessionBusy;

impl std::fmt::Display for SessionBusy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session is busy — a turn is already in progress")
    }
}

impl std::error::Error for SessionBusy {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequential_access_succeeds() {
        let map = SessionLockMap::new();
        let permit1 = map.try_acquire("s1").unwrap();
        drop(permit1);
        let permit2 = map.try_acquire("s1").unwrap();
        drop(permit2);
    }

    #[test]
    fn different_sessions_concurrent() {
        let map = SessionLockMap::new();
        let p1 = map.try_acquire("s1").unwrap();
        let p2 = map.try_acquire("s2").unwrap();
        assert_eq!(map.session_count(), 2);
        drop(p1);
        drop(p2);
    }

    #[test]
    fn contended_session_fails_fast_instead_of_queueing() {
        let map = SessionLockMap::new();
        let _held = map.try_acquire("s1").unwrap();
        let err = map.try_acquire("s1");
        assert!(err.is_err());
    }

    #[test]
    fn released_lock_can_be_reacquired() {
        let map = SessionLockMap::new();
        {
            let _p = map.try_acquire("s1").unwrap();
            assert!(map.try_acquire("s1").is_err());
        }
        assert!(map.try_acquire("s1").is_ok());
    }

    #[test]
    fn prune_idle_drops_unheld_locks_only() {
        let map = SessionLockMap::new();
        let held = map.try_acquire("busy").unwrap();
        drop(map.try_acquire("idle").unwrap());
        map.prune_idle();
        assert_eq!(map.session_count(), 1);
        drop(held);
    }
}
