//! In-process, non-durable backend. Single source of truth lives in the
//! calling process; restarting it loses all session metadata.

use std::collections::HashMap;

use ag_domain::error::{Error, Result};
use ag_domain::session::{Session, SessionFilter};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;

use crate::MetadataStore;

#[derive(Default)]
pub struct MemoryStore {
    sessions: RwLock<HashMap<String, Session>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetadataStore for MemoryStore {
    async fn save(&self, session: &Session) -> Result<()> {
        self.sessions
            .write()
            .insert(session.session_id.clone(), session.clone());
        Ok(())
    }

    async fn get(&self, session_id: &str) -> Result<Option<Session>> {
        Ok(self.sessions.read().get(session_id).cloned())
    }

    async fn delete(&self, session_id: &str) -> Result<()> {
        self.sessions.write().remove(session_id);
        Ok(())
    }

    async fn touch(&self, session_id: &str, now: DateTime<Utc>) -> Result<()> {
        let mut sessions = self.sessions.write();
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| Error::NotFound(format!("session {session_id}")))?;
        session.last_active_at = now;
        session.message_count += 1;
        Ok(())
    }

    async fn list(&self, filter: &SessionFilter) -> Result<Vec<Session>> {
        let sessions = self.sessions.read();
        Ok(sessions
            .values()
            .filter(|s| match &filter.user_id {
                Some(uid) => &s.user_id == uid,
                None => true,
            })
            .cloned()
            .collect())
    }

    async fn sweep_expired(&self, now: DateTime<Utc>, ttl: Duration) -> Result<Vec<String>> {
        if ttl.is_zero() {
            return Ok(Vec::new());
        }
        let mut sessions = self.sessions.write();
        let expired: Vec<String> = sessions
            .values()
            .filter(|s| s.is_expired(now, ttl))
            .map(|s| s.session_id.clone())
            .collect();
        for id in &expired {
            sessions.remove(id);
        }
        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MemoryStore {
        MemoryStore::new()
    }

    #[tokio::test]
    async fn save_and_get_roundtrip() {
        let s = store();
        let session = Session::new("alice", "/data/alice");
        s.save(&session).await.unwrap();
        let got = s.get(&session.session_id).await.unwrap().unwrap();
        assert_eq!(got.user_id, "alice");
    }

    #[tokio::test]
    async fn get_missing_returns_none() {
        let s = store();
        assert!(s.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn touch_bumps_activity_and_count() {
        let s = store();
        let session = Session::new("bob", "/data/bob");
        s.save(&session).await.unwrap();
        let later = session.last_active_at + Duration::seconds(60);
        s.touch(&session.session_id, later).await.unwrap();
        let got = s.get(&session.session_id).await.unwrap().unwrap();
        assert_eq!(got.last_active_at, later);
        assert_eq!(got.message_count, 1);
    }

    #[tokio::test]
    async fn touch_missing_is_not_found() {
        let s = store();
        let err = s.touch("missing", Utc::now()).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn list_filters_by_user() {
        let s = store();
        s.save(&Session::new("alice", "/a")).await.unwrap();
        s.save(&Session::new("bob", "/b")).await.unwrap();
        let filtered = s
            .list(&SessionFilter {
                user_id: Some("alice".into()),
            })
            .await
            .unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].user_id, "alice");
    }

    #[tokio::test]
    async fn sweep_expired_removes_stale_sessions() {
        let s = store();
        let mut stale = Session::new("carol", "/c");
        stale.last_active_at = Utc::now() - Duration::hours(2);
        s.save(&stale).await.unwrap();
        let fresh = Session::new("dave", "/d");
        s.save(&fresh).await.unwrap();

        let removed = s.sweep_expired(Utc::now(), Duration::seconds(3600)).await.unwrap();
        assert_eq!(removed, vec![stale.session_id.clone()]);
        assert!(s.get(&stale.session_id).await.unwrap().is_none());
        assert!(s.get(&fresh.session_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn sweep_expired_noop_when_ttl_zero() {
        let s = store();
        let mut stale = Session::new("erin", "/e");
        stale.last_active_at = Utc::now() - Duration::hours(10);
        s.save(&stale).await.unwrap();
        let removed = s.sweep_expired(Utc::now(), Duration::zero()).await.unwrap();
        assert!(removed.is_empty());
    }
}
