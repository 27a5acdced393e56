//! Server-session tracking.
//!
//! Every session server registers a [`ServerSession`] so that issued access
//! can be listed and revoked while the process is still running. The store
//! is the single source of truth: a revoke written by another process takes
//! effect on the server's next request.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::clock;
use crate::identifiers::{self, InvalidId};
use crate::storage::{SessionStore, StoreError};

pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(12 * 3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Revoked,
    Expired,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Revoked => "revoked",
            Self::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "revoked" => Some(Self::Revoked),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }

    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        matches!(
            (self, next),
            (Self::Active, Self::Revoked) | (Self::Active, Self::Expired)
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSession {
    pub id: String,
    pub user: String,
    pub profile: String,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub last_access_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub request_count: u64,
    pub server_instance_id: String,
    pub source_identity: String,
    pub device_id: Option<String>,
    pub revoked_by: Option<String>,
    pub revoked_reason: Option<String>,
    pub version: u64,
}

impl ServerSession {
    pub fn effective_status(&self, now: DateTime<Utc>) -> SessionStatus {
        match self.status {
            SessionStatus::Active if now >= self.expires_at => SessionStatus::Expired,
            status => status,
        }
    }

    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.effective_status(now) == SessionStatus::Active
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum SessionError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    InvalidId(#[from] InvalidId),

    #[error("{0} must not be empty")]
    #[diagnostic(code(gatehouse::session::missing_field))]
    MissingField(&'static str),

    #[error("session `{0}` is already revoked")]
    #[diagnostic(code(gatehouse::session::already_revoked))]
    AlreadyRevoked(String),

    #[error("session `{id}` is {status}")]
    #[diagnostic(
        code(gatehouse::session::not_active),
        help("Start a new session server to obtain credentials again")
    )]
    NotActive { id: String, status: SessionStatus },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct NewSession {
    pub user: String,
    pub profile: String,
    pub server_instance_id: String,
    pub source_identity: String,
    pub device_id: Option<String>,
}

pub struct SessionTracker {
    store: Arc<dyn SessionStore>,
    ttl: Duration,
}

impl SessionTracker {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self {
            store,
            ttl: DEFAULT_SESSION_TTL,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub async fn create(&self, input: NewSession) -> Result<ServerSession, SessionError> {
        if input.user.trim().is_empty() {
            return Err(SessionError::MissingField("user"));
        }
        if input.profile.trim().is_empty() {
            return Err(SessionError::MissingField("profile"));
        }
        if input.server_instance_id.is_empty() {
            return Err(SessionError::MissingField("server_instance_id"));
        }

        let now = Utc::now();
        let session = ServerSession {
            id: identifiers::new_id(),
            user: input.user,
            profile: input.profile,
            status: SessionStatus::Active,
            started_at: now,
            last_access_at: now,
            expires_at: clock::add(now, self.ttl),
            updated_at: now,
            request_count: 0,
            server_instance_id: input.server_instance_id,
            source_identity: input.source_identity,
            device_id: input.device_id,
            revoked_by: None,
            revoked_reason: None,
            version: 1,
        };
        self.store.create(&session).await?;

        tracing::info!(
            session_id = %session.id,
            user = %session.user,
            profile = %session.profile,
            expires_at = %session.expires_at,
            "Server session started"
        );
        Ok(session)
    }

    pub async fn get(&self, id: &str) -> Result<ServerSession, SessionError> {
        identifiers::validate_id("session", id)?;
        let mut session = self.store.get(id).await?;
        session.status = session.effective_status(Utc::now());
        Ok(session)
    }

    /// Record one credential request against an Active session.
    pub async fn touch(&self, id: &str) -> Result<ServerSession, SessionError> {
        identifiers::validate_id("session", id)?;
        let now = Utc::now();
        match self.store.touch(id, now).await {
            Ok(session) => Ok(session),
            Err(StoreError::ConditionFailed { .. }) => {
                let session = self.store.get(id).await?;
                Err(SessionError::NotActive {
                    id: id.to_string(),
                    status: session.effective_status(now),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn revoke(
        &self,
        id: &str,
        revoked_by: &str,
        reason: &str,
    ) -> Result<ServerSession, SessionError> {
        identifiers::validate_id("session", id)?;
        if revoked_by.trim().is_empty() {
            return Err(SessionError::MissingField("revoked_by"));
        }

        let mut session = self.store.get(id).await?;
        let now = Utc::now();
        match session.effective_status(now) {
            SessionStatus::Active => {}
            SessionStatus::Revoked => return Err(SessionError::AlreadyRevoked(session.id)),
            status => {
                return Err(SessionError::NotActive {
                    id: session.id,
                    status,
                })
            }
        }

        session.status = SessionStatus::Revoked;
        session.revoked_by = Some(revoked_by.to_string());
        session.revoked_reason = Some(reason.to_string());
        session.updated_at = now;
        let session = self.store.update(&session).await?;

        tracing::warn!(session_id = %session.id, revoked_by, reason, "Server session revoked");
        Ok(session)
    }

    /// Mark a session Expired on normal shutdown. Failures are logged and
    /// otherwise ignored; read-time expiry covers a missed write.
    pub async fn end(&self, id: &str) {
        if let Err(e) = self.try_end(id).await {
            tracing::warn!(session_id = %id, error = %e, "Failed to end server session");
        }
    }

    async fn try_end(&self, id: &str) -> Result<(), SessionError> {
        identifiers::validate_id("session", id)?;
        let mut session = self.store.get(id).await?;
        if session.status != SessionStatus::Active {
            return Ok(());
        }
        let now = Utc::now();
        session.status = SessionStatus::Expired;
        session.expires_at = session.expires_at.min(now);
        session.updated_at = now;
        self.store.update(&session).await?;
        tracing::info!(session_id = %id, requests = session.request_count, "Server session ended");
        Ok(())
    }

    pub async fn find_for_instance(
        &self,
        server_instance_id: &str,
    ) -> Result<Option<ServerSession>, SessionError> {
        Ok(self
            .store
            .find_active_by_server_instance(server_instance_id, Utc::now())
            .await?)
    }

    pub async fn list_active(&self, limit: usize) -> Result<Vec<ServerSession>, SessionError> {
        let now = Utc::now();
        Ok(self
            .store
            .list_by_status(SessionStatus::Active, limit)
            .await?
            .into_iter()
            .filter(|s| s.is_active(now))
            .collect())
    }

    pub async fn list_for_user(
        &self,
        user: &str,
        limit: usize,
    ) -> Result<Vec<ServerSession>, SessionError> {
        Ok(self.with_effective_status(self.store.list_by_user(user, limit).await?))
    }

    pub async fn list_for_profile(
        &self,
        profile: &str,
        limit: usize,
    ) -> Result<Vec<ServerSession>, SessionError> {
        Ok(self.with_effective_status(self.store.list_by_profile(profile, limit).await?))
    }

    pub async fn list_for_device(
        &self,
        device_id: &str,
        limit: usize,
    ) -> Result<Vec<ServerSession>, SessionError> {
        Ok(self.with_effective_status(self.store.list_by_device_id(device_id, limit).await?))
    }

    pub async fn list_started_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ServerSession>, SessionError> {
        Ok(self.with_effective_status(self.store.list_by_time_range(start, end, limit).await?))
    }

    fn with_effective_status(&self, mut sessions: Vec<ServerSession>) -> Vec<ServerSession> {
        let now = Utc::now();
        for s in &mut sessions {
            s.status = s.effective_status(now);
        }
        sessions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn tracker() -> (SessionTracker, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (SessionTracker::new(store.clone()), store)
    }

    fn new_session() -> NewSession {
        NewSession {
            user: "alice".into(),
            profile: "production".into(),
            server_instance_id: identifiers::new_id(),
            source_identity: "gatehouse:alice:0123456789abcdef".into(),
            device_id: Some("laptop-7".into()),
        }
    }

    #[tokio::test]
    async fn test_touch_counts_requests() {
        let (tracker, _) = tracker();
        let session = tracker.create(new_session()).await.unwrap();
        assert_eq!(session.request_count, 0);

        tracker.touch(&session.id).await.unwrap();
        let touched = tracker.touch(&session.id).await.unwrap();
        assert_eq!(touched.request_count, 2);
        assert!(touched.last_access_at >= session.last_access_at);
    }

    #[tokio::test]
    async fn test_revoke_twice_fails() {
        let (tracker, _) = tracker();
        let session = tracker.create(new_session()).await.unwrap();

        let revoked = tracker.revoke(&session.id, "security", "lost laptop").await.unwrap();
        assert_eq!(revoked.status, SessionStatus::Revoked);
        assert_eq!(revoked.revoked_by.as_deref(), Some("security"));

        let err = tracker.revoke(&session.id, "security", "again").await.unwrap_err();
        assert!(matches!(err, SessionError::AlreadyRevoked(_)));

        let err = tracker.touch(&session.id).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::NotActive { status: SessionStatus::Revoked, .. }
        ));
    }

    #[tokio::test]
    async fn test_invalid_id_never_reaches_store() {
        let (tracker, _) = tracker();
        for bad in ["", "short", "0123456789ABCDEF", "0123456789abcdeg"] {
            assert!(matches!(
                tracker.get(bad).await.unwrap_err(),
                SessionError::InvalidId(_)
            ));
        }
    }

    #[tokio::test]
    async fn test_missing_session_is_not_found() {
        let (tracker, _) = tracker();
        let err = tracker.get("0123456789abcdef").await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::Store(StoreError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_end_marks_expired() {
        let (tracker, _) = tracker();
        let session = tracker.create(new_session()).await.unwrap();
        tracker.end(&session.id).await;

        let ended = tracker.get(&session.id).await.unwrap();
        assert_eq!(ended.status, SessionStatus::Expired);
        assert!(tracker.find_for_instance(&session.server_instance_id).await.unwrap().is_none());

        // Ending twice or ending an unknown session is harmless.
        tracker.end(&session.id).await;
        tracker.end("ffffffffffffffff").await;
    }

    #[tokio::test]
    async fn test_expired_session_reads_expired() {
        let (tracker, store) = tracker();
        let mut session = tracker.create(new_session()).await.unwrap();
        session.expires_at = Utc::now() - chrono::TimeDelta::seconds(1);
        store.update(&session).await.unwrap();

        assert_eq!(tracker.get(&session.id).await.unwrap().status, SessionStatus::Expired);
        assert!(tracker.list_active(0).await.unwrap().is_empty());
        assert!(matches!(
            tracker.touch(&session.id).await.unwrap_err(),
            SessionError::NotActive { status: SessionStatus::Expired, .. }
        ));
    }

    #[tokio::test]
    async fn test_concurrent_touches_are_atomic() {
        let (tracker, _) = tracker();
        let tracker = Arc::new(tracker);
        let session = tracker.create(new_session()).await.unwrap();

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let tracker = tracker.clone();
                let id = session.id.clone();
                tokio::spawn(async move { tracker.touch(&id).await.map(|_| ()) })
            })
            .collect();
        for h in handles {
            h.await.unwrap().unwrap();
        }

        assert_eq!(tracker.get(&session.id).await.unwrap().request_count, 32);
    }

    #[tokio::test]
    async fn test_list_queries() {
        let (tracker, _) = tracker();
        let a = tracker.create(new_session()).await.unwrap();
        let mut other = new_session();
        other.user = "bob".into();
        other.device_id = None;
        tracker.create(other).await.unwrap();

        assert_eq!(tracker.list_for_user("alice", 0).await.unwrap().len(), 1);
        assert_eq!(tracker.list_for_profile("production", 0).await.unwrap().len(), 2);
        assert_eq!(tracker.list_for_device("laptop-7", 0).await.unwrap()[0].id, a.id);
        assert_eq!(tracker.list_active(1).await.unwrap().len(), 1);

        let start = a.started_at - chrono::TimeDelta::seconds(1);
        let end = Utc::now() + chrono::TimeDelta::seconds(1);
        assert_eq!(tracker.list_started_between(start, end, 0).await.unwrap().len(), 2);
    }
}
