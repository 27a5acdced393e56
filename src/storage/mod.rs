//! Persistence seams for access requests, break-glass events and server
//! sessions.
//!
//! Each store is a narrow async trait with two implementations: [`sql`]
//! (sea-orm, SQLite or Postgres) for production and [`memory`] for tests and
//! single-process use. Updates are optimistic: the caller passes the record
//! it read, and the write succeeds only if the stored `version` still
//! matches.

pub mod memory;
pub mod sql;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use miette::Diagnostic;
use thiserror::Error;

use crate::breakglass::{BreakGlassEvent, BreakGlassStatus};
use crate::requests::{AccessRequest, RequestStatus};
use crate::session::{ServerSession, SessionStatus};

pub use memory::MemoryStore;
pub use sql::SqlStore;

/// Limit applied when a caller passes 0.
pub const DEFAULT_LIST_LIMIT: usize = 100;
/// Upper bound for any list query.
pub const MAX_LIST_LIMIT: usize = 1000;

pub(crate) fn effective_limit(limit: usize) -> usize {
    match limit {
        0 => DEFAULT_LIST_LIMIT,
        n => n.min(MAX_LIST_LIMIT),
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    #[error("access request `{0}` not found")]
    #[diagnostic(code(gatehouse::store::request_not_found))]
    RequestNotFound(String),

    #[error("break-glass event `{0}` not found")]
    #[diagnostic(code(gatehouse::store::break_glass_not_found))]
    BreakGlassNotFound(String),

    #[error("server session `{0}` not found")]
    #[diagnostic(code(gatehouse::store::session_not_found))]
    SessionNotFound(String),

    #[error("{kind} `{id}` already exists")]
    #[diagnostic(code(gatehouse::store::already_exists))]
    AlreadyExists { kind: &'static str, id: String },

    #[error("concurrent modification of {kind} `{id}`")]
    #[diagnostic(
        code(gatehouse::store::concurrent_modification),
        help("Re-read the record and retry the update")
    )]
    ConcurrentModification { kind: &'static str, id: String },

    #[error("an active {kind} already exists: `{id}`")]
    #[diagnostic(
        code(gatehouse::store::active_exists),
        help("Close or wait out the existing record first")
    )]
    ActiveExists { kind: &'static str, id: String },

    #[error("{kind} `{id}` is not in a state that allows this update")]
    #[diagnostic(code(gatehouse::store::condition_failed))]
    ConditionFailed { kind: &'static str, id: String },

    #[error("store operation timed out after {0:?}")]
    #[diagnostic(code(gatehouse::store::timeout))]
    Timeout(Duration),

    #[error("stored record is corrupt: {0}")]
    #[diagnostic(code(gatehouse::store::corrupt))]
    Corrupt(String),

    #[error("Database error: {0}")]
    #[diagnostic(code(gatehouse::store::db))]
    Db(#[from] sea_orm::DbErr),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StoreError::RequestNotFound(_)
                | StoreError::BreakGlassNotFound(_)
                | StoreError::SessionNotFound(_)
        )
    }
}

/// Run a store call under a deadline. An elapsed deadline surfaces as
/// [`StoreError::Timeout`], never as an empty result.
pub async fn with_deadline<T, F>(deadline: Duration, fut: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(deadline)),
    }
}

#[async_trait]
pub trait RequestStore: Send + Sync {
    async fn create(&self, request: &AccessRequest) -> Result<(), StoreError>;
    async fn get(&self, id: &str) -> Result<AccessRequest, StoreError>;
    /// Persist `request` if its version is current; returns the stored copy.
    async fn update(&self, request: &AccessRequest) -> Result<AccessRequest, StoreError>;
    async fn delete(&self, id: &str) -> Result<(), StoreError>;
    async fn list_by_requester(
        &self,
        requester: &str,
        limit: usize,
    ) -> Result<Vec<AccessRequest>, StoreError>;
    async fn list_by_status(
        &self,
        status: RequestStatus,
        limit: usize,
    ) -> Result<Vec<AccessRequest>, StoreError>;
    async fn list_by_profile(
        &self,
        profile: &str,
        limit: usize,
    ) -> Result<Vec<AccessRequest>, StoreError>;
    /// Requests still stored as `status` whose expiry is at or before
    /// `now`, oldest expiry first.
    async fn list_past_expiry(
        &self,
        status: RequestStatus,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<AccessRequest>, StoreError>;
    /// Approved, unexpired requests by `requester` for `profile`, latest expiry first.
    async fn find_approved(
        &self,
        requester: &str,
        profile: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<AccessRequest>, StoreError>;
}

#[async_trait]
pub trait BreakGlassStore: Send + Sync {
    async fn create(&self, event: &BreakGlassEvent) -> Result<(), StoreError>;
    /// Insert `event` unless an Active, unexpired event already exists for
    /// its `(invoker, profile)`. The check and the insert are one atomic
    /// step; a conflict is [`StoreError::ActiveExists`] naming the holder.
    async fn create_if_no_active(
        &self,
        event: &BreakGlassEvent,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;
    async fn get(&self, id: &str) -> Result<BreakGlassEvent, StoreError>;
    async fn update(&self, event: &BreakGlassEvent) -> Result<BreakGlassEvent, StoreError>;
    async fn delete(&self, id: &str) -> Result<(), StoreError>;
    async fn list_by_invoker(
        &self,
        invoker: &str,
        limit: usize,
    ) -> Result<Vec<BreakGlassEvent>, StoreError>;
    async fn list_by_status(
        &self,
        status: BreakGlassStatus,
        limit: usize,
    ) -> Result<Vec<BreakGlassEvent>, StoreError>;
    async fn list_by_profile(
        &self,
        profile: &str,
        limit: usize,
    ) -> Result<Vec<BreakGlassEvent>, StoreError>;
    async fn list_past_expiry(
        &self,
        status: BreakGlassStatus,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<BreakGlassEvent>, StoreError>;
    /// The Active, unexpired event for `(invoker, profile)`, if any.
    async fn find_active(
        &self,
        invoker: &str,
        profile: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<BreakGlassEvent>, StoreError>;
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create(&self, session: &ServerSession) -> Result<(), StoreError>;
    async fn get(&self, id: &str) -> Result<ServerSession, StoreError>;
    async fn update(&self, session: &ServerSession) -> Result<ServerSession, StoreError>;
    async fn delete(&self, id: &str) -> Result<(), StoreError>;
    async fn list_by_user(&self, user: &str, limit: usize)
        -> Result<Vec<ServerSession>, StoreError>;
    async fn list_by_status(
        &self,
        status: SessionStatus,
        limit: usize,
    ) -> Result<Vec<ServerSession>, StoreError>;
    async fn list_by_profile(
        &self,
        profile: &str,
        limit: usize,
    ) -> Result<Vec<ServerSession>, StoreError>;
    /// Sessions started in `[start, end)`.
    async fn list_by_time_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ServerSession>, StoreError>;
    async fn list_by_device_id(
        &self,
        device_id: &str,
        limit: usize,
    ) -> Result<Vec<ServerSession>, StoreError>;
    async fn list_past_expiry(
        &self,
        status: SessionStatus,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ServerSession>, StoreError>;
    async fn find_active_by_server_instance(
        &self,
        server_instance_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ServerSession>, StoreError>;
    /// Atomically bump `last_access_at` and `request_count` on an Active,
    /// unexpired session. Fails with [`StoreError::ConditionFailed`] otherwise.
    async fn touch(&self, id: &str, now: DateTime<Utc>) -> Result<ServerSession, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_limit() {
        assert_eq!(effective_limit(0), DEFAULT_LIST_LIMIT);
        assert_eq!(effective_limit(5), 5);
        assert_eq!(effective_limit(1_000_000), MAX_LIST_LIMIT);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_deadline_times_out() {
        let slow = async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<_, StoreError>(())
        };
        let err = with_deadline(Duration::from_secs(1), slow).await.unwrap_err();
        assert!(matches!(err, StoreError::Timeout(_)));
        assert!(!err.is_not_found());
    }
}
