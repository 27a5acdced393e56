//! Pre-approved access requests.
//!
//! A requester asks for access to a profile; another user approves or denies
//! it. An Approved, unexpired request is the first override the resolver
//! consults when policy denies.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::audit::{ApprovalAction, ApprovalLogEntry, Logger};
use crate::clock;
use crate::identifiers::{self, InvalidId};
use crate::storage::{RequestStore, StoreError};

pub const MIN_JUSTIFICATION_LEN: usize = 10;
pub const MAX_JUSTIFICATION_LEN: usize = 500;
pub const MAX_REQUEST_DURATION: Duration = Duration::from_secs(8 * 3600);
pub const DEFAULT_REQUEST_TTL: Duration = Duration::from_secs(24 * 3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Approved,
    Denied,
    Expired,
    Cancelled,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Denied => "denied",
            Self::Expired => "expired",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "denied" => Some(Self::Denied),
            "expired" => Some(Self::Expired),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Denied | Self::Expired | Self::Cancelled)
    }

    pub fn can_transition_to(&self, next: RequestStatus) -> bool {
        use RequestStatus::*;
        matches!(
            (self, next),
            (Pending, Approved) | (Pending, Denied) | (Pending, Cancelled) | (Pending, Expired)
                | (Approved, Expired)
        )
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessRequest {
    pub id: String,
    pub requester: String,
    pub profile: String,
    pub justification: String,
    pub duration: Duration,
    pub status: RequestStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub approver: Option<String>,
    pub approver_comment: Option<String>,
    pub version: u64,
}

impl AccessRequest {
    /// Stored status with time-based expiry applied.
    pub fn effective_status(&self, now: DateTime<Utc>) -> RequestStatus {
        match self.status {
            RequestStatus::Pending | RequestStatus::Approved if now >= self.expires_at => {
                RequestStatus::Expired
            }
            status => status,
        }
    }

    /// True when this request can override a policy denial at `now`.
    pub fn grants_access(&self, now: DateTime<Utc>) -> bool {
        self.effective_status(now) == RequestStatus::Approved
    }

    pub fn remaining_duration(&self, now: DateTime<Utc>) -> Duration {
        clock::remaining(self.expires_at, now)
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum RequestError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    InvalidId(#[from] InvalidId),

    #[error("{0} must not be empty")]
    #[diagnostic(code(gatehouse::request::missing_field))]
    MissingField(&'static str),

    #[error("justification must be between {min} and {max} characters (got {len})")]
    #[diagnostic(code(gatehouse::request::justification))]
    Justification { len: usize, min: usize, max: usize },

    #[error("requested duration {0:?} is outside (0, {max:?}]", max = MAX_REQUEST_DURATION)]
    #[diagnostic(code(gatehouse::request::duration))]
    Duration(Duration),

    #[error("requesters cannot approve or deny their own request")]
    #[diagnostic(code(gatehouse::request::self_approval))]
    SelfApproval,

    #[error("only the requester may cancel request `{0}`")]
    #[diagnostic(code(gatehouse::request::not_requester))]
    NotRequester(String),

    #[error("request `{id}` is {from} and cannot become {to}")]
    #[diagnostic(code(gatehouse::request::invalid_transition))]
    InvalidTransition {
        id: String,
        from: RequestStatus,
        to: RequestStatus,
    },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct NewAccessRequest {
    pub requester: String,
    pub profile: String,
    pub justification: String,
    pub duration: Duration,
}

/// Drives access requests through their lifecycle.
pub struct RequestManager {
    store: Arc<dyn RequestStore>,
    logger: Arc<dyn Logger>,
    ttl: Duration,
}

impl RequestManager {
    pub fn new(store: Arc<dyn RequestStore>, logger: Arc<dyn Logger>) -> Self {
        Self {
            store,
            logger,
            ttl: DEFAULT_REQUEST_TTL,
        }
    }

    /// How long a request stays usable after submission.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub async fn submit(&self, input: NewAccessRequest) -> Result<AccessRequest, RequestError> {
        if input.requester.trim().is_empty() {
            return Err(RequestError::MissingField("requester"));
        }
        if input.profile.trim().is_empty() {
            return Err(RequestError::MissingField("profile"));
        }
        let len = input.justification.chars().count();
        if !(MIN_JUSTIFICATION_LEN..=MAX_JUSTIFICATION_LEN).contains(&len) {
            return Err(RequestError::Justification {
                len,
                min: MIN_JUSTIFICATION_LEN,
                max: MAX_JUSTIFICATION_LEN,
            });
        }
        if input.duration.is_zero() || input.duration > MAX_REQUEST_DURATION {
            return Err(RequestError::Duration(input.duration));
        }

        let now = Utc::now();
        let request = AccessRequest {
            id: identifiers::new_id(),
            requester: input.requester,
            profile: input.profile,
            justification: input.justification,
            duration: input.duration,
            status: RequestStatus::Pending,
            created_at: now,
            updated_at: now,
            expires_at: clock::add(now, self.ttl),
            approver: None,
            approver_comment: None,
            version: 1,
        };
        self.store.create(&request).await?;

        tracing::info!(
            request_id = %request.id,
            requester = %request.requester,
            profile = %request.profile,
            "Access request submitted"
        );
        self.audit(ApprovalAction::Submitted, &request, &request.requester, None);
        Ok(request)
    }

    /// Fetch a request with time-based expiry applied to its status.
    pub async fn get(&self, id: &str) -> Result<AccessRequest, RequestError> {
        identifiers::validate_id("request", id)?;
        let mut request = self.store.get(id).await?;
        request.status = request.effective_status(Utc::now());
        Ok(request)
    }

    pub async fn approve(
        &self,
        id: &str,
        approver: &str,
        comment: Option<String>,
    ) -> Result<AccessRequest, RequestError> {
        self.decide(id, approver, comment, RequestStatus::Approved)
            .await
    }

    pub async fn deny(
        &self,
        id: &str,
        approver: &str,
        comment: Option<String>,
    ) -> Result<AccessRequest, RequestError> {
        self.decide(id, approver, comment, RequestStatus::Denied).await
    }

    pub async fn cancel(&self, id: &str, actor: &str) -> Result<AccessRequest, RequestError> {
        identifiers::validate_id("request", id)?;
        let request = self.store.get(id).await?;
        if request.requester != actor {
            return Err(RequestError::NotRequester(id.to_string()));
        }
        let updated = self
            .transition(request, RequestStatus::Cancelled, |_| {})
            .await?;
        self.audit(ApprovalAction::Cancelled, &updated, actor, None);
        Ok(updated)
    }

    pub async fn list_pending(&self, limit: usize) -> Result<Vec<AccessRequest>, RequestError> {
        let now = Utc::now();
        Ok(self
            .store
            .list_by_status(RequestStatus::Pending, limit)
            .await?
            .into_iter()
            .filter(|r| r.effective_status(now) == RequestStatus::Pending)
            .collect())
    }

    pub async fn list_for_requester(
        &self,
        requester: &str,
        limit: usize,
    ) -> Result<Vec<AccessRequest>, RequestError> {
        let now = Utc::now();
        let mut requests = self.store.list_by_requester(requester, limit).await?;
        for r in &mut requests {
            r.status = r.effective_status(now);
        }
        Ok(requests)
    }

    async fn decide(
        &self,
        id: &str,
        approver: &str,
        comment: Option<String>,
        to: RequestStatus,
    ) -> Result<AccessRequest, RequestError> {
        identifiers::validate_id("request", id)?;
        if approver.trim().is_empty() {
            return Err(RequestError::MissingField("approver"));
        }
        let request = self.store.get(id).await?;
        if request.requester == approver {
            return Err(RequestError::SelfApproval);
        }

        let approver_owned = approver.to_string();
        let comment_copy = comment.clone();
        let updated = self
            .transition(request, to, move |r| {
                r.approver = Some(approver_owned);
                r.approver_comment = comment_copy;
            })
            .await?;

        tracing::info!(
            request_id = %updated.id,
            approver,
            status = %updated.status,
            "Access request decided"
        );
        let action = if to == RequestStatus::Approved {
            ApprovalAction::Approved
        } else {
            ApprovalAction::Denied
        };
        self.audit(action, &updated, approver, comment);
        Ok(updated)
    }

    async fn transition(
        &self,
        mut request: AccessRequest,
        to: RequestStatus,
        stamp: impl FnOnce(&mut AccessRequest),
    ) -> Result<AccessRequest, RequestError> {
        let now = Utc::now();
        let from = request.effective_status(now);
        if !from.can_transition_to(to) {
            return Err(RequestError::InvalidTransition {
                id: request.id,
                from,
                to,
            });
        }
        request.status = to;
        request.updated_at = now;
        stamp(&mut request);
        Ok(self.store.update(&request).await?)
    }

    fn audit(
        &self,
        action: ApprovalAction,
        request: &AccessRequest,
        actor: &str,
        comment: Option<String>,
    ) {
        self.logger.log_approval(&ApprovalLogEntry {
            timestamp: Utc::now(),
            action,
            request_id: request.id.clone(),
            requester: request.requester.clone(),
            profile: request.profile.clone(),
            actor: actor.to_string(),
            status: request.status,
            duration_secs: request.duration.as_secs(),
            comment,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryLogger;
    use crate::storage::MemoryStore;

    fn manager() -> (RequestManager, Arc<MemoryStore>, Arc<MemoryLogger>) {
        let store = Arc::new(MemoryStore::new());
        let logger = Arc::new(MemoryLogger::new());
        (
            RequestManager::new(store.clone(), logger.clone()),
            store,
            logger,
        )
    }

    fn input() -> NewAccessRequest {
        NewAccessRequest {
            requester: "alice".into(),
            profile: "production".into(),
            justification: "deploy hotfix for ticket OPS-123".into(),
            duration: Duration::from_secs(3600),
        }
    }

    #[test]
    fn test_transitions() {
        use RequestStatus::*;
        assert!(Pending.can_transition_to(Approved));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Approved.can_transition_to(Expired));
        assert!(!Approved.can_transition_to(Denied));
        assert!(!Denied.can_transition_to(Approved));
        assert!(!Cancelled.can_transition_to(Pending));
        assert!(Denied.is_terminal());
        assert!(!Approved.is_terminal());
    }

    #[tokio::test]
    async fn test_submit_and_approve() {
        let (mgr, _store, logger) = manager();
        let req = mgr.submit(input()).await.unwrap();
        assert_eq!(req.status, RequestStatus::Pending);
        assert!(identifiers::is_valid_id(&req.id));

        let approved = mgr
            .approve(&req.id, "bob", Some("looks fine".into()))
            .await
            .unwrap();
        assert_eq!(approved.status, RequestStatus::Approved);
        assert_eq!(approved.approver.as_deref(), Some("bob"));
        assert_eq!(approved.version, req.version + 1);

        let actions: Vec<_> = logger.approvals().iter().map(|e| e.action).collect();
        assert_eq!(
            actions,
            vec![ApprovalAction::Submitted, ApprovalAction::Approved]
        );
    }

    #[tokio::test]
    async fn test_self_approval_rejected() {
        let (mgr, _, _) = manager();
        let req = mgr.submit(input()).await.unwrap();
        let err = mgr.approve(&req.id, "alice", None).await.unwrap_err();
        assert!(matches!(err, RequestError::SelfApproval));
    }

    #[tokio::test]
    async fn test_cannot_approve_denied() {
        let (mgr, _, _) = manager();
        let req = mgr.submit(input()).await.unwrap();
        mgr.deny(&req.id, "bob", None).await.unwrap();
        let err = mgr.approve(&req.id, "bob", None).await.unwrap_err();
        assert!(matches!(
            err,
            RequestError::InvalidTransition {
                from: RequestStatus::Denied,
                to: RequestStatus::Approved,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_cancel_only_by_requester() {
        let (mgr, _, _) = manager();
        let req = mgr.submit(input()).await.unwrap();
        assert!(matches!(
            mgr.cancel(&req.id, "mallory").await.unwrap_err(),
            RequestError::NotRequester(_)
        ));
        let cancelled = mgr.cancel(&req.id, "alice").await.unwrap();
        assert_eq!(cancelled.status, RequestStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_submit_validation() {
        let (mgr, _, _) = manager();

        let mut short = input();
        short.justification = "because".into();
        assert!(matches!(
            mgr.submit(short).await.unwrap_err(),
            RequestError::Justification { .. }
        ));

        let mut long = input();
        long.duration = Duration::from_secs(9 * 3600);
        assert!(matches!(
            mgr.submit(long).await.unwrap_err(),
            RequestError::Duration(_)
        ));

        let mut anon = input();
        anon.requester = " ".into();
        assert!(matches!(
            mgr.submit(anon).await.unwrap_err(),
            RequestError::MissingField("requester")
        ));
    }

    #[tokio::test]
    async fn test_invalid_id_rejected_before_store() {
        let (mgr, _, _) = manager();
        assert!(matches!(
            mgr.get("NOT-AN-ID").await.unwrap_err(),
            RequestError::InvalidId(_)
        ));
    }

    #[tokio::test]
    async fn test_expired_request_reads_as_expired() {
        let (mgr, store, _) = manager();
        let mut req = mgr.submit(input()).await.unwrap();
        req.expires_at = Utc::now() - chrono::TimeDelta::seconds(1);
        store.update(&req).await.unwrap();

        let fetched = mgr.get(&req.id).await.unwrap();
        assert_eq!(fetched.status, RequestStatus::Expired);
        assert!(matches!(
            mgr.approve(&req.id, "bob", None).await.unwrap_err(),
            RequestError::InvalidTransition { from: RequestStatus::Expired, .. }
        ));
    }
}
