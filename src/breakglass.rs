//! Break-glass: emergency access that bypasses a policy denial.
//!
//! An event starts Active and ends either Closed (explicitly, by anyone) or
//! Expired (once `expires_at` passes). Expiry is computed on read; the sweep
//! job only persists what reads already report.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::audit::{BreakGlassAction, BreakGlassLogEntry, Logger};
use crate::clock;
use crate::identifiers::{self, InvalidId};
use crate::notify::{self, BreakGlassNotification, NotificationType, Notifier};
use crate::storage::{BreakGlassStore, StoreError};

pub const MIN_JUSTIFICATION_LEN: usize = 20;
pub const MAX_JUSTIFICATION_LEN: usize = 1000;
pub const DEFAULT_MAX_DURATION: Duration = Duration::from_secs(4 * 3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    Incident,
    Maintenance,
    Security,
    Recovery,
    Other,
}

impl ReasonCode {
    pub const ALL: [ReasonCode; 5] = [
        Self::Incident,
        Self::Maintenance,
        Self::Security,
        Self::Recovery,
        Self::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Incident => "incident",
            Self::Maintenance => "maintenance",
            Self::Security => "security",
            Self::Recovery => "recovery",
            Self::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == s)
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakGlassStatus {
    Active,
    Closed,
    Expired,
}

impl BreakGlassStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Closed => "closed",
            Self::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "closed" => Some(Self::Closed),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Active)
    }

    pub fn can_transition_to(&self, next: BreakGlassStatus) -> bool {
        matches!(
            (self, next),
            (Self::Active, Self::Closed) | (Self::Active, Self::Expired)
        )
    }
}

impl fmt::Display for BreakGlassStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakGlassEvent {
    pub id: String,
    pub invoker: String,
    pub profile: String,
    pub reason_code: ReasonCode,
    pub justification: String,
    pub duration: Duration,
    pub status: BreakGlassStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub closed_by: Option<String>,
    pub closed_reason: Option<String>,
    /// Correlates the event with the issuance request that prompted it.
    pub request_id: Option<String>,
    pub version: u64,
}

impl BreakGlassEvent {
    pub fn effective_status(&self, now: DateTime<Utc>) -> BreakGlassStatus {
        match self.status {
            BreakGlassStatus::Active if now >= self.expires_at => BreakGlassStatus::Expired,
            status => status,
        }
    }

    /// Active and not yet expired.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.effective_status(now) == BreakGlassStatus::Active
    }

    pub fn remaining_duration(&self, now: DateTime<Utc>) -> Duration {
        clock::remaining(self.expires_at, now)
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum BreakGlassError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    InvalidId(#[from] InvalidId),

    #[error("{0} must not be empty")]
    #[diagnostic(code(gatehouse::break_glass::missing_field))]
    MissingField(&'static str),

    #[error("unknown reason code `{0}`")]
    #[diagnostic(
        code(gatehouse::break_glass::reason_code),
        help("Use one of: incident, maintenance, security, recovery, other")
    )]
    ReasonCode(String),

    #[error("justification must be between {min} and {max} characters (got {len})")]
    #[diagnostic(code(gatehouse::break_glass::justification))]
    Justification { len: usize, min: usize, max: usize },

    #[error("break-glass duration must be greater than zero")]
    #[diagnostic(code(gatehouse::break_glass::duration))]
    ZeroDuration,

    #[error("an active break-glass event `{existing}` already exists for {invoker} on {profile}")]
    #[diagnostic(
        code(gatehouse::break_glass::duplicate_active),
        help("Close the existing event before invoking a new one")
    )]
    DuplicateActive {
        existing: String,
        invoker: String,
        profile: String,
    },

    #[error("break-glass event `{0}` is already closed")]
    #[diagnostic(code(gatehouse::break_glass::already_closed))]
    AlreadyClosed(String),

    #[error("break-glass event `{0}` has expired")]
    #[diagnostic(code(gatehouse::break_glass::expired))]
    Expired(String),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct Invocation {
    pub invoker: String,
    pub profile: String,
    pub reason_code: String,
    pub justification: String,
    pub duration: Duration,
    pub request_id: Option<String>,
}

pub struct BreakGlassManager {
    store: Arc<dyn BreakGlassStore>,
    logger: Arc<dyn Logger>,
    notifier: Arc<dyn Notifier>,
    max_duration: Duration,
}

impl BreakGlassManager {
    pub fn new(
        store: Arc<dyn BreakGlassStore>,
        logger: Arc<dyn Logger>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            store,
            logger,
            notifier,
            max_duration: DEFAULT_MAX_DURATION,
        }
    }

    pub fn with_max_duration(mut self, max: Duration) -> Self {
        self.max_duration = max;
        self
    }

    /// Open an emergency-access window. The duration is capped at the
    /// configured maximum.
    pub async fn invoke(&self, inv: Invocation) -> Result<BreakGlassEvent, BreakGlassError> {
        if inv.invoker.trim().is_empty() {
            return Err(BreakGlassError::MissingField("invoker"));
        }
        if inv.profile.trim().is_empty() {
            return Err(BreakGlassError::MissingField("profile"));
        }
        let reason_code = ReasonCode::parse(&inv.reason_code)
            .ok_or_else(|| BreakGlassError::ReasonCode(inv.reason_code.clone()))?;
        let len = inv.justification.chars().count();
        if !(MIN_JUSTIFICATION_LEN..=MAX_JUSTIFICATION_LEN).contains(&len) {
            return Err(BreakGlassError::Justification {
                len,
                min: MIN_JUSTIFICATION_LEN,
                max: MAX_JUSTIFICATION_LEN,
            });
        }
        if inv.duration.is_zero() {
            return Err(BreakGlassError::ZeroDuration);
        }
        if let Some(request_id) = inv.request_id.as_deref() {
            identifiers::validate_id("request", request_id)?;
        }

        let now = Utc::now();
        if let Some(existing) = self
            .store
            .find_active(&inv.invoker, &inv.profile, now)
            .await?
        {
            return Err(BreakGlassError::DuplicateActive {
                existing: existing.id,
                invoker: inv.invoker,
                profile: inv.profile,
            });
        }

        let duration = inv.duration.min(self.max_duration);
        if duration < inv.duration {
            tracing::info!(
                requested_secs = inv.duration.as_secs(),
                capped_secs = duration.as_secs(),
                "Break-glass duration capped"
            );
        }

        let event = BreakGlassEvent {
            id: identifiers::new_id(),
            invoker: inv.invoker,
            profile: inv.profile,
            reason_code,
            justification: inv.justification,
            duration,
            status: BreakGlassStatus::Active,
            created_at: now,
            updated_at: now,
            expires_at: clock::add(now, duration),
            closed_by: None,
            closed_reason: None,
            request_id: inv.request_id,
            version: 1,
        };
        match self.store.create_if_no_active(&event, now).await {
            Ok(()) => {}
            Err(StoreError::ActiveExists { id, .. }) => {
                return Err(BreakGlassError::DuplicateActive {
                    existing: id,
                    invoker: event.invoker,
                    profile: event.profile,
                });
            }
            Err(e) => return Err(e.into()),
        }

        tracing::warn!(
            event_id = %event.id,
            invoker = %event.invoker,
            profile = %event.profile,
            reason_code = %event.reason_code,
            "Break-glass invoked"
        );
        let actor = event.invoker.clone();
        self.audit(BreakGlassAction::Invoked, &event, &actor);
        self.notify(NotificationType::Invoked, &event, &actor).await;
        Ok(event)
    }

    pub async fn close(
        &self,
        id: &str,
        closed_by: &str,
        reason: &str,
    ) -> Result<BreakGlassEvent, BreakGlassError> {
        identifiers::validate_id("break-glass event", id)?;
        if closed_by.trim().is_empty() {
            return Err(BreakGlassError::MissingField("closed_by"));
        }
        if reason.trim().is_empty() {
            return Err(BreakGlassError::MissingField("reason"));
        }

        let mut event = self.store.get(id).await?;
        let now = Utc::now();
        match event.effective_status(now) {
            BreakGlassStatus::Active => {}
            BreakGlassStatus::Closed => return Err(BreakGlassError::AlreadyClosed(event.id)),
            BreakGlassStatus::Expired => return Err(BreakGlassError::Expired(event.id)),
        }

        event.status = BreakGlassStatus::Closed;
        event.closed_by = Some(closed_by.to_string());
        event.closed_reason = Some(reason.to_string());
        event.updated_at = now;
        let event = self.store.update(&event).await?;

        tracing::info!(event_id = %event.id, closed_by, "Break-glass closed");
        self.audit(BreakGlassAction::Closed, &event, closed_by);
        self.notify(NotificationType::Closed, &event, closed_by).await;
        Ok(event)
    }

    pub async fn get(&self, id: &str) -> Result<BreakGlassEvent, BreakGlassError> {
        identifiers::validate_id("break-glass event", id)?;
        let mut event = self.store.get(id).await?;
        event.status = event.effective_status(Utc::now());
        Ok(event)
    }

    /// Events that are still usable, newest first.
    pub async fn list_active(&self, limit: usize) -> Result<Vec<BreakGlassEvent>, BreakGlassError> {
        let now = Utc::now();
        Ok(self
            .store
            .list_by_status(BreakGlassStatus::Active, limit)
            .await?
            .into_iter()
            .filter(|e| e.is_active(now))
            .collect())
    }

    pub async fn list_for_invoker(
        &self,
        invoker: &str,
        limit: usize,
    ) -> Result<Vec<BreakGlassEvent>, BreakGlassError> {
        let now = Utc::now();
        let mut events = self.store.list_by_invoker(invoker, limit).await?;
        for e in &mut events {
            e.status = e.effective_status(now);
        }
        Ok(events)
    }

    fn audit(&self, action: BreakGlassAction, event: &BreakGlassEvent, actor: &str) {
        self.logger.log_break_glass(&BreakGlassLogEntry {
            timestamp: Utc::now(),
            action,
            event_id: event.id.clone(),
            invoker: event.invoker.clone(),
            profile: event.profile.clone(),
            actor: actor.to_string(),
            reason_code: event.reason_code,
            justification: event.justification.clone(),
            duration_secs: event.duration.as_secs(),
            expires_at: event.expires_at,
            closed_reason: event.closed_reason.clone(),
        });
    }

    async fn notify(&self, kind: NotificationType, event: &BreakGlassEvent, actor: &str) {
        notify::dispatch(
            self.notifier.as_ref(),
            BreakGlassNotification {
                kind,
                event: event.clone(),
                actor: actor.to_string(),
                timestamp: Utc::now(),
            },
        )
        .await;
    }
}
