//! Emergency-override lookup for policy denials.
//!
//! An Approved access request wins over break-glass, and break-glass is not
//! consulted at all once one is found. Lookups fail closed: a store error or
//! an elapsed deadline means "no override", reported through
//! [`Resolution::lookup_failed`] so callers can tell it apart from a genuine
//! absence.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::breakglass::BreakGlassEvent;
use crate::requests::AccessRequest;
use crate::storage::{with_deadline, BreakGlassStore, RequestStore, StoreError};

pub const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Override {
    ApprovedRequest(AccessRequest),
    BreakGlass(BreakGlassEvent),
}

impl Override {
    pub fn id(&self) -> &str {
        match self {
            Override::ApprovedRequest(r) => &r.id,
            Override::BreakGlass(e) => &e.id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Override::ApprovedRequest(_) => "approved_request",
            Override::BreakGlass(_) => "break_glass",
        }
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        match self {
            Override::ApprovedRequest(r) => r.expires_at,
            Override::BreakGlass(e) => e.expires_at,
        }
    }

    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        match self {
            Override::ApprovedRequest(r) => r.remaining_duration(now),
            Override::BreakGlass(e) => e.remaining_duration(now),
        }
    }

    /// Session length granted under this override: never past its expiry.
    pub fn cap(&self, requested: Duration, now: DateTime<Utc>) -> Duration {
        requested.min(self.remaining(now))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    pub found: Option<Override>,
    /// At least one lookup errored or timed out.
    pub lookup_failed: bool,
}

pub struct OverrideResolver {
    requests: Option<Arc<dyn RequestStore>>,
    break_glass: Option<Arc<dyn BreakGlassStore>>,
    timeout: Duration,
}

impl Default for OverrideResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl OverrideResolver {
    /// A resolver with no override paths configured; every lookup is "none".
    pub fn new() -> Self {
        Self {
            requests: None,
            break_glass: None,
            timeout: DEFAULT_LOOKUP_TIMEOUT,
        }
    }

    pub fn with_requests(mut self, store: Arc<dyn RequestStore>) -> Self {
        self.requests = Some(store);
        self
    }

    pub fn with_break_glass(mut self, store: Arc<dyn BreakGlassStore>) -> Self {
        self.break_glass = Some(store);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn has_approval_path(&self) -> bool {
        self.requests.is_some()
    }

    pub fn has_break_glass_path(&self) -> bool {
        self.break_glass.is_some()
    }

    pub async fn resolve(&self, user: &str, profile: &str, now: DateTime<Utc>) -> Resolution {
        let mut resolution = Resolution::default();

        if let Some(store) = &self.requests {
            match with_deadline(self.timeout, store.find_approved(user, profile, now)).await {
                Ok(Some(request)) if request.grants_access(now) => {
                    tracing::info!(
                        request_id = %request.id,
                        user,
                        profile,
                        "Approved access request overrides policy denial"
                    );
                    resolution.found = Some(Override::ApprovedRequest(request));
                    return resolution;
                }
                Ok(_) => {}
                Err(e) => {
                    log_lookup_failure("approved request", user, profile, &e);
                    resolution.lookup_failed = true;
                }
            }
        }

        if let Some(store) = &self.break_glass {
            match with_deadline(self.timeout, store.find_active(user, profile, now)).await {
                Ok(Some(event)) if event.is_active(now) => {
                    tracing::warn!(
                        event_id = %event.id,
                        user,
                        profile,
                        "Break-glass event overrides policy denial"
                    );
                    resolution.found = Some(Override::BreakGlass(event));
                }
                Ok(_) => {}
                Err(e) => {
                    log_lookup_failure("break-glass", user, profile, &e);
                    resolution.lookup_failed = true;
                }
            }
        }

        resolution
    }
}

fn log_lookup_failure(kind: &str, user: &str, profile: &str, error: &StoreError) {
    match error {
        StoreError::Timeout(after) => tracing::warn!(
            lookup = kind,
            user,
            profile,
            timeout_ms = after.as_millis() as u64,
            "Override lookup timed out; treating as no override"
        ),
        other => tracing::warn!(
            lookup = kind,
            user,
            profile,
            error = %other,
            "Override lookup failed; treating as no override"
        ),
    }
}
