//! In-process stores backed by `DashMap`.
//!
//! Used by tests and by single-process deployments that do not need
//! sessions to outlive the server. Entry locks give `touch` and versioned
//! updates the same atomicity the SQL store gets from conditional `UPDATE`s.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::{
    effective_limit, BreakGlassStore, RequestStore, SessionStore, StoreError,
};
use crate::breakglass::{BreakGlassEvent, BreakGlassStatus};
use crate::requests::{AccessRequest, RequestStatus};
use crate::session::{ServerSession, SessionStatus};

#[derive(Debug, Default)]
pub struct MemoryStore {
    requests: DashMap<String, AccessRequest>,
    break_glass: DashMap<String, BreakGlassEvent>,
    /// Last event created per `(invoker, profile)`. Its entry lock
    /// serializes `create_if_no_active` for one pair.
    break_glass_slots: DashMap<(String, String), String>,
    sessions: DashMap<String, ServerSession>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn active_break_glass(
        &self,
        invoker: &str,
        profile: &str,
        now: DateTime<Utc>,
    ) -> Option<BreakGlassEvent> {
        collect(
            &self.break_glass,
            1,
            |e| e.invoker == invoker && e.profile == profile && e.is_active(now),
            |e| e.expires_at,
        )
        .into_iter()
        .next()
    }
}

/// Collect matching values, newest first, truncated to the effective limit.
fn collect<T: Clone, K: Ord>(
    map: &DashMap<String, T>,
    limit: usize,
    keep: impl Fn(&T) -> bool,
    sort_key: impl Fn(&T) -> K,
) -> Vec<T> {
    let mut out: Vec<T> = map
        .iter()
        .filter(|e| keep(e.value()))
        .map(|e| e.value().clone())
        .collect();
    out.sort_by(|a, b| sort_key(b).cmp(&sort_key(a)));
    out.truncate(effective_limit(limit));
    out
}

/// Values stored with an expiry at or before `now`, oldest expiry first.
fn collect_past_expiry<T: Clone>(
    map: &DashMap<String, T>,
    limit: usize,
    keep: impl Fn(&T) -> bool,
    expires_at: impl Fn(&T) -> DateTime<Utc>,
    now: DateTime<Utc>,
) -> Vec<T> {
    let mut out: Vec<T> = map
        .iter()
        .filter(|e| keep(e.value()) && expires_at(e.value()) <= now)
        .map(|e| e.value().clone())
        .collect();
    out.sort_by_key(|v| expires_at(v));
    out.truncate(effective_limit(limit));
    out
}

/// Compare-and-swap on `version`. The stored copy gets `version + 1`.
fn versioned_update<T: Clone>(
    map: &DashMap<String, T>,
    kind: &'static str,
    id: &str,
    value: &T,
    version_of: impl Fn(&T) -> u64,
    set_version: impl Fn(&mut T, u64),
    not_found: impl FnOnce(String) -> StoreError,
) -> Result<T, StoreError> {
    let mut entry = map
        .get_mut(id)
        .ok_or_else(|| not_found(id.to_string()))?;
    if version_of(entry.value()) != version_of(value) {
        return Err(StoreError::ConcurrentModification {
            kind,
            id: id.to_string(),
        });
    }
    let mut next = value.clone();
    set_version(&mut next, version_of(value) + 1);
    *entry.value_mut() = next.clone();
    Ok(next)
}

fn insert_new<T: Clone>(
    map: &DashMap<String, T>,
    kind: &'static str,
    id: &str,
    value: &T,
) -> Result<(), StoreError> {
    match map.entry(id.to_string()) {
        Entry::Occupied(_) => Err(StoreError::AlreadyExists {
            kind,
            id: id.to_string(),
        }),
        Entry::Vacant(v) => {
            v.insert(value.clone());
            Ok(())
        }
    }
}

#[async_trait]
impl RequestStore for MemoryStore {
    async fn create(&self, request: &AccessRequest) -> Result<(), StoreError> {
        insert_new(&self.requests, "access request", &request.id, request)
    }

    async fn get(&self, id: &str) -> Result<AccessRequest, StoreError> {
        self.requests
            .get(id)
            .map(|r| r.value().clone())
            .ok_or_else(|| StoreError::RequestNotFound(id.to_string()))
    }

    async fn update(&self, request: &AccessRequest) -> Result<AccessRequest, StoreError> {
        versioned_update(
            &self.requests,
            "access request",
            &request.id,
            request,
            |r| r.version,
            |r, v| r.version = v,
            StoreError::RequestNotFound,
        )
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.requests.remove(id);
        Ok(())
    }

    async fn list_by_requester(
        &self,
        requester: &str,
        limit: usize,
    ) -> Result<Vec<AccessRequest>, StoreError> {
        Ok(collect(
            &self.requests,
            limit,
            |r| r.requester == requester,
            |r| r.created_at,
        ))
    }

    async fn list_by_status(
        &self,
        status: RequestStatus,
        limit: usize,
    ) -> Result<Vec<AccessRequest>, StoreError> {
        Ok(collect(
            &self.requests,
            limit,
            |r| r.status == status,
            |r| r.created_at,
        ))
    }

    async fn list_past_expiry(
        &self,
        status: RequestStatus,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<AccessRequest>, StoreError> {
        Ok(collect_past_expiry(
            &self.requests,
            limit,
            |r| r.status == status,
            |r| r.expires_at,
            now,
        ))
    }

    async fn list_by_profile(
        &self,
        profile: &str,
        limit: usize,
    ) -> Result<Vec<AccessRequest>, StoreError> {
        Ok(collect(
            &self.requests,
            limit,
            |r| r.profile == profile,
            |r| r.created_at,
        ))
    }

    async fn find_approved(
        &self,
        requester: &str,
        profile: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<AccessRequest>, StoreError> {
        Ok(collect(
            &self.requests,
            1,
            |r| r.requester == requester && r.profile == profile && r.grants_access(now),
            |r| r.expires_at,
        )
        .into_iter()
        .next())
    }
}

#[async_trait]
impl BreakGlassStore for MemoryStore {
    async fn create(&self, event: &BreakGlassEvent) -> Result<(), StoreError> {
        insert_new(&self.break_glass, "break-glass event", &event.id, event)
    }

    async fn create_if_no_active(
        &self,
        event: &BreakGlassEvent,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        // Held until return, so a second creator for the same pair waits
        // here and then sees this event.
        let mut slot = self
            .break_glass_slots
            .entry((event.invoker.clone(), event.profile.clone()))
            .or_default();
        if let Some(existing) = self.active_break_glass(&event.invoker, &event.profile, now) {
            return Err(StoreError::ActiveExists {
                kind: "break-glass event",
                id: existing.id,
            });
        }
        insert_new(&self.break_glass, "break-glass event", &event.id, event)?;
        *slot = event.id.clone();
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<BreakGlassEvent, StoreError> {
        self.break_glass
            .get(id)
            .map(|e| e.value().clone())
            .ok_or_else(|| StoreError::BreakGlassNotFound(id.to_string()))
    }

    async fn update(&self, event: &BreakGlassEvent) -> Result<BreakGlassEvent, StoreError> {
        versioned_update(
            &self.break_glass,
            "break-glass event",
            &event.id,
            event,
            |e| e.version,
            |e, v| e.version = v,
            StoreError::BreakGlassNotFound,
        )
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.break_glass.remove(id);
        Ok(())
    }

    async fn list_by_invoker(
        &self,
        invoker: &str,
        limit: usize,
    ) -> Result<Vec<BreakGlassEvent>, StoreError> {
        Ok(collect(
            &self.break_glass,
            limit,
            |e| e.invoker == invoker,
            |e| e.created_at,
        ))
    }

    async fn list_by_status(
        &self,
        status: BreakGlassStatus,
        limit: usize,
    ) -> Result<Vec<BreakGlassEvent>, StoreError> {
        Ok(collect(
            &self.break_glass,
            limit,
            |e| e.status == status,
            |e| e.created_at,
        ))
    }

    async fn list_past_expiry(
        &self,
        status: BreakGlassStatus,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<BreakGlassEvent>, StoreError> {
        Ok(collect_past_expiry(
            &self.break_glass,
            limit,
            |e| e.status == status,
            |e| e.expires_at,
            now,
        ))
    }

    async fn list_by_profile(
        &self,
        profile: &str,
        limit: usize,
    ) -> Result<Vec<BreakGlassEvent>, StoreError> {
        Ok(collect(
            &self.break_glass,
            limit,
            |e| e.profile == profile,
            |e| e.created_at,
        ))
    }

    async fn find_active(
        &self,
        invoker: &str,
        profile: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<BreakGlassEvent>, StoreError> {
        Ok(self.active_break_glass(invoker, profile, now))
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn create(&self, session: &ServerSession) -> Result<(), StoreError> {
        insert_new(&self.sessions, "server session", &session.id, session)
    }

    async fn get(&self, id: &str) -> Result<ServerSession, StoreError> {
        self.sessions
            .get(id)
            .map(|s| s.value().clone())
            .ok_or_else(|| StoreError::SessionNotFound(id.to_string()))
    }

    async fn update(&self, session: &ServerSession) -> Result<ServerSession, StoreError> {
        let mut entry = self
            .sessions
            .get_mut(&session.id)
            .ok_or_else(|| StoreError::SessionNotFound(session.id.clone()))?;
        if entry.version != session.version {
            return Err(StoreError::ConcurrentModification {
                kind: "server session",
                id: session.id.clone(),
            });
        }
        // Counters are owned by touch(); keep whatever it has recorded.
        let stored = entry.value_mut();
        *stored = ServerSession {
            version: session.version + 1,
            request_count: stored.request_count,
            last_access_at: stored.last_access_at,
            ..session.clone()
        };
        Ok(stored.clone())
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.sessions.remove(id);
        Ok(())
    }

    async fn list_by_user(
        &self,
        user: &str,
        limit: usize,
    ) -> Result<Vec<ServerSession>, StoreError> {
        Ok(collect(&self.sessions, limit, |s| s.user == user, |s| s.started_at))
    }

    async fn list_by_status(
        &self,
        status: SessionStatus,
        limit: usize,
    ) -> Result<Vec<ServerSession>, StoreError> {
        Ok(collect(
            &self.sessions,
            limit,
            |s| s.status == status,
            |s| s.started_at,
        ))
    }

    async fn list_past_expiry(
        &self,
        status: SessionStatus,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ServerSession>, StoreError> {
        Ok(collect_past_expiry(
            &self.sessions,
            limit,
            |s| s.status == status,
            |s| s.expires_at,
            now,
        ))
    }

    async fn list_by_profile(
        &self,
        profile: &str,
        limit: usize,
    ) -> Result<Vec<ServerSession>, StoreError> {
        Ok(collect(
            &self.sessions,
            limit,
            |s| s.profile == profile,
            |s| s.started_at,
        ))
    }

    async fn list_by_time_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ServerSession>, StoreError> {
        Ok(collect(
            &self.sessions,
            limit,
            |s| s.started_at >= start && s.started_at < end,
            |s| s.started_at,
        ))
    }

    async fn list_by_device_id(
        &self,
        device_id: &str,
        limit: usize,
    ) -> Result<Vec<ServerSession>, StoreError> {
        Ok(collect(
            &self.sessions,
            limit,
            |s| s.device_id.as_deref() == Some(device_id),
            |s| s.started_at,
        ))
    }

    async fn find_active_by_server_instance(
        &self,
        server_instance_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ServerSession>, StoreError> {
        Ok(collect(
            &self.sessions,
            1,
            |s| s.server_instance_id == server_instance_id && s.is_active(now),
            |s| s.started_at,
        )
        .into_iter()
        .next())
    }

    async fn touch(&self, id: &str, now: DateTime<Utc>) -> Result<ServerSession, StoreError> {
        let mut entry = self
            .sessions
            .get_mut(id)
            .ok_or_else(|| StoreError::SessionNotFound(id.to_string()))?;
        let session = entry.value_mut();
        if !session.is_active(now) {
            return Err(StoreError::ConditionFailed {
                kind: "server session",
                id: id.to_string(),
            });
        }
        session.last_access_at = now;
        session.request_count += 1;
        Ok(session.clone())
    }
}
