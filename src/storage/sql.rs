//! sea-orm implementation of the store traits (SQLite or Postgres).
//!
//! Timestamps are stored as unix seconds and durations as whole seconds.
//! Versioned updates are a single `UPDATE … WHERE id = ? AND version = ?`;
//! zero affected rows means either a stale version or a missing row, and a
//! follow-up read tells the two apart.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Database, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect, Set, SqlErr, TransactionTrait,
};

use super::{effective_limit, BreakGlassStore, RequestStore, SessionStore, StoreError};
use crate::breakglass::{BreakGlassEvent, BreakGlassStatus, ReasonCode};
use crate::clock;
use crate::entities::{access_request, break_glass_event, server_session};
use crate::requests::{AccessRequest, RequestStatus};
use crate::session::{ServerSession, SessionStatus};

#[derive(Debug, Clone)]
pub struct SqlStore {
    db: DatabaseConnection,
}

impl SqlStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let db = Database::connect(url).await?;
        Ok(Self { db })
    }

    /// Apply any pending schema migrations.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        use migration::MigratorTrait;
        migration::Migrator::up(&self.db, None).await?;
        Ok(())
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }
}

fn ts(secs: i64, field: &str) -> Result<DateTime<Utc>, StoreError> {
    clock::from_unix(secs).ok_or_else(|| StoreError::Corrupt(format!("{field}: bad timestamp {secs}")))
}

fn secs(value: i64, field: &str) -> Result<Duration, StoreError> {
    u64::try_from(value)
        .map(Duration::from_secs)
        .map_err(|_| StoreError::Corrupt(format!("{field}: negative duration {value}")))
}

fn count(value: i64, field: &str) -> Result<u64, StoreError> {
    u64::try_from(value).map_err(|_| StoreError::Corrupt(format!("{field}: negative value {value}")))
}

fn as_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

// ---------------------------------------------------------------------------
// Access requests
// ---------------------------------------------------------------------------

impl TryFrom<access_request::Model> for AccessRequest {
    type Error = StoreError;

    fn try_from(m: access_request::Model) -> Result<Self, StoreError> {
        let status = RequestStatus::parse(&m.status)
            .ok_or_else(|| StoreError::Corrupt(format!("access request status `{}`", m.status)))?;
        Ok(AccessRequest {
            duration: secs(m.duration_secs, "duration_secs")?,
            created_at: ts(m.created_at, "created_at")?,
            updated_at: ts(m.updated_at, "updated_at")?,
            expires_at: ts(m.expires_at, "expires_at")?,
            version: count(m.version, "version")?,
            id: m.id,
            requester: m.requester,
            profile: m.profile,
            justification: m.justification,
            status,
            approver: m.approver,
            approver_comment: m.approver_comment,
        })
    }
}

fn request_model(r: &AccessRequest, version: u64) -> access_request::ActiveModel {
    access_request::ActiveModel {
        id: Set(r.id.clone()),
        requester: Set(r.requester.clone()),
        profile: Set(r.profile.clone()),
        justification: Set(r.justification.clone()),
        duration_secs: Set(as_i64(r.duration.as_secs())),
        status: Set(r.status.as_str().to_string()),
        created_at: Set(r.created_at.timestamp()),
        updated_at: Set(r.updated_at.timestamp()),
        expires_at: Set(r.expires_at.timestamp()),
        approver: Set(r.approver.clone()),
        approver_comment: Set(r.approver_comment.clone()),
        version: Set(as_i64(version)),
    }
}

fn requests(models: Vec<access_request::Model>) -> Result<Vec<AccessRequest>, StoreError> {
    models.into_iter().map(AccessRequest::try_from).collect()
}

#[async_trait]
impl RequestStore for SqlStore {
    async fn create(&self, request: &AccessRequest) -> Result<(), StoreError> {
        use access_request::Entity;

        if Entity::find_by_id(request.id.clone()).one(&self.db).await?.is_some() {
            return Err(StoreError::AlreadyExists {
                kind: "access request",
                id: request.id.clone(),
            });
        }
        request_model(request, request.version).insert(&self.db).await?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<AccessRequest, StoreError> {
        access_request::Entity::find_by_id(id.to_string())
            .one(&self.db)
            .await?
            .ok_or_else(|| StoreError::RequestNotFound(id.to_string()))?
            .try_into()
    }

    async fn update(&self, request: &AccessRequest) -> Result<AccessRequest, StoreError> {
        use access_request::{Column, Entity};

        let next = request.version + 1;
        let result = Entity::update_many()
            .set(request_model(request, next))
            .filter(Column::Id.eq(request.id.as_str()))
            .filter(Column::Version.eq(as_i64(request.version)))
            .exec(&self.db)
            .await?;

        if result.rows_affected == 0 {
            RequestStore::get(self, &request.id).await?;
            return Err(StoreError::ConcurrentModification {
                kind: "access request",
                id: request.id.clone(),
            });
        }
        Ok(AccessRequest {
            version: next,
            ..request.clone()
        })
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        access_request::Entity::delete_by_id(id.to_string())
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn list_by_requester(
        &self,
        requester: &str,
        limit: usize,
    ) -> Result<Vec<AccessRequest>, StoreError> {
        use access_request::{Column, Entity};

        requests(
            Entity::find()
                .filter(Column::Requester.eq(requester))
                .order_by_desc(Column::CreatedAt)
                .limit(effective_limit(limit) as u64)
                .all(&self.db)
                .await?,
        )
    }

    async fn list_by_status(
        &self,
        status: RequestStatus,
        limit: usize,
    ) -> Result<Vec<AccessRequest>, StoreError> {
        use access_request::{Column, Entity};

        requests(
            Entity::find()
                .filter(Column::Status.eq(status.as_str()))
                .order_by_desc(Column::CreatedAt)
                .limit(effective_limit(limit) as u64)
                .all(&self.db)
                .await?,
        )
    }

    async fn list_past_expiry(
        &self,
        status: RequestStatus,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<AccessRequest>, StoreError> {
        use access_request::{Column, Entity};

        requests(
            Entity::find()
                .filter(Column::Status.eq(status.as_str()))
                .filter(Column::ExpiresAt.lte(now.timestamp()))
                .order_by_asc(Column::ExpiresAt)
                .limit(effective_limit(limit) as u64)
                .all(&self.db)
                .await?,
        )
    }

    async fn list_by_profile(
        &self,
        profile: &str,
        limit: usize,
    ) -> Result<Vec<AccessRequest>, StoreError> {
        use access_request::{Column, Entity};

        requests(
            Entity::find()
                .filter(Column::Profile.eq(profile))
                .order_by_desc(Column::CreatedAt)
                .limit(effective_limit(limit) as u64)
                .all(&self.db)
                .await?,
        )
    }

    async fn find_approved(
        &self,
        requester: &str,
        profile: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<AccessRequest>, StoreError> {
        use access_request::{Column, Entity};

        let candidates = requests(
            Entity::find()
                .filter(Column::Requester.eq(requester))
                .filter(Column::Profile.eq(profile))
                .filter(Column::Status.eq(RequestStatus::Approved.as_str()))
                .filter(Column::ExpiresAt.gte(now.timestamp()))
                .order_by_desc(Column::ExpiresAt)
                .all(&self.db)
                .await?,
        )?;
        Ok(candidates.into_iter().find(|r| r.grants_access(now)))
    }
}

// ---------------------------------------------------------------------------
// Break-glass events
// ---------------------------------------------------------------------------

impl TryFrom<break_glass_event::Model> for BreakGlassEvent {
    type Error = StoreError;

    fn try_from(m: break_glass_event::Model) -> Result<Self, StoreError> {
        let status = BreakGlassStatus::parse(&m.status)
            .ok_or_else(|| StoreError::Corrupt(format!("break-glass status `{}`", m.status)))?;
        let reason_code = ReasonCode::parse(&m.reason_code)
            .ok_or_else(|| StoreError::Corrupt(format!("reason code `{}`", m.reason_code)))?;
        Ok(BreakGlassEvent {
            duration: secs(m.duration_secs, "duration_secs")?,
            created_at: ts(m.created_at, "created_at")?,
            updated_at: ts(m.updated_at, "updated_at")?,
            expires_at: ts(m.expires_at, "expires_at")?,
            version: count(m.version, "version")?,
            id: m.id,
            invoker: m.invoker,
            profile: m.profile,
            reason_code,
            justification: m.justification,
            status,
            closed_by: m.closed_by,
            closed_reason: m.closed_reason,
            request_id: m.request_id,
        })
    }
}

fn break_glass_model(e: &BreakGlassEvent, version: u64) -> break_glass_event::ActiveModel {
    break_glass_event::ActiveModel {
        id: Set(e.id.clone()),
        invoker: Set(e.invoker.clone()),
        profile: Set(e.profile.clone()),
        reason_code: Set(e.reason_code.as_str().to_string()),
        justification: Set(e.justification.clone()),
        duration_secs: Set(as_i64(e.duration.as_secs())),
        status: Set(e.status.as_str().to_string()),
        created_at: Set(e.created_at.timestamp()),
        updated_at: Set(e.updated_at.timestamp()),
        expires_at: Set(e.expires_at.timestamp()),
        closed_by: Set(e.closed_by.clone()),
        closed_reason: Set(e.closed_reason.clone()),
        request_id: Set(e.request_id.clone()),
        version: Set(as_i64(version)),
    }
}

fn events(models: Vec<break_glass_event::Model>) -> Result<Vec<BreakGlassEvent>, StoreError> {
    models.into_iter().map(BreakGlassEvent::try_from).collect()
}

#[async_trait]
impl BreakGlassStore for SqlStore {
    async fn create(&self, event: &BreakGlassEvent) -> Result<(), StoreError> {
        use break_glass_event::Entity;

        if Entity::find_by_id(event.id.clone()).one(&self.db).await?.is_some() {
            return Err(StoreError::AlreadyExists {
                kind: "break-glass event",
                id: event.id.clone(),
            });
        }
        break_glass_model(event, event.version).insert(&self.db).await?;
        Ok(())
    }

    async fn create_if_no_active(
        &self,
        event: &BreakGlassEvent,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        use break_glass_event::{Column, Entity};

        let txn = self.db.begin().await?;

        // Rows that lapsed by time still read `active`; retire them so the
        // partial unique index only covers live events.
        Entity::update_many()
            .col_expr(Column::Status, Expr::value(BreakGlassStatus::Expired.as_str()))
            .col_expr(Column::UpdatedAt, Expr::value(now.timestamp()))
            .col_expr(Column::Version, Expr::col(Column::Version).add(1))
            .filter(Column::Invoker.eq(event.invoker.as_str()))
            .filter(Column::Profile.eq(event.profile.as_str()))
            .filter(Column::Status.eq(BreakGlassStatus::Active.as_str()))
            .filter(Column::ExpiresAt.lte(now.timestamp()))
            .exec(&txn)
            .await?;

        match break_glass_model(event, event.version).insert(&txn).await {
            Ok(_) => {
                txn.commit().await?;
                Ok(())
            }
            Err(e) if matches!(e.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) => {
                txn.rollback().await?;
                match self.find_active(&event.invoker, &event.profile, now).await? {
                    Some(existing) => Err(StoreError::ActiveExists {
                        kind: "break-glass event",
                        id: existing.id,
                    }),
                    None => Err(StoreError::AlreadyExists {
                        kind: "break-glass event",
                        id: event.id.clone(),
                    }),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, id: &str) -> Result<BreakGlassEvent, StoreError> {
        break_glass_event::Entity::find_by_id(id.to_string())
            .one(&self.db)
            .await?
            .ok_or_else(|| StoreError::BreakGlassNotFound(id.to_string()))?
            .try_into()
    }

    async fn update(&self, event: &BreakGlassEvent) -> Result<BreakGlassEvent, StoreError> {
        use break_glass_event::{Column, Entity};

        let next = event.version + 1;
        let result = Entity::update_many()
            .set(break_glass_model(event, next))
            .filter(Column::Id.eq(event.id.as_str()))
            .filter(Column::Version.eq(as_i64(event.version)))
            .exec(&self.db)
            .await?;

        if result.rows_affected == 0 {
            BreakGlassStore::get(self, &event.id).await?;
            return Err(StoreError::ConcurrentModification {
                kind: "break-glass event",
                id: event.id.clone(),
            });
        }
        Ok(BreakGlassEvent {
            version: next,
            ..event.clone()
        })
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        break_glass_event::Entity::delete_by_id(id.to_string())
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn list_by_invoker(
        &self,
        invoker: &str,
        limit: usize,
    ) -> Result<Vec<BreakGlassEvent>, StoreError> {
        use break_glass_event::{Column, Entity};

        events(
            Entity::find()
                .filter(Column::Invoker.eq(invoker))
                .order_by_desc(Column::CreatedAt)
                .limit(effective_limit(limit) as u64)
                .all(&self.db)
                .await?,
        )
    }

    async fn list_by_status(
        &self,
        status: BreakGlassStatus,
        limit: usize,
    ) -> Result<Vec<BreakGlassEvent>, StoreError> {
        use break_glass_event::{Column, Entity};

        events(
            Entity::find()
                .filter(Column::Status.eq(status.as_str()))
                .order_by_desc(Column::CreatedAt)
                .limit(effective_limit(limit) as u64)
                .all(&self.db)
                .await?,
        )
    }

    async fn list_past_expiry(
        &self,
        status: BreakGlassStatus,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<BreakGlassEvent>, StoreError> {
        use break_glass_event::{Column, Entity};

        events(
            Entity::find()
                .filter(Column::Status.eq(status.as_str()))
                .filter(Column::ExpiresAt.lte(now.timestamp()))
                .order_by_asc(Column::ExpiresAt)
                .limit(effective_limit(limit) as u64)
                .all(&self.db)
                .await?,
        )
    }

    async fn list_by_profile(
        &self,
        profile: &str,
        limit: usize,
    ) -> Result<Vec<BreakGlassEvent>, StoreError> {
        use break_glass_event::{Column, Entity};

        events(
            Entity::find()
                .filter(Column::Profile.eq(profile))
                .order_by_desc(Column::CreatedAt)
                .limit(effective_limit(limit) as u64)
                .all(&self.db)
                .await?,
        )
    }

    async fn find_active(
        &self,
        invoker: &str,
        profile: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<BreakGlassEvent>, StoreError> {
        use break_glass_event::{Column, Entity};

        let candidates = events(
            Entity::find()
                .filter(Column::Invoker.eq(invoker))
                .filter(Column::Profile.eq(profile))
                .filter(Column::Status.eq(BreakGlassStatus::Active.as_str()))
                .filter(Column::ExpiresAt.gte(now.timestamp()))
                .order_by_desc(Column::ExpiresAt)
                .all(&self.db)
                .await?,
        )?;
        Ok(candidates.into_iter().find(|e| e.is_active(now)))
    }
}

// ---------------------------------------------------------------------------
// Server sessions
// ---------------------------------------------------------------------------

impl TryFrom<server_session::Model> for ServerSession {
    type Error = StoreError;

    fn try_from(m: server_session::Model) -> Result<Self, StoreError> {
        let status = SessionStatus::parse(&m.status)
            .ok_or_else(|| StoreError::Corrupt(format!("session status `{}`", m.status)))?;
        Ok(ServerSession {
            started_at: ts(m.started_at, "started_at")?,
            last_access_at: ts(m.last_access_at, "last_access_at")?,
            expires_at: ts(m.expires_at, "expires_at")?,
            updated_at: ts(m.updated_at, "updated_at")?,
            request_count: count(m.request_count, "request_count")?,
            version: count(m.version, "version")?,
            id: m.id,
            user: m.user,
            profile: m.profile,
            status,
            server_instance_id: m.server_instance_id,
            source_identity: m.source_identity,
            device_id: m.device_id,
            revoked_by: m.revoked_by,
            revoked_reason: m.revoked_reason,
        })
    }
}

fn session_model(s: &ServerSession, version: u64) -> server_session::ActiveModel {
    server_session::ActiveModel {
        id: Set(s.id.clone()),
        user: Set(s.user.clone()),
        profile: Set(s.profile.clone()),
        status: Set(s.status.as_str().to_string()),
        started_at: Set(s.started_at.timestamp()),
        last_access_at: Set(s.last_access_at.timestamp()),
        expires_at: Set(s.expires_at.timestamp()),
        updated_at: Set(s.updated_at.timestamp()),
        request_count: Set(as_i64(s.request_count)),
        server_instance_id: Set(s.server_instance_id.clone()),
        source_identity: Set(s.source_identity.clone()),
        device_id: Set(s.device_id.clone()),
        revoked_by: Set(s.revoked_by.clone()),
        revoked_reason: Set(s.revoked_reason.clone()),
        version: Set(as_i64(version)),
    }
}

fn sessions(models: Vec<server_session::Model>) -> Result<Vec<ServerSession>, StoreError> {
    models.into_iter().map(ServerSession::try_from).collect()
}

#[async_trait]
impl SessionStore for SqlStore {
    async fn create(&self, session: &ServerSession) -> Result<(), StoreError> {
        use server_session::Entity;

        if Entity::find_by_id(session.id.clone()).one(&self.db).await?.is_some() {
            return Err(StoreError::AlreadyExists {
                kind: "server session",
                id: session.id.clone(),
            });
        }
        session_model(session, session.version).insert(&self.db).await?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<ServerSession, StoreError> {
        server_session::Entity::find_by_id(id.to_string())
            .one(&self.db)
            .await?
            .ok_or_else(|| StoreError::SessionNotFound(id.to_string()))?
            .try_into()
    }

    async fn update(&self, session: &ServerSession) -> Result<ServerSession, StoreError> {
        use server_session::{Column, Entity};

        let next = session.version + 1;
        // request_count and last_access_at belong to touch(); a versioned
        // update must not roll them back.
        let mut model = session_model(session, next);
        model.request_count = sea_orm::ActiveValue::NotSet;
        model.last_access_at = sea_orm::ActiveValue::NotSet;

        let result = Entity::update_many()
            .set(model)
            .filter(Column::Id.eq(session.id.as_str()))
            .filter(Column::Version.eq(as_i64(session.version)))
            .exec(&self.db)
            .await?;

        if result.rows_affected == 0 {
            SessionStore::get(self, &session.id).await?;
            return Err(StoreError::ConcurrentModification {
                kind: "server session",
                id: session.id.clone(),
            });
        }
        SessionStore::get(self, &session.id).await
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        server_session::Entity::delete_by_id(id.to_string())
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn list_by_user(
        &self,
        user: &str,
        limit: usize,
    ) -> Result<Vec<ServerSession>, StoreError> {
        use server_session::{Column, Entity};

        sessions(
            Entity::find()
                .filter(Column::User.eq(user))
                .order_by_desc(Column::StartedAt)
                .limit(effective_limit(limit) as u64)
                .all(&self.db)
                .await?,
        )
    }

    async fn list_by_status(
        &self,
        status: SessionStatus,
        limit: usize,
    ) -> Result<Vec<ServerSession>, StoreError> {
        use server_session::{Column, Entity};

        sessions(
            Entity::find()
                .filter(Column::Status.eq(status.as_str()))
                .order_by_desc(Column::StartedAt)
                .limit(effective_limit(limit) as u64)
                .all(&self.db)
                .await?,
        )
    }

    async fn list_past_expiry(
        &self,
        status: SessionStatus,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ServerSession>, StoreError> {
        use server_session::{Column, Entity};

        sessions(
            Entity::find()
                .filter(Column::Status.eq(status.as_str()))
                .filter(Column::ExpiresAt.lte(now.timestamp()))
                .order_by_asc(Column::ExpiresAt)
                .limit(effective_limit(limit) as u64)
                .all(&self.db)
                .await?,
        )
    }

    async fn list_by_profile(
        &self,
        profile: &str,
        limit: usize,
    ) -> Result<Vec<ServerSession>, StoreError> {
        use server_session::{Column, Entity};

        sessions(
            Entity::find()
                .filter(Column::Profile.eq(profile))
                .order_by_desc(Column::StartedAt)
                .limit(effective_limit(limit) as u64)
                .all(&self.db)
                .await?,
        )
    }

    async fn list_by_time_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ServerSession>, StoreError> {
        use server_session::{Column, Entity};

        sessions(
            Entity::find()
                .filter(Column::StartedAt.gte(start.timestamp()))
                .filter(Column::StartedAt.lt(end.timestamp()))
                .order_by_desc(Column::StartedAt)
                .limit(effective_limit(limit) as u64)
                .all(&self.db)
                .await?,
        )
    }

    async fn list_by_device_id(
        &self,
        device_id: &str,
        limit: usize,
    ) -> Result<Vec<ServerSession>, StoreError> {
        use server_session::{Column, Entity};

        sessions(
            Entity::find()
                .filter(Column::DeviceId.eq(device_id))
                .order_by_desc(Column::StartedAt)
                .limit(effective_limit(limit) as u64)
                .all(&self.db)
                .await?,
        )
    }

    async fn find_active_by_server_instance(
        &self,
        server_instance_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ServerSession>, StoreError> {
        use server_session::{Column, Entity};

        let candidates = sessions(
            Entity::find()
                .filter(Column::ServerInstanceId.eq(server_instance_id))
                .filter(Column::Status.eq(SessionStatus::Active.as_str()))
                .filter(Column::ExpiresAt.gte(now.timestamp()))
                .order_by_desc(Column::StartedAt)
                .all(&self.db)
                .await?,
        )?;
        Ok(candidates.into_iter().find(|s| s.is_active(now)))
    }

    async fn touch(&self, id: &str, now: DateTime<Utc>) -> Result<ServerSession, StoreError> {
        use server_session::{Column, Entity};

        let result = Entity::update_many()
            .col_expr(Column::RequestCount, Expr::col(Column::RequestCount).add(1))
            .col_expr(Column::LastAccessAt, Expr::value(now.timestamp()))
            .filter(Column::Id.eq(id))
            .filter(Column::Status.eq(SessionStatus::Active.as_str()))
            .filter(Column::ExpiresAt.gt(now.timestamp()))
            .exec(&self.db)
            .await?;

        let session = SessionStore::get(self, id).await?;
        if result.rows_affected == 0 {
            return Err(StoreError::ConditionFailed {
                kind: "server session",
                id: id.to_string(),
            });
        }
        Ok(session)
    }
}
