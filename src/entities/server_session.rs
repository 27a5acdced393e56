use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "server_sessions")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub user: String,
    pub profile: String,
    pub status: String, // "active" | "revoked" | "expired"
    pub started_at: i64,
    pub last_access_at: i64,
    pub expires_at: i64,
    pub updated_at: i64,
    pub request_count: i64,
    pub server_instance_id: String,
    pub source_identity: String,
    pub device_id: Option<String>,
    pub revoked_by: Option<String>,
    pub revoked_reason: Option<String>,
    pub version: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
