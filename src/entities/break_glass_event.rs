use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "break_glass_events")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub invoker: String,
    pub profile: String,
    pub reason_code: String,
    pub justification: String,
    pub duration_secs: i64,
    pub status: String, // "active" | "closed" | "expired"
    pub created_at: i64,
    pub updated_at: i64,
    pub expires_at: i64,
    pub closed_by: Option<String>,
    pub closed_reason: Option<String>,
    pub request_id: Option<String>,
    pub version: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
