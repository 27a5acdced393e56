use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "access_requests")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub requester: String,
    pub profile: String,
    pub justification: String,
    pub duration_secs: i64,
    pub status: String, // "pending" | "approved" | "denied" | "expired" | "cancelled"
    pub created_at: i64,
    pub updated_at: i64,
    pub expires_at: i64,
    pub approver: Option<String>,
    pub approver_comment: Option<String>,
    pub version: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
