//! SyncLog entity model
//!
//! Append-only audit trail with one row per dispatch attempt. Rows are never
//! updated or deleted.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde::Serialize;

use super::types::{EntityType, LogStatus, SyncAction, TargetService};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize)]
#[sea_orm(table_name = "sync_log")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,

    /// Owning queue job; empty for attempts made outside the queue
    pub job_id: Option<i32>,

    pub entity_type: EntityType,

    pub entity_id: String,

    pub action: SyncAction,

    pub target_service: TargetService,

    pub status: LogStatus,

    /// Attempt number this row records (1-based)
    pub attempt: i32,

    pub duration_ms: i64,

    /// Classification of the failure (`transient`, `rate_limited`, ...)
    pub error_kind: Option<String>,

    pub error_message: Option<String>,

    pub synced_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
