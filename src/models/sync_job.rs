//! SyncJob entity model
//!
//! SeaORM entity for the `sync_queue` table. A row is one unit of work pushing
//! a business entity change to a single external service.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde::Serialize;
use serde_json::Value as JsonValue;

use super::types::{EntityType, JobStatus, Priority, SyncAction, TargetService};

/// Queue row. Only the dispatcher moves a job between statuses.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize)]
#[sea_orm(table_name = "sync_queue")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,

    pub entity_type: EntityType,

    /// Identifier owned by the business store that enqueued the job
    pub entity_id: String,

    pub action: SyncAction,

    pub target_service: TargetService,

    /// Lower values are leased first
    pub priority: i16,

    pub status: JobStatus,

    /// Snapshot of the entity taken at enqueue time
    #[sea_orm(column_type = "JsonBinary")]
    pub payload: JsonValue,

    pub attempt_count: i32,

    /// Token of the dispatcher call currently holding the job
    pub lease_owner: Option<String>,

    pub lease_expires_at: Option<DateTimeWithTimeZone>,

    pub last_attempted_at: Option<DateTimeWithTimeZone>,

    pub next_attempt_at: DateTimeWithTimeZone,

    pub error_message: Option<String>,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn priority(&self) -> Priority {
        Priority(self.priority)
    }

    /// Key sent with every delivery of this job. Redeliveries share it; two
    /// jobs for the same entity never do.
    pub fn idempotency_key(&self) -> String {
        format!("{}:job-{}", self.target_service, self.id)
    }
}
