//! # Sync Log Repository
//!
//! Append-only attempt log. Rows are inserted and read, never updated.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, ConnectionTrait, DatabaseConnection, DbErr,
    EntityTrait, PaginatorTrait, QueryFilter, QueryOrder, Set,
};

use super::{LogStore, NewLogEntry, WindowCounts, to_db_time};
use crate::adapters::SyncErrorKind;
use crate::models::LogStatus;
use crate::models::sync_log::{ActiveModel, Column, Entity, Model};

/// Insert one entry using any connection or open transaction.
pub(crate) async fn insert_entry<C>(
    conn: &C,
    entry: NewLogEntry,
    now: DateTime<Utc>,
) -> Result<Model, DbErr>
where
    C: ConnectionTrait,
{
    ActiveModel {
        job_id: Set(entry.job_id),
        entity_type: Set(entry.entity_type),
        entity_id: Set(entry.entity_id),
        action: Set(entry.action),
        target_service: Set(entry.target_service),
        status: Set(entry.status),
        attempt: Set(entry.attempt),
        duration_ms: Set(entry.duration_ms),
        error_kind: Set(entry.error_kind),
        error_message: Set(entry.error_message),
        synced_at: Set(to_db_time(now)),
        ..Default::default()
    }
    .insert(conn)
    .await
}

#[derive(Debug, Clone)]
pub struct SeaOrmLogStore {
    db: DatabaseConnection,
}

impl SeaOrmLogStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }
}

#[async_trait]
impl LogStore for SeaOrmLogStore {
    async fn append(&self, entry: NewLogEntry, now: DateTime<Utc>) -> Result<Model, DbErr> {
        insert_entry(&self.db, entry, now).await
    }

    async fn list_for_job(&self, job_id: i32) -> Result<Vec<Model>, DbErr> {
        Entity::find()
            .filter(Column::JobId.eq(job_id))
            .order_by_asc(Column::Id)
            .all(&self.db)
            .await
    }

    async fn window_counts(&self, since: DateTime<Utc>) -> Result<WindowCounts, DbErr> {
        let since = to_db_time(since);
        let success = Entity::find()
            .filter(Column::Status.eq(LogStatus::Success))
            .filter(Column::SyncedAt.gte(since))
            .count(&self.db)
            .await?;
        let errors = Entity::find()
            .filter(Column::Status.eq(LogStatus::Error))
            .filter(Column::SyncedAt.gte(since))
            .filter(
                Condition::any()
                    .add(Column::ErrorKind.is_null())
                    .add(Column::ErrorKind.ne(SyncErrorKind::Configuration.as_str())),
            )
            .count(&self.db)
            .await?;

        Ok(WindowCounts { success, errors })
    }

    async fn last_successful_sync(&self) -> Result<Option<DateTime<Utc>>, DbErr> {
        let latest = Entity::find()
            .filter(Column::Status.eq(LogStatus::Success))
            .order_by_desc(Column::SyncedAt)
            .one(&self.db)
            .await?;

        Ok(latest.map(|row| row.synced_at.with_timezone(&Utc)))
    }
}
