//! Migration to create the sync_queue table.
//!
//! Each row is one pending or historical unit of work pushing a business entity
//! change to a single external service. Rows are never deleted.

use sea_orm_migration::prelude::*;
use sea_orm_migration::sea_orm::Statement;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(SyncQueue::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(SyncQueue::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(SyncQueue::EntityType).text().not_null())
                    .col(ColumnDef::new(SyncQueue::EntityId).text().not_null())
                    .col(ColumnDef::new(SyncQueue::Action).text().not_null())
                    .col(ColumnDef::new(SyncQueue::TargetService).text().not_null())
                    .col(
                        ColumnDef::new(SyncQueue::Priority)
                            .small_integer()
                            .not_null()
                            .default(5),
                    )
                    .col(
                        ColumnDef::new(SyncQueue::Status)
                            .text()
                            .not_null()
                            .default("pending"),
                    )
                    .col(ColumnDef::new(SyncQueue::Payload).json_binary().not_null())
                    .col(
                        ColumnDef::new(SyncQueue::AttemptCount)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(SyncQueue::LeaseOwner).text().null())
                    .col(
                        ColumnDef::new(SyncQueue::LeaseExpiresAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(SyncQueue::LastAttemptedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(SyncQueue::NextAttemptAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(ColumnDef::new(SyncQueue::ErrorMessage).text().null())
                    .col(
                        ColumnDef::new(SyncQueue::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(SyncQueue::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        // Lease scan: status + due time, then priority
        manager
            .get_connection()
            .execute(Statement::from_string(
                manager.get_database_backend(),
                "CREATE INDEX IF NOT EXISTS idx_sync_queue_status_next_attempt_priority ON sync_queue (status, next_attempt_at, priority)".to_string(),
            ))
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_sync_queue_status")
                    .table(SyncQueue::Table)
                    .col(SyncQueue::Status)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_sync_queue_entity")
                    .table(SyncQueue::Table)
                    .col(SyncQueue::EntityType)
                    .col(SyncQueue::EntityId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_sync_queue_target_service_status")
                    .table(SyncQueue::Table)
                    .col(SyncQueue::TargetService)
                    .col(SyncQueue::Status)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        for name in [
            "idx_sync_queue_status_next_attempt_priority",
            "idx_sync_queue_status",
            "idx_sync_queue_entity",
            "idx_sync_queue_target_service_status",
        ] {
            manager
                .drop_index(Index::drop().name(name).to_owned())
                .await?;
        }

        manager
            .drop_table(Table::drop().table(SyncQueue::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum SyncQueue {
    Table,
    Id,
    EntityType,
    EntityId,
    Action,
    TargetService,
    Priority,
    Status,
    Payload,
    AttemptCount,
    LeaseOwner,
    LeaseExpiresAt,
    LastAttemptedAt,
    NextAttemptAt,
    ErrorMessage,
    CreatedAt,
    UpdatedAt,
}
