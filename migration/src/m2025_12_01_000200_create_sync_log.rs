//! Migration to create the append-only sync_log table.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(SyncLog::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(SyncLog::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(SyncLog::JobId).integer().null())
                    .col(ColumnDef::new(SyncLog::EntityType).text().not_null())
                    .col(ColumnDef::new(SyncLog::EntityId).text().not_null())
                    .col(ColumnDef::new(SyncLog::Action).text().not_null())
                    .col(ColumnDef::new(SyncLog::TargetService).text().not_null())
                    .col(ColumnDef::new(SyncLog::Status).text().not_null())
                    .col(
                        ColumnDef::new(SyncLog::Attempt)
                            .integer()
                            .not_null()
                            .default(1),
                    )
                    .col(
                        ColumnDef::new(SyncLog::DurationMs)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(SyncLog::ErrorKind).text().null())
                    .col(ColumnDef::new(SyncLog::ErrorMessage).text().null())
                    .col(
                        ColumnDef::new(SyncLog::SyncedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_sync_log_job_id")
                    .table(SyncLog::Table)
                    .col(SyncLog::JobId)
                    .to_owned(),
            )
            .await?;

        // Health window scans
        manager
            .create_index(
                Index::create()
                    .name("idx_sync_log_status_synced_at")
                    .table(SyncLog::Table)
                    .col(SyncLog::Status)
                    .col(SyncLog::SyncedAt)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_sync_log_entity")
                    .table(SyncLog::Table)
                    .col(SyncLog::EntityType)
                    .col(SyncLog::EntityId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(SyncLog::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum SyncLog {
    Table,
    Id,
    JobId,
    EntityType,
    EntityId,
    Action,
    TargetService,
    Status,
    Attempt,
    DurationMs,
    ErrorKind,
    ErrorMessage,
    SyncedAt,
}
