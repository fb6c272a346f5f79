//! Migration to create the external_id_mappings table.
//!
//! A mapping records which internal entity a foreign record produced, e.g. the
//! project created from a QuoteWerks quote. The unique index is what makes
//! workflow re-runs idempotent.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(ExternalIdMappings::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ExternalIdMappings::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(ExternalIdMappings::SourceSystem)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ExternalIdMappings::SourceId)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ExternalIdMappings::EntityType)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ExternalIdMappings::InternalId)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ExternalIdMappings::CreatedAt)
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
                    .name("idx_external_id_mappings_source_unique")
                    .table(ExternalIdMappings::Table)
                    .col(ExternalIdMappings::SourceSystem)
                    .col(ExternalIdMappings::SourceId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(ExternalIdMappings::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum ExternalIdMappings {
    Table,
    Id,
    SourceSystem,
    SourceId,
    EntityType,
    InternalId,
    CreatedAt,
}
