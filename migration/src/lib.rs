//! Database migrations for the sync engine.
//!
//! This module contains all database migrations using SeaORM Migration.

pub use sea_orm_migration::prelude::*;

mod m2025_12_01_000100_create_sync_queue;
mod m2025_12_01_000200_create_sync_log;
mod m2025_12_01_000300_create_external_id_mappings;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m2025_12_01_000100_create_sync_queue::Migration),
            Box::new(m2025_12_01_000200_create_sync_log::Migration),
            Box::new(m2025_12_01_000300_create_external_id_mappings::Migration),
        ]
    }
}
