//! Test utilities shared by the integration suites.
//!
//! In-memory SQLite databases with migrations applied, store constructors and
//! registries of scripted adapters.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use migration::{Migrator, MigratorTrait};
use sea_orm::{Database, DatabaseConnection};
use serde_json::json;
use sync_engine::adapters::{AdapterRegistry, ScriptedAdapter};
use sync_engine::config::{DispatcherConfig, RateLimitConfig};
use sync_engine::models::{EntityType, Priority, SyncAction, TargetService};
use sync_engine::repositories::{NewSyncJob, SeaOrmQueueStore};
use sync_engine::retry::RetryPolicy;

/// Sets up an in-memory SQLite database with all migrations applied.
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let db = Database::connect("sqlite::memory:").await?;
    Migrator::up(&db, None).await?;
    Ok(db)
}

pub fn test_retry_policy() -> RetryPolicy {
    RetryPolicy {
        base_seconds: 10,
        max_seconds: 600,
        max_attempts: 3,
    }
}

pub fn queue_store(db: &DatabaseConnection) -> SeaOrmQueueStore {
    SeaOrmQueueStore::new(db.clone(), test_retry_policy(), Duration::from_secs(300))
}

pub fn dispatcher_config(pool_size: usize) -> DispatcherConfig {
    DispatcherConfig {
        pool_size,
        adapter_timeout_seconds: 5,
        ..Default::default()
    }
}

/// Limits high enough that no test job waits on a bucket.
pub fn generous_rate_limits() -> RateLimitConfig {
    RateLimitConfig {
        default_requests_per_minute: 60_000,
        service_overrides: BTreeMap::new(),
    }
}

/// Registry holding the given adapters.
pub fn registry_with(adapters: &[Arc<ScriptedAdapter>]) -> AdapterRegistry {
    let mut registry = AdapterRegistry::new();
    for adapter in adapters {
        registry.register(adapter.clone());
    }
    registry
}

pub fn project_job(entity_id: &str, service: TargetService, priority: i16) -> NewSyncJob {
    NewSyncJob::new(
        EntityType::Project,
        entity_id,
        SyncAction::Create,
        service,
        json!({ "name": format!("Project {entity_id}") }),
    )
    .with_priority(Priority(priority))
}
