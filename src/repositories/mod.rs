//! # Repository Layer
//!
//! Store interfaces injected into the dispatcher, orchestrator and health
//! aggregator, and their SeaORM implementations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::DbErr;
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use utoipa::ToSchema;

use crate::adapters::SyncError;
use crate::models::external_id_mapping::Model as MappingModel;
use crate::models::sync_job::Model as JobModel;
use crate::models::sync_log::Model as LogModel;
use crate::models::{EntityType, JobStatus, LogStatus, Priority, SyncAction, TargetService};

pub mod external_id_mapping;
pub mod queue;
pub mod sync_log;

pub use external_id_mapping::SeaOrmMappingStore;
pub use queue::SeaOrmQueueStore;
pub use sync_log::SeaOrmLogStore;

/// Errors raised by the queue store.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("invalid sync job: {0}")]
    InvalidEntity(String),
    #[error("sync job {0} not found")]
    JobNotFound(i32),
    #[error("sync job {job_id} is {status}")]
    InvalidTransition { job_id: i32, status: JobStatus },
    /// The lease expired and the job was released or claimed by another worker.
    #[error("lease on sync job {job_id} is no longer held")]
    LeaseLost { job_id: i32 },
    #[error("{0} has no configured adapter")]
    ServiceNotConfigured(TargetService),
    #[error(transparent)]
    Database(#[from] DbErr),
}

/// Job as handed to [`QueueStore::enqueue`].
#[derive(Debug, Clone, PartialEq)]
pub struct NewSyncJob {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub action: SyncAction,
    pub target_service: TargetService,
    pub priority: Priority,
    pub payload: JsonValue,
}

impl NewSyncJob {
    pub fn new(
        entity_type: EntityType,
        entity_id: impl Into<String>,
        action: SyncAction,
        target_service: TargetService,
        payload: JsonValue,
    ) -> Self {
        Self {
            entity_type,
            entity_id: entity_id.into(),
            action,
            target_service,
            priority: Priority::default(),
            payload,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// Filter for [`QueueStore::list`]. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub entity_type: Option<EntityType>,
    pub entity_id: Option<String>,
    pub target_service: Option<TargetService>,
    pub limit: Option<u64>,
}

/// Number of jobs in each status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, ToSchema)]
pub struct QueueCounts {
    pub pending: u64,
    pub processing: u64,
    pub success: u64,
    pub failed: u64,
    pub dead: u64,
    pub cancelled: u64,
}

impl QueueCounts {
    pub fn add(&mut self, status: JobStatus, count: u64) {
        let slot = match status {
            JobStatus::Pending => &mut self.pending,
            JobStatus::Processing => &mut self.processing,
            JobStatus::Success => &mut self.success,
            JobStatus::Failed => &mut self.failed,
            JobStatus::Dead => &mut self.dead,
            JobStatus::Cancelled => &mut self.cancelled,
        };
        *slot += count;
    }
}

/// Logged attempts inside a time window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, ToSchema)]
pub struct WindowCounts {
    pub success: u64,
    pub errors: u64,
}

/// One attempt to record in the sync log.
#[derive(Debug, Clone, PartialEq)]
pub struct NewLogEntry {
    pub job_id: Option<i32>,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub action: SyncAction,
    pub target_service: TargetService,
    pub status: LogStatus,
    pub attempt: i32,
    pub duration_ms: i64,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
}

impl NewLogEntry {
    /// Successful attempt of `job`, which has already been counted.
    pub fn success(job: &JobModel, attempt: i32, duration_ms: i64) -> Self {
        Self {
            job_id: Some(job.id),
            entity_type: job.entity_type,
            entity_id: job.entity_id.clone(),
            action: job.action,
            target_service: job.target_service,
            status: LogStatus::Success,
            attempt,
            duration_ms,
            error_kind: None,
            error_message: None,
        }
    }

    /// Failed attempt of `job`. The error is given the job's context first so
    /// the row reads on its own.
    pub fn failure(job: &JobModel, attempt: i32, error: &SyncError, duration_ms: i64) -> Self {
        let error = error.clone().with_context(
            job.target_service,
            job.entity_type,
            job.entity_id.clone(),
        );
        Self {
            status: LogStatus::Error,
            error_kind: Some(error.kind.as_str().to_string()),
            error_message: Some(error.to_string()),
            ..Self::success(job, attempt, duration_ms)
        }
    }
}

/// Mapping as handed to [`MappingStore::insert`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMapping {
    pub source_system: TargetService,
    pub source_id: String,
    pub entity_type: EntityType,
    pub internal_id: String,
}

/// Durable job queue. Only the dispatcher moves jobs between statuses.
///
/// Completion calls carry the lease owner stamped by the lease that handed the
/// job out; they fail with [`QueueError::LeaseLost`] once that lease is gone.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Persist a new pending job, due immediately.
    async fn enqueue(&self, job: NewSyncJob) -> Result<i32, QueueError>;

    /// Persist several jobs in one transaction: all of them or none.
    async fn enqueue_many(&self, jobs: Vec<NewSyncJob>) -> Result<Vec<i32>, QueueError>;

    /// Atomically claim up to `limit` due pending jobs targeting one of
    /// `services`, lowest priority value first, then oldest. No job is ever
    /// returned to two concurrent callers.
    async fn lease_batch_for(
        &self,
        limit: u64,
        now: DateTime<Utc>,
        services: &[TargetService],
    ) -> Result<Vec<JobModel>, QueueError>;

    /// [`QueueStore::lease_batch_for`] over every service.
    async fn lease_batch(
        &self,
        limit: u64,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobModel>, QueueError> {
        self.lease_batch_for(limit, now, &TargetService::ALL).await
    }

    /// Push the lease expiry of a held job out to `now` plus the lease length.
    async fn renew_lease(
        &self,
        job_id: i32,
        lease_owner: &str,
        now: DateTime<Utc>,
    ) -> Result<JobModel, QueueError>;

    async fn mark_success(
        &self,
        job_id: i32,
        lease_owner: &str,
        duration_ms: i64,
        now: DateTime<Utc>,
    ) -> Result<JobModel, QueueError>;

    /// Record a failed attempt and decide between retry, dead-lettering and
    /// terminal failure from the error kind and the remaining attempt budget.
    async fn mark_failure(
        &self,
        job_id: i32,
        lease_owner: &str,
        error: &SyncError,
        duration_ms: i64,
        now: DateTime<Utc>,
    ) -> Result<JobModel, QueueError>;

    /// Return abandoned `processing` jobs to `pending`. Returns how many moved.
    async fn release_expired_leases(&self, now: DateTime<Utc>) -> Result<u64, QueueError>;

    async fn cancel(&self, job_id: i32) -> Result<JobModel, QueueError>;

    async fn get(&self, job_id: i32) -> Result<Option<JobModel>, QueueError>;

    async fn list(&self, filter: &JobFilter) -> Result<Vec<JobModel>, QueueError>;

    async fn counts(&self) -> Result<QueueCounts, QueueError>;
}

/// Append-only attempt log.
#[async_trait]
pub trait LogStore: Send + Sync {
    async fn append(
        &self,
        entry: NewLogEntry,
        now: DateTime<Utc>,
    ) -> Result<LogModel, DbErr>;

    async fn list_for_job(&self, job_id: i32) -> Result<Vec<LogModel>, DbErr>;

    /// Success and error counts for attempts logged at or after `since`.
    /// Configuration errors are not attempt failures and are left out.
    async fn window_counts(&self, since: DateTime<Utc>) -> Result<WindowCounts, DbErr>;

    async fn last_successful_sync(&self) -> Result<Option<DateTime<Utc>>, DbErr>;
}

/// Source-system id to internal entity lookups.
#[async_trait]
pub trait MappingStore: Send + Sync {
    async fn find(
        &self,
        source_system: TargetService,
        source_id: &str,
    ) -> Result<Option<MappingModel>, DbErr>;

    /// Insert a mapping. If one already exists for the same source key, the
    /// existing row is returned unchanged.
    async fn insert(&self, mapping: NewMapping) -> Result<MappingModel, DbErr>;
}

/// Timestamps are stored with an explicit UTC offset.
pub(crate) fn to_db_time(value: DateTime<Utc>) -> sea_orm::prelude::DateTimeWithTimeZone {
    value.fixed_offset()
}
