//! # Sync Queue Repository
//!
//! SeaORM implementation of [`QueueStore`] over the `sync_queue` table.
//!
//! Leasing selects due rows (`FOR UPDATE SKIP LOCKED` where the backend
//! supports it) and claims them with an update guarded on `status = pending`,
//! both inside one transaction. Each lease call stamps its own owner token, so
//! a row whose guarded update was won by another caller is never returned.
//! Every completion writes the job row and its log entry in one transaction,
//! and only lands while the caller's lease owner is still on the row.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::sea_query::LockBehavior;
use sea_orm::{
    ColumnTrait, DatabaseConnection, DatabaseTransaction, EntityTrait,
    QueryFilter, QueryOrder, QuerySelect, Set, TransactionTrait, sea_query::LockType,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::sync_log::insert_entry;
use super::{
    JobFilter, NewLogEntry, NewSyncJob, QueueCounts, QueueError, QueueStore, to_db_time,
};
use crate::adapters::{SyncError, SyncErrorKind};
use crate::config::AppConfig;
use crate::models::{JobStatus, TargetService};
use crate::models::sync_job::{ActiveModel, Column, Entity, Model};
use crate::retry::RetryPolicy;

#[derive(Debug, Clone)]
pub struct SeaOrmQueueStore {
    db: DatabaseConnection,
    retry: RetryPolicy,
    lease: Duration,
}

impl SeaOrmQueueStore {
    pub fn new(db: DatabaseConnection, retry: RetryPolicy, lease: Duration) -> Self {
        Self { db, retry, lease }
    }

    pub fn from_config(db: DatabaseConnection, config: &AppConfig) -> Self {
        Self::new(
            db,
            config.retry,
            Duration::from_secs(config.dispatcher.lease_seconds),
        )
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Load a job the caller still holds: `processing` under `lease_owner`.
    async fn held_job(
        txn: &DatabaseTransaction,
        job_id: i32,
        lease_owner: &str,
    ) -> Result<Model, QueueError> {
        let job = Entity::find_by_id(job_id)
            .one(txn)
            .await?
            .ok_or(QueueError::JobNotFound(job_id))?;

        match (job.status, job.lease_owner.as_deref()) {
            (JobStatus::Processing, Some(owner)) if owner == lease_owner => Ok(job),
            (JobStatus::Pending | JobStatus::Processing, _) => Err(QueueError::LeaseLost { job_id }),
            (status, _) => Err(QueueError::InvalidTransition { job_id, status }),
        }
    }

    /// Apply `changes` to a job only while it is still in `expected` status
    /// and, when `held_by` is set, still leased to that owner.
    async fn guarded_update(
        txn: &DatabaseTransaction,
        job: &Model,
        expected: JobStatus,
        held_by: Option<&str>,
        changes: ActiveModel,
    ) -> Result<Model, QueueError> {
        let mut update = Entity::update_many()
            .set(changes)
            .filter(Column::Id.eq(job.id))
            .filter(Column::Status.eq(expected));
        if let Some(owner) = held_by {
            update = update.filter(Column::LeaseOwner.eq(owner));
        }
        let result = update.exec(txn).await?;

        if result.rows_affected == 0 {
            return Err(match held_by {
                Some(_) => QueueError::LeaseLost { job_id: job.id },
                None => QueueError::InvalidTransition {
                    job_id: job.id,
                    status: job.status,
                },
            });
        }

        Entity::find_by_id(job.id)
            .one(txn)
            .await?
            .ok_or(QueueError::JobNotFound(job.id))
    }

    fn lease_expiry(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let lease = chrono::Duration::from_std(self.lease).unwrap_or(chrono::Duration::MAX);
        now.checked_add_signed(lease).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    fn new_row(job: NewSyncJob, now: DateTime<Utc>) -> Result<ActiveModel, QueueError> {
        if job.entity_id.trim().is_empty() {
            return Err(QueueError::InvalidEntity(
                "entity_id must not be empty".to_string(),
            ));
        }

        let now = to_db_time(now);
        Ok(ActiveModel {
            entity_type: Set(job.entity_type),
            entity_id: Set(job.entity_id),
            action: Set(job.action),
            target_service: Set(job.target_service),
            priority: Set(job.priority.0),
            status: Set(JobStatus::Pending),
            payload: Set(job.payload),
            attempt_count: Set(0),
            lease_owner: Set(None),
            lease_expires_at: Set(None),
            last_attempted_at: Set(None),
            next_attempt_at: Set(now),
            error_message: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        })
    }

    fn retry_at(&self, error: &SyncError, attempt: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        let delay = self.retry.delay_for(error, attempt);
        let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
        now.checked_add_signed(delay)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

#[async_trait]
impl QueueStore for SeaOrmQueueStore {
    async fn enqueue(&self, job: NewSyncJob) -> Result<i32, QueueError> {
        let priority = job.priority;
        let model = Self::new_row(job, Utc::now())?;
        let job_id = Entity::insert(model).exec(&self.db).await?.last_insert_id;

        debug!(job_id, priority = priority.0, "Sync job enqueued");
        Ok(job_id)
    }

    async fn enqueue_many(&self, jobs: Vec<NewSyncJob>) -> Result<Vec<i32>, QueueError> {
        let now = Utc::now();
        let rows = jobs
            .into_iter()
            .map(|job| Self::new_row(job, now))
            .collect::<Result<Vec<_>, _>>()?;

        let txn = self.db.begin().await?;
        let mut ids = Vec::with_capacity(rows.len());
        for row in rows {
            ids.push(Entity::insert(row).exec(&txn).await?.last_insert_id);
        }
        txn.commit().await?;

        debug!(job_ids = ?ids, "Sync jobs enqueued");
        Ok(ids)
    }

    async fn lease_batch_for(
        &self,
        limit: u64,
        now: DateTime<Utc>,
        services: &[TargetService],
    ) -> Result<Vec<Model>, QueueError> {
        if limit == 0 || services.is_empty() {
            return Ok(Vec::new());
        }

        let owner = Uuid::new_v4().to_string();
        let expires_at = self.lease_expiry(now);
        let now_db = to_db_time(now);

        let txn = self.db.begin().await?;

        let eligible: Vec<i32> = Entity::find()
            .select_only()
            .column(Column::Id)
            .filter(Column::Status.eq(JobStatus::Pending))
            .filter(Column::NextAttemptAt.lte(now_db))
            .filter(Column::TargetService.is_in(services.iter().copied()))
            .order_by_asc(Column::Priority)
            .order_by_asc(Column::CreatedAt)
            .order_by_asc(Column::Id)
            .limit(limit)
            .lock_with_behavior(LockType::Update, LockBehavior::SkipLocked)
            .into_tuple::<i32>()
            .all(&txn)
            .await?;

        if eligible.is_empty() {
            txn.commit().await?;
            return Ok(Vec::new());
        }

        let claim = ActiveModel {
            status: Set(JobStatus::Processing),
            lease_owner: Set(Some(owner.clone())),
            lease_expires_at: Set(Some(to_db_time(expires_at))),
            updated_at: Set(now_db),
            ..Default::default()
        };
        let claimed = Entity::update_many()
            .set(claim)
            .filter(Column::Id.is_in(eligible))
            .filter(Column::Status.eq(JobStatus::Pending)) // lost races update nothing
            .exec(&txn)
            .await?;

        let jobs = if claimed.rows_affected > 0 {
            Entity::find()
                .filter(Column::LeaseOwner.eq(owner.as_str()))
                .filter(Column::Status.eq(JobStatus::Processing))
                .order_by_asc(Column::Priority)
                .order_by_asc(Column::CreatedAt)
                .order_by_asc(Column::Id)
                .all(&txn)
                .await?
        } else {
            Vec::new()
        };

        txn.commit().await?;

        debug!(leased = jobs.len(), lease_owner = %owner, "Leased sync jobs");
        Ok(jobs)
    }

    async fn renew_lease(
        &self,
        job_id: i32,
        lease_owner: &str,
        now: DateTime<Utc>,
    ) -> Result<Model, QueueError> {
        let expires_at = self.lease_expiry(now);
        let txn = self.db.begin().await?;

        let job = Self::held_job(&txn, job_id, lease_owner).await?;
        let changes = ActiveModel {
            lease_expires_at: Set(Some(to_db_time(expires_at))),
            updated_at: Set(to_db_time(now)),
            ..Default::default()
        };
        let renewed =
            Self::guarded_update(&txn, &job, JobStatus::Processing, Some(lease_owner), changes)
                .await?;

        txn.commit().await?;
        debug!(job_id, lease_expires_at = %expires_at, "Sync job lease renewed");
        Ok(renewed)
    }

    async fn mark_success(
        &self,
        job_id: i32,
        lease_owner: &str,
        duration_ms: i64,
        now: DateTime<Utc>,
    ) -> Result<Model, QueueError> {
        let now_db = to_db_time(now);
        let txn = self.db.begin().await?;

        let job = Self::held_job(&txn, job_id, lease_owner).await?;
        let attempt = job.attempt_count + 1;

        let changes = ActiveModel {
            status: Set(JobStatus::Success),
            attempt_count: Set(attempt),
            lease_owner: Set(None),
            lease_expires_at: Set(None),
            last_attempted_at: Set(Some(now_db)),
            error_message: Set(None),
            updated_at: Set(now_db),
            ..Default::default()
        };
        let updated =
            Self::guarded_update(&txn, &job, JobStatus::Processing, Some(lease_owner), changes)
                .await?;
        insert_entry(
            &txn,
            NewLogEntry::success(&updated, attempt, duration_ms),
            now,
        )
        .await?;

        txn.commit().await?;
        Ok(updated)
    }

    async fn mark_failure(
        &self,
        job_id: i32,
        lease_owner: &str,
        error: &SyncError,
        duration_ms: i64,
        now: DateTime<Utc>,
    ) -> Result<Model, QueueError> {
        let now_db = to_db_time(now);
        let txn = self.db.begin().await?;

        let job = Self::held_job(&txn, job_id, lease_owner).await?;
        let attempt = job.attempt_count + 1;
        let attempts = u32::try_from(attempt).unwrap_or(u32::MAX);

        let (status, next_attempt_at) = match error.kind {
            SyncErrorKind::Configuration => (JobStatus::Failed, job.next_attempt_at),
            SyncErrorKind::Permanent => (JobStatus::Dead, job.next_attempt_at),
            _ if self.retry.has_budget(attempts) => (
                JobStatus::Pending,
                to_db_time(self.retry_at(error, attempts, now)),
            ),
            _ => (JobStatus::Dead, job.next_attempt_at),
        };

        let described = error.clone().with_context(
            job.target_service,
            job.entity_type,
            job.entity_id.clone(),
        );
        let changes = ActiveModel {
            status: Set(status),
            attempt_count: Set(attempt),
            lease_owner: Set(None),
            lease_expires_at: Set(None),
            last_attempted_at: Set(Some(now_db)),
            next_attempt_at: Set(next_attempt_at),
            error_message: Set(Some(described.to_string())),
            updated_at: Set(now_db),
            ..Default::default()
        };
        let updated =
            Self::guarded_update(&txn, &job, JobStatus::Processing, Some(lease_owner), changes)
                .await?;
        insert_entry(
            &txn,
            NewLogEntry::failure(&updated, attempt, error, duration_ms),
            now,
        )
        .await?;

        txn.commit().await?;

        match status {
            JobStatus::Pending => debug!(
                job_id,
                attempt,
                next_attempt_at = %next_attempt_at,
                error_kind = error.kind.as_str(),
                "Sync job scheduled for retry"
            ),
            _ => warn!(
                job_id,
                attempt,
                status = %status,
                error_kind = error.kind.as_str(),
                "Sync job will not be retried"
            ),
        }

        Ok(updated)
    }

    async fn release_expired_leases(&self, now: DateTime<Utc>) -> Result<u64, QueueError> {
        let now_db = to_db_time(now);
        let changes = ActiveModel {
            status: Set(JobStatus::Pending),
            lease_owner: Set(None),
            lease_expires_at: Set(None),
            updated_at: Set(now_db),
            ..Default::default()
        };

        let result = Entity::update_many()
            .set(changes)
            .filter(Column::Status.eq(JobStatus::Processing))
            .filter(Column::LeaseExpiresAt.lte(now_db))
            .exec(&self.db)
            .await?;

        if result.rows_affected > 0 {
            info!(
                released = result.rows_affected,
                "Released expired sync job leases"
            );
        }
        Ok(result.rows_affected)
    }

    async fn cancel(&self, job_id: i32) -> Result<Model, QueueError> {
        let txn = self.db.begin().await?;
        let job = Entity::find_by_id(job_id)
            .one(&txn)
            .await?
            .ok_or(QueueError::JobNotFound(job_id))?;

        if job.status != JobStatus::Pending {
            return Err(QueueError::InvalidTransition {
                job_id,
                status: job.status,
            });
        }

        let changes = ActiveModel {
            status: Set(JobStatus::Cancelled),
            updated_at: Set(to_db_time(Utc::now())),
            ..Default::default()
        };
        let updated = Self::guarded_update(&txn, &job, JobStatus::Pending, None, changes).await?;
        txn.commit().await?;

        info!(job_id, "Sync job cancelled");
        Ok(updated)
    }

    async fn get(&self, job_id: i32) -> Result<Option<Model>, QueueError> {
        Ok(Entity::find_by_id(job_id).one(&self.db).await?)
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Model>, QueueError> {
        let mut query = Entity::find().order_by_asc(Column::CreatedAt).order_by_asc(Column::Id);

        if let Some(status) = filter.status {
            query = query.filter(Column::Status.eq(status));
        }
        if let Some(entity_type) = filter.entity_type {
            query = query.filter(Column::EntityType.eq(entity_type));
        }
        if let Some(entity_id) = &filter.entity_id {
            query = query.filter(Column::EntityId.eq(entity_id.as_str()));
        }
        if let Some(service) = filter.target_service {
            query = query.filter(Column::TargetService.eq(service));
        }
        if let Some(limit) = filter.limit {
            query = query.limit(limit);
        }

        Ok(query.all(&self.db).await?)
    }

    async fn counts(&self) -> Result<QueueCounts, QueueError> {
        let rows: Vec<(JobStatus, i64)> = Entity::find()
            .select_only()
            .column(Column::Status)
            .column_as(Column::Id.count(), "count")
            .group_by(Column::Status)
            .into_tuple()
            .all(&self.db)
            .await?;

        let mut counts = QueueCounts::default();
        for (status, count) in rows {
            counts.add(status, u64::try_from(count).unwrap_or(0));
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EntityType, LogStatus, Priority, SyncAction, TargetService};
    use crate::repositories::{LogStore, SeaOrmLogStore};
    use chrono::Duration as ChronoDuration;
    use migration::{Migrator, MigratorTrait};
    use sea_orm::Database;
    use serde_json::json;

    async fn setup() -> (SeaOrmQueueStore, SeaOrmLogStore) {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        Migrator::up(&db, None).await.unwrap();
        let retry = RetryPolicy {
            base_seconds: 10,
            max_seconds: 600,
            max_attempts: 3,
        };
        (
            SeaOrmQueueStore::new(db.clone(), retry, Duration::from_secs(300)),
            SeaOrmLogStore::new(db),
        )
    }

    fn job(entity_id: &str, priority: i16) -> NewSyncJob {
        NewSyncJob::new(
            EntityType::Project,
            entity_id,
            SyncAction::Create,
            TargetService::Crm,
            json!({ "name": entity_id }),
        )
        .with_priority(Priority(priority))
    }

    fn later(hours: i64) -> DateTime<Utc> {
        Utc::now() + ChronoDuration::hours(hours)
    }

    /// Lease the next due job and return its id and lease owner.
    async fn lease_one(queue: &SeaOrmQueueStore, now: DateTime<Utc>) -> (i32, String) {
        let leased = queue.lease_batch(1, now).await.unwrap();
        let job = &leased[0];
        (job.id, job.lease_owner.clone().unwrap())
    }

    #[tokio::test]
    async fn enqueue_rejects_blank_entity_id() {
        let (queue, _) = setup().await;
        let err = queue.enqueue(job("  ", 5)).await.unwrap_err();
        assert!(matches!(err, QueueError::InvalidEntity(_)));
    }

    #[tokio::test]
    async fn lease_orders_by_priority_then_age() {
        let (queue, _) = setup().await;
        let low = queue.enqueue(job("low", 8)).await.unwrap();
        let first_medium = queue.enqueue(job("m-1", 5)).await.unwrap();
        let critical = queue.enqueue(job("crit", 1)).await.unwrap();
        let second_medium = queue.enqueue(job("m-2", 5)).await.unwrap();

        let leased = queue.lease_batch(3, later(1)).await.unwrap();
        let ids: Vec<i32> = leased.iter().map(|job| job.id).collect();
        assert_eq!(ids, vec![critical, first_medium, second_medium]);
        assert!(leased.iter().all(|job| job.status == JobStatus::Processing));
        assert!(leased.iter().all(|job| job.lease_owner.is_some()));

        let rest = queue.lease_batch(3, later(1)).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].id, low);
    }

    #[tokio::test]
    async fn leased_jobs_are_not_leased_again() {
        let (queue, _) = setup().await;
        for i in 0..6 {
            queue.enqueue(job(&format!("p-{i}"), 5)).await.unwrap();
        }

        let now = later(1);
        let (a, b) = tokio::join!(queue.lease_batch(4, now), queue.lease_batch(4, now));
        let mut ids: Vec<i32> = a
            .unwrap()
            .into_iter()
            .chain(b.unwrap())
            .map(|job| job.id)
            .collect();
        let total = ids.len();
        ids.sort_unstable();
        ids.dedup();

        assert_eq!(total, 6);
        assert_eq!(ids.len(), 6);
        assert!(queue.lease_batch(4, now).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn jobs_not_yet_due_are_skipped() {
        let (queue, _) = setup().await;
        queue.enqueue(job("p-1", 5)).await.unwrap();
        let past = Utc::now() - ChronoDuration::hours(1);
        assert!(queue.lease_batch(10, past).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn success_is_terminal_and_logged() {
        let (queue, logs) = setup().await;
        let id = queue.enqueue(job("p-1", 5)).await.unwrap();
        let (_, owner) = lease_one(&queue, later(1)).await;

        let done = queue.mark_success(id, &owner, 42, Utc::now()).await.unwrap();
        assert_eq!(done.status, JobStatus::Success);
        assert_eq!(done.attempt_count, 1);
        assert!(done.lease_owner.is_none());

        let entries = logs.list_for_job(id).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, LogStatus::Success);
        assert_eq!(entries[0].duration_ms, 42);

        let again = queue.mark_success(id, &owner, 1, Utc::now()).await.unwrap_err();
        assert!(matches!(
            again,
            QueueError::InvalidTransition {
                status: JobStatus::Success,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn transient_failures_back_off_then_dead_letter() {
        let (queue, logs) = setup().await;
        let id = queue.enqueue(job("p-1", 5)).await.unwrap();
        let error = SyncError::transient("connection reset");

        let mut now = Utc::now() + ChronoDuration::seconds(1);
        let mut previous_delay = ChronoDuration::zero();
        for attempt in 1..=3 {
            let leased = queue.lease_batch(1, now).await.unwrap();
            assert_eq!(leased.len(), 1, "attempt {attempt} should lease the job");
            let owner = leased[0].lease_owner.clone().unwrap();

            let failed = queue.mark_failure(id, &owner, &error, 5, now).await.unwrap();
            assert_eq!(failed.attempt_count, attempt);

            if attempt < 3 {
                assert_eq!(failed.status, JobStatus::Pending);
                let delay = failed.next_attempt_at.with_timezone(&Utc) - now;
                assert!(delay >= previous_delay);
                assert!(delay > ChronoDuration::zero());
                previous_delay = delay;
                // Not due until the backoff elapses.
                assert!(queue.lease_batch(1, now).await.unwrap().is_empty());
                now = failed.next_attempt_at.with_timezone(&Utc);
            } else {
                assert_eq!(failed.status, JobStatus::Dead);
                assert!(failed.error_message.unwrap().contains("connection reset"));
            }
        }

        assert!(queue.lease_batch(1, later(48)).await.unwrap().is_empty());
        let entries = logs.list_for_job(id).await.unwrap();
        assert_eq!(entries.len(), 3);
        assert!(entries.iter().all(|e| e.status == LogStatus::Error));
        assert_eq!(entries[2].attempt, 3);
    }

    #[tokio::test]
    async fn permanent_failure_is_dead_after_one_attempt() {
        let (queue, logs) = setup().await;
        let id = queue.enqueue(job("p-1", 5)).await.unwrap();
        let (_, owner) = lease_one(&queue, later(1)).await;

        let dead = queue
            .mark_failure(id, &owner, &SyncError::permanent("422 name required"), 8, Utc::now())
            .await
            .unwrap();
        assert_eq!(dead.status, JobStatus::Dead);
        assert_eq!(dead.attempt_count, 1);
        assert!(queue.lease_batch(1, later(48)).await.unwrap().is_empty());

        let entries = logs.list_for_job(id).await.unwrap();
        assert_eq!(entries[0].error_kind.as_deref(), Some("permanent"));
        assert!(
            entries[0]
                .error_message
                .as_deref()
                .unwrap()
                .starts_with("[crm project/p-1]")
        );
    }

    #[tokio::test]
    async fn configuration_failure_is_terminal_failed() {
        let (queue, _) = setup().await;
        let id = queue.enqueue(job("p-1", 5)).await.unwrap();
        let (_, owner) = lease_one(&queue, later(1)).await;

        let failed = queue
            .mark_failure(id, &owner, &SyncError::configuration("no api key"), 0, Utc::now())
            .await
            .unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert!(failed.status.is_terminal());
    }

    #[tokio::test]
    async fn rate_limit_hint_extends_retry_delay() {
        let (queue, _) = setup().await;
        let id = queue.enqueue(job("p-1", 5)).await.unwrap();
        let (_, owner) = lease_one(&queue, later(1)).await;

        let now = Utc::now();
        let retried = queue
            .mark_failure(id, &owner, &SyncError::rate_limited("429", Some(500)), 3, now)
            .await
            .unwrap();
        let delay = retried.next_attempt_at.with_timezone(&Utc) - now;
        assert_eq!(retried.status, JobStatus::Pending);
        assert!(delay >= ChronoDuration::seconds(500));
    }

    #[tokio::test]
    async fn expired_leases_are_released() {
        let (queue, _) = setup().await;
        let id = queue.enqueue(job("p-1", 5)).await.unwrap();
        let now = Utc::now() + ChronoDuration::seconds(1);
        queue.lease_batch(1, now).await.unwrap();

        // Lease still valid
        assert_eq!(queue.release_expired_leases(now).await.unwrap(), 0);
        assert!(queue.lease_batch(1, now).await.unwrap().is_empty());

        let after_expiry = now + ChronoDuration::seconds(301);
        assert_eq!(queue.release_expired_leases(after_expiry).await.unwrap(), 1);

        let job = queue.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.lease_owner.is_none());
        assert_eq!(job.attempt_count, 0);

        let leased = queue.lease_batch(1, after_expiry).await.unwrap();
        assert_eq!(leased[0].id, id);
    }

    #[tokio::test]
    async fn completion_requires_the_current_lease_owner() {
        let (queue, logs) = setup().await;
        let id = queue.enqueue(job("p-1", 5)).await.unwrap();
        let now = Utc::now() + ChronoDuration::seconds(1);
        let (_, stale) = lease_one(&queue, now).await;

        let after_expiry = now + ChronoDuration::seconds(301);
        assert_eq!(queue.release_expired_leases(after_expiry).await.unwrap(), 1);
        let (_, current) = lease_one(&queue, after_expiry).await;
        assert_ne!(stale, current);

        let err = queue
            .mark_failure(id, &stale, &SyncError::transient("reset"), 5, after_expiry)
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::LeaseLost { job_id } if job_id == id));
        assert!(matches!(
            queue.mark_success(id, &stale, 5, after_expiry).await.unwrap_err(),
            QueueError::LeaseLost { .. }
        ));

        // The current holder keeps the job and nobody else can lease it.
        let job = queue.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.lease_owner.as_deref(), Some(current.as_str()));
        assert_eq!(job.attempt_count, 0);
        assert!(queue.lease_batch(1, after_expiry).await.unwrap().is_empty());
        assert!(logs.list_for_job(id).await.unwrap().is_empty());

        let done = queue.mark_success(id, &current, 5, after_expiry).await.unwrap();
        assert_eq!(done.status, JobStatus::Success);
    }

    #[tokio::test]
    async fn renewed_lease_outlives_the_original_expiry() {
        let (queue, _) = setup().await;
        let id = queue.enqueue(job("p-1", 5)).await.unwrap();
        let now = Utc::now() + ChronoDuration::seconds(1);
        let (_, owner) = lease_one(&queue, now).await;

        let renewed = queue
            .renew_lease(id, &owner, now + ChronoDuration::seconds(200))
            .await
            .unwrap();
        assert_eq!(
            renewed.lease_expires_at.unwrap().timestamp(),
            (now + ChronoDuration::seconds(500)).timestamp()
        );

        let past_first_expiry = now + ChronoDuration::seconds(301);
        assert_eq!(queue.release_expired_leases(past_first_expiry).await.unwrap(), 0);
        assert!(matches!(
            queue.renew_lease(id, "someone-else", past_first_expiry).await.unwrap_err(),
            QueueError::LeaseLost { .. }
        ));
    }

    #[tokio::test]
    async fn lease_is_limited_to_the_given_services() {
        let (queue, _) = setup().await;
        queue.enqueue(job("p-1", 1)).await.unwrap();
        let fsm = queue
            .enqueue(NewSyncJob::new(
                EntityType::Project,
                "p-2",
                SyncAction::Create,
                TargetService::Fsm,
                json!({}),
            ))
            .await
            .unwrap();

        assert!(queue.lease_batch_for(10, later(1), &[]).await.unwrap().is_empty());
        let leased = queue
            .lease_batch_for(10, later(1), &[TargetService::Fsm])
            .await
            .unwrap();
        assert_eq!(leased.len(), 1);
        assert_eq!(leased[0].id, fsm);
        assert_eq!(queue.counts().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn enqueue_many_rejects_the_whole_batch() {
        let (queue, _) = setup().await;
        let err = queue
            .enqueue_many(vec![job("p-1", 5), job(" ", 5)])
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidEntity(_)));
        assert_eq!(queue.counts().await.unwrap().pending, 0);

        let ids = queue
            .enqueue_many(vec![job("p-1", 5), job("p-2", 5)])
            .await
            .unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(queue.counts().await.unwrap().pending, 2);
    }

    #[tokio::test]
    async fn only_pending_jobs_can_be_cancelled() {
        let (queue, _) = setup().await;
        let pending = queue.enqueue(job("p-1", 1)).await.unwrap();
        let cancelled = queue.cancel(pending).await.unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);

        let leased = queue.enqueue(job("p-2", 1)).await.unwrap();
        queue.lease_batch(1, later(1)).await.unwrap();
        let err = queue.cancel(leased).await.unwrap_err();
        assert!(matches!(
            err,
            QueueError::InvalidTransition {
                status: JobStatus::Processing,
                ..
            }
        ));

        assert!(matches!(
            queue.cancel(9999).await.unwrap_err(),
            QueueError::JobNotFound(9999)
        ));
    }

    #[tokio::test]
    async fn counts_and_filters() {
        let (queue, _) = setup().await;
        queue.enqueue(job("p-1", 5)).await.unwrap();
        queue.enqueue(job("p-2", 5)).await.unwrap();
        let fsm = queue
            .enqueue(NewSyncJob::new(
                EntityType::TimeEntry,
                "t-1",
                SyncAction::Update,
                TargetService::Fsm,
                json!({}),
            ))
            .await
            .unwrap();
        queue.cancel(fsm).await.unwrap();

        let counts = queue.counts().await.unwrap();
        assert_eq!(counts.pending, 2);
        assert_eq!(counts.cancelled, 1);
        assert_eq!(counts.processing, 0);

        let crm_jobs = queue
            .list(&JobFilter {
                target_service: Some(TargetService::Crm),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(crm_jobs.len(), 2);

        let by_entity = queue
            .list(&JobFilter {
                entity_type: Some(EntityType::TimeEntry),
                entity_id: Some("t-1".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(by_entity.len(), 1);
        assert_eq!(by_entity[0].status, JobStatus::Cancelled);
    }
}
