//! Dispatcher
//!
//! Periodic worker pool that leases due jobs, pushes them through the adapter
//! for their target service and records the outcome. Every cycle first returns
//! abandoned leases to the queue, then leases at most one job per worker.
//!
//! Only jobs for services with a configured adapter are leased; the rest wait
//! in `pending` until the service is configured.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::adapters::{AdapterRegistry, SyncError, SyncOutcome, SyncRequest};
use crate::config::DispatcherConfig;
use crate::models::{JobStatus, sync_job};
use crate::rate_limit::ServiceRateLimiter;
use crate::repositories::{QueueError, QueueStore};
use crate::telemetry::{JOB_DURATION_MS, JOBS_TOTAL, RATE_LIMITED_TOTAL, TICK_DURATION_MS};

/// Workflow logic run around each job.
#[async_trait]
pub trait JobHook: Send + Sync {
    /// Run `job` in place of its adapter. `None` hands it to the adapter.
    async fn execute(&self, _job: &sync_job::Model) -> Option<Result<SyncOutcome, SyncError>> {
        None
    }

    /// Runs after a successful sync, before the success is recorded. An error
    /// is recorded as a failed attempt instead, so the job is retried.
    async fn after_success(
        &self,
        _job: &sync_job::Model,
        _outcome: &SyncOutcome,
    ) -> Result<(), SyncError> {
        Ok(())
    }
}

/// Counters for one dispatch cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickStats {
    pub released: u64,
    pub leased: u64,
    pub succeeded: u64,
    pub retried: u64,
    pub dead: u64,
    pub failed: u64,
    /// Jobs whose outcome could not be recorded, lost leases included
    pub errors: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobOutcome {
    Succeeded,
    Retrying,
    Dead,
    Failed,
    Unrecorded,
}

impl JobOutcome {
    fn from_status(status: JobStatus) -> Self {
        match status {
            JobStatus::Success => JobOutcome::Succeeded,
            JobStatus::Pending => JobOutcome::Retrying,
            JobStatus::Dead => JobOutcome::Dead,
            _ => JobOutcome::Failed,
        }
    }

    fn label(self) -> &'static str {
        match self {
            JobOutcome::Succeeded => "success",
            JobOutcome::Retrying => "retry",
            JobOutcome::Dead => "dead",
            JobOutcome::Failed => "failed",
            JobOutcome::Unrecorded => "unrecorded",
        }
    }
}

impl TickStats {
    fn record(&mut self, outcome: JobOutcome) {
        match outcome {
            JobOutcome::Succeeded => self.succeeded += 1,
            JobOutcome::Retrying => self.retried += 1,
            JobOutcome::Dead => self.dead += 1,
            JobOutcome::Failed => self.failed += 1,
            JobOutcome::Unrecorded => self.errors += 1,
        }
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    queue: Arc<dyn QueueStore>,
    registry: Arc<AdapterRegistry>,
    limiter: Arc<ServiceRateLimiter>,
    config: DispatcherConfig,
    hook: Option<Arc<dyn JobHook>>,
}

impl Dispatcher {
    pub fn new(
        queue: Arc<dyn QueueStore>,
        registry: Arc<AdapterRegistry>,
        limiter: Arc<ServiceRateLimiter>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            queue,
            registry,
            limiter,
            config,
            hook: None,
        }
    }

    pub fn with_hook(mut self, hook: Arc<dyn JobHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Run dispatch cycles until `shutdown` is cancelled. A cycle in progress
    /// always finishes before the loop exits.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            tick_interval_seconds = self.config.tick_interval_seconds,
            pool_size = self.config.pool_size,
            "Starting sync dispatcher"
        );
        let tick_interval = Duration::from_secs(self.config.tick_interval_seconds);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Sync dispatcher shutdown requested");
                    break;
                }
                _ = sleep(tick_interval) => {
                    let tick_started = Instant::now();
                    match self.tick(Utc::now()).await {
                        Ok(stats) if stats.leased > 0 || stats.released > 0 => {
                            info!(?stats, "Dispatch cycle complete");
                        }
                        Ok(_) => debug!("No due sync jobs"),
                        Err(err) => error!(error = %err, "Dispatch cycle failed"),
                    }
                    histogram!(TICK_DURATION_MS)
                        .record(tick_started.elapsed().as_secs_f64() * 1000.0);
                }
            }
        }

        info!("Sync dispatcher stopped");
    }

    /// One dispatch cycle at logical time `now`.
    #[instrument(skip(self), fields(pool_size = self.config.pool_size))]
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickStats, QueueError> {
        let clock = Instant::now();
        let mut stats = TickStats {
            released: self.queue.release_expired_leases(now).await?,
            ..Default::default()
        };

        let services = self.registry.configured_services();
        let jobs = self
            .queue
            .lease_batch_for(self.config.pool_size as u64, now, &services)
            .await?;
        stats.leased = jobs.len() as u64;
        if jobs.is_empty() {
            return Ok(stats);
        }

        let semaphore = Arc::new(Semaphore::new(self.config.pool_size));
        let mut workers = JoinSet::new();
        for job in jobs {
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    // Only reachable if the semaphore is closed.
                    stats.errors += 1;
                    continue;
                }
            };
            let dispatcher = self.clone();
            workers.spawn(async move {
                let _permit = permit;
                dispatcher.run_job(job, now, clock).await
            });
        }

        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(outcome) => stats.record(outcome),
                Err(err) => {
                    error!(error = %err, "Dispatch worker panicked");
                    stats.errors += 1;
                }
            }
        }

        Ok(stats)
    }

    #[instrument(
        skip(self, job, now, clock),
        fields(
            job_id = job.id,
            target_service = %job.target_service,
            entity_type = %job.entity_type,
            entity_id = %job.entity_id,
            attempt = job.attempt_count + 1,
        )
    )]
    async fn run_job(&self, job: sync_job::Model, now: DateTime<Utc>, clock: Instant) -> JobOutcome {
        let service = job.target_service;
        let completed_at = || {
            now + chrono::Duration::from_std(clock.elapsed()).unwrap_or(chrono::Duration::zero())
        };
        let Some(owner) = job.lease_owner.clone() else {
            return self.unrecorded(&job, QueueError::LeaseLost { job_id: job.id });
        };

        let adapter = match self.registry.get(service) {
            Ok(adapter) if adapter.is_configured() => adapter,
            Ok(_) => {
                let err = SyncError::configuration(format!("no credentials configured for {service}"));
                return self.record_failure(&job, &owner, &err, 0, completed_at()).await;
            }
            Err(err) => {
                let err = SyncError::configuration(err.to_string());
                return self.record_failure(&job, &owner, &err, 0, completed_at()).await;
            }
        };

        let waited = self.limiter.acquire(service).await;
        if !waited.is_zero() {
            counter!(RATE_LIMITED_TOTAL, "target_service" => service.as_str()).increment(1);
            debug!(waited_ms = waited.as_millis() as u64, "Rate limiter delayed job");
            // The wait counts against the lease taken at the start of the cycle.
            if let Err(err) = self.queue.renew_lease(job.id, &owner, completed_at()).await {
                return self.unrecorded(&job, err);
            }
        }

        let idempotency_key = job.idempotency_key();
        let request = SyncRequest {
            action: job.action,
            entity_type: job.entity_type,
            entity_id: &job.entity_id,
            payload: &job.payload,
            idempotency_key: &idempotency_key,
        };
        let call = async {
            if let Some(hook) = &self.hook
                && let Some(result) = hook.execute(&job).await
            {
                return result;
            }
            adapter.sync(&request).await
        };

        let timeout = Duration::from_secs(self.config.adapter_timeout_seconds);
        let started = Instant::now();
        let result = match tokio::time::timeout(timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::transient(format!(
                "adapter call timed out after {}s",
                timeout.as_secs()
            ))),
        };
        let duration_ms = i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX);
        histogram!(JOB_DURATION_MS, "target_service" => service.as_str()).record(duration_ms as f64);

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(error = %err, error_kind = err.kind.as_str(), duration_ms, "Sync attempt failed");
                return self
                    .record_failure(&job, &owner, &err, duration_ms, completed_at())
                    .await;
            }
        };

        if let Some(hook) = &self.hook
            && let Err(err) = hook.after_success(&job, &outcome).await
        {
            warn!(error = %err, duration_ms, "Follow-up of a successful sync failed");
            return self
                .record_failure(&job, &owner, &err, duration_ms, completed_at())
                .await;
        }

        match self
            .queue
            .mark_success(job.id, &owner, duration_ms, completed_at())
            .await
        {
            Ok(_) => {
                info!(duration_ms, "Sync job succeeded");
                counter!(JOBS_TOTAL, "target_service" => service.as_str(), "outcome" => "success")
                    .increment(1);
                JobOutcome::Succeeded
            }
            Err(err) => self.unrecorded(&job, err),
        }
    }

    async fn record_failure(
        &self,
        job: &sync_job::Model,
        owner: &str,
        err: &SyncError,
        duration_ms: i64,
        now: DateTime<Utc>,
    ) -> JobOutcome {
        match self
            .queue
            .mark_failure(job.id, owner, err, duration_ms, now)
            .await
        {
            Ok(updated) => {
                let outcome = JobOutcome::from_status(updated.status);
                counter!(
                    JOBS_TOTAL,
                    "target_service" => job.target_service.as_str(),
                    "outcome" => outcome.label()
                )
                .increment(1);
                outcome
            }
            Err(store_err) => self.unrecorded(job, store_err),
        }
    }

    /// The lease was lost (released after expiry, maybe re-leased) or the store failed.
    fn unrecorded(&self, job: &sync_job::Model, err: QueueError) -> JobOutcome {
        match err {
            QueueError::LeaseLost { .. } => warn!(
                job_id = job.id,
                "Lease lost before the outcome was recorded; discarding it"
            ),
            QueueError::InvalidTransition { status, .. } => warn!(
                job_id = job.id,
                status = %status,
                "Job left processing before its outcome was recorded"
            ),
            other => error!(job_id = job.id, error = %other, "Failed to record job outcome"),
        }
        counter!(
            JOBS_TOTAL,
            "target_service" => job.target_service.as_str(),
            "outcome" => JobOutcome::Unrecorded.label()
        )
        .increment(1);
        JobOutcome::Unrecorded
    }
}
