//! Health aggregation
//!
//! Derives the system verdict from database reachability, each adapter's
//! `test_connection`, and queue/log statistics.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sea_orm::DatabaseConnection;
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use tokio::task::JoinSet;
use tracing::{debug, warn};
use utoipa::ToSchema;

use crate::adapters::{AdapterRegistry, ConnectionError};
use crate::config::AppConfig;
use crate::db;
use crate::models::TargetService;
use crate::repositories::{LogStore, QueueCounts, QueueStore, WindowCounts};

/// More errors than this in the last 24h is critical.
pub const CRITICAL_ERRORS_24H: u64 = 10;
/// More errors than this in the last 24h is a warning.
pub const WARNING_ERRORS_24H: u64 = 3;
/// A pending backlog above this is a warning.
pub const WARNING_PENDING: u64 = 50;

const DEFAULT_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    /// Service without credentials; informational, does not degrade the verdict
    NotConfigured,
    Warning,
    Critical,
}

impl HealthStatus {
    fn severity(self) -> u8 {
        match self {
            HealthStatus::Healthy | HealthStatus::NotConfigured => 0,
            HealthStatus::Warning => 1,
            HealthStatus::Critical => 2,
        }
    }

    /// Worst of `statuses`; `NotConfigured` counts as healthy.
    pub fn worst<I: IntoIterator<Item = HealthStatus>>(statuses: I) -> HealthStatus {
        statuses
            .into_iter()
            .map(|status| match status {
                HealthStatus::NotConfigured => HealthStatus::Healthy,
                other => other,
            })
            .max_by_key(|status| status.severity())
            .unwrap_or(HealthStatus::Healthy)
    }
}

/// Queue verdict from the pending backlog and the last 24h error count.
pub fn classify_queue(pending: u64, errors_24h: u64) -> HealthStatus {
    if errors_24h > CRITICAL_ERRORS_24H {
        HealthStatus::Critical
    } else if errors_24h > WARNING_ERRORS_24H || pending > WARNING_PENDING {
        HealthStatus::Warning
    } else {
        HealthStatus::Healthy
    }
}

/// One entry under `checks`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct HealthCheck {
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub details: Option<JsonValue>,
}

impl HealthCheck {
    fn healthy() -> Self {
        Self {
            status: HealthStatus::Healthy,
            message: None,
            details: None,
        }
    }

    fn with_message<S: Into<String>>(status: HealthStatus, message: S) -> Self {
        Self {
            status,
            message: Some(message.into()),
            details: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct QueueSummary {
    pub pending: u64,
    pub processing: u64,
    /// Jobs that exhausted their retries or were rejected permanently
    /// (`dead`). Jobs failed for missing configuration are not counted.
    pub failed: u64,
}

impl From<&QueueCounts> for QueueSummary {
    fn from(counts: &QueueCounts) -> Self {
        Self {
            pending: counts.pending,
            processing: counts.processing,
            failed: counts.dead,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct WindowSummary {
    pub success: u64,
    pub errors: u64,
}

impl From<WindowCounts> for WindowSummary {
    fn from(window: WindowCounts) -> Self {
        Self {
            success: window.success,
            errors: window.errors,
        }
    }
}

/// Body of `GET /health/sync`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct SyncHealth {
    pub status: HealthStatus,
    pub queue: QueueSummary,
    pub last_24h: WindowSummary,
    pub last_successful_sync: Option<DateTime<Utc>>,
    /// Set when the statistics could not be read
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SyncHealth {
    fn unavailable(error: String) -> Self {
        Self {
            status: HealthStatus::Critical,
            queue: QueueSummary::default(),
            last_24h: WindowSummary::default(),
            last_successful_sync: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct HealthChecks {
    pub database: HealthCheck,
    /// Keyed by service name: crm, fsm, books, people, desk
    pub services: BTreeMap<TargetService, HealthCheck>,
    pub quotewerks: HealthCheck,
    pub sync: SyncHealth,
}

/// Body of `GET /health`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct SystemHealth {
    pub status: HealthStatus,
    pub timestamp: DateTime<Utc>,
    pub checks: HealthChecks,
}

#[derive(Clone)]
pub struct HealthAggregator {
    db: DatabaseConnection,
    queue: Arc<dyn QueueStore>,
    logs: Arc<dyn LogStore>,
    registry: Arc<AdapterRegistry>,
    required: BTreeSet<TargetService>,
    check_timeout: Duration,
}

impl HealthAggregator {
    pub fn new(
        db: DatabaseConnection,
        queue: Arc<dyn QueueStore>,
        logs: Arc<dyn LogStore>,
        registry: Arc<AdapterRegistry>,
        required: BTreeSet<TargetService>,
    ) -> Self {
        Self {
            db,
            queue,
            logs,
            registry,
            required,
            check_timeout: DEFAULT_CHECK_TIMEOUT,
        }
    }

    /// Services whose failure makes the system critical, from their endpoint config.
    pub fn required_services(config: &AppConfig) -> BTreeSet<TargetService> {
        TargetService::ALL
            .into_iter()
            .filter(|service| config.is_required(*service))
            .collect()
    }

    pub fn with_check_timeout(mut self, timeout: Duration) -> Self {
        self.check_timeout = timeout;
        self
    }

    pub async fn sync_health(&self, now: DateTime<Utc>) -> SyncHealth {
        let counts = match self.queue.counts().await {
            Ok(counts) => counts,
            Err(err) => {
                warn!(error = %err, "Failed to read queue counts");
                return SyncHealth::unavailable(format!("queue unavailable: {err}"));
            }
        };

        let since = now - ChronoDuration::hours(24);
        let window = match self.logs.window_counts(since).await {
            Ok(window) => window,
            Err(err) => {
                warn!(error = %err, "Failed to read sync log window");
                return SyncHealth::unavailable(format!("sync log unavailable: {err}"));
            }
        };

        let last_successful_sync = match self.logs.last_successful_sync().await {
            Ok(last) => last,
            Err(err) => {
                warn!(error = %err, "Failed to read last successful sync");
                return SyncHealth::unavailable(format!("sync log unavailable: {err}"));
            }
        };

        SyncHealth {
            status: classify_queue(counts.pending, window.errors),
            queue: QueueSummary::from(&counts),
            last_24h: window.into(),
            last_successful_sync,
            error: None,
        }
    }

    pub async fn system_health(&self, now: DateTime<Utc>) -> SystemHealth {
        let (database, mut services, sync) = tokio::join!(
            self.database_check(),
            self.service_checks(),
            self.sync_health(now),
        );

        let quotewerks = services
            .remove(&TargetService::Quotewerks)
            .unwrap_or_else(|| HealthCheck::with_message(HealthStatus::NotConfigured, "not checked"));

        let status = HealthStatus::worst(
            [database.status, quotewerks.status, sync.status]
                .into_iter()
                .chain(services.values().map(|check| check.status)),
        );
        debug!(?status, "Health aggregated");

        SystemHealth {
            status,
            timestamp: now,
            checks: HealthChecks {
                database,
                services,
                quotewerks,
                sync,
            },
        }
    }

    async fn database_check(&self) -> HealthCheck {
        if let Err(err) = db::health_check(&self.db).await {
            return HealthCheck::with_message(HealthStatus::Critical, format!("{err:#}"));
        }

        let missing = db::missing_tables(&self.db).await;
        if missing.is_empty() {
            return HealthCheck::healthy();
        }

        HealthCheck {
            status: HealthStatus::Critical,
            message: Some("required tables are missing".to_string()),
            details: Some(json!({ "missing_tables": missing })),
        }
    }

    /// Test every service connection concurrently, each bounded by the check timeout.
    async fn service_checks(&self) -> BTreeMap<TargetService, HealthCheck> {
        let mut checks = BTreeMap::new();
        let mut connection_tests = JoinSet::new();
        let mut spawned = HashMap::new();

        for service in TargetService::ALL {
            let adapter = match self.registry.get(service) {
                Ok(adapter) if adapter.is_configured() => adapter,
                Ok(_) => {
                    checks.insert(
                        service,
                        HealthCheck::with_message(HealthStatus::NotConfigured, "missing credentials"),
                    );
                    continue;
                }
                Err(err) => {
                    checks.insert(
                        service,
                        HealthCheck::with_message(HealthStatus::NotConfigured, err.to_string()),
                    );
                    continue;
                }
            };

            let timeout = self.check_timeout;
            let handle = connection_tests.spawn(async move {
                let result = tokio::time::timeout(timeout, adapter.test_connection()).await;
                (service, result)
            });
            spawned.insert(handle.id(), service);
        }

        while let Some(joined) = connection_tests.join_next().await {
            let (service, result) = match joined {
                Ok(finished) => finished,
                Err(err) => {
                    let Some(service) = spawned.get(&err.id()).copied() else {
                        warn!(error = %err, "Connection test task failed");
                        continue;
                    };
                    warn!(target_service = %service, error = %err, "Connection test task failed");
                    checks.insert(
                        service,
                        HealthCheck::with_message(
                            self.failing_status(service),
                            format!("connection test failed: {err}"),
                        ),
                    );
                    continue;
                }
            };
            let failing = self.failing_status(service);

            let check = match result {
                Ok(Ok(())) => HealthCheck::healthy(),
                Ok(Err(ConnectionError::NotConfigured(message))) => {
                    HealthCheck::with_message(HealthStatus::NotConfigured, message)
                }
                Ok(Err(err)) => {
                    warn!(target_service = %service, error = %err, "Connection test failed");
                    HealthCheck::with_message(failing, err.to_string())
                }
                Err(_) => {
                    warn!(target_service = %service, "Connection test timed out");
                    HealthCheck::with_message(
                        failing,
                        format!("connection test timed out after {:?}", self.check_timeout),
                    )
                }
            };
            checks.insert(service, check);
        }

        checks
    }

    fn failing_status(&self, service: TargetService) -> HealthStatus {
        if self.required.contains(&service) {
            HealthStatus::Critical
        } else {
            HealthStatus::Warning
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::ScriptedAdapter;
    use crate::retry::RetryPolicy;
    use crate::models::{EntityType, SyncAction};
    use crate::repositories::{NewSyncJob, SeaOrmLogStore, SeaOrmQueueStore};
    use migration::{Migrator, MigratorTrait};
    use async_trait::async_trait;
    use sea_orm::Database;

    use crate::adapters::{Adapter, SyncError, SyncOutcome, SyncRequest};
    use crate::models::JobStatus;

    /// Adapter whose connection test panics.
    struct PanickingAdapter(TargetService);

    #[async_trait]
    impl Adapter for PanickingAdapter {
        fn service(&self) -> TargetService {
            self.0
        }

        fn is_configured(&self) -> bool {
            true
        }

        async fn test_connection(&self) -> Result<(), ConnectionError> {
            panic!("connection test blew up")
        }

        async fn sync(&self, _request: &SyncRequest<'_>) -> Result<SyncOutcome, SyncError> {
            Ok(SyncOutcome::default())
        }
    }

    #[test]
    fn queue_thresholds() {
        assert_eq!(classify_queue(0, 11), HealthStatus::Critical);
        assert_eq!(classify_queue(10, 5), HealthStatus::Warning);
        assert_eq!(classify_queue(0, 0), HealthStatus::Healthy);
        assert_eq!(classify_queue(51, 0), HealthStatus::Warning);
        assert_eq!(classify_queue(50, 3), HealthStatus::Healthy);
        assert_eq!(classify_queue(0, 10), HealthStatus::Warning);
    }

    #[test]
    fn not_configured_does_not_degrade() {
        assert_eq!(
            HealthStatus::worst([HealthStatus::NotConfigured, HealthStatus::Healthy]),
            HealthStatus::Healthy
        );
        assert_eq!(
            HealthStatus::worst([HealthStatus::Warning, HealthStatus::Critical]),
            HealthStatus::Critical
        );
        assert_eq!(HealthStatus::worst(std::iter::empty()), HealthStatus::Healthy);
    }

    async fn aggregator(
        registry: AdapterRegistry,
        required: &[TargetService],
    ) -> (HealthAggregator, Arc<SeaOrmQueueStore>) {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        Migrator::up(&db, None).await.unwrap();
        let queue = Arc::new(SeaOrmQueueStore::new(
            db.clone(),
            RetryPolicy::default(),
            Duration::from_secs(300),
        ));
        let logs = Arc::new(SeaOrmLogStore::new(db.clone()));
        let health = HealthAggregator::new(
            db,
            queue.clone(),
            logs,
            Arc::new(registry),
            required.iter().copied().collect(),
        );
        (health, queue)
    }

    fn healthy_registry() -> AdapterRegistry {
        let mut registry = AdapterRegistry::new();
        for service in TargetService::ALL {
            registry.register(Arc::new(ScriptedAdapter::new(service)));
        }
        registry
    }

    #[tokio::test]
    async fn all_services_healthy() {
        let (health, _) = aggregator(healthy_registry(), &TargetService::ALL).await;
        let report = health.system_health(Utc::now()).await;

        assert_eq!(report.status, HealthStatus::Healthy);
        assert_eq!(report.checks.database.status, HealthStatus::Healthy);
        assert_eq!(report.checks.services.len(), 5);
        assert!(!report.checks.services.contains_key(&TargetService::Quotewerks));
        assert_eq!(report.checks.quotewerks.status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn failing_required_service_is_critical() {
        let mut registry = healthy_registry();
        registry.register(Arc::new(ScriptedAdapter::new(TargetService::Crm).with_connection(
            Err(ConnectionError::Unreachable("connection refused".into())),
        )));

        let (health, _) = aggregator(registry, &[TargetService::Crm]).await;
        let report = health.system_health(Utc::now()).await;

        assert_eq!(report.status, HealthStatus::Critical);
        let crm = &report.checks.services[&TargetService::Crm];
        assert_eq!(crm.status, HealthStatus::Critical);
        assert!(crm.message.as_deref().unwrap().contains("connection refused"));
    }

    #[tokio::test]
    async fn failing_optional_service_is_warning() {
        let mut registry = healthy_registry();
        registry.register(Arc::new(ScriptedAdapter::new(TargetService::Desk).with_connection(
            Err(ConnectionError::Unauthorized("bad key".into())),
        )));

        let (health, _) = aggregator(registry, &[TargetService::Crm]).await;
        let report = health.system_health(Utc::now()).await;

        assert_eq!(report.status, HealthStatus::Warning);
        assert_eq!(
            report.checks.services[&TargetService::Desk].status,
            HealthStatus::Warning
        );
    }

    #[tokio::test]
    async fn unconfigured_services_are_reported_not_failed() {
        let mut registry = AdapterRegistry::new();
        registry.register(Arc::new(ScriptedAdapter::unconfigured(TargetService::People)));

        let (health, _) = aggregator(registry, &TargetService::ALL).await;
        let report = health.system_health(Utc::now()).await;

        assert_eq!(report.status, HealthStatus::Healthy);
        assert_eq!(
            report.checks.services[&TargetService::People].status,
            HealthStatus::NotConfigured
        );
        assert_eq!(report.checks.quotewerks.status, HealthStatus::NotConfigured);
    }

    #[tokio::test]
    async fn pending_backlog_warns() {
        let (health, queue) = aggregator(healthy_registry(), &[]).await;
        for i in 0..51 {
            queue
                .enqueue(NewSyncJob::new(
                    EntityType::TimeEntry,
                    format!("te-{i}"),
                    SyncAction::Create,
                    TargetService::People,
                    serde_json::Value::Null,
                ))
                .await
                .unwrap();
        }

        let sync = health.sync_health(Utc::now()).await;
        assert_eq!(sync.queue.pending, 51);
        assert_eq!(sync.status, HealthStatus::Warning);
        assert!(sync.last_successful_sync.is_none());
    }

    #[tokio::test]
    async fn panicking_connection_test_is_reported_failing() {
        let mut registry = healthy_registry();
        registry.register(Arc::new(PanickingAdapter(TargetService::Fsm)));

        let (health, _) = aggregator(registry, &[TargetService::Fsm]).await;
        let report = health.system_health(Utc::now()).await;

        assert_eq!(report.status, HealthStatus::Critical);
        let fsm = &report.checks.services[&TargetService::Fsm];
        assert_eq!(fsm.status, HealthStatus::Critical);
        assert!(fsm.message.as_deref().unwrap().contains("connection test failed"));
        assert_eq!(report.checks.services.len(), 5);
    }

    #[tokio::test]
    async fn configuration_failures_do_not_count_against_sync_health() {
        let (health, queue) = aggregator(healthy_registry(), &[]).await;
        let now = Utc::now();
        let unconfigured = (0..11)
            .map(|i| {
                NewSyncJob::new(
                    EntityType::Project,
                    format!("p-{i}"),
                    SyncAction::Create,
                    TargetService::Desk,
                    JsonValue::Null,
                )
            })
            .collect();
        queue.enqueue_many(unconfigured).await.unwrap();

        let leased = queue
            .lease_batch(11, now + ChronoDuration::seconds(1))
            .await
            .unwrap();
        assert_eq!(leased.len(), 11);
        let err = SyncError::configuration("no adapter configured for desk");
        for job in &leased {
            let owner = job.lease_owner.clone().unwrap();
            let failed = queue
                .mark_failure(job.id, &owner, &err, 0, now + ChronoDuration::seconds(2))
                .await
                .unwrap();
            assert_eq!(failed.status, JobStatus::Failed);
        }

        let sync = health.sync_health(now + ChronoDuration::seconds(3)).await;
        assert_eq!(sync.queue.failed, 0);
        assert_eq!(sync.last_24h.errors, 0);
        assert_eq!(sync.status, HealthStatus::Healthy);
    }
}
