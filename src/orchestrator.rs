//! Orchestrator
//!
//! Multi-step workflows where later steps consume an id produced by an earlier
//! step. A workflow runs either inline, returning a step-by-step report
//! (diagnostics), or through the queue, where the orchestrator runs as the
//! dispatcher's [`JobHook`] and chains the follow-up jobs.
//!
//! The quote step is idempotent: the quote id is mapped to the project it
//! produced, and every later run reuses that project. Conversions of the same
//! quote are serialized within the process; across processes the unique
//! mapping key keeps the first project.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::adapters::{AdapterRegistry, SyncError, SyncOutcome, SyncRequest};
use crate::dispatcher::JobHook;
use crate::models::{EntityType, ParseKindError, Priority, SyncAction, TargetService, sync_job};
use crate::repositories::{MappingStore, NewMapping, NewSyncJob, QueueError, QueueStore};
use crate::telemetry::ORCHESTRATOR_STEPS_TOTAL;

/// Payload key marking a queued quote job as the first step of `full_workflow`.
pub const WORKFLOW_KEY: &str = "workflow";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Workflow {
    QuoteToProject,
    ProjectToCrm,
    ProjectToFsm,
    InventoryToBooks,
    FullWorkflow,
}

impl Workflow {
    pub const ALL: [Workflow; 5] = [
        Workflow::QuoteToProject,
        Workflow::ProjectToCrm,
        Workflow::ProjectToFsm,
        Workflow::InventoryToBooks,
        Workflow::FullWorkflow,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Workflow::QuoteToProject => "quote_to_project",
            Workflow::ProjectToCrm => "project_to_crm",
            Workflow::ProjectToFsm => "project_to_fsm",
            Workflow::InventoryToBooks => "inventory_to_books",
            Workflow::FullWorkflow => "full_workflow",
        }
    }
}

impl fmt::Display for Workflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Workflow {
    type Err = ParseKindError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Workflow::ALL
            .into_iter()
            .find(|workflow| workflow.as_str().eq_ignore_ascii_case(value.trim()))
            .ok_or_else(|| ParseKindError {
                kind: "workflow",
                value: value.to_string(),
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Success,
    Error,
    /// Not attempted because a step it depends on failed
    Skipped,
}

impl StepStatus {
    fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Success => "success",
            StepStatus::Error => "error",
            StepStatus::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct StepReport {
    #[schema(example = "quote_to_project")]
    pub name: String,
    pub status: StepStatus,
    /// Step output on success, the error on failure, the reason when skipped
    #[schema(value_type = Object)]
    pub result: JsonValue,
}

impl StepReport {
    fn success(name: &str, result: JsonValue) -> Self {
        Self {
            name: name.to_string(),
            status: StepStatus::Success,
            result,
        }
    }

    fn error(name: &str, err: &SyncError) -> Self {
        Self {
            name: name.to_string(),
            status: StepStatus::Error,
            result: json!({ "error": err.to_string(), "kind": err.kind.as_str() }),
        }
    }

    fn skipped(name: &str, reason: &str) -> Self {
        Self {
            name: name.to_string(),
            status: StepStatus::Skipped,
            result: json!({ "reason": reason }),
        }
    }
}

/// Outcome of an inline workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct WorkflowReport {
    pub workflow: Workflow,
    pub timestamp: DateTime<Utc>,
    /// True when every attempted step succeeded
    pub success: bool,
    pub steps: Vec<StepReport>,
    pub errors: Vec<String>,
}

impl WorkflowReport {
    fn new(workflow: Workflow, steps: Vec<StepReport>) -> Self {
        let errors: Vec<String> = steps
            .iter()
            .filter(|step| step.status == StepStatus::Error)
            .map(|step| {
                let message = step
                    .result
                    .get("error")
                    .and_then(JsonValue::as_str)
                    .unwrap_or("unknown error");
                format!("{}: {}", step.name, message)
            })
            .collect();

        Self {
            workflow,
            timestamp: Utc::now(),
            success: errors.is_empty(),
            steps,
            errors,
        }
    }
}

/// Locks keyed by quote id.
#[derive(Default)]
struct QuoteLocks(Mutex<HashMap<String, Arc<AsyncMutex<()>>>>);

impl QuoteLocks {
    async fn lock(&self, quote_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.0.lock().unwrap_or_else(PoisonError::into_inner);
            // Entries nobody holds or waits on are dropped.
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks.entry(quote_id.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }
}

/// Project a quote resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
struct QuoteConversion {
    project_id: String,
    /// The mapping already existed and the adapter was not called
    reused: bool,
}

impl QuoteConversion {
    fn report(&self) -> JsonValue {
        json!({ "project_id": self.project_id, "reused": self.reused })
    }
}

#[derive(Clone)]
pub struct Orchestrator {
    queue: Arc<dyn QueueStore>,
    mappings: Arc<dyn MappingStore>,
    registry: Arc<AdapterRegistry>,
    quote_locks: Arc<QuoteLocks>,
}

impl Orchestrator {
    pub fn new(
        queue: Arc<dyn QueueStore>,
        mappings: Arc<dyn MappingStore>,
        registry: Arc<AdapterRegistry>,
    ) -> Self {
        Self {
            queue,
            mappings,
            registry,
            quote_locks: Arc::default(),
        }
    }

    /// Run `workflow` inline for one entity and report every step.
    #[instrument(skip(self, payload), fields(workflow = %workflow))]
    pub async fn run_sync(
        &self,
        workflow: Workflow,
        entity_id: &str,
        payload: &JsonValue,
    ) -> WorkflowReport {
        let steps = match workflow {
            Workflow::QuoteToProject => vec![self.quote_to_project(entity_id, payload).await.0],
            Workflow::ProjectToCrm => vec![
                self.push_step(
                    "project_to_crm",
                    TargetService::Crm,
                    EntityType::Project,
                    SyncAction::Create,
                    entity_id,
                    payload,
                )
                .await,
            ],
            Workflow::ProjectToFsm => vec![
                self.push_step(
                    "project_to_fsm",
                    TargetService::Fsm,
                    EntityType::Project,
                    SyncAction::Create,
                    entity_id,
                    payload,
                )
                .await,
            ],
            Workflow::InventoryToBooks => vec![
                self.push_step(
                    "inventory_to_books",
                    TargetService::Books,
                    EntityType::Inventory,
                    SyncAction::Update,
                    entity_id,
                    payload,
                )
                .await,
            ],
            Workflow::FullWorkflow => self.full_steps(entity_id, payload).await,
        };

        for step in &steps {
            counter!(
                ORCHESTRATOR_STEPS_TOTAL,
                "workflow" => workflow.as_str(),
                "step" => step.name.clone(),
                "status" => step.status.as_str()
            )
            .increment(1);
        }

        let report = WorkflowReport::new(workflow, steps);
        info!(
            entity_id,
            success = report.success,
            errors = report.errors.len(),
            "Workflow run finished"
        );
        report
    }

    /// Quote to project, then the project to CRM and FSM.
    pub async fn full_quote_sync(&self, quote_id: &str, payload: &JsonValue) -> WorkflowReport {
        self.run_sync(Workflow::FullWorkflow, quote_id, payload)
            .await
    }

    async fn full_steps(&self, quote_id: &str, payload: &JsonValue) -> Vec<StepReport> {
        let (quote_step, project_id) = self.quote_to_project(quote_id, payload).await;

        let Some(project_id) = project_id else {
            let reason = "not attempted: quote_to_project failed";
            return vec![
                quote_step,
                StepReport::skipped("project_to_crm", reason),
                StepReport::skipped("project_to_fsm", reason),
            ];
        };

        let project_payload = project_payload(payload, &project_id);
        // CRM and FSM only depend on the project, not on each other.
        let (crm, fsm) = tokio::join!(
            self.push_step(
                "project_to_crm",
                TargetService::Crm,
                EntityType::Project,
                SyncAction::Create,
                &project_id,
                &project_payload,
            ),
            self.push_step(
                "project_to_fsm",
                TargetService::Fsm,
                EntityType::Project,
                SyncAction::Create,
                &project_id,
                &project_payload,
            ),
        );

        vec![quote_step, crm, fsm]
    }

    async fn quote_to_project(
        &self,
        quote_id: &str,
        payload: &JsonValue,
    ) -> (StepReport, Option<String>) {
        const STEP: &str = "quote_to_project";

        let key = run_key(TargetService::Quotewerks);
        match self.convert_quote(quote_id, payload, &key).await {
            Ok(conversion) => (
                StepReport::success(STEP, conversion.report()),
                Some(conversion.project_id),
            ),
            Err(err) => (StepReport::error(STEP, &err), None),
        }
    }

    /// Resolve the project for a quote, creating it at most once.
    async fn convert_quote(
        &self,
        quote_id: &str,
        payload: &JsonValue,
        idempotency_key: &str,
    ) -> Result<QuoteConversion, SyncError> {
        let _guard = self.quote_locks.lock(quote_id).await;

        let existing = self
            .mappings
            .find(TargetService::Quotewerks, quote_id)
            .await
            .map_err(|err| SyncError::transient(format!("mapping lookup failed: {err}")))?;
        if let Some(mapping) = existing {
            return Ok(QuoteConversion {
                project_id: mapping.internal_id,
                reused: true,
            });
        }

        let outcome = self
            .call_adapter(
                TargetService::Quotewerks,
                EntityType::Quote,
                SyncAction::Create,
                quote_id,
                payload,
                idempotency_key,
            )
            .await?;
        let Some(created) = outcome.external_id else {
            return Err(SyncError::permanent("quotewerks did not return a project id"));
        };

        let project_id = self.record_mapping(quote_id, &created).await?;
        Ok(QuoteConversion {
            project_id,
            reused: false,
        })
    }

    /// Persist the quote mapping. A concurrent run may have won; its project wins.
    async fn record_mapping(&self, quote_id: &str, project_id: &str) -> Result<String, SyncError> {
        let mapping = self
            .mappings
            .insert(NewMapping {
                source_system: TargetService::Quotewerks,
                source_id: quote_id.to_string(),
                entity_type: EntityType::Project,
                internal_id: project_id.to_string(),
            })
            .await
            .map_err(|err| SyncError::transient(format!("failed to record mapping: {err}")))?;

        if mapping.internal_id != project_id {
            warn!(
                quote_id,
                created = project_id,
                existing = %mapping.internal_id,
                "Quote was already mapped; keeping existing project"
            );
        }
        Ok(mapping.internal_id)
    }

    async fn push_step(
        &self,
        name: &str,
        service: TargetService,
        entity_type: EntityType,
        action: SyncAction,
        entity_id: &str,
        payload: &JsonValue,
    ) -> StepReport {
        let key = run_key(service);
        match self
            .call_adapter(service, entity_type, action, entity_id, payload, &key)
            .await
        {
            Ok(outcome) => StepReport::success(
                name,
                json!({
                    "target_service": service,
                    "entity_id": entity_id,
                    "external_id": outcome.external_id,
                }),
            ),
            Err(err) => StepReport::error(name, &err),
        }
    }

    async fn call_adapter(
        &self,
        service: TargetService,
        entity_type: EntityType,
        action: SyncAction,
        entity_id: &str,
        payload: &JsonValue,
        idempotency_key: &str,
    ) -> Result<SyncOutcome, SyncError> {
        let adapter = self
            .registry
            .get(service)
            .map_err(|err| SyncError::configuration(err.to_string()))?;
        if !adapter.is_configured() {
            return Err(SyncError::configuration(format!(
                "no credentials configured for {service}"
            )));
        }

        let request = SyncRequest {
            action,
            entity_type,
            entity_id,
            payload,
            idempotency_key,
        };
        adapter
            .sync(&request)
            .await
            .map_err(|err| err.with_context(service, entity_type, entity_id))
    }

    /// Enqueue the first jobs of `workflow`; the rest follow through
    /// [`JobHook::after_success`]. Returns the ids enqueued now.
    ///
    /// Fails with [`QueueError::ServiceNotConfigured`] when a job enqueued now
    /// targets a service without a configured adapter.
    #[instrument(skip(self, payload), fields(workflow = %workflow))]
    pub async fn enqueue_workflow(
        &self,
        workflow: Workflow,
        entity_id: &str,
        payload: JsonValue,
        priority: Priority,
    ) -> Result<Vec<i32>, QueueError> {
        let jobs = match workflow {
            Workflow::QuoteToProject => vec![quote_job(entity_id, payload, None)],
            Workflow::ProjectToCrm => vec![project_job(entity_id, payload, TargetService::Crm)],
            Workflow::ProjectToFsm => vec![project_job(entity_id, payload, TargetService::Fsm)],
            Workflow::InventoryToBooks => vec![NewSyncJob::new(
                EntityType::Inventory,
                entity_id,
                SyncAction::Update,
                TargetService::Books,
                payload,
            )],
            Workflow::FullWorkflow => {
                let existing = self.mappings.find(TargetService::Quotewerks, entity_id).await?;
                match existing {
                    Some(mapping) => {
                        let payload = project_payload(&payload, &mapping.internal_id);
                        project_jobs(&mapping.internal_id, &payload)
                    }
                    None => vec![quote_job(entity_id, payload, Some(Workflow::FullWorkflow))],
                }
            }
        };

        if let Some(job) = jobs
            .iter()
            .find(|job| !self.registry.is_configured(job.target_service))
        {
            return Err(QueueError::ServiceNotConfigured(job.target_service));
        }

        let jobs = jobs
            .into_iter()
            .map(|job| job.with_priority(priority))
            .collect();
        let ids = self.queue.enqueue_many(jobs).await?;

        info!(entity_id, job_ids = ?ids, "Workflow enqueued");
        Ok(ids)
    }

    async fn continue_full_workflow(
        &self,
        job: &sync_job::Model,
        project_id: &str,
    ) -> Result<Vec<i32>, QueueError> {
        let payload = project_payload(&job.payload, project_id);
        let jobs = project_jobs(project_id, &payload)
            .into_iter()
            .map(|next| next.with_priority(job.priority()))
            .collect();
        self.queue.enqueue_many(jobs).await
    }
}

#[async_trait]
impl JobHook for Orchestrator {
    /// Queued quote conversions go through the mapping first, so a quote that
    /// already has a project never reaches the adapter again.
    async fn execute(&self, job: &sync_job::Model) -> Option<Result<SyncOutcome, SyncError>> {
        if !is_quote_conversion(job) {
            return None;
        }

        let payload = quote_payload(&job.payload);
        let key = job.idempotency_key();
        let result = self
            .convert_quote(&job.entity_id, &payload, &key)
            .await
            .map(|conversion| {
                if conversion.reused {
                    info!(
                        job_id = job.id,
                        project_id = %conversion.project_id,
                        "Quote already converted; reusing project"
                    );
                }
                SyncOutcome {
                    response: Some(conversion.report()),
                    external_id: Some(conversion.project_id),
                }
            });
        Some(result)
    }

    async fn after_success(
        &self,
        job: &sync_job::Model,
        outcome: &SyncOutcome,
    ) -> Result<(), SyncError> {
        if !is_quote_conversion(job) || workflow_of(job) != Some(Workflow::FullWorkflow) {
            return Ok(());
        }
        let Some(project_id) = outcome.external_id.as_deref() else {
            return Err(SyncError::permanent(
                "quote conversion finished without a project id",
            ));
        };

        let ids = self
            .continue_full_workflow(job, project_id)
            .await
            .map_err(|err| {
                SyncError::transient(format!("failed to enqueue follow-up jobs: {err}"))
            })?;
        info!(
            job_id = job.id,
            project_id,
            job_ids = ?ids,
            "Continued full workflow"
        );
        Ok(())
    }
}

fn is_quote_conversion(job: &sync_job::Model) -> bool {
    job.target_service == TargetService::Quotewerks
        && job.entity_type == EntityType::Quote
        && job.action == SyncAction::Create
}

fn workflow_of(job: &sync_job::Model) -> Option<Workflow> {
    job.payload
        .get(WORKFLOW_KEY)
        .and_then(JsonValue::as_str)
        .and_then(|name| name.parse().ok())
}

/// Key for one inline call; inline runs are not redelivered.
fn run_key(service: TargetService) -> String {
    format!("{service}:run-{}", Uuid::new_v4())
}

fn quote_job(quote_id: &str, payload: JsonValue, workflow: Option<Workflow>) -> NewSyncJob {
    let payload = match (workflow, payload) {
        (Some(workflow), JsonValue::Object(mut fields)) => {
            fields.insert(WORKFLOW_KEY.to_string(), json!(workflow));
            JsonValue::Object(fields)
        }
        (Some(workflow), JsonValue::Null) => json!({ WORKFLOW_KEY: workflow }),
        (Some(workflow), other) => json!({ WORKFLOW_KEY: workflow, "data": other }),
        (None, payload) => payload,
    };
    NewSyncJob::new(
        EntityType::Quote,
        quote_id,
        SyncAction::Create,
        TargetService::Quotewerks,
        payload,
    )
}

fn project_job(project_id: &str, payload: JsonValue, service: TargetService) -> NewSyncJob {
    NewSyncJob::new(
        EntityType::Project,
        project_id,
        SyncAction::Create,
        service,
        payload,
    )
}

fn project_jobs(project_id: &str, payload: &JsonValue) -> Vec<NewSyncJob> {
    [TargetService::Crm, TargetService::Fsm]
        .into_iter()
        .map(|service| project_job(project_id, payload.clone(), service))
        .collect()
}

/// Quote snapshot without the workflow marker.
fn quote_payload(payload: &JsonValue) -> JsonValue {
    match payload {
        JsonValue::Object(fields) if fields.contains_key(WORKFLOW_KEY) => {
            let mut fields = fields.clone();
            fields.remove(WORKFLOW_KEY);
            JsonValue::Object(fields)
        }
        other => other.clone(),
    }
}

/// Payload for the project steps: the quote snapshot plus the project id.
fn project_payload(payload: &JsonValue, project_id: &str) -> JsonValue {
    match payload {
        JsonValue::Object(fields) => {
            let mut fields = fields.clone();
            fields.remove(WORKFLOW_KEY);
            fields.insert("project_id".to_string(), json!(project_id));
            JsonValue::Object(fields)
        }
        JsonValue::Null => json!({ "project_id": project_id }),
        other => json!({ "project_id": project_id, "data": other }),
    }
}
