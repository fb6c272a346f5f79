//! # Health API Handlers
//!
//! Aggregate and queue health reports plus the operator-only diagnostic
//! workflow runner.

use axum::{
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
    response::Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use utoipa::ToSchema;

use crate::auth::OperatorAuth;
use crate::error::{ApiError, validation_error};
use crate::health::{HealthStatus, SyncHealth, SystemHealth};
use crate::orchestrator::{Workflow, WorkflowReport};
use crate::server::AppState;

/// Request body for the diagnostic workflow runner
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TestSyncRequest {
    /// Workflow to run inline
    pub workflow: Workflow,
    /// Entity the first step operates on (a quote id for quote workflows)
    #[schema(example = "42")]
    pub entity_id: String,
    /// Entity snapshot passed to the adapters; defaults to an empty object
    #[serde(default)]
    #[schema(value_type = Option<Object>)]
    pub payload: Option<JsonValue>,
}

/// Aggregate health of the database, every external service and the queue
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "System is healthy or degraded", body = SystemHealth),
        (status = 503, description = "System is critical", body = SystemHealth)
    ),
    tag = "health"
)]
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<SystemHealth>) {
    let report = state.health.system_health(Utc::now()).await;
    let status = if report.status == HealthStatus::Critical {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (status, Json(report))
}

/// Queue backlog and last-24h attempt statistics
#[utoipa::path(
    get,
    path = "/health/sync",
    responses(
        (status = 200, description = "Queue health", body = SyncHealth)
    ),
    tag = "health"
)]
pub async fn sync_health(State(state): State<AppState>) -> Json<SyncHealth> {
    Json(state.health.sync_health(Utc::now()).await)
}

/// Run a workflow synchronously and report every step
///
/// Calls the external services for real; the queue and the sync log are not
/// touched. Quote conversions still record their id mapping.
#[utoipa::path(
    post,
    path = "/health/test-sync",
    request_body = TestSyncRequest,
    security(("bearer_auth" = [])),
    responses(
        (status = 200, description = "Workflow report", body = WorkflowReport),
        (status = 400, description = "Invalid request", body = ApiError),
        (status = 401, description = "Missing or invalid operator token", body = ApiError)
    ),
    tag = "health"
)]
pub async fn test_sync(
    State(state): State<AppState>,
    _auth: OperatorAuth,
    body: Result<Json<TestSyncRequest>, JsonRejection>,
) -> Result<Json<WorkflowReport>, ApiError> {
    let Json(request) = body?;

    let entity_id = request.entity_id.trim();
    if entity_id.is_empty() {
        return Err(validation_error(
            "Invalid test-sync request",
            json!({ "entity_id": "must not be empty" }),
        ));
    }

    let payload = request.payload.unwrap_or_else(|| json!({}));
    tracing::info!(
        workflow = %request.workflow,
        entity_id,
        "Running diagnostic workflow"
    );

    let report = state
        .orchestrator
        .run_sync(request.workflow, entity_id, &payload)
        .await;
    Ok(Json(report))
}
