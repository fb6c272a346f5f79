//! # Server Configuration
//!
//! Router construction and process wiring: the HTTP surface and the
//! dispatcher loop share one set of stores and one adapter registry.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{
    Router,
    extract::Request,
    http::HeaderValue,
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
};
use sea_orm::DatabaseConnection;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme};
use utoipa::{Modify, OpenApi};
use utoipa_swagger_ui::SwaggerUi;

use crate::adapters::AdapterRegistry;
use crate::auth::operator_auth_middleware;
use crate::config::AppConfig;
use crate::dispatcher::Dispatcher;
use crate::handlers;
use crate::health::HealthAggregator;
use crate::orchestrator::Orchestrator;
use crate::rate_limit::ServiceRateLimiter;
use crate::repositories::{SeaOrmLogStore, SeaOrmMappingStore, SeaOrmQueueStore};
use crate::telemetry::{TraceContext, with_trace_context};

/// Header carrying the request correlation id in both directions.
pub const TRACE_ID_HEADER: &str = "x-trace-id";

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub db: DatabaseConnection,
    pub health: HealthAggregator,
    pub orchestrator: Orchestrator,
}

/// Stores, registry and engines built from one configuration.
pub struct Engine {
    pub state: AppState,
    pub dispatcher: Dispatcher,
}

impl Engine {
    pub fn new(config: AppConfig, db: DatabaseConnection, registry: AdapterRegistry) -> Self {
        let config = Arc::new(config);
        let registry = Arc::new(registry);

        let queue = Arc::new(SeaOrmQueueStore::from_config(db.clone(), &config));
        let logs = Arc::new(SeaOrmLogStore::new(db.clone()));
        let mappings = Arc::new(SeaOrmMappingStore::new(db.clone()));

        let orchestrator = Orchestrator::new(queue.clone(), mappings, registry.clone());
        let limiter = Arc::new(ServiceRateLimiter::from_config(&config.rate_limits));
        let dispatcher = Dispatcher::new(
            queue.clone(),
            registry.clone(),
            limiter,
            config.dispatcher.clone(),
        )
        .with_hook(Arc::new(orchestrator.clone()));

        let health = HealthAggregator::new(
            db.clone(),
            queue,
            logs,
            registry,
            HealthAggregator::required_services(&config),
        )
        .with_check_timeout(Duration::from_secs(
            config.dispatcher.adapter_timeout_seconds,
        ));

        Self {
            state: AppState {
                config,
                db,
                health,
                orchestrator,
            },
            dispatcher,
        }
    }
}

/// Creates and configures the Axum application router
pub fn create_app(state: AppState) -> Router {
    let operator_routes = Router::new()
        .route("/health/test-sync", post(handlers::test_sync))
        .route_layer(middleware::from_fn_with_state(
            state.config.clone(),
            operator_auth_middleware,
        ));

    Router::new()
        .route("/", get(handlers::root))
        .route("/health", get(handlers::health))
        .route("/health/sync", get(handlers::sync_health))
        .merge(operator_routes)
        .with_state(state)
        .merge(SwaggerUi::new("/docs").url("/openapi.json", ApiDoc::openapi()))
        .layer(middleware::from_fn(trace_context_middleware))
        .layer(TraceLayer::new_for_http())
}

/// Scope each request in a trace context, reusing an inbound `x-trace-id`.
async fn trace_context_middleware(request: Request, next: Next) -> Response {
    let context = request
        .headers()
        .get(TRACE_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty() && value.len() <= 64)
        .map(|trace_id| TraceContext {
            trace_id: trace_id.to_string(),
        })
        .unwrap_or_else(TraceContext::generate);

    let trace_id = context.trace_id.clone();
    let mut response = with_trace_context(context, next.run(request)).await;
    if let Ok(value) = HeaderValue::from_str(&trace_id) {
        response.headers_mut().insert(TRACE_ID_HEADER, value);
    }
    response
}

/// Serve HTTP and run the dispatcher until Ctrl-C.
pub async fn run_server(config: AppConfig, db: DatabaseConnection) -> anyhow::Result<()> {
    let addr = config.bind_addr().context("Invalid server address")?;
    let registry = AdapterRegistry::from_config(&config).context("Failed to build adapters")?;

    let Engine { state, dispatcher } = Engine::new(config, db, registry);
    let profile = state.config.profile.clone();
    let app = create_app(state);

    let shutdown = CancellationToken::new();
    let dispatcher_task = tokio::spawn(dispatcher.run(shutdown.clone()));

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    tracing::info!(%addr, %profile, "Server listening");

    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %err, "Failed to listen for shutdown signal");
            }
            tracing::info!("Shutdown requested");
            signal.cancel();
        })
        .await
        .context("HTTP server failed")?;

    // The server can also stop on its own; make sure the dispatcher follows.
    shutdown.cancel();
    if let Err(err) = dispatcher_task.await {
        tracing::error!(error = %err, "Dispatcher task panicked");
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

struct BearerAuthAddon;

impl Modify for BearerAuthAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_scheme(
            "bearer_auth",
            SecurityScheme::Http(HttpBuilder::new().scheme(HttpAuthScheme::Bearer).build()),
        );
    }
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        crate::handlers::root,
        crate::handlers::health::health,
        crate::handlers::health::sync_health,
        crate::handlers::health::test_sync,
    ),
    components(
        schemas(
            crate::models::ServiceInfo,
            crate::error::ApiError,
            crate::handlers::health::TestSyncRequest,
            crate::health::HealthStatus,
            crate::health::HealthCheck,
            crate::health::HealthChecks,
            crate::health::SystemHealth,
            crate::health::SyncHealth,
            crate::health::QueueSummary,
            crate::health::WindowSummary,
            crate::orchestrator::Workflow,
            crate::orchestrator::StepStatus,
            crate::orchestrator::StepReport,
            crate::orchestrator::WorkflowReport,
        )
    ),
    modifiers(&BearerAuthAddon),
    tags(
        (name = "root", description = "Service information"),
        (name = "health", description = "Health reporting and diagnostics")
    ),
    info(
        title = "Sync Engine API",
        description = "Operational API for the sync queue and orchestration engine",
        version = env!("CARGO_PKG_VERSION"),
    )
)]
pub struct ApiDoc;
