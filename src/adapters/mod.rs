//! Adapters module
//!
//! Uniform contract for the external services a sync job can target:
//! - The `Adapter` trait every service implementation follows
//! - The error taxonomy the dispatcher classifies failures with
//! - `AdapterRegistry`, populated once at startup from configuration
//! - `HttpAdapter`, the REST implementation shared by all services

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::models::{EntityType, SyncAction, TargetService};

pub mod auth;
pub mod error;
pub mod http;
pub mod registry;
pub mod scripted;

pub use error::{AdapterError, ConnectionError, SyncError, SyncErrorContext, SyncErrorKind};
pub use http::HttpAdapter;
pub use registry::{AdapterRegistry, RegistryError};
pub use scripted::ScriptedAdapter;

/// One entity change pushed to a service.
#[derive(Debug, Clone, Copy)]
pub struct SyncRequest<'a> {
    pub action: SyncAction,
    pub entity_type: EntityType,
    pub entity_id: &'a str,
    /// Snapshot captured at enqueue time
    pub payload: &'a JsonValue,
    /// Stable across redeliveries of one job, distinct between jobs
    pub idempotency_key: &'a str,
}

/// What the remote side reported back for a successful sync.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncOutcome {
    /// Identifier of the record created or touched remotely, when reported
    pub external_id: Option<String>,
    pub response: Option<JsonValue>,
}

impl SyncOutcome {
    pub fn with_external_id<S: Into<String>>(external_id: S) -> Self {
        Self {
            external_id: Some(external_id.into()),
            response: None,
        }
    }
}

#[async_trait]
pub trait Adapter: Send + Sync {
    /// Service this adapter talks to.
    fn service(&self) -> TargetService;

    /// Whether credentials are present. Unconfigured adapters are reported as
    /// `not_configured` by health checks instead of failing.
    fn is_configured(&self) -> bool {
        true
    }

    /// Verify credentials and reachability without side effects.
    async fn test_connection(&self) -> Result<(), ConnectionError>;

    /// Push one entity change. Implementations must be safe to call again with
    /// the same request since delivery is at-least-once.
    async fn sync(&self, request: &SyncRequest<'_>) -> Result<SyncOutcome, SyncError>;
}
