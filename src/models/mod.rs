//! # Data Models
//!
//! SeaORM entities for the queue, the attempt log and the external id
//! mappings, plus the typed vocabulary they share.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub mod external_id_mapping;
pub mod sync_job;
pub mod sync_log;
pub mod types;

pub use external_id_mapping::Entity as ExternalIdMapping;
pub use sync_job::Entity as SyncJob;
pub use sync_log::Entity as SyncLog;
pub use types::{EntityType, JobStatus, LogStatus, ParseKindError, Priority, SyncAction, TargetService};

/// Basic service information response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ServiceInfo {
    /// The name of the service
    pub service: String,
    /// The version of the service
    pub version: String,
}

impl Default for ServiceInfo {
    fn default() -> Self {
        Self {
            service: "sync-engine".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}
