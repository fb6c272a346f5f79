//! Adapter registry
//!
//! Maps each target service to its adapter. Built once at startup from
//! configuration and passed explicitly to the dispatcher, orchestrator and
//! health checks.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use super::{Adapter, AdapterError, HttpAdapter};
use crate::config::AppConfig;
use crate::models::TargetService;

/// Error type for registry operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("no adapter configured for service '{service}'")]
    NotConfigured { service: TargetService },
}

#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: BTreeMap<TargetService, Arc<dyn Adapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build HTTP adapters for every service with an endpoint in `config`.
    ///
    /// Endpoints without credentials are still registered so health checks can
    /// report them as not configured.
    pub fn from_config(config: &AppConfig) -> Result<Self, AdapterError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.dispatcher.adapter_timeout_seconds))
            .user_agent(concat!("sync-engine/", env!("CARGO_PKG_VERSION")))
            .build()?;

        let mut registry = Self::new();
        for (service, endpoint) in &config.services {
            let adapter = HttpAdapter::new(*service, endpoint, client.clone())?;
            if !adapter.is_configured() {
                warn!(target_service = %service, "Adapter registered without credentials");
            }
            registry.register(Arc::new(adapter));
        }

        info!(
            services = ?registry.configured_services(),
            "Adapter registry initialized"
        );
        Ok(registry)
    }

    /// Register an adapter, replacing any previous one for the same service.
    pub fn register(&mut self, adapter: Arc<dyn Adapter>) {
        self.adapters.insert(adapter.service(), adapter);
    }

    pub fn get(&self, service: TargetService) -> Result<Arc<dyn Adapter>, RegistryError> {
        self.adapters
            .get(&service)
            .cloned()
            .ok_or(RegistryError::NotConfigured { service })
    }

    pub fn contains(&self, service: TargetService) -> bool {
        self.adapters.contains_key(&service)
    }

    /// Whether `service` has a registered adapter with credentials.
    pub fn is_configured(&self, service: TargetService) -> bool {
        self.adapters
            .get(&service)
            .is_some_and(|adapter| adapter.is_configured())
    }

    /// Services with a registered adapter that has credentials.
    pub fn configured_services(&self) -> Vec<TargetService> {
        self.adapters
            .iter()
            .filter(|(_, adapter)| adapter.is_configured())
            .map(|(service, _)| *service)
            .collect()
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("services", &self.adapters.keys().collect::<Vec<_>>())
            .finish()
    }
}
