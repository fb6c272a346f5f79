//! Scripted adapter
//!
//! In-process adapter whose responses are scripted up front. Used for local
//! dry runs without credentials and by the test suites to drive the dispatcher
//! and orchestrator through specific failure sequences.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use super::{Adapter, ConnectionError, SyncError, SyncOutcome, SyncRequest};
use crate::models::{EntityType, SyncAction, TargetService};

/// One call observed by a [`ScriptedAdapter`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub action: SyncAction,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub payload: JsonValue,
    pub idempotency_key: String,
}

#[derive(Debug)]
struct Script {
    queued: VecDeque<Result<SyncOutcome, SyncError>>,
    fallback: Result<SyncOutcome, SyncError>,
    connection: Result<(), ConnectionError>,
    calls: Vec<RecordedCall>,
}

#[derive(Debug)]
pub struct ScriptedAdapter {
    service: TargetService,
    configured: bool,
    delay: Option<Duration>,
    script: Mutex<Script>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl ScriptedAdapter {
    /// Adapter that succeeds on every call.
    pub fn new(service: TargetService) -> Self {
        Self {
            service,
            configured: true,
            delay: None,
            script: Mutex::new(Script {
                queued: VecDeque::new(),
                fallback: Ok(SyncOutcome::default()),
                connection: Ok(()),
                calls: Vec::new(),
            }),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    /// Adapter without credentials; `test_connection` reports `NotConfigured`.
    pub fn unconfigured(service: TargetService) -> Self {
        let adapter = Self::new(service).with_connection(Err(ConnectionError::NotConfigured(
            format!("no credentials for {service}"),
        )));
        Self {
            configured: false,
            ..adapter
        }
    }

    /// Result returned once the queued results are used up.
    pub fn with_fallback(self, result: Result<SyncOutcome, SyncError>) -> Self {
        self.lock().fallback = result;
        self
    }

    pub fn with_connection(self, result: Result<(), ConnectionError>) -> Self {
        self.lock().connection = result;
        self
    }

    /// Simulated latency of every `sync` call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Queue a result for the next unanswered call.
    pub fn push_result(&self, result: Result<SyncOutcome, SyncError>) {
        self.lock().queued.push_back(result);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.lock().calls.clone()
    }

    pub fn call_count(&self) -> usize {
        self.lock().calls.len()
    }

    /// Highest number of `sync` calls observed running at once.
    pub fn peak_concurrency(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Adapter for ScriptedAdapter {
    fn service(&self) -> TargetService {
        self.service
    }

    fn is_configured(&self) -> bool {
        self.configured
    }

    async fn test_connection(&self) -> Result<(), ConnectionError> {
        self.lock().connection.clone()
    }

    async fn sync(&self, request: &SyncRequest<'_>) -> Result<SyncOutcome, SyncError> {
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(running, Ordering::SeqCst);

        let result = {
            let mut script = self.lock();
            script.calls.push(RecordedCall {
                action: request.action,
                entity_type: request.entity_type,
                entity_id: request.entity_id.to_string(),
                payload: request.payload.clone(),
                idempotency_key: request.idempotency_key.to_string(),
            });
            let next = script.queued.pop_front();
            next.unwrap_or_else(|| script.fallback.clone())
        };

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn replays_queued_results_then_fallback() {
        let adapter = ScriptedAdapter::new(TargetService::Crm)
            .with_fallback(Ok(SyncOutcome::with_external_id("deal-1")));
        adapter.push_result(Err(SyncError::transient("flaky")));

        let payload = json!({"name": "x"});
        let request = SyncRequest {
            action: SyncAction::Create,
            entity_type: EntityType::Project,
            entity_id: "p-1",
            payload: &payload,
            idempotency_key: "crm:job-1",
        };

        assert!(adapter.sync(&request).await.is_err());
        let outcome = adapter.sync(&request).await.unwrap();
        assert_eq!(outcome.external_id.as_deref(), Some("deal-1"));
        assert_eq!(adapter.call_count(), 2);
        assert_eq!(adapter.calls()[0].payload, payload);
        assert_eq!(adapter.calls()[1].idempotency_key, "crm:job-1");
    }

    #[tokio::test]
    async fn unconfigured_adapter_reports_not_configured() {
        let adapter = ScriptedAdapter::unconfigured(TargetService::Desk);
        assert!(!adapter.is_configured());
        assert!(matches!(
            adapter.test_connection().await,
            Err(ConnectionError::NotConfigured(_))
        ));
    }
}
