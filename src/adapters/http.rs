//! REST adapter shared by every external service.
//!
//! Each service exposes the same resource-oriented API shape: `POST` to create,
//! `PUT` to update and `DELETE` to remove, keyed by the business entity id.
//! Requests carry the caller's `Idempotency-Key`, so a redelivered job is
//! recognised remotely while a later change to the same entity is not.

use async_trait::async_trait;
use reqwest::{Method, Response, StatusCode, header};
use serde_json::Value as JsonValue;
use url::Url;

use super::auth::{Credentials, TokenProvider};
use super::error::{AdapterError, ConnectionError, SyncError};
use super::{Adapter, SyncOutcome, SyncRequest};
use crate::config::ServiceEndpointConfig;
use crate::models::{EntityType, SyncAction, TargetService};

/// Longest upstream body kept in error messages.
const MAX_BODY_SNIPPET: usize = 512;

/// Collection path for an entity type on a given service.
pub fn resource_path(service: TargetService, entity_type: EntityType) -> &'static str {
    match (service, entity_type) {
        (TargetService::Crm, EntityType::Project) => "deals",
        (TargetService::Fsm, EntityType::Project) => "work_orders",
        (TargetService::Books, EntityType::Inventory) => "items",
        (TargetService::People, EntityType::TimeEntry) => "timesheets",
        (TargetService::Desk, _) => "tickets",
        (_, EntityType::Project) => "projects",
        (_, EntityType::TimeEntry) => "time_entries",
        (_, EntityType::Expense) => "expenses",
        (_, EntityType::Inventory) => "inventory",
        (_, EntityType::Quote) => "quotes",
    }
}

/// Adapter speaking the common REST dialect of the external services.
pub struct HttpAdapter {
    service: TargetService,
    base_url: Url,
    client: reqwest::Client,
    tokens: TokenProvider,
}

impl HttpAdapter {
    pub fn new(
        service: TargetService,
        endpoint: &ServiceEndpointConfig,
        client: reqwest::Client,
    ) -> Result<Self, AdapterError> {
        let mut base_url = Url::parse(&endpoint.base_url).map_err(|err| {
            AdapterError::configuration(format!(
                "invalid base url '{}' for {}: {}",
                endpoint.base_url, service, err
            ))
        })?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        Ok(Self {
            service,
            base_url,
            client,
            tokens: TokenProvider::new(Credentials::from_endpoint(endpoint)),
        })
    }

    fn url(&self, path: &str) -> Result<Url, AdapterError> {
        self.base_url
            .join(path)
            .map_err(|err| AdapterError::configuration(format!("invalid resource path: {err}")))
    }

    async fn send(
        &self,
        method: Method,
        url: Url,
        idempotency_key: Option<&str>,
        body: Option<&JsonValue>,
    ) -> Result<Response, AdapterError> {
        let mut refreshed = false;
        loop {
            let token = self.tokens.bearer(&self.client).await?;
            let mut request = self
                .client
                .request(method.clone(), url.clone())
                .bearer_auth(token)
                .header(header::ACCEPT, "application/json");
            if let Some(key) = idempotency_key {
                request = request.header("Idempotency-Key", key);
            }
            if let Some(body) = body {
                request = request.json(body);
            }

            let response = request.send().await?;

            // A cached OAuth token may have been revoked early; refresh once.
            if response.status() == StatusCode::UNAUTHORIZED
                && !refreshed
                && matches!(self.tokens.credentials(), Credentials::OAuthRefresh(_))
            {
                tracing::debug!(target_service = %self.service, "Access token rejected, refreshing");
                self.tokens.invalidate().await;
                refreshed = true;
                continue;
            }

            return Ok(response);
        }
    }
}

#[async_trait]
impl Adapter for HttpAdapter {
    fn service(&self) -> TargetService {
        self.service
    }

    fn is_configured(&self) -> bool {
        self.tokens.credentials().is_configured()
    }

    async fn test_connection(&self) -> Result<(), ConnectionError> {
        if !self.is_configured() {
            return Err(ConnectionError::NotConfigured(format!(
                "no credentials for {}",
                self.service
            )));
        }

        let url = self.url("ping")?;
        let response = self.send(Method::GET, url, None, None).await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        Err(error_from_response(response).await.into())
    }

    async fn sync(&self, request: &SyncRequest<'_>) -> Result<SyncOutcome, SyncError> {
        let collection = resource_path(self.service, request.entity_type);

        let (method, path) = match request.action {
            SyncAction::Create => (Method::POST, collection.to_string()),
            SyncAction::Update => (Method::PUT, format!("{collection}/{}", request.entity_id)),
            SyncAction::Delete => (
                Method::DELETE,
                format!("{collection}/{}", request.entity_id),
            ),
        };
        let url = self.url(&path)?;
        let body = match request.action {
            SyncAction::Delete => None,
            _ => Some(request.payload),
        };

        let response = self
            .send(method, url, Some(request.idempotency_key), body)
            .await?;
        let status = response.status();

        // Deleting something already gone is the outcome we wanted.
        if request.action == SyncAction::Delete && status == StatusCode::NOT_FOUND {
            return Ok(SyncOutcome::default());
        }

        if !status.is_success() {
            return Err(error_from_response(response).await.into());
        }

        let body: Option<JsonValue> = if status == StatusCode::NO_CONTENT {
            None
        } else {
            let text = response.text().await.map_err(AdapterError::from)?;
            if text.trim().is_empty() {
                None
            } else {
                Some(serde_json::from_str(&text).map_err(|err| {
                    AdapterError::MalformedResponse {
                        details: err.to_string(),
                    }
                })?)
            }
        };

        Ok(SyncOutcome {
            external_id: body.as_ref().and_then(extract_id),
            response: body,
        })
    }
}

async fn error_from_response(response: Response) -> AdapterError {
    let status = response.status().as_u16();
    let retry_after = response
        .headers()
        .get(header::RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok());
    let body = response.text().await.ok().map(|body| {
        if body.chars().count() > MAX_BODY_SNIPPET {
            let truncated: String = body.chars().take(MAX_BODY_SNIPPET).collect();
            format!("{truncated}...")
        } else {
            body
        }
    });

    AdapterError::Http {
        status,
        body,
        retry_after,
    }
}

/// Remote id from `{"id": ..}` or `{"data": {"id": ..}}`, string or number.
fn extract_id(body: &JsonValue) -> Option<String> {
    let id = body
        .get("id")
        .or_else(|| body.get("data").and_then(|data| data.get("id")))?;
    match id {
        JsonValue::String(value) => Some(value.clone()),
        JsonValue::Number(value) => Some(value.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, header as header_eq, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn adapter(service: TargetService, base_url: &str, api_key: Option<&str>) -> HttpAdapter {
        let endpoint = ServiceEndpointConfig {
            base_url: base_url.to_string(),
            api_key: api_key.map(str::to_string),
            ..Default::default()
        };
        HttpAdapter::new(service, &endpoint, reqwest::Client::new()).unwrap()
    }

    fn request<'a>(action: SyncAction, payload: &'a JsonValue) -> SyncRequest<'a> {
        SyncRequest {
            action,
            entity_type: EntityType::Project,
            entity_id: "p-1",
            payload,
            idempotency_key: "crm:job-1",
        }
    }

    #[tokio::test]
    async fn create_posts_payload_and_returns_remote_id() {
        let server = MockServer::start().await;
        let payload = json!({"name": "Roof repair"});
        Mock::given(method("POST"))
            .and(path("/api/deals"))
            .and(header_eq("authorization", "Bearer secret"))
            .and(header_eq("idempotency-key", "crm:job-1"))
            .and(body_json(&payload))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": 991})))
            .expect(1)
            .mount(&server)
            .await;

        let adapter = adapter(
            TargetService::Crm,
            &format!("{}/api", server.uri()),
            Some("secret"),
        );
        let outcome = adapter
            .sync(&request(SyncAction::Create, &payload))
            .await
            .unwrap();

        assert_eq!(outcome.external_id.as_deref(), Some("991"));
    }

    #[tokio::test]
    async fn update_targets_entity_path() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/work_orders/p-1"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let adapter = adapter(TargetService::Fsm, &server.uri(), Some("secret"));
        let outcome = adapter
            .sync(&request(SyncAction::Update, &json!({})))
            .await
            .unwrap();
        assert!(outcome.external_id.is_none());
    }

    #[tokio::test]
    async fn delete_of_missing_record_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/deals/p-1"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let adapter = adapter(TargetService::Crm, &server.uri(), Some("secret"));
        assert!(
            adapter
                .sync(&request(SyncAction::Delete, &json!({})))
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn upstream_failures_are_classified() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/deals"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "120"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/deals"))
            .respond_with(ResponseTemplate::new(422).set_body_string("name is required"))
            .mount(&server)
            .await;

        let adapter = adapter(TargetService::Crm, &server.uri(), Some("secret"));
        let payload = json!({});

        let throttled = adapter
            .sync(&request(SyncAction::Create, &payload))
            .await
            .unwrap_err();
        assert_eq!(
            throttled.kind,
            crate::adapters::SyncErrorKind::RateLimited {
                retry_after_secs: Some(120)
            }
        );

        let rejected = adapter
            .sync(&request(SyncAction::Create, &payload))
            .await
            .unwrap_err();
        assert_eq!(rejected.kind, crate::adapters::SyncErrorKind::Permanent);
        assert!(rejected.message.contains("name is required"));
    }

    #[tokio::test]
    async fn test_connection_reports_missing_credentials() {
        let adapter = adapter(TargetService::Desk, "https://desk.example.com", None);
        assert!(!adapter.is_configured());
        assert!(matches!(
            adapter.test_connection().await,
            Err(ConnectionError::NotConfigured(_))
        ));
    }

    #[tokio::test]
    async fn test_connection_pings_service() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ping"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let adapter = adapter(TargetService::Books, &server.uri(), Some("secret"));
        assert!(adapter.test_connection().await.is_ok());
    }

    #[test]
    fn resource_paths_follow_service_vocabulary() {
        assert_eq!(resource_path(TargetService::Crm, EntityType::Project), "deals");
        assert_eq!(resource_path(TargetService::Books, EntityType::Inventory), "items");
        assert_eq!(
            resource_path(TargetService::People, EntityType::TimeEntry),
            "timesheets"
        );
        assert_eq!(resource_path(TargetService::Quotewerks, EntityType::Quote), "quotes");
        assert_eq!(resource_path(TargetService::Books, EntityType::Expense), "expenses");
    }

    #[test]
    fn extracts_nested_ids() {
        assert_eq!(extract_id(&json!({"data": {"id": "abc"}})), Some("abc".into()));
        assert_eq!(extract_id(&json!({"name": "x"})), None);
    }
}
