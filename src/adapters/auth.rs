//! Outbound credentials for external services.
//!
//! A service authenticates either with a static API key or with an OAuth
//! refresh token exchanged for short-lived access tokens. Access tokens are
//! cached until shortly before they expire.

use std::time::Duration;

use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::error::AdapterError;
use crate::config::ServiceEndpointConfig;

/// Refresh this long before the provider-reported expiry.
const EXPIRY_SKEW: Duration = Duration::from_secs(60);
/// Used when the token endpoint omits `expires_in`.
const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthRefreshCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
    pub token_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    ApiKey(String),
    OAuthRefresh(OAuthRefreshCredentials),
    Missing,
}

impl Credentials {
    pub fn from_endpoint(endpoint: &ServiceEndpointConfig) -> Self {
        if let (Some(client_id), Some(client_secret), Some(refresh_token), Some(token_url)) = (
            endpoint.client_id.as_ref(),
            endpoint.client_secret.as_ref(),
            endpoint.refresh_token.as_ref(),
            endpoint.token_url.as_ref(),
        ) {
            return Credentials::OAuthRefresh(OAuthRefreshCredentials {
                client_id: client_id.clone(),
                client_secret: client_secret.clone(),
                refresh_token: refresh_token.clone(),
                token_url: token_url.clone(),
            });
        }

        match endpoint.api_key.as_ref() {
            Some(key) if !key.trim().is_empty() => Credentials::ApiKey(key.clone()),
            _ => Credentials::Missing,
        }
    }

    pub fn is_configured(&self) -> bool {
        !matches!(self, Credentials::Missing)
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    refresh_at: Instant,
}

/// Produces bearer tokens for one service.
#[derive(Debug)]
pub struct TokenProvider {
    credentials: Credentials,
    cache: Mutex<Option<CachedToken>>,
}

impl TokenProvider {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            cache: Mutex::new(None),
        }
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Current bearer token, refreshing through the token endpoint when needed.
    pub async fn bearer(&self, client: &reqwest::Client) -> Result<String, AdapterError> {
        match &self.credentials {
            Credentials::ApiKey(key) => Ok(key.clone()),
            Credentials::Missing => Err(AdapterError::configuration(
                "no api key or OAuth refresh credentials configured",
            )),
            Credentials::OAuthRefresh(oauth) => {
                let mut cache = self.cache.lock().await;
                if let Some(token) = cache.as_ref()
                    && Instant::now() < token.refresh_at
                {
                    return Ok(token.access_token.clone());
                }

                let token = refresh_access_token(client, oauth).await?;
                let access_token = token.access_token.clone();
                *cache = Some(token);
                Ok(access_token)
            }
        }
    }

    /// Drop the cached access token so the next call refreshes it.
    pub async fn invalidate(&self) {
        self.cache.lock().await.take();
    }
}

async fn refresh_access_token(
    client: &reqwest::Client,
    oauth: &OAuthRefreshCredentials,
) -> Result<CachedToken, AdapterError> {
    tracing::debug!(token_url = %oauth.token_url, "Refreshing access token");

    let body = url::form_urlencoded::Serializer::new(String::new())
        .append_pair("grant_type", "refresh_token")
        .append_pair("refresh_token", &oauth.refresh_token)
        .append_pair("client_id", &oauth.client_id)
        .append_pair("client_secret", &oauth.client_secret)
        .finish();

    let response = client
        .post(&oauth.token_url)
        .header(
            reqwest::header::CONTENT_TYPE,
            "application/x-www-form-urlencoded",
        )
        .body(body)
        .send()
        .await?;

    let status = response.status();
    if status.as_u16() == 400 || status.as_u16() == 401 {
        let body = response.text().await.unwrap_or_default();
        return Err(AdapterError::Authentication {
            details: format!("token refresh rejected ({}): {}", status.as_u16(), body),
        });
    }
    if !status.is_success() {
        let body = response.text().await.ok();
        return Err(AdapterError::Http {
            status: status.as_u16(),
            body,
            retry_after: None,
        });
    }

    let token: TokenResponse = response.json().await?;
    let ttl = token
        .expires_in
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_TOKEN_TTL);

    Ok(CachedToken {
        access_token: token.access_token,
        refresh_at: Instant::now() + ttl.saturating_sub(EXPIRY_SKEW),
    })
}
