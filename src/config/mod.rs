//! Configuration loading for the sync engine.
//!
//! Loads layered `.env` files and environment variables prefixed with
//! `SYNC_ENGINE_`, producing a typed [`AppConfig`] that is loaded once at
//! startup and passed by reference.

use std::{collections::BTreeMap, env, net::SocketAddr, path::PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::TargetService;
use crate::retry::RetryPolicy;

const ENV_PREFIX: &str = "SYNC_ENGINE_";
const REDACTED: &str = "[REDACTED]";

/// Application configuration derived from `SYNC_ENGINE_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct AppConfig {
    #[serde(default = "default_profile")]
    pub profile: String,
    #[serde(default = "default_api_bind_addr")]
    pub api_bind_addr: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,
    #[serde(default = "default_db_acquire_timeout_ms")]
    pub db_acquire_timeout_ms: u64,
    /// Bearer tokens accepted by the diagnostic endpoint
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub operator_tokens: Vec<String>,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub rate_limits: RateLimitConfig,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub services: BTreeMap<TargetService, ServiceEndpointConfig>,
}

/// Dispatcher tick and worker pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct DispatcherConfig {
    /// Seconds between dispatch cycles
    ///
    /// Environment variable: `SYNC_ENGINE_DISPATCHER_TICK_INTERVAL_SECONDS`
    #[serde(default = "default_dispatcher_tick_interval_seconds")]
    pub tick_interval_seconds: u64,

    /// Concurrent workers per cycle; also the lease batch size
    ///
    /// Environment variable: `SYNC_ENGINE_DISPATCHER_POOL_SIZE`
    #[serde(default = "default_dispatcher_pool_size")]
    pub pool_size: usize,

    /// How long a leased job stays reserved before it is considered abandoned
    ///
    /// Environment variable: `SYNC_ENGINE_DISPATCHER_LEASE_SECONDS`
    #[serde(default = "default_dispatcher_lease_seconds")]
    pub lease_seconds: u64,

    /// Upper bound on a single adapter call
    ///
    /// Environment variable: `SYNC_ENGINE_DISPATCHER_ADAPTER_TIMEOUT_SECONDS`
    #[serde(default = "default_dispatcher_adapter_timeout_seconds")]
    pub adapter_timeout_seconds: u64,
}

/// Outbound request budgets per target service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct RateLimitConfig {
    /// Environment variable: `SYNC_ENGINE_RATE_LIMIT_DEFAULT_PER_MINUTE`
    #[serde(default = "default_requests_per_minute")]
    pub default_requests_per_minute: u32,

    /// Environment variable: `SYNC_ENGINE_RATE_LIMIT_{SERVICE}_PER_MINUTE`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub service_overrides: BTreeMap<TargetService, u32>,
}

impl RateLimitConfig {
    pub fn requests_per_minute(&self, service: TargetService) -> u32 {
        self.service_overrides
            .get(&service)
            .copied()
            .unwrap_or(self.default_requests_per_minute)
    }
}

/// Connection settings for one external service.
///
/// Environment variables: `SYNC_ENGINE_SERVICE_{SERVICE}_{FIELD}`, e.g.
/// `SYNC_ENGINE_SERVICE_CRM_BASE_URL`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct ServiceEndpointConfig {
    pub base_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_url: Option<String>,
    /// A failing required service makes overall health critical
    #[serde(default = "default_service_required")]
    pub required: bool,
}

impl ServiceEndpointConfig {
    fn oauth_fields(&self) -> [&Option<String>; 4] {
        [
            &self.client_id,
            &self.client_secret,
            &self.refresh_token,
            &self.token_url,
        ]
    }

    fn validate(&self, service: TargetService) -> Result<(), ConfigError> {
        if let Err(source) = url::Url::parse(&self.base_url) {
            return Err(ConfigError::InvalidServiceBaseUrl {
                service: service.to_string(),
                value: self.base_url.clone(),
                source,
            });
        }

        let present = self.oauth_fields().iter().filter(|f| f.is_some()).count();
        if present != 0 && present != 4 {
            return Err(ConfigError::IncompleteOAuthCredentials {
                service: service.to_string(),
            });
        }

        if let Some(token_url) = &self.token_url
            && let Err(source) = url::Url::parse(token_url)
        {
            return Err(ConfigError::InvalidServiceBaseUrl {
                service: service.to_string(),
                value: token_url.clone(),
                source,
            });
        }

        Ok(())
    }
}

impl Default for ServiceEndpointConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key: None,
            client_id: None,
            client_secret: None,
            refresh_token: None,
            token_url: None,
            required: default_service_required(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            profile: default_profile(),
            api_bind_addr: default_api_bind_addr(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            database_url: default_database_url(),
            db_max_connections: default_db_max_connections(),
            db_acquire_timeout_ms: default_db_acquire_timeout_ms(),
            operator_tokens: Vec::new(),
            dispatcher: DispatcherConfig::default(),
            retry: RetryPolicy::default(),
            rate_limits: RateLimitConfig::default(),
            services: BTreeMap::new(),
        }
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            tick_interval_seconds: default_dispatcher_tick_interval_seconds(),
            pool_size: default_dispatcher_pool_size(),
            lease_seconds: default_dispatcher_lease_seconds(),
            adapter_timeout_seconds: default_dispatcher_adapter_timeout_seconds(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            default_requests_per_minute: default_requests_per_minute(),
            service_overrides: BTreeMap::new(),
        }
    }
}

impl DispatcherConfig {
    /// Validate dispatcher bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=3600).contains(&self.tick_interval_seconds) {
            return Err(ConfigError::InvalidDispatcherTickInterval {
                value: self.tick_interval_seconds,
            });
        }

        if self.pool_size == 0 || self.pool_size > 64 {
            return Err(ConfigError::InvalidDispatcherPoolSize {
                value: self.pool_size,
            });
        }

        if self.adapter_timeout_seconds == 0 {
            return Err(ConfigError::InvalidAdapterTimeout {
                value: self.adapter_timeout_seconds,
            });
        }

        // A lease must outlive the call it protects.
        if self.lease_seconds < self.adapter_timeout_seconds {
            return Err(ConfigError::LeaseShorterThanTimeout {
                lease: self.lease_seconds,
                timeout: self.adapter_timeout_seconds,
            });
        }

        Ok(())
    }
}

fn validate_retry(policy: &RetryPolicy) -> Result<(), ConfigError> {
    if policy.base_seconds > policy.max_seconds {
        return Err(ConfigError::InvalidRetryBounds {
            base: policy.base_seconds,
            max: policy.max_seconds,
        });
    }

    if policy.max_attempts == 0 {
        return Err(ConfigError::InvalidMaxAttempts);
    }

    Ok(())
}

impl RateLimitConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_requests_per_minute == 0 {
            return Err(ConfigError::InvalidRateLimit {
                service: "default".to_string(),
            });
        }

        if let Some((service, _)) = self.service_overrides.iter().find(|(_, rpm)| **rpm == 0) {
            return Err(ConfigError::InvalidRateLimit {
                service: service.to_string(),
            });
        }

        Ok(())
    }
}

impl AppConfig {
    /// Returns the configured bind address as a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        self.api_bind_addr.parse()
    }

    /// Whether a failing `service` should make overall health critical.
    pub fn is_required(&self, service: TargetService) -> bool {
        self.services
            .get(&service)
            .map(|endpoint| endpoint.required)
            .unwrap_or(false)
    }

    /// Returns a redacted JSON representation (secrets are redacted).
    pub fn redacted_json(&self) -> serde_json::Result<String> {
        let mut config = self.clone();
        if !config.operator_tokens.is_empty() {
            config.operator_tokens = vec![REDACTED.to_string()];
        }
        for endpoint in config.services.values_mut() {
            for secret in [
                &mut endpoint.api_key,
                &mut endpoint.client_secret,
                &mut endpoint.refresh_token,
            ] {
                if secret.is_some() {
                    *secret = Some(REDACTED.to_string());
                }
            }
        }
        serde_json::to_string_pretty(&config)
    }

    /// Validates the configuration, returning the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !matches!(self.profile.as_str(), "local" | "test") && self.operator_tokens.is_empty() {
            return Err(ConfigError::MissingOperatorTokens);
        }

        self.dispatcher.validate()?;
        validate_retry(&self.retry)?;
        self.rate_limits.validate()?;

        for (service, endpoint) in &self.services {
            endpoint.validate(*service)?;
        }

        Ok(())
    }
}

fn default_profile() -> String {
    "local".to_string()
}

fn default_api_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_database_url() -> String {
    "postgresql://localhost:5432/sync_engine".to_string()
}

fn default_db_max_connections() -> u32 {
    10
}

fn default_db_acquire_timeout_ms() -> u64 {
    5000
}

fn default_dispatcher_tick_interval_seconds() -> u64 {
    60 // 1 minute
}

fn default_dispatcher_pool_size() -> usize {
    8
}

fn default_dispatcher_lease_seconds() -> u64 {
    300 // 5 minutes
}

fn default_dispatcher_adapter_timeout_seconds() -> u64 {
    30
}

fn default_requests_per_minute() -> u32 {
    60
}

fn default_service_required() -> bool {
    true
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load environment file {path}: {source}")]
    EnvFile {
        path: PathBuf,
        source: dotenvy::Error,
    },
    #[error("invalid api bind address '{value}': {source}")]
    InvalidBindAddr {
        value: String,
        source: std::net::AddrParseError,
    },
    #[error(
        "no operator tokens configured; set SYNC_ENGINE_OPERATOR_TOKEN or SYNC_ENGINE_OPERATOR_TOKENS"
    )]
    MissingOperatorTokens,
    #[error("dispatcher tick interval must be between 1 and 3600 seconds, got {value}")]
    InvalidDispatcherTickInterval { value: u64 },
    #[error("dispatcher pool size must be between 1 and 64, got {value}")]
    InvalidDispatcherPoolSize { value: usize },
    #[error("adapter timeout must be positive, got {value}")]
    InvalidAdapterTimeout { value: u64 },
    #[error("dispatcher lease ({lease}s) must not be shorter than the adapter timeout ({timeout}s)")]
    LeaseShorterThanTimeout { lease: u64, timeout: u64 },
    #[error("retry base seconds ({base}) cannot be greater than max seconds ({max})")]
    InvalidRetryBounds { base: u64, max: u64 },
    #[error("retry max attempts must be at least 1")]
    InvalidMaxAttempts,
    #[error("rate limit for {service} must be at least 1 request per minute")]
    InvalidRateLimit { service: String },
    #[error("unknown target service '{value}' in {key}")]
    UnknownService { key: String, value: String },
    #[error("service {service} has settings but no SYNC_ENGINE_SERVICE_{service}_BASE_URL")]
    MissingServiceBaseUrl { service: String },
    #[error("invalid url '{value}' for service {service}: {source}")]
    InvalidServiceBaseUrl {
        service: String,
        value: String,
        source: url::ParseError,
    },
    #[error(
        "service {service} has an incomplete OAuth credential set; client id, client secret, refresh token and token url are all required"
    )]
    IncompleteOAuthCredentials { service: String },
}

fn parse_or<T: std::str::FromStr>(value: Option<String>, default: impl FnOnce() -> T) -> T {
    value.and_then(|v| v.trim().parse().ok()).unwrap_or_else(default)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.and_then(|val| {
        let trimmed = val.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn parse_service(key: &str, name: &str) -> Result<TargetService, ConfigError> {
    name.parse().map_err(|_| ConfigError::UnknownService {
        key: format!("{ENV_PREFIX}{key}"),
        value: name.to_string(),
    })
}

/// Loads configuration using layered `.env` files and `SYNC_ENGINE_*` env vars.
pub struct ConfigLoader {
    base_dir: PathBuf,
}

impl ConfigLoader {
    /// Creates a new loader rooted at the current working directory.
    pub fn new() -> Self {
        Self {
            base_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    /// Creates a loader rooted at the provided directory (useful for tests).
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let (mut layered, profile_hint) = self.collect_layered_env()?;

        // Overlay process environment last so it wins.
        for (key, value) in env::vars() {
            if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                layered.insert(stripped.to_string(), value);
            }
        }

        let profile = layered
            .remove("PROFILE")
            .filter(|v| !v.is_empty())
            .unwrap_or(profile_hint);
        let api_bind_addr = layered
            .remove("API_BIND_ADDR")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_api_bind_addr);
        let log_level = layered
            .remove("LOG_LEVEL")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_log_level);
        let log_format = layered
            .remove("LOG_FORMAT")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_log_format);
        let database_url = layered
            .remove("DATABASE_URL")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_database_url);
        let db_max_connections =
            parse_or(layered.remove("DB_MAX_CONNECTIONS"), default_db_max_connections);
        let db_acquire_timeout_ms = parse_or(
            layered.remove("DB_ACQUIRE_TIMEOUT_MS"),
            default_db_acquire_timeout_ms,
        );

        // Single token or comma-separated list
        let operator_tokens = if let Some(tokens) = layered.remove("OPERATOR_TOKENS") {
            tokens
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        } else if let Some(token) = non_empty(layered.remove("OPERATOR_TOKEN")) {
            vec![token]
        } else {
            Vec::new()
        };

        let dispatcher = DispatcherConfig {
            tick_interval_seconds: parse_or(
                layered.remove("DISPATCHER_TICK_INTERVAL_SECONDS"),
                default_dispatcher_tick_interval_seconds,
            ),
            pool_size: parse_or(
                layered.remove("DISPATCHER_POOL_SIZE"),
                default_dispatcher_pool_size,
            ),
            lease_seconds: parse_or(
                layered.remove("DISPATCHER_LEASE_SECONDS"),
                default_dispatcher_lease_seconds,
            ),
            adapter_timeout_seconds: parse_or(
                layered.remove("DISPATCHER_ADAPTER_TIMEOUT_SECONDS"),
                default_dispatcher_adapter_timeout_seconds,
            ),
        };

        let retry_defaults = RetryPolicy::default();
        let retry = RetryPolicy {
            base_seconds: parse_or(layered.remove("RETRY_BASE_SECONDS"), || {
                retry_defaults.base_seconds
            }),
            max_seconds: parse_or(layered.remove("RETRY_MAX_SECONDS"), || {
                retry_defaults.max_seconds
            }),
            max_attempts: parse_or(layered.remove("RETRY_MAX_ATTEMPTS"), || {
                retry_defaults.max_attempts
            }),
        };

        let default_requests_per_minute = parse_or(
            layered.remove("RATE_LIMIT_DEFAULT_PER_MINUTE"),
            default_requests_per_minute,
        );
        let mut service_overrides = BTreeMap::new();
        let mut endpoint_settings: BTreeMap<TargetService, BTreeMap<String, String>> =
            BTreeMap::new();

        for (key, value) in &layered {
            // RATE_LIMIT_<SERVICE>_PER_MINUTE
            if let Some(service_name) = key
                .strip_prefix("RATE_LIMIT_")
                .and_then(|rest| rest.strip_suffix("_PER_MINUTE"))
            {
                let service = parse_service(key, service_name)?;
                if let Ok(rpm) = value.trim().parse::<u32>() {
                    service_overrides.insert(service, rpm);
                }
                continue;
            }

            // SERVICE_<SERVICE>_<FIELD>
            if let Some(rest) = key.strip_prefix("SERVICE_")
                && let Some((service_name, field)) = rest.split_once('_')
            {
                let service = parse_service(key, service_name)?;
                endpoint_settings
                    .entry(service)
                    .or_default()
                    .insert(field.to_string(), value.clone());
            }
        }

        let mut services = BTreeMap::new();
        for (service, mut settings) in endpoint_settings {
            let Some(base_url) = non_empty(settings.remove("BASE_URL")) else {
                return Err(ConfigError::MissingServiceBaseUrl {
                    service: service.as_str().to_ascii_uppercase(),
                });
            };
            let endpoint = ServiceEndpointConfig {
                base_url,
                api_key: non_empty(settings.remove("API_KEY")),
                client_id: non_empty(settings.remove("CLIENT_ID")),
                client_secret: non_empty(settings.remove("CLIENT_SECRET")),
                refresh_token: non_empty(settings.remove("REFRESH_TOKEN")),
                token_url: non_empty(settings.remove("TOKEN_URL")),
                required: parse_or(settings.remove("REQUIRED"), default_service_required),
            };
            services.insert(service, endpoint);
        }

        let config = AppConfig {
            profile,
            api_bind_addr,
            log_level,
            log_format,
            database_url,
            db_max_connections,
            db_acquire_timeout_ms,
            operator_tokens,
            dispatcher,
            retry,
            rate_limits: RateLimitConfig {
                default_requests_per_minute,
                service_overrides,
            },
            services,
        };

        config.validate()?;

        match config.bind_addr() {
            Ok(_) => Ok(config),
            Err(source) => Err(ConfigError::InvalidBindAddr {
                value: config.api_bind_addr.clone(),
                source,
            }),
        }
    }

    fn collect_layered_env(&self) -> Result<(BTreeMap<String, String>, String), ConfigError> {
        let mut values = BTreeMap::new();

        self.merge_dotenv(self.base_dir.join(".env"), &mut values)?;
        self.merge_dotenv(self.base_dir.join(".env.local"), &mut values)?;

        let profile = env::var(format!("{ENV_PREFIX}PROFILE"))
            .ok()
            .or_else(|| values.get("PROFILE").cloned())
            .unwrap_or_else(default_profile);

        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}", &profile)),
            &mut values,
        )?;
        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}.local", &profile)),
            &mut values,
        )?;

        Ok((values, profile))
    }

    fn merge_dotenv(
        &self,
        path: PathBuf,
        values: &mut BTreeMap<String, String>,
    ) -> Result<(), ConfigError> {
        match dotenvy::from_path_iter(&path) {
            Ok(iter) => {
                for item in iter {
                    let (key, value) = item.map_err(|source| ConfigError::EnvFile {
                        path: path.clone(),
                        source,
                    })?;
                    if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                        values.insert(stripped.to_string(), value);
                    }
                }
                Ok(())
            }
            Err(dotenvy::Error::Io(ref io_err))
                if io_err.kind() == std::io::ErrorKind::NotFound =>
            {
                Ok(())
            }
            Err(err) => Err(ConfigError::EnvFile { path, source: err }),
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(base_url: &str) -> ServiceEndpointConfig {
        ServiceEndpointConfig {
            base_url: base_url.to_string(),
            api_key: Some("key".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn defaults_are_valid() {
        assert!(AppConfig::default().validate().is_ok());
    }

    #[test]
    fn test_dispatcher_validation() {
        let mut config = DispatcherConfig::default();
        config.tick_interval_seconds = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidDispatcherTickInterval { value: 0 })
        ));

        let mut config = DispatcherConfig::default();
        config.pool_size = 65;
        assert!(config.validate().is_err());

        let mut config = DispatcherConfig::default();
        config.lease_seconds = 10;
        config.adapter_timeout_seconds = 30;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::LeaseShorterThanTimeout { .. })
        ));
    }

    #[test]
    fn test_retry_validation() {
        let mut config = AppConfig::default();
        config.retry.base_seconds = 1000;
        config.retry.max_seconds = 500;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidRetryBounds { base: 1000, max: 500 })
        ));

        let mut config = AppConfig::default();
        config.retry.max_attempts = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidMaxAttempts)
        ));
    }

    #[test]
    fn test_rate_limit_lookup_and_validation() {
        let mut limits = RateLimitConfig::default();
        limits.service_overrides.insert(TargetService::Crm, 100);
        assert_eq!(limits.requests_per_minute(TargetService::Crm), 100);
        assert_eq!(limits.requests_per_minute(TargetService::Fsm), 60);

        limits.service_overrides.insert(TargetService::Desk, 0);
        assert!(limits.validate().is_err());
    }

    #[test]
    fn test_service_endpoint_validation() {
        let mut config = AppConfig::default();
        config
            .services
            .insert(TargetService::Crm, endpoint("https://crm.example.com"));
        assert!(config.validate().is_ok());

        config.services.insert(TargetService::Fsm, endpoint("nope"));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidServiceBaseUrl { .. })
        ));

        let mut config = AppConfig::default();
        let mut partial = endpoint("https://fsm.example.com");
        partial.client_id = Some("id".into());
        config.services.insert(TargetService::Fsm, partial);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::IncompleteOAuthCredentials { .. })
        ));
    }

    #[test]
    fn production_profile_requires_operator_tokens() {
        let mut config = AppConfig::default();
        config.profile = "production".into();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingOperatorTokens)
        ));

        config.operator_tokens = vec!["ops".into()];
        assert!(config.validate().is_ok());
    }

    #[test]
    fn redacted_json_hides_secrets() {
        let mut config = AppConfig::default();
        config.operator_tokens = vec!["super-secret-token".into()];
        let mut crm = endpoint("https://crm.example.com");
        crm.api_key = Some("crm-api-key".into());
        config.services.insert(TargetService::Crm, crm);

        let json = config.redacted_json().unwrap();
        assert!(!json.contains("super-secret-token"));
        assert!(!json.contains("crm-api-key"));
        assert!(json.contains(REDACTED));
        assert!(json.contains("https://crm.example.com"));
    }
}
