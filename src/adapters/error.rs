//! Adapter error taxonomy.
//!
//! `AdapterError` describes what went wrong talking to a remote service.
//! `SyncError` is what the dispatcher acts on: its `kind` decides between
//! retry, dead-lettering and the terminal configuration failure.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{EntityType, TargetService};

/// Low-level failure raised while calling an external service.
#[derive(Debug, Clone, Error)]
pub enum AdapterError {
    #[error("HTTP error {status}: {}", .body.as_deref().unwrap_or("No body"))]
    Http {
        status: u16,
        body: Option<String>,
        retry_after: Option<u64>,
    },
    #[error("Network error: {details}")]
    Network { details: String, retryable: bool },
    #[error("Malformed response: {details}")]
    MalformedResponse { details: String },
    #[error("Authentication error: {details}")]
    Authentication { details: String },
    #[error("Configuration error: {details}")]
    Configuration { details: String },
}

impl AdapterError {
    pub fn network<S: Into<String>>(details: S) -> Self {
        AdapterError::Network {
            details: details.into(),
            retryable: true,
        }
    }

    pub fn configuration<S: Into<String>>(details: S) -> Self {
        AdapterError::Configuration {
            details: details.into(),
        }
    }
}

impl From<reqwest::Error> for AdapterError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            AdapterError::MalformedResponse {
                details: err.to_string(),
            }
        } else if err.is_builder() {
            AdapterError::Configuration {
                details: err.to_string(),
            }
        } else {
            AdapterError::Network {
                details: err.to_string(),
                retryable: true,
            }
        }
    }
}

/// Classification of a failed sync attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncErrorKind {
    /// Network failure, timeout or 5xx; retried with backoff
    Transient,
    /// Remote throttling; retried no sooner than the hint
    RateLimited {
        #[serde(skip_serializing_if = "Option::is_none")]
        retry_after_secs: Option<u64>,
    },
    /// Remote rejected the request; dead-lettered on first occurrence
    Permanent,
    /// Missing or rejected credentials for the target service
    Configuration,
}

impl SyncErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncErrorKind::Transient => "transient",
            SyncErrorKind::RateLimited { .. } => "rate_limited",
            SyncErrorKind::Permanent => "permanent",
            SyncErrorKind::Configuration => "configuration",
        }
    }
}

/// Where a failure happened, attached before it is logged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncErrorContext {
    pub target_service: TargetService,
    pub entity_type: EntityType,
    pub entity_id: String,
}

/// Failure of a single `Adapter::sync` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncError {
    #[serde(flatten)]
    pub kind: SyncErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<SyncErrorContext>,
}

impl SyncError {
    fn new<S: Into<String>>(kind: SyncErrorKind, message: S) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
            context: None,
        }
    }

    pub fn transient<S: Into<String>>(message: S) -> Self {
        Self::new(SyncErrorKind::Transient, message)
    }

    pub fn rate_limited<S: Into<String>>(message: S, retry_after_secs: Option<u64>) -> Self {
        Self::new(SyncErrorKind::RateLimited { retry_after_secs }, message)
    }

    pub fn permanent<S: Into<String>>(message: S) -> Self {
        Self::new(SyncErrorKind::Permanent, message)
    }

    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::new(SyncErrorKind::Configuration, message)
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_context(
        mut self,
        target_service: TargetService,
        entity_type: EntityType,
        entity_id: impl Into<String>,
    ) -> Self {
        self.context = Some(SyncErrorContext {
            target_service,
            entity_type,
            entity_id: entity_id.into(),
        });
        self
    }

    /// Transient and rate-limited failures may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            SyncErrorKind::Transient | SyncErrorKind::RateLimited { .. }
        )
    }
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ctx) = &self.context {
            write!(
                f,
                "[{} {}/{}] ",
                ctx.target_service, ctx.entity_type, ctx.entity_id
            )?;
        }
        match &self.kind {
            SyncErrorKind::Transient => write!(f, "Transient error")?,
            SyncErrorKind::RateLimited { retry_after_secs } => {
                write!(f, "Rate limited")?;
                if let Some(after) = retry_after_secs {
                    write!(f, " (retry after: {}s)", after)?;
                }
            }
            SyncErrorKind::Permanent => write!(f, "Permanent error")?,
            SyncErrorKind::Configuration => write!(f, "Configuration error")?,
        }
        if !self.message.is_empty() {
            write!(f, ": {}", self.message)?;
        }
        Ok(())
    }
}

impl std::error::Error for SyncError {}

impl From<AdapterError> for SyncError {
    fn from(adapter_error: AdapterError) -> Self {
        let message = adapter_error.to_string();
        match adapter_error {
            AdapterError::Http {
                status: 429,
                retry_after,
                ..
            } => SyncError::rate_limited(message, retry_after),
            AdapterError::Http {
                status: 401 | 403, ..
            } => SyncError::configuration(message),
            AdapterError::Http { status, .. } if (400..500).contains(&status) => {
                SyncError::permanent(message)
            }
            AdapterError::Http { .. } => SyncError::transient(message),
            AdapterError::Network { retryable, .. } => {
                if retryable {
                    SyncError::transient(message)
                } else {
                    SyncError::permanent(message)
                }
            }
            AdapterError::MalformedResponse { .. } => SyncError::transient(message),
            AdapterError::Authentication { .. } | AdapterError::Configuration { .. } => {
                SyncError::configuration(message)
            }
        }
    }
}

/// Result of `Adapter::test_connection`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    /// No usable credentials; reported as `not_configured` rather than a failure
    #[error("service not configured: {0}")]
    NotConfigured(String),
    #[error("credentials rejected: {0}")]
    Unauthorized(String),
    #[error("service unreachable: {0}")]
    Unreachable(String),
    #[error("unexpected response: {0}")]
    Unexpected(String),
}

impl From<AdapterError> for ConnectionError {
    fn from(err: AdapterError) -> Self {
        let message = err.to_string();
        match err {
            AdapterError::Configuration { .. } => ConnectionError::NotConfigured(message),
            AdapterError::Authentication { .. }
            | AdapterError::Http {
                status: 401 | 403, ..
            } => ConnectionError::Unauthorized(message),
            AdapterError::Network { .. } => ConnectionError::Unreachable(message),
            AdapterError::Http { .. } | AdapterError::MalformedResponse { .. } => {
                ConnectionError::Unexpected(message)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn http(status: u16) -> AdapterError {
        AdapterError::Http {
            status,
            body: Some("boom".into()),
            retry_after: None,
        }
    }

    #[test]
    fn http_statuses_are_classified() {
        assert_eq!(SyncError::from(http(400)).kind, SyncErrorKind::Permanent);
        assert_eq!(SyncError::from(http(404)).kind, SyncErrorKind::Permanent);
        assert_eq!(SyncError::from(http(422)).kind, SyncErrorKind::Permanent);
        assert_eq!(SyncError::from(http(401)).kind, SyncErrorKind::Configuration);
        assert_eq!(SyncError::from(http(500)).kind, SyncErrorKind::Transient);
        assert_eq!(SyncError::from(http(503)).kind, SyncErrorKind::Transient);

        let throttled = SyncError::from(AdapterError::Http {
            status: 429,
            body: None,
            retry_after: Some(30),
        });
        assert_eq!(
            throttled.kind,
            SyncErrorKind::RateLimited {
                retry_after_secs: Some(30)
            }
        );
        assert!(throttled.is_retryable());
    }

    #[test]
    fn non_http_failures_are_classified() {
        assert!(SyncError::from(AdapterError::network("reset")).is_retryable());
        assert!(
            !SyncError::from(AdapterError::Network {
                details: "bad address".into(),
                retryable: false
            })
            .is_retryable()
        );
        assert_eq!(
            SyncError::from(AdapterError::MalformedResponse {
                details: "eof".into()
            })
            .kind,
            SyncErrorKind::Transient
        );
        assert_eq!(
            SyncError::from(AdapterError::configuration("no key")).kind,
            SyncErrorKind::Configuration
        );
    }

    #[test]
    fn context_is_rendered_in_message() {
        let err = SyncError::transient("timed out").with_context(
            TargetService::Crm,
            EntityType::Project,
            "p-9",
        );
        assert_eq!(err.to_string(), "[crm project/p-9] Transient error: timed out");
    }

    #[test]
    fn serializes_with_kind_tag() {
        let err = SyncError::rate_limited("slow", Some(5));
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["type"], "rate_limited");
        assert_eq!(value["retry_after_secs"], 5);
        assert_eq!(value["message"], "slow");
    }

    #[test]
    fn connection_errors_from_adapter_errors() {
        assert!(matches!(
            ConnectionError::from(AdapterError::configuration("missing api key")),
            ConnectionError::NotConfigured(_)
        ));
        assert!(matches!(
            ConnectionError::from(http(403)),
            ConnectionError::Unauthorized(_)
        ));
        assert!(matches!(
            ConnectionError::from(AdapterError::network("refused")),
            ConnectionError::Unreachable(_)
        ));
    }
}
