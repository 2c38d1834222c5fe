//! LLM error types

use super::HealthStatus;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// LLM error with classification
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct LlmError {
    pub kind: LlmErrorKind,
    pub message: String,
    /// HTTP status, when the service answered at all
    pub status: Option<u16>,
}

impl LlmError {
    pub fn new(kind: LlmErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn not_configured(message: impl Into<String>) -> Self {
        Self::new(LlmErrorKind::NotConfigured, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(LlmErrorKind::Timeout, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(LlmErrorKind::Network, message)
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(LlmErrorKind::Malformed, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(LlmErrorKind::Cancelled, message)
    }

    /// Classify a non-success HTTP status
    pub fn from_status(status: u16, body: &str) -> Self {
        let snippet: String = body.chars().take(200).collect();
        let kind = match status {
            503 => LlmErrorKind::Overloaded,
            400 | 401 | 403 => LlmErrorKind::Auth,
            500..=599 => LlmErrorKind::ServerError,
            _ => LlmErrorKind::Http,
        };
        Self::new(kind, format!("HTTP {status}: {snippet}")).with_status(status)
    }
}

/// Error classification for health reporting and credential checks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmErrorKind {
    /// No credential available, nothing was sent
    NotConfigured,
    /// Deadline exceeded, request dropped
    Timeout,
    /// Connection or transport failure
    Network,
    /// 503: the service is at capacity
    Overloaded,
    /// 400/401/403: the credential was refused
    Auth,
    /// Other 5xx
    ServerError,
    /// Any other non-success status
    Http,
    /// The service answered with something we could not decode
    Malformed,
    /// The turn was cancelled by its owner
    Cancelled,
}

impl LlmErrorKind {
    /// Failures that say nothing about whether the credential is good
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::Network | Self::Overloaded | Self::ServerError | Self::Cancelled
        )
    }

    pub fn health_status(self) -> HealthStatus {
        match self {
            Self::Overloaded => HealthStatus::Degraded,
            _ => HealthStatus::Error,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotConfigured => "not_configured",
            Self::Timeout => "timeout",
            Self::Network => "network",
            Self::Overloaded => "overloaded",
            Self::Auth => "auth",
            Self::ServerError => "server_error",
            Self::Http => "http",
            Self::Malformed => "malformed",
            Self::Cancelled => "cancelled",
        }
    }
}
