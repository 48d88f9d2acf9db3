//! Normalized provider error taxonomy.
//!
//! Every backend failure is classified into an [`AiError`] at the provider
//! boundary. The retry layer looks only at [`AiError::retryable`]; it never
//! inspects the kind.

use crate::Provider;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Closed set of provider failure categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AiErrorKind {
    /// Invalid or missing credentials (401/403).
    Auth,
    /// Provider asked us to slow down (429).
    RateLimit,
    /// Transport-level failure before a response arrived.
    Network,
    /// An attempt exceeded its deadline.
    Timeout,
    /// The request itself was malformed (400 without a better match).
    InvalidRequest,
    /// The conversation no longer fits the model's window.
    ContextLengthExceeded,
    /// The requested model does not exist for this account.
    ModelNotFound,
    /// The response body could not be decoded.
    Parsing,
    /// A streaming response broke mid-flight.
    Stream,
    /// Any other non-success status from the provider.
    Api,
    Unknown,
}

impl AiErrorKind {
    /// Whether this kind is retryable absent more specific information.
    ///
    /// Status-based classification may override this (a 500 is retryable, a
    /// 501 arguably not, but we treat all 5xx uniformly).
    #[must_use]
    pub const fn default_retryable(self) -> bool {
        match self {
            AiErrorKind::RateLimit
            | AiErrorKind::Network
            | AiErrorKind::Timeout
            | AiErrorKind::Stream => true,
            AiErrorKind::Auth
            | AiErrorKind::InvalidRequest
            | AiErrorKind::ContextLengthExceeded
            | AiErrorKind::ModelNotFound
            | AiErrorKind::Parsing
            | AiErrorKind::Api
            | AiErrorKind::Unknown => false,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            AiErrorKind::Auth => "auth",
            AiErrorKind::RateLimit => "rate_limit",
            AiErrorKind::Network => "network",
            AiErrorKind::Timeout => "timeout",
            AiErrorKind::InvalidRequest => "invalid_request",
            AiErrorKind::ContextLengthExceeded => "context_length_exceeded",
            AiErrorKind::ModelNotFound => "model_not_found",
            AiErrorKind::Parsing => "parsing",
            AiErrorKind::Stream => "stream",
            AiErrorKind::Api => "api",
            AiErrorKind::Unknown => "unknown",
        }
    }
}

/// A classified provider failure.
///
/// Constructed once at the boundary and never mutated afterwards; callers
/// branch on `retryable`, surface `message`, and log the rest.
#[derive(Debug, Clone, Error)]
#[error("{provider} {kind}: {message}{status}", kind = self.kind.as_str(), status = self.status_suffix())]
pub struct AiError {
    kind: AiErrorKind,
    provider: Provider,
    message: String,
    retryable: bool,
    status: Option<u16>,
}

impl AiError {
    /// Create an error with the kind's default retryability.
    #[must_use]
    pub fn new(kind: AiErrorKind, provider: Provider, message: impl Into<String>) -> Self {
        Self {
            kind,
            provider,
            message: message.into(),
            retryable: kind.default_retryable(),
            status: None,
        }
    }

    #[must_use]
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    #[must_use]
    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    #[must_use]
    pub const fn kind(&self) -> AiErrorKind {
        self.kind
    }

    #[must_use]
    pub const fn provider(&self) -> Provider {
        self.provider
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[must_use]
    pub const fn retryable(&self) -> bool {
        self.retryable
    }

    #[must_use]
    pub const fn status(&self) -> Option<u16> {
        self.status
    }

    fn status_suffix(&self) -> String {
        match self.status {
            Some(code) => format!(" (status {code})"),
            None => String::new(),
        }
    }
}
