//! Error types for the notify relay.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Mirror error: {0}")]
    Mirror(#[from] MirrorError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to build HTTP client: {0}")]
    HttpClient(String),
}

/// Reasons a single inbound transaction is turned away.
///
/// Everything except `Internal` is a permanent rejection; `Internal` covers
/// failures nobody anticipated and is reported as a temporary failure so the
/// sender retries.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    #[error("source address {0:?} is outside the trusted network")]
    UntrustedSource(Option<String>),

    #[error("payload could not be decoded as a mail message")]
    MalformedPayload,

    #[error("no recipient address found in To/Cc/Bcc")]
    EmptyRecipients,

    #[error("message has an empty subject or body")]
    InvalidContent,

    #[error("none of the recipients are permitted by policy")]
    RecipientNotPermitted,

    #[error("internal failure: {0}")]
    Internal(String),
}

/// Errors from the notification provider.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("provider returned HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("provider call timed out after {0:?}")]
    Timeout(Duration),

    #[error("network error: {0}")]
    Network(String),

    #[error("invalid provider response: {0}")]
    InvalidResponse(String),

    #[error("notification provider not configured (missing NOTIFY_API_KEY or NOTIFY_TEMPLATE_ID)")]
    NotConfigured,
}

impl ProviderError {
    /// HTTP status code attached to the failure, if the provider answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Whether another attempt could plausibly succeed.
    ///
    /// Connection-level failures (no status) and 429/500/502/503/504 are
    /// transient. Explicit rejections and missing configuration are not.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http { status, .. } => matches!(status, 429 | 500 | 502 | 503 | 504),
            Self::Timeout(_) | Self::Network(_) => true,
            Self::InvalidResponse(_) | Self::NotConfigured => false,
        }
    }
}

/// Errors from the best-effort mirror sink. Logged, never escalated.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MirrorError {
    #[error("mirror returned HTTP {0}")]
    Http(u16),

    #[error("mirror request failed: {0}")]
    Request(String),
}

/// Result type alias for the relay.
pub type Result<T> = std::result::Result<T, Error>;
