//! Configuration types.
//!
//! Everything is read once at process start into an immutable [`RelayConfig`]
//! that is shared by reference with every component.

use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::delivery::{DeliveryConfig, RetryConfig};
use crate::error::ConfigError;
use crate::policy::{PolicyConfig, RecipientPattern};

/// Default GC Notify API base.
pub const DEFAULT_NOTIFY_BASE_URL: &str = "https://api.notification.canada.ca";

/// SMTP listener settings.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Bind host for the SMTP listener.
    pub hostname: String,
    /// Bind port for the SMTP listener.
    pub port: u16,
    /// Host name announced in the 220 greeting.
    pub banner_host: String,
    /// Largest DATA payload accepted, in bytes.
    pub max_message_bytes: usize,
    /// Host the `healthcheck` subcommand connects to.
    pub healthcheck_host: String,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            hostname: "127.0.0.1".to_string(),
            port: 2525,
            banner_host: "notify-relay".to_string(),
            max_message_bytes: 10 * 1024 * 1024,
            healthcheck_host: "localhost".to_string(),
        }
    }
}

/// Notification provider settings.
#[derive(Debug, Clone)]
pub struct NotifyConfig {
    pub api_key: Option<SecretString>,
    pub template_id: Option<String>,
    pub base_url: String,
    /// Per-call timeout. A timeout counts as a transient failure.
    pub timeout: Duration,
}

impl NotifyConfig {
    /// Both the key and the template are required to send anything.
    pub fn is_configured(&self) -> bool {
        self.api_key.is_some() && self.template_id.is_some()
    }
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            template_id: None,
            base_url: DEFAULT_NOTIFY_BASE_URL.to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Process-wide relay configuration.
#[derive(Debug, Clone, Default)]
pub struct RelayConfig {
    pub listener: ListenerConfig,
    pub notify: NotifyConfig,
    /// Slack-style webhook that mirrors relayed notifications. Disabled when unset.
    pub mirror_webhook_url: Option<String>,
    pub policy: PolicyConfig,
    pub delivery: DeliveryConfig,
}

impl RelayConfig {
    /// Build config from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary variable lookup.
    ///
    /// Empty values are treated as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let listener_defaults = ListenerConfig::default();
        let listener = ListenerConfig {
            hostname: get("SMTP_HOSTNAME").unwrap_or(listener_defaults.hostname),
            port: parse_or(&get, "SMTP_PORT", listener_defaults.port)?,
            banner_host: get("SMTP_BANNER_HOST").unwrap_or(listener_defaults.banner_host),
            max_message_bytes: parse_or(
                &get,
                "SMTP_MAX_MESSAGE_BYTES",
                listener_defaults.max_message_bytes,
            )?,
            healthcheck_host: get("SMTP_HOST_HEALTHCHECK")
                .unwrap_or(listener_defaults.healthcheck_host),
        };

        let notify = NotifyConfig {
            api_key: get("NOTIFY_API_KEY").map(SecretString::from),
            template_id: get("NOTIFY_TEMPLATE_ID"),
            base_url: get("NOTIFY_BASE_URL")
                .unwrap_or_else(|| DEFAULT_NOTIFY_BASE_URL.to_string()),
            timeout: Duration::from_secs(parse_or(&get, "NOTIFY_TIMEOUT_SECS", 30u64)?),
        };

        let allow_pattern = match get("RECIPIENT_ALLOW_REGEX") {
            Some(pattern) => Some(RecipientPattern::new(&pattern).map_err(|e| {
                ConfigError::InvalidValue {
                    key: "RECIPIENT_ALLOW_REGEX".into(),
                    message: e.to_string(),
                }
            })?),
            None => None,
        };
        let allow_domains: HashSet<String> = get("RECIPIENT_ALLOW_DOMAINS")
            .unwrap_or_default()
            .split(',')
            .map(|d| d.trim().to_lowercase())
            .filter(|d| !d.is_empty())
            .collect();
        let policy = PolicyConfig {
            allow_pattern,
            allow_domains,
        };

        let retry_defaults = RetryConfig::default();
        let max_attempts: u32 = parse_or(&get, "NOTIFY_MAX_RETRIES", retry_defaults.max_attempts)?;
        if max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "NOTIFY_MAX_RETRIES".into(),
                message: "must be at least 1".into(),
            });
        }
        let retry = RetryConfig {
            max_attempts,
            backoff_base: parse_secs(&get, "NOTIFY_BACKOFF_BASE", retry_defaults.backoff_base)?,
            backoff_cap: parse_secs(&get, "NOTIFY_BACKOFF_CAP", retry_defaults.backoff_cap)?,
            ..retry_defaults
        };

        let delivery_defaults = DeliveryConfig::default();
        let delivery = DeliveryConfig {
            max_body_chars: parse_or(&get, "MAX_BODY_CHARS", delivery_defaults.max_body_chars)?,
            max_concurrency: parse_or(
                &get,
                "MAX_CONCURRENT_DELIVERIES",
                delivery_defaults.max_concurrency,
            )?
            .max(1),
            retry,
        };

        Ok(Self {
            listener,
            notify,
            mirror_webhook_url: get("SLACK_WEBHOOK_URL"),
            policy,
            delivery,
        })
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
        None => Ok(default),
    }
}

/// Parse a non-negative number of seconds (fractions allowed).
fn parse_secs<G>(get: &G, key: &str, default: Duration) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    let Some(raw) = get(key) else {
        return Ok(default);
    };
    let secs: f64 = raw.parse().map_err(|e: std::num::ParseFloatError| {
        ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }
    })?;
    Duration::try_from_secs_f64(secs).map_err(|e| ConfigError::InvalidValue {
        key: key.to_string(),
        message: e.to_string(),
    })
}
