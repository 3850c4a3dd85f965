//! Per-recipient fan-out with independent retry loops.
//!
//! Every recipient gets its own task with its own attempt counter and
//! backoff. A semaphore caps how many run at once within one transaction.
//! After a recipient's primary outcome is final, the mirror sink (if any)
//! receives a copy; mirror failures are logged and otherwise ignored.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::delivery::provider::{MirrorSink, Notification, NotificationProvider};
use crate::delivery::retry::RetryConfig;
use crate::error::ProviderError;

/// Maximum length of the delivery reference passed to the provider.
pub const MAX_REFERENCE_CHARS: usize = 255;

/// Dispatcher settings.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryConfig {
    /// Body truncation limit, in characters.
    pub max_body_chars: usize,
    /// Recipients delivered concurrently within one transaction.
    pub max_concurrency: usize,
    pub retry: RetryConfig,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_body_chars: 20_000,
            max_concurrency: 16,
            retry: RetryConfig::default(),
        }
    }
}

/// Why a recipient ultimately failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DeliveryErrorKind {
    /// Transient failures until the attempt budget ran out.
    ProviderTransient,
    /// The provider refused outright; not retried.
    ProviderPermanent,
    /// The delivery task itself died.
    Internal,
}

/// Final result for one recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveryOutcome {
    pub recipient: String,
    /// Attempts made (1-based).
    pub attempt: u32,
    pub succeeded: bool,
    pub terminal_error: Option<DeliveryErrorKind>,
    pub provider_response_id: Option<String>,
}

impl DeliveryOutcome {
    fn delivered(recipient: String, attempt: u32, id: String) -> Self {
        Self {
            recipient,
            attempt,
            succeeded: true,
            terminal_error: None,
            provider_response_id: Some(id),
        }
    }

    fn failed(recipient: String, attempt: u32, kind: DeliveryErrorKind) -> Self {
        Self {
            recipient,
            attempt,
            succeeded: false,
            terminal_error: Some(kind),
            provider_response_id: None,
        }
    }
}

/// Fans one message out to many recipients.
pub struct Dispatcher {
    provider: Arc<dyn NotificationProvider>,
    mirror: Option<Arc<dyn MirrorSink>>,
    config: DeliveryConfig,
}

impl Dispatcher {
    pub fn new(
        provider: Arc<dyn NotificationProvider>,
        mirror: Option<Arc<dyn MirrorSink>>,
        config: DeliveryConfig,
    ) -> Self {
        Self {
            provider,
            mirror,
            config,
        }
    }

    /// Deliver to every recipient concurrently.
    ///
    /// Returns one outcome per recipient, in input order, once all of them
    /// are final.
    pub async fn deliver(
        &self,
        recipients: &[String],
        subject: &str,
        body: &str,
        correlation_id: Option<&str>,
    ) -> Vec<DeliveryOutcome> {
        let body = truncate_chars(body, self.config.max_body_chars);
        let reference = correlation_id.map(|id| truncate_chars(id, MAX_REFERENCE_CHARS));
        let permits = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));

        let mut tasks = JoinSet::new();
        for (index, recipient) in recipients.iter().enumerate() {
            let notification = Notification {
                recipient: recipient.clone(),
                subject: subject.to_string(),
                body: body.clone(),
                reference: reference.clone(),
            };
            let provider = Arc::clone(&self.provider);
            let mirror = self.mirror.clone();
            let retry = self.config.retry.clone();
            let permits = Arc::clone(&permits);

            tasks.spawn(async move {
                // Never closed; acquire cannot fail.
                let permit = permits.acquire_owned().await.ok();
                let outcome = deliver_one(provider.as_ref(), &notification, &retry).await;
                // The cap bounds provider calls only; a slow mirror must not
                // hold back other recipients.
                drop(permit);
                if let Some(mirror) = mirror {
                    forward_to_mirror(mirror.as_ref(), &notification).await;
                }
                (index, outcome)
            });
        }

        let mut slots: Vec<Option<DeliveryOutcome>> = vec![None; recipients.len()];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, outcome)) => slots[index] = Some(outcome),
                Err(e) => tracing::error!(error = %e, "Delivery task panicked"),
            }
        }

        slots
            .into_iter()
            .zip(recipients)
            .map(|(slot, recipient)| {
                slot.unwrap_or_else(|| {
                    DeliveryOutcome::failed(recipient.clone(), 0, DeliveryErrorKind::Internal)
                })
            })
            .collect()
    }
}

/// Retry loop for a single recipient.
async fn deliver_one(
    provider: &dyn NotificationProvider,
    notification: &Notification,
    retry: &RetryConfig,
) -> DeliveryOutcome {
    let recipient = notification.recipient.clone();
    let mut attempt = 0;

    loop {
        attempt += 1;
        match provider.send_notification(notification).await {
            Ok(receipt) => {
                tracing::info!(
                    recipient = %recipient,
                    attempt,
                    provider = provider.name(),
                    id = %receipt.id,
                    "Notification relayed"
                );
                return DeliveryOutcome::delivered(recipient, attempt, receipt.id);
            }
            Err(error) => {
                if !error.is_transient() {
                    log_terminal(&recipient, attempt, &error, "Notification rejected");
                    return DeliveryOutcome::failed(
                        recipient,
                        attempt,
                        DeliveryErrorKind::ProviderPermanent,
                    );
                }
                if !retry.can_retry(attempt) {
                    log_terminal(&recipient, attempt, &error, "Notification retries exhausted");
                    return DeliveryOutcome::failed(
                        recipient,
                        attempt,
                        DeliveryErrorKind::ProviderTransient,
                    );
                }

                let delay = retry.delay(attempt - 1);
                tracing::debug!(
                    recipient = %recipient,
                    attempt,
                    status = ?error.status(),
                    backoff_ms = delay.as_millis() as u64,
                    error = %error,
                    "Retrying notification after backoff"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

fn log_terminal(recipient: &str, attempt: u32, error: &ProviderError, message: &str) {
    tracing::warn!(
        recipient = %recipient,
        attempt,
        status = ?error.status(),
        error = %error,
        "{message}"
    );
}

async fn forward_to_mirror(mirror: &dyn MirrorSink, notification: &Notification) {
    if let Err(e) = mirror
        .post_mirror(
            &notification.recipient,
            &notification.subject,
            &notification.body,
        )
        .await
    {
        tracing::warn!(
            recipient = %notification.recipient,
            sink = mirror.name(),
            error = %e,
            "Mirror post failed"
        );
    }
}

/// Truncate to at most `max` characters without splitting a code point.
pub fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((byte_idx, _)) => s[..byte_idx].to_string(),
        None => s.to_string(),
    }
}
