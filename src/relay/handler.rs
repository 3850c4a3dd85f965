//! One inbound transaction → one protocol status.
//!
//! Stages run in a fixed order and the first failing stage decides the
//! result:
//! gate → normalize → validate → filter → dispatch → resolve.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tracing::Instrument;
use uuid::Uuid;

use crate::delivery::{DeliveryOutcome, Dispatcher, MirrorSink, NotificationProvider};
use crate::error::RelayError;
use crate::message::{Render, normalize};
use crate::policy::{PolicyConfig, is_trusted_peer};
use crate::relay::{InboundTransaction, TransactionResult};

/// Orchestrates the relay pipeline for a single transaction.
///
/// Holds only read-only state; one handler serves every connection.
pub struct TransactionHandler {
    policy: PolicyConfig,
    renderer: Arc<dyn Render>,
    dispatcher: Dispatcher,
}

impl TransactionHandler {
    pub fn new(policy: PolicyConfig, renderer: Arc<dyn Render>, dispatcher: Dispatcher) -> Self {
        Self {
            policy,
            renderer,
            dispatcher,
        }
    }

    /// Convenience constructor wiring a dispatcher from its parts.
    pub fn with_provider(
        policy: PolicyConfig,
        renderer: Arc<dyn Render>,
        provider: Arc<dyn NotificationProvider>,
        mirror: Option<Arc<dyn MirrorSink>>,
        delivery: crate::delivery::DeliveryConfig,
    ) -> Self {
        Self::new(policy, renderer, Dispatcher::new(provider, mirror, delivery))
    }

    /// Run the transaction to completion. Never fails and never panics
    /// outward; unexpected failures become a temporary failure.
    pub async fn handle(&self, transaction: InboundTransaction) -> TransactionResult {
        let span = tracing::info_span!(
            "transaction",
            transaction_id = %Uuid::new_v4(),
            peer = transaction.peer_address.as_deref().unwrap_or("-"),
            bytes = transaction.raw_payload.len(),
        );

        async {
            if !is_trusted_peer(transaction.peer_address.as_deref()) {
                let err = RelayError::UntrustedSource(transaction.peer_address.clone());
                tracing::warn!(error = %err, "Rejecting transaction");
                return TransactionResult::from(err);
            }

            let result = match AssertUnwindSafe(self.process(&transaction.raw_payload))
                .catch_unwind()
                .await
            {
                Ok(Ok(result)) => result,
                Ok(Err(err)) => {
                    tracing::warn!(error = %err, "Rejecting transaction");
                    TransactionResult::from(err)
                }
                Err(panic) => {
                    let reason = panic_message(panic.as_ref());
                    tracing::error!(reason = %reason, "Transaction handler panicked");
                    TransactionResult::from(RelayError::Internal(reason))
                }
            };
            tracing::info!(code = result.code(), detail = %result.detail, "Transaction resolved");
            result
        }
        .instrument(span)
        .await
    }

    async fn process(&self, raw: &[u8]) -> Result<TransactionResult, RelayError> {
        let message = normalize(raw, self.renderer.as_ref())?;
        tracing::debug!(
            recipients = message.recipients.len(),
            subject = %message.subject,
            reference = ?message.correlation_id,
            "Message normalized"
        );

        if message.recipients.is_empty() {
            return Err(RelayError::EmptyRecipients);
        }
        if !message.has_content() {
            return Err(RelayError::InvalidContent);
        }

        let allowed = self.policy.filter(&message.recipients);
        if allowed.is_empty() {
            return Err(RelayError::RecipientNotPermitted);
        }
        if allowed.len() < message.recipients.len() {
            tracing::info!(
                dropped = message.recipients.len() - allowed.len(),
                "Some recipients are not permitted by policy"
            );
        }

        let outcomes = self
            .dispatcher
            .deliver(
                &allowed,
                &message.subject,
                &message.body,
                message.correlation_id.as_deref(),
            )
            .await;
        Ok(resolve(&outcomes))
    }
}

/// Reduce per-recipient outcomes: any success accepts the message, otherwise
/// the sender should retry later.
pub fn resolve(outcomes: &[DeliveryOutcome]) -> TransactionResult {
    let failed: Vec<&DeliveryOutcome> = outcomes.iter().filter(|o| !o.succeeded).collect();
    if failed.len() == outcomes.len() {
        for outcome in &failed {
            tracing::warn!(
                recipient = %outcome.recipient,
                attempts = outcome.attempt,
                error = ?outcome.terminal_error,
                "Notify relay failed"
            );
        }
        return TransactionResult::temporary_failure();
    }
    if !failed.is_empty() {
        tracing::warn!(
            failed = failed.len(),
            delivered = outcomes.len() - failed.len(),
            "Partial delivery; accepting message"
        );
    }
    TransactionResult::accepted()
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::delivery::{DeliveryConfig, Notification, NotificationReceipt};
    use crate::error::{MirrorError, ProviderError};
    use crate::policy::RecipientPattern;
    use crate::relay::StatusCode;

    /// Provider that answers 503 for listed recipients and succeeds otherwise.
    #[derive(Default)]
    struct FakeProvider {
        unavailable: HashSet<String>,
        calls: AtomicUsize,
    }

    impl FakeProvider {
        fn failing(recipients: &[&str]) -> Self {
            Self {
                unavailable: recipients.iter().map(|r| r.to_string()).collect(),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl NotificationProvider for FakeProvider {
        fn name(&self) -> &str {
            "fake"
        }

        async fn send_notification(
            &self,
            notification: &Notification,
        ) -> Result<NotificationReceipt, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.unavailable.contains(&notification.recipient) {
                Err(ProviderError::Http {
                    status: 503,
                    message: "unavailable".into(),
                })
            } else {
                Ok(NotificationReceipt {
                    id: format!("n-{}", notification.recipient),
                })
            }
        }
    }

    #[derive(Default)]
    struct CountingMirror {
        posts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl MirrorSink for CountingMirror {
        fn name(&self) -> &str {
            "counting"
        }

        async fn post_mirror(&self, recipient: &str, _: &str, _: &str) -> Result<(), MirrorError> {
            self.posts.lock().unwrap().push(recipient.to_string());
            Ok(())
        }
    }

    fn plain(html: &str) -> String {
        html.to_string()
    }

    fn handler(
        policy: PolicyConfig,
        provider: Arc<FakeProvider>,
        mirror: Arc<CountingMirror>,
    ) -> TransactionHandler {
        TransactionHandler::with_provider(
            policy,
            Arc::new(plain),
            provider,
            Some(mirror),
            DeliveryConfig::default(),
        )
    }

    fn eml(to: &str, subject: &str, body: &str) -> Vec<u8> {
        format!(
            "From: app@internal.local\r\nTo: {to}\r\nSubject: {subject}\r\nMessage-ID: <t1@internal.local>\r\nContent-Type: text/plain\r\n\r\n{body}"
        )
        .into_bytes()
    }

    fn txn(peer: Option<&str>, raw: Vec<u8>) -> InboundTransaction {
        InboundTransaction {
            peer_address: peer.map(str::to_string),
            raw_payload: raw,
        }
    }

    // ── Gate ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn untrusted_peer_rejected_without_external_calls() {
        let provider = Arc::new(FakeProvider::default());
        let mirror = Arc::new(CountingMirror::default());
        let h = handler(PolicyConfig::default(), provider.clone(), mirror.clone());

        for peer in [Some("8.8.8.8"), Some("garbage"), None] {
            let result = h.handle(txn(peer, eml("a@x.com", "s", "b"))).await;
            assert_eq!(result.status, StatusCode::PermanentReject);
            assert_eq!(result.to_string(), "550 Source IP unacceptable");
        }
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
        assert!(mirror.posts.lock().unwrap().is_empty());
    }

    // ── Validation ──────────────────────────────────────────────────

    #[tokio::test]
    async fn no_recipient_found() {
        let provider = Arc::new(FakeProvider::default());
        let h = handler(PolicyConfig::default(), provider.clone(), Arc::default());

        let result = h.handle(txn(Some("10.0.0.2"), eml("nobody", "s", "b"))).await;
        assert_eq!(result.to_string(), "550 No recipient found");
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn empty_body_is_invalid_content() {
        let provider = Arc::new(FakeProvider::default());
        let h = handler(PolicyConfig::default(), provider.clone(), Arc::default());

        let result = h.handle(txn(Some("10.0.0.2"), eml("a@x.com", "s", ""))).await;
        assert_eq!(result.to_string(), "550 Invalid email content");
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn whitespace_body_is_relayed() {
        let provider = Arc::new(FakeProvider::default());
        let h = handler(PolicyConfig::default(), provider.clone(), Arc::default());

        let result = h
            .handle(txn(Some("10.0.0.2"), eml("a@x.com", "s", "   \r\n")))
            .await;
        assert_eq!(result.to_string(), "250 Message accepted");
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn recipient_not_permitted() {
        let policy = PolicyConfig {
            allow_pattern: Some(RecipientPattern::new(r".*@canada\.ca").unwrap()),
            allow_domains: ["x.com".to_string()].into_iter().collect(),
        };
        let provider = Arc::new(FakeProvider::default());
        let h = handler(policy, provider.clone(), Arc::default());

        let result = h.handle(txn(Some("10.0.0.2"), eml("a@x.com", "s", "b"))).await;
        assert_eq!(result.to_string(), "550 Recipient not permitted");
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn only_permitted_recipients_are_dispatched() {
        let policy = PolicyConfig {
            allow_pattern: None,
            allow_domains: ["canada.ca".to_string()].into_iter().collect(),
        };
        let provider = Arc::new(FakeProvider::default());
        let mirror = Arc::new(CountingMirror::default());
        let h = handler(policy, provider.clone(), mirror.clone());

        let result = h
            .handle(txn(Some("127.0.0.1"), eml("a@canada.ca, b@x.com", "s", "b")))
            .await;
        assert_eq!(result.status, StatusCode::Accepted);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        assert_eq!(*mirror.posts.lock().unwrap(), vec!["a@canada.ca"]);
    }

    // ── Resolution ──────────────────────────────────────────────────

    #[tokio::test]
    async fn all_delivered_is_accepted() {
        let provider = Arc::new(FakeProvider::default());
        let h = handler(PolicyConfig::default(), provider.clone(), Arc::default());

        let result = h
            .handle(txn(Some("192.168.0.9"), eml("a@x.com, b@x.com", "s", "b")))
            .await;
        assert_eq!(result.to_string(), "250 Message accepted");
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn partial_success_is_accepted() {
        let provider = Arc::new(FakeProvider::failing(&["c@x.com"]));
        let h = handler(PolicyConfig::default(), provider.clone(), Arc::default());

        let result = h
            .handle(txn(Some("10.1.1.1"), eml("a@x.com, b@x.com, c@x.com", "s", "b")))
            .await;
        assert_eq!(result.status, StatusCode::Accepted);
        // 1 + 1 + 5 attempts
        assert_eq!(provider.calls.load(Ordering::SeqCst), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn total_failure_is_temporary() {
        let provider = Arc::new(FakeProvider::failing(&["a@x.com", "b@x.com", "c@x.com"]));
        let h = handler(PolicyConfig::default(), provider.clone(), Arc::default());

        let result = h
            .handle(txn(Some("10.1.1.1"), eml("a@x.com, b@x.com, c@x.com", "s", "b")))
            .await;
        assert_eq!(result.to_string(), "451 Temporary failure");
        assert_eq!(provider.calls.load(Ordering::SeqCst), 15);
    }

    #[tokio::test]
    async fn renderer_panic_becomes_temporary_failure() {
        let provider = Arc::new(FakeProvider::default());
        let exploding = |_: &str| -> String { panic!("renderer blew up") };
        let h = TransactionHandler::with_provider(
            PolicyConfig::default(),
            Arc::new(exploding),
            provider.clone(),
            None,
            DeliveryConfig::default(),
        );

        let raw = b"From: s@x.com\r\nTo: a@x.com\r\nSubject: s\r\nContent-Type: text/html\r\n\r\n<p>x</p>".to_vec();
        let result = h.handle(txn(Some("10.0.0.1"), raw)).await;
        assert_eq!(result.status, StatusCode::TemporaryFailure);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn resolve_rules() {
        let ok = |r: &str| DeliveryOutcome {
            recipient: r.into(),
            attempt: 1,
            succeeded: true,
            terminal_error: None,
            provider_response_id: Some("id".into()),
        };
        let failed = |r: &str| DeliveryOutcome {
            recipient: r.into(),
            attempt: 5,
            succeeded: false,
            terminal_error: Some(crate::delivery::DeliveryErrorKind::ProviderTransient),
            provider_response_id: None,
        };
        assert_eq!(resolve(&[ok("a"), failed("b")]).status, StatusCode::Accepted);
        assert_eq!(
            resolve(&[failed("a"), failed("b")]).status,
            StatusCode::TemporaryFailure
        );
    }

    #[test]
    fn panic_messages_are_extracted() {
        let boxed: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");
        let boxed: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(boxed.as_ref()), "bang");
        let boxed: Box<dyn std::any::Any + Send> = Box::new(42);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic");
    }
}
