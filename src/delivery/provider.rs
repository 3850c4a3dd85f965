//! Collaborator traits for the notification provider and the mirror sink.

use async_trait::async_trait;
use serde::Serialize;

use crate::error::{MirrorError, ProviderError};

/// One notification for one recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub recipient: String,
    pub subject: String,
    /// Body already truncated to the configured limit.
    pub body: String,
    /// Delivery reference (at most 255 characters).
    pub reference: Option<String>,
}

/// Provider acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationReceipt {
    pub id: String,
}

/// Something that can deliver a notification to a single recipient.
#[async_trait]
pub trait NotificationProvider: Send + Sync {
    /// Provider name for logs.
    fn name(&self) -> &str;

    async fn send_notification(
        &self,
        notification: &Notification,
    ) -> Result<NotificationReceipt, ProviderError>;
}

/// Best-effort secondary copy of relayed notifications (e.g. a chat webhook).
#[async_trait]
pub trait MirrorSink: Send + Sync {
    fn name(&self) -> &str;

    async fn post_mirror(
        &self,
        recipient: &str,
        subject: &str,
        body: &str,
    ) -> Result<(), MirrorError>;
}
