//! Outbound delivery: provider clients, retry policy and the per-recipient fan-out.

pub mod dispatcher;
pub mod mirror;
pub mod notify;
pub mod provider;
pub mod retry;

pub use dispatcher::{DeliveryConfig, DeliveryErrorKind, DeliveryOutcome, Dispatcher};
pub use mirror::SlackMirror;
pub use notify::NotifyClient;
pub use provider::{MirrorSink, Notification, NotificationProvider, NotificationReceipt};
pub use retry::RetryConfig;
