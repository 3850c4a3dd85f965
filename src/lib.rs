//! Notify Relay: SMTP to notification-API bridge.

pub mod config;
pub mod delivery;
pub mod error;
pub mod message;
pub mod policy;
pub mod relay;
pub mod smtp;
