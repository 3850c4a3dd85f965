//! Minimal SMTP front end feeding the transaction handler.

pub mod health;
pub mod server;
pub mod session;

pub use health::probe;
pub use server::SmtpServer;
pub use session::Session;
