//! TCP listener: one task per inbound connection.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;

use crate::config::ListenerConfig;
use crate::error::Result;
use crate::relay::TransactionHandler;
use crate::smtp::session::Session;

/// Pause after a failed accept (e.g. file descriptor exhaustion).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// SMTP listener bound to the configured address.
pub struct SmtpServer {
    listener: TcpListener,
    handler: Arc<TransactionHandler>,
    config: Arc<ListenerConfig>,
}

impl SmtpServer {
    /// Bind to `config.hostname:config.port`.
    pub async fn bind(
        config: ListenerConfig,
        handler: Arc<TransactionHandler>,
    ) -> Result<Self> {
        let listener = TcpListener::bind((config.hostname.as_str(), config.port)).await?;
        Ok(Self {
            listener,
            handler,
            config: Arc::new(config),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections forever. Each session runs independently; a failing
    /// session is logged and never takes the listener down.
    pub async fn run(self) -> std::io::Result<()> {
        tracing::info!(addr = ?self.listener.local_addr().ok(), "SMTP relay listening");
        loop {
            let (socket, peer) = match self.listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to accept connection");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };
            let handler = Arc::clone(&self.handler);
            let config = Arc::clone(&self.config);

            tokio::spawn(async move {
                tracing::debug!(%peer, "Connection accepted");
                let session = Session::new(socket, Some(peer.ip().to_string()), handler, config);
                if let Err(e) = session.run().await {
                    tracing::warn!(%peer, error = %e, "SMTP session ended with error");
                }
            });
        }
    }
}
