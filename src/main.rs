use std::sync::Arc;
use std::time::Duration;

use notify_relay::config::RelayConfig;
use notify_relay::delivery::{Dispatcher, MirrorSink, NotifyClient, SlackMirror};
use notify_relay::message::MarkdownRenderer;
use notify_relay::relay::TransactionHandler;
use notify_relay::smtp::{self, SmtpServer};

const HEALTHCHECK_TIMEOUT: Duration = Duration::from_secs(3);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = RelayConfig::from_env()?;

    if std::env::args().nth(1).as_deref() == Some("healthcheck") {
        let listener = &config.listener;
        match smtp::probe(&listener.healthcheck_host, listener.port, HEALTHCHECK_TIMEOUT).await {
            Ok(_) => {
                println!("SMTP server is healthy");
                std::process::exit(0);
            }
            Err(e) => {
                println!("SMTP server is unhealthy: {e:#}");
                std::process::exit(1);
            }
        }
    }

    eprintln!("📨 Notify Relay v{}", env!("CARGO_PKG_VERSION"));
    eprintln!(
        "   SMTP: {}:{}",
        config.listener.hostname, config.listener.port
    );
    eprintln!("   Notify: {}", config.notify.base_url);

    if !config.notify.is_configured() {
        tracing::warn!(
            "NOTIFY_API_KEY and/or NOTIFY_TEMPLATE_ID not set; messages will be rejected"
        );
    }

    let provider = Arc::new(NotifyClient::new(&config.notify)?);

    let mirror: Option<Arc<dyn MirrorSink>> = match &config.mirror_webhook_url {
        Some(url) => {
            eprintln!("   Mirror: enabled");
            Some(Arc::new(SlackMirror::new(url.clone())?))
        }
        None => {
            eprintln!("   Mirror: disabled");
            None
        }
    };

    let policy = &config.policy;
    eprintln!(
        "   Recipients: {}",
        if policy.allow_pattern.is_some() {
            "regex allowlist".to_string()
        } else if !policy.allow_domains.is_empty() {
            let mut domains: Vec<&str> = policy.allow_domains.iter().map(String::as_str).collect();
            domains.sort_unstable();
            domains.join(", ")
        } else {
            "any (private network only)".to_string()
        }
    );

    let dispatcher = Dispatcher::new(provider, mirror, config.delivery.clone());
    let handler = Arc::new(TransactionHandler::new(
        config.policy.clone(),
        Arc::new(MarkdownRenderer),
        dispatcher,
    ));

    let server = SmtpServer::bind(config.listener.clone(), handler).await?;
    eprintln!("   Listening on {}\n", server.local_addr()?);

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Stopping SMTP relay");
        }
    }

    Ok(())
}
