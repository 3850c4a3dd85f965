//! Slack incoming-webhook mirror.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::delivery::provider::MirrorSink;
use crate::error::{ConfigError, MirrorError};

/// Characters of the body carried into the mirror post.
pub const MIRROR_EXCERPT_CHARS: usize = 1000;

const MIRROR_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Serialize)]
struct MirrorPayload<'a> {
    to: &'a str,
    subject: &'a str,
    body: String,
}

/// Posts a short copy of every relayed notification to a webhook.
pub struct SlackMirror {
    webhook_url: String,
    client: reqwest::Client,
}

impl SlackMirror {
    pub fn new(webhook_url: impl Into<String>) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder()
            .timeout(MIRROR_TIMEOUT)
            .build()
            .map_err(|e| ConfigError::HttpClient(e.to_string()))?;
        Ok(Self {
            webhook_url: webhook_url.into(),
            client,
        })
    }
}

#[async_trait]
impl MirrorSink for SlackMirror {
    fn name(&self) -> &str {
        "slack"
    }

    async fn post_mirror(
        &self,
        recipient: &str,
        subject: &str,
        body: &str,
    ) -> Result<(), MirrorError> {
        let payload = MirrorPayload {
            to: recipient,
            subject,
            body: excerpt(body),
        };
        let resp = self
            .client
            .post(&self.webhook_url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| MirrorError::Request(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(MirrorError::Http(resp.status().as_u16()));
        }
        Ok(())
    }
}

fn excerpt(body: &str) -> String {
    body.chars().take(MIRROR_EXCERPT_CHARS).collect()
}
