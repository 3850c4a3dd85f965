//! GC Notify email client (`POST /v2/notifications/email`).

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::config::NotifyConfig;
use crate::delivery::provider::{Notification, NotificationProvider, NotificationReceipt};
use crate::error::{ConfigError, ProviderError};

/// Maximum characters of provider error text kept in an error message.
const MAX_ERROR_BODY_CHARS: usize = 500;

#[derive(Serialize)]
struct EmailRequest<'a> {
    email_address: &'a str,
    template_id: &'a str,
    personalisation: Personalisation<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reference: Option<&'a str>,
}

#[derive(Serialize)]
struct Personalisation<'a> {
    subject: &'a str,
    body: &'a str,
}

#[derive(Deserialize)]
struct EmailResponse {
    id: String,
}

/// HTTP client for the GC Notify email API.
pub struct NotifyClient {
    api_key: Option<SecretString>,
    template_id: Option<String>,
    base_url: String,
    timeout: std::time::Duration,
    client: reqwest::Client,
}

impl NotifyClient {
    pub fn new(config: &NotifyConfig) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ConfigError::HttpClient(e.to_string()))?;
        Ok(Self {
            api_key: config.api_key.clone(),
            template_id: config.template_id.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            timeout: config.timeout,
            client,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/v2/notifications/email", self.base_url)
    }

    fn map_send_error(&self, e: reqwest::Error) -> ProviderError {
        if e.is_timeout() {
            ProviderError::Timeout(self.timeout)
        } else {
            ProviderError::Network(e.to_string())
        }
    }
}

#[async_trait]
impl NotificationProvider for NotifyClient {
    fn name(&self) -> &str {
        "gc-notify"
    }

    async fn send_notification(
        &self,
        notification: &Notification,
    ) -> Result<NotificationReceipt, ProviderError> {
        let (Some(api_key), Some(template_id)) = (&self.api_key, &self.template_id) else {
            return Err(ProviderError::NotConfigured);
        };

        let request = EmailRequest {
            email_address: &notification.recipient,
            template_id,
            personalisation: Personalisation {
                subject: &notification.subject,
                body: &notification.body,
            },
            reference: notification.reference.as_deref(),
        };

        let resp = self
            .client
            .post(self.endpoint())
            .header(
                reqwest::header::AUTHORIZATION,
                format!("ApiKey-v1 {}", api_key.expose_secret()),
            )
            .json(&request)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Http {
                status: status.as_u16(),
                message: body.chars().take(MAX_ERROR_BODY_CHARS).collect(),
            });
        }

        let parsed: EmailResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
        Ok(NotificationReceipt { id: parsed.id })
    }
}
