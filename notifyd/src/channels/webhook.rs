//! Webhook channel adapter.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use super::ChannelAdapter;
use super::http::{HttpAuth, build_client, post_json};
use crate::domain::{Notification, Recipient};
use crate::{Error, Result};

/// Webhook adapter configuration.
///
/// The target URL comes from each notification's recipient; this only carries
/// what is common to every call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Whether the adapter is enabled.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Custom headers.
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    /// Authentication type.
    #[serde(default)]
    pub auth: Option<HttpAuth>,
    /// Request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_enabled() -> bool {
    true
}

fn default_timeout() -> u64 {
    30
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            headers: Vec::new(),
            auth: None,
            timeout_secs: default_timeout(),
        }
    }
}

/// Delivers WEBHOOK notifications as an HTTP POST to the recipient URL.
pub struct WebhookAdapter {
    config: WebhookConfig,
    client: Client,
}

impl WebhookAdapter {
    pub fn new(config: WebhookConfig) -> Self {
        let client = build_client(Duration::from_secs(config.timeout_secs));
        Self { config, client }
    }

    fn build_payload(&self, notification: &Notification) -> serde_json::Value {
        json!({
            "notification_id": notification.id,
            "channel": notification.channel,
            "priority": notification.priority,
            "title": notification.title,
            "body": notification.body,
            "template_id": notification.template_id,
            "data": notification.template_data,
            "attachments": notification.attachments,
            "batch_id": notification.batch_id,
            "attempt": notification.retry_count + 1,
            "timestamp": Utc::now().to_rfc3339(),
        })
    }
}

#[async_trait]
impl ChannelAdapter for WebhookAdapter {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn send(&self, notification: &Notification) -> Result<()> {
        let Recipient::Url(url) = &notification.recipient else {
            return Err(Error::adapter(format!(
                "Webhook adapter cannot deliver to a {} recipient",
                notification.recipient.kind_str()
            )));
        };

        let payload = self.build_payload(notification);
        post_json(
            &self.client,
            url,
            &payload,
            &self.config.headers,
            self.config.auth.as_ref(),
            "Webhook",
        )
        .await?;

        debug!(notification_id = %notification.id, url = %url, "Webhook delivered");
        Ok(())
    }
}
