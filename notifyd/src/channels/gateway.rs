//! HTTP gateway channel adapter.
//!
//! Email, SMS, push and chat delivery is delegated to an external relay (an
//! SMTP bridge, SMS provider, push service or chat bot) that accepts a JSON
//! envelope over HTTP.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use super::ChannelAdapter;
use super::http::{HttpAuth, build_client, post_json};
use crate::Result;
use crate::domain::{Channel, Notification};

/// Gateway adapter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Channels relayed through this gateway.
    pub channels: Vec<Channel>,
    /// Relay endpoint.
    pub url: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default)]
    pub auth: Option<HttpAuth>,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_enabled() -> bool {
    true
}

fn default_timeout() -> u64 {
    30
}

pub struct GatewayAdapter {
    config: GatewayConfig,
    client: Client,
}

impl GatewayAdapter {
    pub fn new(config: GatewayConfig) -> Self {
        let client = build_client(Duration::from_secs(config.timeout_secs));
        Self { config, client }
    }

    fn build_envelope(&self, notification: &Notification) -> serde_json::Value {
        json!({
            "notification_id": notification.id,
            "channel": notification.channel,
            "priority": notification.priority,
            "recipient": notification.recipient,
            "title": notification.title,
            "body": notification.body,
            "template_id": notification.template_id,
            "template_data": notification.template_data,
            "attachments": notification.attachments,
        })
    }
}

#[async_trait]
impl ChannelAdapter for GatewayAdapter {
    fn name(&self) -> &'static str {
        "gateway"
    }

    async fn send(&self, notification: &Notification) -> Result<()> {
        let envelope = self.build_envelope(notification);
        post_json(
            &self.client,
            &self.config.url,
            &envelope,
            &self.config.headers,
            self.config.auth.as_ref(),
            "Gateway",
        )
        .await?;

        debug!(
            notification_id = %notification.id,
            channel = %notification.channel,
            "Relayed notification to gateway"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::http::test_server::respond_once;
    use crate::domain::{NewNotification, Recipient};
    use chrono::Utc;

    fn sms() -> Notification {
        let request = NewNotification::new(
            "Code",
            "Your code is 123456",
            Channel::Sms,
            Recipient::Phone("+15551234567".to_string()),
        );
        Notification::create(request, Utc::now()).unwrap()
    }

    fn config(url: String) -> GatewayConfig {
        GatewayConfig {
            enabled: true,
            channels: vec![Channel::Sms],
            url,
            headers: Vec::new(),
            auth: Some(HttpAuth::Bearer {
                token: "relay-token".to_string(),
            }),
            timeout_secs: 5,
        }
    }

    #[test]
    fn test_envelope_shape() {
        let adapter = GatewayAdapter::new(config("http://localhost/relay".to_string()));
        let envelope = adapter.build_envelope(&sms());
        assert_eq!(envelope["channel"], "SMS");
        assert_eq!(envelope["recipient"]["kind"], "phone");
        assert_eq!(envelope["recipient"]["value"], "+15551234567");
    }

    #[tokio::test]
    async fn test_relay_sends_bearer() {
        let (url, server) = respond_once(202).await;
        let adapter = GatewayAdapter::new(config(url));
        adapter.send(&sms()).await.unwrap();

        let request = server.await.unwrap().to_ascii_lowercase();
        assert!(request.contains("authorization: bearer relay-token"));
        assert!(request.contains("\"channel\":\"sms\""));
    }
}
