//! Dry-run channel adapter.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::ChannelAdapter;
use crate::Result;
use crate::domain::{Channel, Notification};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_channels")]
    pub channels: Vec<Channel>,
}

fn default_enabled() -> bool {
    true
}

fn default_channels() -> Vec<Channel> {
    Channel::ALL.to_vec()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            channels: default_channels(),
        }
    }
}

/// Logs each notification and reports success without contacting anything.
#[derive(Debug, Default)]
pub struct LogAdapter;

#[async_trait]
impl ChannelAdapter for LogAdapter {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn send(&self, notification: &Notification) -> Result<()> {
        info!(
            notification_id = %notification.id,
            channel = %notification.channel,
            priority = %notification.priority,
            recipient = %notification.recipient.address(),
            title = %notification.title,
            "Dry-run delivery"
        );
        Ok(())
    }
}
