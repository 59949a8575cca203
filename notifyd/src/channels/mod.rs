//! Channel adapters.
//!
//! An adapter performs the actual delivery of one notification on one channel:
//! - Webhook: HTTP POST to the recipient URL
//! - Gateway: JSON envelope relayed to an HTTP gateway (email, SMS, push, chat)
//! - Log: dry-run, logs and succeeds

mod gateway;
pub(crate) mod http;
mod log_adapter;
mod webhook;

pub use gateway::{GatewayAdapter, GatewayConfig};
pub use http::HttpAuth;
pub use log_adapter::{LogAdapter, LogConfig};
pub use webhook::{WebhookAdapter, WebhookConfig};

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::domain::{Channel, Notification};
use crate::{Error, Result};

/// Delivery contract for a channel.
///
/// `send` is invoked under the caller's timeout. Any error it returns is a
/// delivery failure fed to the retry policy.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Adapter name for logs.
    fn name(&self) -> &'static str;

    /// Deliver the notification.
    async fn send(&self, notification: &Notification) -> Result<()>;
}

/// Adapter configuration wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ChannelConfig {
    Webhook(WebhookConfig),
    Gateway(GatewayConfig),
    Log(LogConfig),
}

impl ChannelConfig {
    /// Get the adapter type name.
    pub fn adapter_type(&self) -> &'static str {
        match self {
            Self::Webhook(_) => "webhook",
            Self::Gateway(_) => "gateway",
            Self::Log(_) => "log",
        }
    }

    pub fn is_enabled(&self) -> bool {
        match self {
            Self::Webhook(c) => c.enabled,
            Self::Gateway(c) => c.enabled,
            Self::Log(c) => c.enabled,
        }
    }

    /// Channels served by the adapter built from this config.
    pub fn channels(&self) -> Vec<Channel> {
        match self {
            Self::Webhook(_) => vec![Channel::Webhook],
            Self::Gateway(c) => c.channels.clone(),
            Self::Log(c) => c.channels.clone(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if let Self::Gateway(c) = self {
            url::Url::parse(&c.url)
                .map_err(|e| Error::config(format!("Invalid gateway URL {}: {}", c.url, e)))?;
            if c.channels.is_empty() {
                return Err(Error::config("Gateway adapter must serve at least one channel"));
            }
        }
        Ok(())
    }

    pub fn build(&self) -> Arc<dyn ChannelAdapter> {
        match self {
            Self::Webhook(c) => Arc::new(WebhookAdapter::new(c.clone())),
            Self::Gateway(c) => Arc::new(GatewayAdapter::new(c.clone())),
            Self::Log(_) => Arc::new(LogAdapter),
        }
    }
}

/// Adapter lookup by channel.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<Channel, Arc<dyn ChannelAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build adapters for every enabled config. A channel claimed by two
    /// enabled configs is a configuration error.
    pub fn from_configs(configs: &[ChannelConfig]) -> Result<Self> {
        let mut registry = Self::new();
        for config in configs.iter().filter(|c| c.is_enabled()) {
            config.validate()?;
            let adapter = config.build();
            for channel in config.channels() {
                if registry.adapters.contains_key(&channel) {
                    return Err(Error::config(format!(
                        "Channel {} is served by more than one adapter",
                        channel
                    )));
                }
                info!(channel = %channel, adapter = adapter.name(), "Registered channel adapter");
                registry.adapters.insert(channel, adapter.clone());
            }
        }
        Ok(registry)
    }

    pub fn register(&mut self, channel: Channel, adapter: Arc<dyn ChannelAdapter>) {
        self.adapters.insert(channel, adapter);
    }

    pub fn with(mut self, channel: Channel, adapter: Arc<dyn ChannelAdapter>) -> Self {
        self.register(channel, adapter);
        self
    }

    pub fn get(&self, channel: Channel) -> Option<Arc<dyn ChannelAdapter>> {
        self.adapters.get(&channel).cloned()
    }

    /// Registered channels in declaration order.
    pub fn channels(&self) -> Vec<Channel> {
        Channel::ALL
            .into_iter()
            .filter(|c| self.adapters.contains_key(c))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}
