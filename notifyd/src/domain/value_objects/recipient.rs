//! Recipient value object.
//!
//! A notification addresses exactly one recipient, whose kind is fixed by the
//! notification channel. [`Recipient::validate_for`] checks the channel match
//! and the address format.

use serde::{Deserialize, Serialize};
use url::Url;

use super::channel::Channel;
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Recipient {
    Email(String),
    Phone(String),
    DeviceToken(String),
    ChatRoom(String),
    Url(String),
}

impl Recipient {
    /// The only channel this recipient can be delivered on.
    pub fn channel(&self) -> Channel {
        match self {
            Self::Email(_) => Channel::Email,
            Self::Phone(_) => Channel::Sms,
            Self::DeviceToken(_) => Channel::Push,
            Self::ChatRoom(_) => Channel::Chat,
            Self::Url(_) => Channel::Webhook,
        }
    }

    pub fn address(&self) -> &str {
        match self {
            Self::Email(v)
            | Self::Phone(v)
            | Self::DeviceToken(v)
            | Self::ChatRoom(v)
            | Self::Url(v) => v,
        }
    }

    /// Database column name for this recipient kind.
    pub fn kind_str(&self) -> &'static str {
        match self {
            Self::Email(_) => "email",
            Self::Phone(_) => "phone",
            Self::DeviceToken(_) => "device_token",
            Self::ChatRoom(_) => "chat_room",
            Self::Url(_) => "url",
        }
    }

    pub fn from_parts(kind: &str, value: impl Into<String>) -> Option<Self> {
        let value = value.into();
        match kind {
            "email" => Some(Self::Email(value)),
            "phone" => Some(Self::Phone(value)),
            "device_token" => Some(Self::DeviceToken(value)),
            "chat_room" => Some(Self::ChatRoom(value)),
            "url" => Some(Self::Url(value)),
            _ => None,
        }
    }

    /// Validate the recipient against the notification channel.
    pub fn validate_for(&self, channel: Channel) -> Result<()> {
        if self.channel() != channel {
            return Err(Error::validation(format!(
                "Recipient of kind '{}' cannot be delivered on channel {}",
                self.kind_str(),
                channel
            )));
        }

        let address = self.address().trim();
        if address.is_empty() {
            return Err(Error::validation("Recipient address is empty"));
        }

        match self {
            Self::Email(v) => {
                let valid = v
                    .split_once('@')
                    .is_some_and(|(local, domain)| {
                        !local.is_empty() && domain.contains('.') && !domain.starts_with('.')
                    });
                if !valid {
                    return Err(Error::validation(format!("Invalid email address: {}", v)));
                }
            }
            Self::Phone(v) => {
                let digits = v.strip_prefix('+').unwrap_or(v);
                if !(7..=15).contains(&digits.len()) || !digits.chars().all(|c| c.is_ascii_digit())
                {
                    return Err(Error::validation(format!("Invalid phone number: {}", v)));
                }
            }
            Self::Url(v) => {
                let url = Url::parse(v)
                    .map_err(|e| Error::validation(format!("Invalid webhook URL {}: {}", v, e)))?;
                if !matches!(url.scheme(), "http" | "https") {
                    return Err(Error::validation(format!(
                        "Webhook URL must be http or https: {}",
                        v
                    )));
                }
            }
            Self::DeviceToken(_) | Self::ChatRoom(_) => {}
        }

        Ok(())
    }
}
