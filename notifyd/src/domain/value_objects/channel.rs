//! Delivery channel value object.

use serde::{Deserialize, Serialize};

/// A delivery medium. Each channel has its own queue and worker group.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Channel {
    Email,
    Sms,
    Push,
    Chat,
    Webhook,
}

impl Channel {
    pub const ALL: [Channel; 5] = [
        Channel::Email,
        Channel::Sms,
        Channel::Push,
        Channel::Chat,
        Channel::Webhook,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Email => "EMAIL",
            Self::Sms => "SMS",
            Self::Push => "PUSH",
            Self::Chat => "CHAT",
            Self::Webhook => "WEBHOOK",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "EMAIL" => Some(Self::Email),
            "SMS" => Some(Self::Sms),
            "PUSH" => Some(Self::Push),
            // The legacy processor called the chat channel "slack".
            "CHAT" | "SLACK" => Some(Self::Chat),
            "WEBHOOK" => Some(Self::Webhook),
            _ => None,
        }
    }

    /// Lower-case name used in queue keys and log fields.
    pub fn key_part(&self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Sms => "sms",
            Self::Push => "push",
            Self::Chat => "chat",
            Self::Webhook => "webhook",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_channel_parse() {
        assert_eq!(Channel::parse("email"), Some(Channel::Email));
        assert_eq!(Channel::parse("SLACK"), Some(Channel::Chat));
        assert_eq!(Channel::parse("fax"), None);
    }

    #[test]
    fn test_channel_strum_round_trip() {
        for channel in Channel::ALL {
            assert_eq!(Channel::from_str(&channel.to_string()).unwrap(), channel);
            assert_eq!(channel.to_string(), channel.as_str());
        }
    }
}
