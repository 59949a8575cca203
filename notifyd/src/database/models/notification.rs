//! Notification database model.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::database::time::{datetime_to_ms, ms_to_datetime, opt_datetime_to_ms};
use crate::domain::{Channel, Notification, NotificationStatus, Priority, Recipient};
use crate::{Error, Result};

/// Notification database model.
///
/// Timestamps are epoch milliseconds. `priority` is stored numerically so the
/// due-query can order by it directly.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct NotificationDbModel {
    pub id: String,
    pub title: String,
    pub body: String,
    /// EMAIL, SMS, PUSH, CHAT, WEBHOOK
    pub channel: String,
    /// 1 (LOW) .. 4 (URGENT)
    pub priority: i64,
    pub status: String,
    pub recipient_kind: String,
    pub recipient: String,
    pub template_id: Option<String>,
    /// JSON object of string to string
    pub template_data: String,
    /// JSON array of attachment references
    pub attachments: String,
    pub scheduled_time: Option<i64>,
    pub retry_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
    pub sent_at: Option<i64>,
    pub retry_count: i64,
    pub last_error: Option<String>,
    pub batch_id: Option<String>,
    pub version: i64,
}

impl NotificationDbModel {
    pub fn from_domain(n: &Notification) -> Result<Self> {
        Ok(Self {
            id: n.id.clone(),
            title: n.title.clone(),
            body: n.body.clone(),
            channel: n.channel.as_str().to_string(),
            priority: i64::from(n.priority.numeric_value()),
            status: n.status.as_str().to_string(),
            recipient_kind: n.recipient.kind_str().to_string(),
            recipient: n.recipient.address().to_string(),
            template_id: n.template_id.clone(),
            template_data: serde_json::to_string(&n.template_data)?,
            attachments: serde_json::to_string(&n.attachments)?,
            scheduled_time: opt_datetime_to_ms(n.scheduled_time),
            retry_at: opt_datetime_to_ms(n.retry_at),
            created_at: datetime_to_ms(n.created_at),
            updated_at: datetime_to_ms(n.updated_at),
            sent_at: opt_datetime_to_ms(n.sent_at),
            retry_count: i64::from(n.retry_count),
            last_error: n.last_error.clone(),
            batch_id: n.batch_id.clone(),
            version: n.version,
        })
    }

    pub fn into_domain(self) -> Result<Notification> {
        let channel = Channel::parse(&self.channel)
            .ok_or_else(|| corrupt(&self.id, "channel", &self.channel))?;
        let priority = i32::try_from(self.priority)
            .ok()
            .and_then(Priority::from_numeric)
            .ok_or_else(|| corrupt(&self.id, "priority", &self.priority.to_string()))?;
        let status = NotificationStatus::parse(&self.status)
            .ok_or_else(|| corrupt(&self.id, "status", &self.status))?;
        let recipient = Recipient::from_parts(&self.recipient_kind, self.recipient)
            .ok_or_else(|| corrupt(&self.id, "recipient_kind", &self.recipient_kind))?;
        let template_data: BTreeMap<String, String> = serde_json::from_str(&self.template_data)?;
        let attachments: Vec<String> = serde_json::from_str(&self.attachments)?;
        let retry_count = u32::try_from(self.retry_count)
            .map_err(|_| corrupt(&self.id, "retry_count", &self.retry_count.to_string()))?;

        Ok(Notification {
            id: self.id,
            title: self.title,
            body: self.body,
            channel,
            priority,
            status,
            recipient,
            template_id: self.template_id,
            template_data,
            attachments,
            scheduled_time: self.scheduled_time.map(ms_to_datetime),
            retry_at: self.retry_at.map(ms_to_datetime),
            created_at: ms_to_datetime(self.created_at),
            updated_at: ms_to_datetime(self.updated_at),
            sent_at: self.sent_at.map(ms_to_datetime),
            retry_count,
            last_error: self.last_error,
            batch_id: self.batch_id,
            version: self.version,
        })
    }
}

fn corrupt(id: &str, column: &str, value: &str) -> Error {
    Error::Other(format!(
        "notification {} has invalid {} value '{}'",
        id, column, value
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::NewNotification;
    use chrono::{Duration, Utc};

    #[test]
    fn test_model_conversion() {
        let now = Utc::now();
        let mut data = BTreeMap::new();
        data.insert("name".to_string(), "Ada".to_string());
        let request = NewNotification::new(
            "Reminder",
            "Your invoice is due",
            Channel::Sms,
            Recipient::Phone("+15551234567".to_string()),
        )
        .with_priority(Priority::Urgent)
        .with_template("invoice-due", data)
        .with_attachment("s3://bucket/invoice.pdf")
        .scheduled_at(now + Duration::minutes(10));
        let n = Notification::create(request, now).unwrap().with_batch("b-1");

        let model = NotificationDbModel::from_domain(&n).unwrap();
        assert_eq!(model.priority, 4);
        assert_eq!(model.status, "SCHEDULED");
        assert_eq!(model.recipient_kind, "phone");

        let back = model.into_domain().unwrap();
        assert_eq!(back.id, n.id);
        assert_eq!(back.recipient, n.recipient);
        assert_eq!(back.template_data, n.template_data);
        assert_eq!(back.attachments, n.attachments);
        assert_eq!(back.batch_id.as_deref(), Some("b-1"));
        assert_eq!(
            back.scheduled_time.map(|t| t.timestamp_millis()),
            n.scheduled_time.map(|t| t.timestamp_millis())
        );
    }

    #[test]
    fn test_invalid_row_is_rejected() {
        let now = Utc::now();
        let request = NewNotification::new(
            "t",
            "b",
            Channel::Email,
            Recipient::Email("a@example.com".to_string()),
        );
        let n = Notification::create(request, now).unwrap();
        let mut model = NotificationDbModel::from_domain(&n).unwrap();
        model.status = "LOST".to_string();
        assert!(matches!(model.into_domain(), Err(Error::Other(_))));
    }
}
