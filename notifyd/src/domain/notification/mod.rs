//! Notification domain module.

mod entity;
mod state;

pub use entity::{MAX_BODY_LEN, MAX_TITLE_LEN, NewNotification, Notification};
pub use state::NotificationStatus;
