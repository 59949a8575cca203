//! Domain layer for notifyd.
//!
//! This module contains the notification lifecycle model and its value objects.

pub mod notification;
pub mod value_objects;

pub use notification::{NewNotification, Notification, NotificationStatus};
pub use value_objects::*;
