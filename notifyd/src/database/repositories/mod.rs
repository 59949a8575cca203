//! Repository layer for the record store.

pub mod memory;
pub mod notification;

pub use memory::MemoryNotificationRepository;
pub use notification::{NotificationRepository, SqlxNotificationRepository, StatusCounts};
