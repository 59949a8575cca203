//! Database models.
//!
//! Row types mirror the SQLite schema. Conversion to and from domain entities
//! lives next to each model.

pub mod notification;

pub use notification::NotificationDbModel;
