//! notifyd library crate.
//!
//! Notification dispatch engine: lifecycle state machine, per-channel priority
//! queues, retry with backoff and scheduled delivery.

pub mod channels;
pub mod config;
pub mod database;
pub mod dispatch;
pub mod domain;
pub mod error;
pub mod logging;
pub mod queue;

pub use error::{Error, Result};
