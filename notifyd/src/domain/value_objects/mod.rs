//! Domain value objects.
//!
//! Value objects are immutable objects that represent concepts in the domain
//! and are defined by their attributes rather than identity.

mod channel;
mod priority;
mod recipient;
mod retry_policy;

pub use channel::Channel;
pub use priority::Priority;
pub use recipient::Recipient;
pub use retry_policy::RetryPolicy;
