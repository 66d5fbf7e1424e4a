//! Acknowledgment channel back to the originating conversation.

pub mod port;
pub mod throttled;
