//! Messenger abstractions: outbound sends and inbound update polling.

pub mod port;
pub mod throttled;
pub mod types;
