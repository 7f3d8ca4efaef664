//! Collector socket modules.
//!
//! - `channel`: length-prefixed framing and the single-flight request path.
//! - `connection`: connect/disconnect lifecycle, receive loop, and ordered
//!   teardown.
//! - `proto`: message envelope and event payloads shared with the collector.

/// Framed message channel.
pub mod channel;
/// Connection lifecycle state machine.
pub mod connection;
/// Wire messages.
pub mod proto;
