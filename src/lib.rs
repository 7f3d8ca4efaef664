//! Test host side of the socket link to an out-of-process data collector.
//!
//! The crate is organized in two layers:
//! - `socket`: connection lifecycle, framed channel, and wire messages.
//! - `sender`: typed test case events sent over an established channel.

/// Test case event sender and its process-wide cell.
pub mod sender;
/// Collector socket connection, channel, and protocol types.
pub mod socket;
