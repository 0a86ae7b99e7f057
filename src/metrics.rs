//! Metric helpers for `hubwire`.
//!
//! This module defines metric names and simple helper functions wrapping
//! the [`metrics`](https://docs.rs/metrics) crate. Without the `metrics`
//! feature the helpers compile to nothing.

#[cfg(feature = "metrics")]
use metrics::{counter, gauge};

/// Name of the gauge tracking connected hub connections.
pub const CONNECTIONS_ACTIVE: &str = "hubwire_connections_active";
/// Name of the counter tracking hub messages.
pub const MESSAGES_TOTAL: &str = "hubwire_messages_total";
/// Name of the counter tracking error occurrences.
pub const ERRORS_TOTAL: &str = "hubwire_errors_total";

/// Direction of message flow.
#[derive(Clone, Copy, Debug)]
pub enum Direction {
    /// Messages received from the server.
    Inbound,
    /// Messages sent to the server.
    Outbound,
}

impl Direction {
    #[cfg_attr(not(feature = "metrics"), expect(dead_code, reason = "only labels metrics"))]
    fn as_str(self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

/// Increment the active connections gauge.
pub fn inc_connections() {
    #[cfg(feature = "metrics")]
    gauge!(CONNECTIONS_ACTIVE).increment(1.0);
}

/// Decrement the active connections gauge.
pub fn dec_connections() {
    #[cfg(feature = "metrics")]
    gauge!(CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record `count` messages for the given direction.
pub fn inc_messages(direction: Direction, count: usize) {
    #[cfg(feature = "metrics")]
    counter!(MESSAGES_TOTAL, "direction" => direction.as_str())
        .increment(u64::try_from(count).unwrap_or(u64::MAX));
    #[cfg(not(feature = "metrics"))]
    let _ = (direction, count);
}

/// Record an error occurrence.
pub fn inc_errors() {
    #[cfg(feature = "metrics")]
    counter!(ERRORS_TOTAL).increment(1);
}
