//! Metric helpers for `umyproxy`.
//!
//! This module defines metric names and simple helper functions wrapping the
//! [`metrics`](https://docs.rs/metrics) crate. Without the `metrics` feature
//! every helper compiles to a no-op.

#[cfg(feature = "metrics")]
use metrics::{counter, gauge};

/// Name of the gauge tracking allocated backend connections.
pub const POOL_OPEN_CONNECTIONS: &str = "umyproxy_pool_open_connections";
/// Name of the gauge tracking client sessions in progress.
pub const SESSIONS_ACTIVE: &str = "umyproxy_sessions_active";
/// Name of the counter tracking successful pool checkouts.
pub const POOL_CHECKOUTS: &str = "umyproxy_pool_checkouts_total";
/// Name of the counter tracking checkouts that gave up waiting.
pub const POOL_WAIT_TIMEOUTS: &str = "umyproxy_pool_wait_timeouts_total";
/// Name of the counter tracking relayed packets.
pub const FRAMES_RELAYED: &str = "umyproxy_frames_relayed_total";
/// Name of the counter tracking sessions that ended in error.
pub const SESSION_ERRORS: &str = "umyproxy_session_errors_total";
/// Name of the counter tracking sessions that panicked.
pub const SESSION_PANICS: &str = "umyproxy_session_panics_total";

/// How a checkout obtained its connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckoutOutcome {
    /// Taken from the idle list.
    Reused,
    /// Freshly dialed.
    Created,
    /// Delivered by a release while waiting.
    HandOff,
}

impl CheckoutOutcome {
    #[cfg_attr(not(feature = "metrics"), expect(dead_code, reason = "label only used by recorders"))]
    fn as_str(self) -> &'static str {
        match self {
            CheckoutOutcome::Reused => "reused",
            CheckoutOutcome::Created => "created",
            CheckoutOutcome::HandOff => "handoff",
        }
    }
}

/// Direction of a relayed packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Client command forwarded to the backend.
    ToBackend,
    /// Backend response forwarded to the client.
    ToClient,
}

impl Direction {
    #[cfg_attr(not(feature = "metrics"), expect(dead_code, reason = "label only used by recorders"))]
    fn as_str(self) -> &'static str {
        match self {
            Direction::ToBackend => "to_backend",
            Direction::ToClient => "to_client",
        }
    }
}

/// Publish the number of allocated backend connections.
#[cfg_attr(not(feature = "metrics"), expect(unused_variables, reason = "no recorder"))]
pub fn set_pool_open(open: usize) {
    #[cfg(feature = "metrics")]
    {
        #[expect(clippy::cast_precision_loss, reason = "pool sizes are small")]
        gauge!(POOL_OPEN_CONNECTIONS).set(open as f64);
    }
}

/// Record a successful checkout.
#[cfg_attr(not(feature = "metrics"), expect(unused_variables, reason = "no recorder"))]
pub fn inc_checkouts(outcome: CheckoutOutcome) {
    #[cfg(feature = "metrics")]
    counter!(POOL_CHECKOUTS, "outcome" => outcome.as_str()).increment(1);
}

/// Record a checkout that timed out.
pub fn inc_wait_timeouts() {
    #[cfg(feature = "metrics")]
    counter!(POOL_WAIT_TIMEOUTS).increment(1);
}

/// Increment the active sessions gauge.
pub fn inc_sessions() {
    #[cfg(feature = "metrics")]
    gauge!(SESSIONS_ACTIVE).increment(1.0);
}

/// Decrement the active sessions gauge.
pub fn dec_sessions() {
    #[cfg(feature = "metrics")]
    gauge!(SESSIONS_ACTIVE).decrement(1.0);
}

/// Record a relayed packet for the given direction.
#[cfg_attr(not(feature = "metrics"), expect(unused_variables, reason = "no recorder"))]
pub fn inc_frames(direction: Direction) {
    #[cfg(feature = "metrics")]
    counter!(FRAMES_RELAYED, "direction" => direction.as_str()).increment(1);
}

/// Record a session that ended in error.
pub fn inc_session_errors() {
    #[cfg(feature = "metrics")]
    counter!(SESSION_ERRORS).increment(1);
}

/// Record a session task that panicked.
pub fn inc_session_panics() {
    #[cfg(feature = "metrics")]
    counter!(SESSION_PANICS).increment(1);
}
