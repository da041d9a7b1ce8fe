//! Well-known overlay ports served by the workspace agent
//!
//! These are fixed constants shared with clients; the overlay network gives
//! every workspace the same port map regardless of the host's real
//! interfaces.

/// SSH wire protocol.
pub const SSH_PORT: u16 = 1;

/// Reconnecting-PTY protocol (length-prefixed init, then a JSON request
/// stream one way and raw PTY output the other).
pub const RECONNECTING_PTY_PORT: u16 = 2;

/// Speedtest protocol, served by the overlay library itself.
pub const SPEEDTEST_PORT: u16 = 3;

/// HTTP telemetry endpoint.
pub const STATISTICS_PORT: u16 = 4;
