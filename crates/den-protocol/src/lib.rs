//! den-protocol: the wire contract between workspace clients and the agent
//!
//! This crate defines the well-known overlay ports, the reconnecting-PTY
//! init/request framing, and the traffic-statistics report types. It is
//! shared verbatim by the agent and by anything that dials it.

pub mod error;
pub mod ports;
pub mod rpty;
pub mod stats;

pub use error::ProtocolError;
pub use rpty::{ReconnectingPtyInit, ReconnectingPtyRequest};
pub use stats::AgentStats;

/// Exit code reported to SSH clients when the agent itself failed to run the
/// session, as opposed to the user's command exiting non-zero. Chosen well
/// above the 0-128 range commands normally use.
pub const MAGIC_SESSION_ERROR_CODE: u32 = 229;
