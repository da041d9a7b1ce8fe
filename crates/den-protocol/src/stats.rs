//! Traffic statistics reported to the control plane

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Aggregated traffic counters for one reporting interval.
///
/// Produced by snapshotting the overlay's per-connection counters; consumed
/// by the control plane and by the statistics HTTP endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentStats {
    pub num_conns: i64,
    pub conns_by_proto: HashMap<String, i64>,
    pub rx_packets: i64,
    pub rx_bytes: i64,
    pub tx_packets: i64,
    pub tx_bytes: i64,
}
