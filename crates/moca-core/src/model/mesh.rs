// ── Derived mesh and flow tables ──
//
// Recomputed from the gateway on every fetch and never cached: a stale PQoS
// flow table misleads admission control elsewhere.

use serde::{Deserialize, Serialize};

use super::identity::{MacAddress, NodeId};

/// Unicast PHY rate from one node to another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshRate {
    pub rx_node: NodeId,
    pub tx_node: NodeId,
    /// Mbps.
    pub tx_rate: u32,
    /// MoCA 2.x NPER rate, Mbps.
    pub tx_rate_nper: u32,
    /// MoCA 2.x VLPER rate, Mbps.
    pub tx_rate_vlper: u32,
}

/// One ingress PQoS flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowEntry {
    pub flow_id: u32,
    pub ingress_node: NodeId,
    pub egress_node: NodeId,
    pub time_left_secs: u32,
    pub destination_mac: MacAddress,
    pub packet_size: u32,
    /// Bits per second.
    pub peak_data_rate: u32,
    /// Bytes.
    pub burst_size: u32,
    pub flow_tag: u32,
    pub lease_time_secs: u32,
}
