// ── Associated device domain types ──

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::identity::{MacAddress, NodeId};

/// A peer node currently or recently seen on the coax network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[allow(clippy::struct_excessive_bools)]
pub struct AssociatedDevice {
    pub mac: MacAddress,
    pub node_id: NodeId,
    pub preferred_nc: bool,
    pub highest_version: String,

    // PHY rates (Mbps)
    pub phy_tx_rate: u32,
    pub phy_rx_rate: u32,
    pub tx_bcast_rate: u32,
    pub rx_bcast_rate: u32,

    // Power (dB / dBm)
    pub tx_power_control_reduction: u32,
    pub rx_power_level: i32,
    pub rx_bcast_power_level: i32,
    pub rx_snr: u32,

    // Packet counters
    pub tx_packets: u64,
    pub rx_packets: u64,
    pub rx_errored_and_missed: u64,

    // Capabilities
    pub qam256_capable: bool,
    pub packet_aggregation: bool,

    pub client_count: u32,
    pub active: bool,

    /// When the cache last accepted data for this device.
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
}

impl AssociatedDevice {
    /// Minimal record for a device first learned from an event.
    pub fn new(mac: MacAddress, node_id: NodeId) -> Self {
        Self {
            mac,
            node_id,
            preferred_nc: false,
            highest_version: String::new(),
            phy_tx_rate: 0,
            phy_rx_rate: 0,
            tx_bcast_rate: 0,
            rx_bcast_rate: 0,
            tx_power_control_reduction: 0,
            rx_power_level: 0,
            rx_bcast_power_level: 0,
            rx_snr: 0,
            tx_packets: 0,
            rx_packets: 0,
            rx_errored_and_missed: 0,
            qam256_capable: false,
            packet_aggregation: false,
            client_count: 0,
            active: true,
            last_seen: None,
        }
    }

    /// Cache key; a device keeps its MAC across node-id reassignment.
    pub fn key(&self) -> MacAddress {
        self.mac
    }
}

/// Devices as reported by one gateway read, tagged with the gateway's event
/// sequence at read time. Every event with `sequence <= listing.sequence`
/// is already reflected in `devices`.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceListing {
    pub sequence: u64,
    pub devices: Vec<AssociatedDevice>,
}

/// Activation or deactivation reported by the gateway's event source.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceEvent {
    pub if_index: super::IfIndex,
    /// Gateway-assigned, strictly increasing per interface.
    pub sequence: u64,
    pub device: AssociatedDevice,
    pub activated: bool,
}
