// ── Interface domain types ──

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use super::identity::{IfIndex, MacAddress, NodeId};
use super::limits::{FREQ_MASK_LEN, MAX_ALIAS_LEN, MAX_PASSPHRASE_LEN, MIN_PASSPHRASE_LEN};
use crate::error::InvalidArgument;

/// Link status of the local interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
pub enum LinkStatus {
    Up,
    Down,
    Unknown,
    Dormant,
    NotPresent,
    LowerLayerDown,
    Error,
}

impl LinkStatus {
    pub fn is_up(&self) -> bool {
        matches!(self, Self::Up)
    }
}

/// Persisted interface settings. Only an explicit `set_config` mutates them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[allow(clippy::struct_excessive_bools)]
pub struct InterfaceConfig {
    pub instance_number: u32,
    pub alias: String,
    pub enabled: bool,
    pub preferred_nc: bool,

    // Privacy
    pub privacy_enabled: bool,
    pub key_passphrase: String,

    // Frequency plan (vendor-specific bitmasks)
    pub freq_current_mask: Vec<u8>,
    pub taboo_enabled: bool,
    pub node_taboo_mask: Vec<u8>,
    pub channel_scan_mask: Vec<u8>,

    // Power
    pub tx_power_limit: i32,
    pub auto_power_control: bool,
    pub auto_power_control_phy_rate: u32,
    pub beacon_power_limit: u32,

    // Bandwidth thresholds (bits per second)
    pub max_ingress_bw_threshold: u32,
    pub max_egress_bw_threshold: u32,

    pub reset: bool,
    pub mixed_mode: bool,
    pub channel_scanning: bool,
}

impl InterfaceConfig {
    /// Field-range validation. Runs before any hardware write.
    pub fn validate(&self, if_index: IfIndex) -> Result<(), InvalidArgument> {
        if self.instance_number != if_index.get() {
            return Err(InvalidArgument::field(
                "instance_number",
                format!(
                    "{} does not match interface index {}",
                    self.instance_number,
                    if_index.get()
                ),
            ));
        }
        if self.alias.chars().count() > MAX_ALIAS_LEN {
            return Err(InvalidArgument::field(
                "alias",
                format!("longer than {MAX_ALIAS_LEN} characters"),
            ));
        }
        validate_passphrase(self.privacy_enabled, &self.key_passphrase)?;
        for (field, mask) in [
            ("freq_current_mask", &self.freq_current_mask),
            ("node_taboo_mask", &self.node_taboo_mask),
            ("channel_scan_mask", &self.channel_scan_mask),
        ] {
            if mask.len() > FREQ_MASK_LEN {
                return Err(InvalidArgument::field(
                    field,
                    format!("{} bytes exceeds {FREQ_MASK_LEN}", mask.len()),
                ));
            }
        }
        Ok(())
    }
}

fn validate_passphrase(privacy_enabled: bool, passphrase: &str) -> Result<(), InvalidArgument> {
    let len = passphrase.chars().count();
    if len > MAX_PASSPHRASE_LEN {
        return Err(InvalidArgument::field(
            "key_passphrase",
            format!("longer than {MAX_PASSPHRASE_LEN} characters"),
        ));
    }
    if privacy_enabled {
        if len < MIN_PASSPHRASE_LEN {
            return Err(InvalidArgument::field(
                "key_passphrase",
                format!("privacy requires at least {MIN_PASSPHRASE_LEN} digits"),
            ));
        }
        if !passphrase.chars().all(|c| c.is_ascii_digit()) {
            return Err(InvalidArgument::field(
                "key_passphrase",
                "must contain decimal digits only",
            ));
        }
    }
    Ok(())
}

/// Read-mostly snapshot of the running link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DynamicInfo {
    pub status: LinkStatus,
    pub last_change: Option<DateTime<Utc>>,
    pub max_ingress_bw: u32,
    pub max_egress_bw: u32,
    pub current_version: String,
    pub network_coordinator: Option<NodeId>,
    pub node_id: Option<NodeId>,
    pub backup_nc: Option<NodeId>,
    pub privacy_enabled: bool,
    pub freq_current_mask: Vec<u8>,
    pub current_oper_freq: u32,
    pub last_oper_freq: u32,
    pub tx_bcast_rate: u32,
    pub max_ingress_bw_threshold_reached: bool,
    pub max_egress_bw_threshold_reached: bool,
    pub connected_clients: u32,
    pub network_coordinator_mac: Option<MacAddress>,
    pub link_up_secs: u64,
}

impl DynamicInfo {
    /// Placeholder for an interface the driver has not reported on yet.
    pub fn not_present() -> Self {
        Self {
            status: LinkStatus::NotPresent,
            last_change: None,
            max_ingress_bw: 0,
            max_egress_bw: 0,
            current_version: String::new(),
            network_coordinator: None,
            node_id: None,
            backup_nc: None,
            privacy_enabled: false,
            freq_current_mask: Vec::new(),
            current_oper_freq: 0,
            last_oper_freq: 0,
            tx_bcast_rate: 0,
            max_ingress_bw_threshold_reached: false,
            max_egress_bw_threshold_reached: false,
            connected_clients: 0,
            network_coordinator_mac: None,
            link_up_secs: 0,
        }
    }
}

/// Facts about the local node that do not change while the driver is loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticInfo {
    pub name: String,
    pub mac: MacAddress,
    pub firmware_version: String,
    pub max_bit_rate: u32,
    pub highest_version: String,
    pub freq_capability_mask: Vec<u8>,
    pub network_taboo_mask: Vec<u8>,
    pub tx_bcast_power_reduction: u32,
    pub qam256_capable: bool,
    pub packet_aggregation: bool,
}

/// Network-layer traffic counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub errors_sent: u64,
    pub errors_received: u64,
    pub unicast_packets_sent: u64,
    pub unicast_packets_received: u64,
    pub discard_packets_sent: u64,
    pub discard_packets_received: u64,
    pub multicast_packets_sent: u64,
    pub multicast_packets_received: u64,
    pub broadcast_packets_sent: u64,
    pub broadcast_packets_received: u64,
    pub unknown_proto_packets_received: u64,
    pub ext_aggr_average_tx: u64,
    pub ext_aggr_average_rx: u64,
}

/// MoCA MAC-layer control packet counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MacCounters {
    pub map: u64,
    pub reservation: u64,
    pub link_control: u64,
    pub admission: u64,
    pub probe: u64,
    pub beacon: u64,
}

/// Payload data units, excluding MoCA control traffic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateCounters {
    pub tx: u64,
    pub rx: u64,
}
