// ── Core identity types ──
//
// IfIndex, NodeId and MacAddress form the foundation of every domain type.
// All three are validated at construction so the rest of the crate never
// re-checks ranges.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::limits::{MAX_IF_INDEX, MAX_MOCA_NODES};
use crate::error::InvalidArgument;

// ── IfIndex ─────────────────────────────────────────────────────────

/// Index of one physical MoCA interface.
///
/// `0` addresses the only interface of a single-interface deployment;
/// multi-interface platforms number their interfaces `1..=256`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct IfIndex(u32);

impl IfIndex {
    /// The interface of a single-interface deployment.
    pub const SINGLE: Self = Self(0);

    pub fn new(raw: u32) -> Result<Self, InvalidArgument> {
        if raw > MAX_IF_INDEX {
            return Err(InvalidArgument::IfIndex(raw));
        }
        Ok(Self(raw))
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl TryFrom<u32> for IfIndex {
    type Error = InvalidArgument;

    fn try_from(raw: u32) -> Result<Self, Self::Error> {
        Self::new(raw)
    }
}

impl From<IfIndex> for u32 {
    fn from(idx: IfIndex) -> Self {
        idx.0
    }
}

impl fmt::Display for IfIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "moca{}", self.0)
    }
}

// ── NodeId ──────────────────────────────────────────────────────────

/// MoCA node identifier (0-7 on MoCA 1.0, 0-15 on 1.1/2.x).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct NodeId(u8);

impl NodeId {
    pub fn new(raw: u32) -> Result<Self, InvalidArgument> {
        u8::try_from(raw)
            .ok()
            .filter(|id| usize::from(*id) < MAX_MOCA_NODES)
            .map(Self)
            .ok_or(InvalidArgument::NodeId(raw))
    }

    pub fn get(self) -> u8 {
        self.0
    }

    /// Bit for this node in a report-nodes mask (LSB = node 0).
    pub fn mask_bit(self) -> u32 {
        1 << self.0
    }
}

impl TryFrom<u32> for NodeId {
    type Error = InvalidArgument;

    fn try_from(raw: u32) -> Result<Self, Self::Error> {
        Self::new(raw)
    }
}

impl From<NodeId> for u32 {
    fn from(id: NodeId) -> Self {
        u32::from(id.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── MacAddress ──────────────────────────────────────────────────────

/// Six-octet MAC address, displayed as `AA:BB:CC:DD:EE:FF`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    pub const fn from_octets(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Parse colon-separated, dash-separated, or bare hex.
    pub fn parse(raw: &str) -> Result<Self, InvalidArgument> {
        let hex: String = raw
            .chars()
            .filter(|c| !matches!(c, ':' | '-' | '.'))
            .collect();
        let invalid = || InvalidArgument::MacAddress(raw.to_owned());
        if hex.len() != 12 || !hex.is_ascii() {
            return Err(invalid());
        }
        let mut octets = [0u8; 6];
        for (i, octet) in octets.iter_mut().enumerate() {
            *octet = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).map_err(|_| invalid())?;
        }
        Ok(Self(octets))
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

impl FromStr for MacAddress {
    type Err = InvalidArgument;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for MacAddress {
    type Error = InvalidArgument;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<MacAddress> for String {
    fn from(mac: MacAddress) -> Self {
        mac.to_string()
    }
}
