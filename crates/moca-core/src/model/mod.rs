// ── Domain model ──
//
// Canonical representations of everything the driver reports. Gateway
// implementations translate their raw structs into these types; the rest
// of the crate never handles driver integers directly.

pub mod aca;
pub mod device;
pub mod identity;
pub mod interface;
pub mod mesh;
pub mod profile;

/// Hardware bounds carried over from the driver contract.
pub mod limits {
    /// Maximum CPE entries reported per interface.
    pub const MAX_CPE_LIST: usize = 256;
    /// Maximum nodes on one MoCA network.
    pub const MAX_MOCA_NODES: usize = 16;
    /// Width of ACA power profiles and subcarrier arrays.
    pub const PROFILE_LEN: usize = 512;
    /// Highest interface index on multi-interface platforms.
    pub const MAX_IF_INDEX: u32 = 256;
    /// Bytes in a frequency / taboo / scan mask.
    pub const FREQ_MASK_LEN: usize = 128;
    pub const MAX_ALIAS_LEN: usize = 63;
    pub const MIN_PASSPHRASE_LEN: usize = 12;
    pub const MAX_PASSPHRASE_LEN: usize = 17;
}

// ── Re-exports ──────────────────────────────────────────────────────

pub use aca::{
    AcaConfig, AcaFailure, AcaProgress, AcaReport, AcaState, AcaStatus, ProbeType, ScModKey,
    ScModStats,
};
pub use device::{AssociatedDevice, DeviceEvent, DeviceListing};
pub use identity::{IfIndex, MacAddress, NodeId};
pub use interface::{
    AggregateCounters, DynamicInfo, InterfaceConfig, InterfaceStats, LinkStatus, MacCounters,
    StaticInfo,
};
pub use mesh::{FlowEntry, MeshRate};
pub use profile::{PowerProfile, Profile, SubcarrierProfile};
