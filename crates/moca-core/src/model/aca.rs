// ── Automated Channel Assessment types ──

use std::fmt;

use serde::{Deserialize, Serialize};
use strum::Display;

use super::identity::NodeId;
use super::profile::{PowerProfile, SubcarrierProfile};
use crate::error::InvalidArgument;

/// Probe used during an assessment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum ProbeType {
    /// Listen only; nothing is transmitted.
    Quiet,
    /// Error-vector-magnitude probe; transmits to measure signal quality.
    #[strum(to_string = "EVM")]
    Evm,
}

impl TryFrom<u32> for ProbeType {
    type Error = InvalidArgument;

    fn try_from(raw: u32) -> Result<Self, Self::Error> {
        match raw {
            0 => Ok(Self::Quiet),
            1 => Ok(Self::Evm),
            other => Err(InvalidArgument::ProbeType(other)),
        }
    }
}

impl From<ProbeType> for u32 {
    fn from(probe: ProbeType) -> Self {
        match probe {
            ProbeType::Quiet => 0,
            ProbeType::Evm => 1,
        }
    }
}

/// Parameters of one assessment run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcaConfig {
    pub node_id: NodeId,
    pub probe: ProbeType,
    pub channel: u32,
    /// Nodes to include, LSB = node 0. Zero means every known node.
    pub report_nodes: u32,
    pub start: bool,
}

impl AcaConfig {
    pub fn new(node_id: NodeId, probe: ProbeType, channel: u32, report_nodes: u32) -> Self {
        Self {
            node_id,
            probe,
            channel,
            report_nodes,
            start: true,
        }
    }

    /// Build from raw driver-style integers, validating each field.
    pub fn from_raw(
        node_id: u32,
        probe: u32,
        channel: u32,
        report_nodes: u32,
    ) -> Result<Self, InvalidArgument> {
        Ok(Self::new(
            NodeId::new(node_id)?,
            ProbeType::try_from(probe)?,
            channel,
            report_nodes,
        ))
    }

    pub fn reports_all_nodes(&self) -> bool {
        self.report_nodes == 0
    }

    pub fn reports_node(&self, node: NodeId) -> bool {
        self.reports_all_nodes() || self.report_nodes & node.mask_bit() != 0
    }
}

/// Why a session ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AcaFailure {
    /// The gateway refused the configuration.
    Rejected(String),
    BadChannel,
    NoEvmProbe,
    /// Hardware reported a generic assessment failure.
    Hardware,
    /// No acknowledgement or result within the bounded wait.
    Timeout,
    /// The gateway call itself failed.
    Driver(String),
}

impl fmt::Display for AcaFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rejected(reason) => write!(f, "rejected: {reason}"),
            Self::BadChannel => f.write_str("bad channel"),
            Self::NoEvmProbe => f.write_str("no EVM probe"),
            Self::Hardware => f.write_str("hardware failure"),
            Self::Timeout => f.write_str("timed out"),
            Self::Driver(reason) => write!(f, "driver error: {reason}"),
        }
    }
}

/// Session lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AcaState {
    #[default]
    Idle,
    Configuring,
    Running,
    Completed,
    Cancelled,
    Failed(AcaFailure),
}

impl AcaState {
    /// `Configuring` or `Running`: a new `start` must be refused.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Configuring | Self::Running)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed(_))
    }
}

impl fmt::Display for AcaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("Idle"),
            Self::Configuring => f.write_str("Configuring"),
            Self::Running => f.write_str("Running"),
            Self::Completed => f.write_str("Completed"),
            Self::Cancelled => f.write_str("Cancelled"),
            Self::Failed(reason) => write!(f, "Failed({reason})"),
        }
    }
}

/// Consistent view of the interface's assessment session.
///
/// Taken in one critical section: `trap_completed` and `power_profile`
/// always belong to the same session as `config` and `state`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AcaStatus {
    /// `None` until the first `start`.
    pub config: Option<AcaConfig>,
    pub state: AcaState,
    /// Total received power, dBm.
    pub rx_power: i32,
    pub power_profile: PowerProfile,
    pub trap_completed: bool,
    /// Monotonic session counter; bumps on every accepted `start`.
    pub session: u64,
}

impl AcaStatus {
    /// True only when the result fields may be read.
    pub fn result_ready(&self) -> bool {
        self.state == AcaState::Completed && self.trap_completed
    }
}

/// Hardware progress code reported by a status poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
pub enum AcaProgress {
    Success,
    BadChannel,
    NoEvmProbe,
    Fail,
    InProgress,
}

impl AcaProgress {
    /// Decode the driver's integer status (0..=4).
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Success),
            1 => Some(Self::BadChannel),
            2 => Some(Self::NoEvmProbe),
            3 => Some(Self::Fail),
            4 => Some(Self::InProgress),
            _ => None,
        }
    }
}

/// Raw result of one `poll_aca_status` gateway call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcaReport {
    pub progress: AcaProgress,
    pub rx_power: i32,
    pub power_profile: PowerProfile,
    pub trap_completed: bool,
}

impl AcaReport {
    pub fn in_progress() -> Self {
        Self {
            progress: AcaProgress::InProgress,
            rx_power: 0,
            power_profile: PowerProfile::empty(),
            trap_completed: false,
        }
    }
}

/// Identifies one subcarrier-statistics row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ScModKey {
    pub tx_node: NodeId,
    pub rx_node: NodeId,
    pub channel: u32,
}

/// Per-subcarrier modulation and error-rate figures for one node pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScModStats {
    pub tx_node: NodeId,
    pub rx_node: NodeId,
    pub channel: u32,
    pub modulation: SubcarrierProfile,
    pub nper: SubcarrierProfile,
    pub vlper: SubcarrierProfile,
}

impl ScModStats {
    pub fn key(&self) -> ScModKey {
        ScModKey {
            tx_node: self.tx_node,
            rx_node: self.rx_node,
            channel: self.channel,
        }
    }

    /// A row is usable only when every array is full-width.
    pub fn is_complete(&self) -> bool {
        !self.modulation.is_empty() && !self.nper.is_empty() && !self.vlper.is_empty()
    }
}
