//! Driver gateway contract.
//!
//! The narrow seam between the state manager and a MoCA chipset driver.
//! Implementations wrap vendor firmware (or, for tests and benches,
//! [`SimGateway`](crate::sim::SimGateway)); the core never talks to hardware
//! any other way.
//!
//! Every call is awaited under a timeout by the core. An implementation that
//! exceeds it is reported as [`CoreError::Timeout`](crate::CoreError::Timeout),
//! never as success.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::error::CoreError;

use crate::model::{
    AcaConfig, AcaReport, AggregateCounters, DeviceEvent, DeviceListing, DynamicInfo, FlowEntry,
    IfIndex, InterfaceConfig, InterfaceStats, MacAddress, MacCounters, MeshRate, ScModStats,
    StaticInfo,
};

/// Failure reported by a gateway implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DriverError {
    /// Driver not loaded or chipset not responding.
    #[error("driver unavailable: {0}")]
    Unavailable(String),

    /// An assessment is already running on this interface.
    #[error("operation already in progress")]
    InProgress,

    #[error("no such node: {0}")]
    NoSuchNode(u32),

    #[error("invalid probe type: {0}")]
    InvalidProbe(u32),

    #[error("invalid channel: {0}")]
    InvalidChannel(u32),

    /// The firmware refused the request.
    #[error("rejected: {0}")]
    Rejected(String),

    /// Generic failure status.
    #[error("failure: {0}")]
    Failure(String),

    /// Returned data violated the documented shape.
    #[error("malformed response: {0}")]
    Malformed(String),
}

/// Non-blocking handle the gateway pushes device events into.
///
/// Backed by an unbounded channel so the hardware event source never waits
/// on a slow consumer.
#[derive(Debug, Clone)]
pub struct DeviceEventSink {
    tx: mpsc::UnboundedSender<DeviceEvent>,
}

impl DeviceEventSink {
    pub(crate) fn channel() -> (Self, mpsc::UnboundedReceiver<DeviceEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue an event. Returns `false` once the controller has shut down.
    pub fn send(&self, event: DeviceEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Low-level driver operations for every interface on the platform.
#[async_trait]
pub trait DriverGateway: Send + Sync + 'static {
    // ── Configuration ────────────────────────────────────────────────

    async fn read_config(&self, if_index: IfIndex) -> Result<InterfaceConfig, DriverError>;

    async fn write_config(
        &self,
        if_index: IfIndex,
        config: &InterfaceConfig,
    ) -> Result<(), DriverError>;

    // ── Status and counters ──────────────────────────────────────────

    async fn read_dynamic_info(&self, if_index: IfIndex) -> Result<DynamicInfo, DriverError>;

    async fn read_static_info(&self, if_index: IfIndex) -> Result<StaticInfo, DriverError>;

    async fn read_stats(&self, if_index: IfIndex) -> Result<InterfaceStats, DriverError>;

    async fn read_mac_counters(&self, if_index: IfIndex) -> Result<MacCounters, DriverError>;

    async fn read_aggregate_counters(
        &self,
        if_index: IfIndex,
    ) -> Result<AggregateCounters, DriverError>;

    // ── Topology ─────────────────────────────────────────────────────

    async fn list_cpe_macs(&self, if_index: IfIndex) -> Result<Vec<MacAddress>, DriverError>;

    async fn list_associated_devices(&self, if_index: IfIndex)
    -> Result<DeviceListing, DriverError>;

    async fn read_full_mesh_rates(&self, if_index: IfIndex) -> Result<Vec<MeshRate>, DriverError>;

    async fn read_flow_table(&self, if_index: IfIndex) -> Result<Vec<FlowEntry>, DriverError>;

    // ── Channel assessment ───────────────────────────────────────────

    /// Submit an assessment. `Ok` is the positive acknowledgement.
    async fn start_aca(&self, if_index: IfIndex, config: AcaConfig) -> Result<(), DriverError>;

    /// Ask the firmware to abort a running assessment.
    async fn cancel_aca(&self, if_index: IfIndex) -> Result<(), DriverError>;

    async fn poll_aca_status(&self, if_index: IfIndex) -> Result<AcaReport, DriverError>;

    async fn read_scmod_stats(&self, if_index: IfIndex) -> Result<Vec<ScModStats>, DriverError>;

    // ── Events ───────────────────────────────────────────────────────

    /// Register the single upstream device-event source. Called once by
    /// [`Controller::start`](crate::Controller::start).
    fn subscribe_device_events(&self, sink: DeviceEventSink);

    // ── Platform ─────────────────────────────────────────────────────

    fn hardware_equipped(&self) -> bool;

    async fn reset_count(&self) -> Result<u64, DriverError>;

    /// Vendor-specific conversion of a frequency mask to a frequency value.
    fn freq_mask_to_value(&self, mask: &[u8]) -> Result<u32, DriverError>;
}

/// Await one gateway call under `limit`, translating its failure.
///
/// A call that outlives the bound is reported as [`CoreError::Timeout`];
/// its eventual result is dropped.
pub(crate) async fn bounded<T, F>(
    operation: &'static str,
    limit: Duration,
    call: F,
) -> Result<T, CoreError>
where
    F: Future<Output = Result<T, DriverError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(CoreError::from_driver(operation, err)),
        Err(_) => Err(CoreError::timeout(operation, limit)),
    }
}
