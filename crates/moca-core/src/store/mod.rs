// ── Topology cache ──
//
// Per-interface view of the associated devices, kept current by refresh
// listings and gateway events. Reads are served from memory; mesh rates
// and flow tables go to the gateway on every call.

mod collection;
mod refresh;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;

use crate::error::CoreError;
use crate::gateway::{self, DriverGateway};
use crate::model::{AssociatedDevice, FlowEntry, IfIndex, MacAddress, MeshRate, NodeId};
use crate::stream::DeviceStream;

use collection::DeviceTable;
pub(crate) use collection::DeviceSnapshot;
pub use refresh::ListingOutcome;

/// Cached associated-device table for one interface.
pub struct TopologyCache {
    if_index: IfIndex,
    gateway: Arc<dyn DriverGateway>,
    gateway_timeout: Duration,
    devices: DeviceTable,
    last_refresh: watch::Sender<Option<DateTime<Utc>>>,
    /// Highest gateway sequence seen from either writer.
    high_water: watch::Sender<u64>,
}

impl TopologyCache {
    pub fn new(
        if_index: IfIndex,
        gateway: Arc<dyn DriverGateway>,
        gateway_timeout: Duration,
    ) -> Self {
        let (last_refresh, _) = watch::channel(None);
        let (high_water, _) = watch::channel(0);

        Self {
            if_index,
            gateway,
            gateway_timeout,
            devices: DeviceTable::new(),
            last_refresh,
            high_water,
        }
    }

    pub fn if_index(&self) -> IfIndex {
        self.if_index
    }

    // ── Gateway-backed operations ────────────────────────────────────

    /// Pull a fresh listing from the gateway and merge it.
    pub async fn refresh(&self) -> Result<ListingOutcome, CoreError> {
        let listing = gateway::bounded(
            "list_associated_devices",
            self.gateway_timeout,
            self.gateway.list_associated_devices(self.if_index),
        )
        .await?;
        Ok(self.apply_listing(listing))
    }

    /// Node-to-node PHY rates, read from the gateway every call.
    pub async fn full_mesh_rates(&self) -> Result<Vec<MeshRate>, CoreError> {
        gateway::bounded(
            "read_full_mesh_rates",
            self.gateway_timeout,
            self.gateway.read_full_mesh_rates(self.if_index),
        )
        .await
    }

    /// Active parameterised-QoS flows, read from the gateway every call.
    pub async fn flow_statistics(&self) -> Result<Vec<FlowEntry>, CoreError> {
        gateway::bounded(
            "read_flow_table",
            self.gateway_timeout,
            self.gateway.read_flow_table(self.if_index),
        )
        .await
    }

    // ── Snapshot accessors ───────────────────────────────────────────

    /// Every cached device, active or not, ordered by node id.
    pub fn list(&self) -> Arc<Vec<Arc<AssociatedDevice>>> {
        self.devices.snapshot()
    }

    pub fn by_mac(&self, mac: &MacAddress) -> Option<Arc<AssociatedDevice>> {
        self.devices.get(mac)
    }

    /// The active device holding `node`, falling back to the most recent
    /// inactive one.
    pub fn by_node(&self, node: NodeId) -> Option<Arc<AssociatedDevice>> {
        let snapshot = self.devices.snapshot();
        let mut inactive = None;
        for device in snapshot.iter().filter(|d| d.node_id == node) {
            if device.active {
                return Some(Arc::clone(device));
            }
            if inactive
                .as_ref()
                .is_none_or(|prev: &Arc<AssociatedDevice>| device.last_seen > prev.last_seen)
            {
                inactive = Some(Arc::clone(device));
            }
        }
        inactive
    }

    pub fn active_count(&self) -> usize {
        self.devices.snapshot().iter().filter(|d| d.active).count()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.len() == 0
    }

    // ── Subscriptions ────────────────────────────────────────────────

    pub fn subscribe(&self) -> DeviceStream {
        DeviceStream::new(self.devices.subscribe())
    }

    // ── Metadata ─────────────────────────────────────────────────────

    pub fn last_refresh(&self) -> Option<DateTime<Utc>> {
        *self.last_refresh.borrow()
    }

    pub fn high_water_mark(&self) -> u64 {
        *self.high_water.borrow()
    }

    /// Bumped on every change to the device table.
    pub fn version(&self) -> u64 {
        self.devices.version()
    }

    /// Drop every entry, including inactive tombstones.
    pub fn invalidate(&self) {
        self.devices.clear();
        self.last_refresh.send_replace(None);
        self.high_water.send_replace(0);
    }
}

impl std::fmt::Debug for TopologyCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopologyCache")
            .field("if_index", &self.if_index)
            .field("devices", &self.devices.len())
            .field("high_water", &self.high_water_mark())
            .finish_non_exhaustive()
    }
}
