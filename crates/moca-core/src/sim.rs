//! In-memory driver gateway.
//!
//! [`SimGateway`] stands in for chipset firmware in tests and in the `mocad`
//! bench daemon. Every interface is created on first use with an empty
//! network. Tests script it through the setters below: add devices, emit
//! events with explicit sequence numbers, hold or reject ACA
//! acknowledgements, stall aborts, and inject latency. Call counters
//! record what the core actually asked for.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::watch;

use crate::gateway::{DeviceEventSink, DriverError, DriverGateway};
use crate::model::limits::{FREQ_MASK_LEN, MAX_CPE_LIST};
use crate::model::{
    AcaConfig, AcaProgress, AcaReport, AggregateCounters, AssociatedDevice, DeviceEvent,
    DeviceListing, DynamicInfo, FlowEntry, IfIndex, InterfaceConfig, InterfaceStats, LinkStatus,
    MacAddress, MacCounters, MeshRate, NodeId, PowerProfile, ScModStats, StaticInfo,
    SubcarrierProfile,
};

/// Base frequency of the lowest mask bit, MHz.
const BASE_FREQ_MHZ: u32 = 1150;
/// Spacing between adjacent mask bits, MHz.
const CHANNEL_SPACING_MHZ: u32 = 25;

// ── Per-interface state ─────────────────────────────────────────────

#[derive(Debug, Default)]
struct SimAca {
    config: Option<AcaConfig>,
    running: bool,
    report: Option<AcaReport>,
    scmod: Vec<ScModStats>,
    reject_next: Option<String>,
    stall_abort: bool,
    failing_polls: u32,
    start_calls: u64,
    cancel_calls: u64,
}

#[derive(Debug)]
struct SimInterface {
    config: InterfaceConfig,
    dynamic: DynamicInfo,
    static_info: StaticInfo,
    stats: InterfaceStats,
    mac_counters: MacCounters,
    aggregate: AggregateCounters,
    cpe_macs: Vec<MacAddress>,
    devices: BTreeMap<MacAddress, AssociatedDevice>,
    mesh: Vec<MeshRate>,
    flows: Vec<FlowEntry>,
    /// Last sequence number handed out by this interface's event source.
    sequence: u64,
    /// Listing returned instead of the live table while set.
    frozen: Option<DeviceListing>,
    aca: SimAca,
    /// `true` while ACA acknowledgements are held back.
    ack_gate: watch::Sender<bool>,
    config_writes: u64,
    dynamic_reads: u64,
}

impl SimInterface {
    fn new(if_index: IfIndex) -> Self {
        let (ack_gate, _) = watch::channel(false);
        let local = MacAddress::from_octets([0x02, 0x00, 0x00, 0x00, 0x00, 0x00]);
        Self {
            config: InterfaceConfig {
                instance_number: if_index.get(),
                alias: if_index.to_string(),
                enabled: true,
                ..InterfaceConfig::default()
            },
            dynamic: DynamicInfo {
                status: LinkStatus::Up,
                current_version: "2.5".into(),
                node_id: NodeId::new(0).ok(),
                network_coordinator: NodeId::new(0).ok(),
                network_coordinator_mac: Some(local),
                ..DynamicInfo::not_present()
            },
            static_info: StaticInfo {
                name: if_index.to_string(),
                mac: local,
                firmware_version: "sim-1.0".into(),
                max_bit_rate: 2500,
                highest_version: "2.5".into(),
                freq_capability_mask: vec![0xFF; 8],
                network_taboo_mask: Vec::new(),
                tx_bcast_power_reduction: 0,
                qam256_capable: true,
                packet_aggregation: true,
            },
            stats: InterfaceStats::default(),
            mac_counters: MacCounters::default(),
            aggregate: AggregateCounters::default(),
            cpe_macs: Vec::new(),
            devices: BTreeMap::new(),
            mesh: Vec::new(),
            flows: Vec::new(),
            sequence: 0,
            frozen: None,
            aca: SimAca::default(),
            ack_gate,
            config_writes: 0,
            dynamic_reads: 0,
        }
    }

    fn listing(&self) -> DeviceListing {
        self.frozen.clone().unwrap_or_else(|| DeviceListing {
            sequence: self.sequence,
            devices: self.devices.values().cloned().collect(),
        })
    }

    /// Nodes covered by the session's report mask, excluding the prober.
    fn reported_nodes(&self, config: &AcaConfig) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = if config.reports_all_nodes() {
            self.devices.values().map(|d| d.node_id).collect()
        } else {
            (0..16u32)
                .filter_map(|n| NodeId::new(n).ok())
                .filter(|n| config.reports_node(*n))
                .collect()
        };
        nodes.retain(|n| *n != config.node_id);
        nodes.sort_unstable();
        nodes.dedup();
        nodes
    }
}

// ── Gateway ─────────────────────────────────────────────────────────

/// Scriptable in-memory gateway.
#[derive(Debug)]
pub struct SimGateway {
    interfaces: DashMap<IfIndex, SimInterface>,
    sink: RwLock<Option<DeviceEventSink>>,
    available: AtomicBool,
    equipped: AtomicBool,
    latency_ms: AtomicU64,
    resets: AtomicU64,
}

impl Default for SimGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl SimGateway {
    pub fn new() -> Self {
        Self {
            interfaces: DashMap::new(),
            sink: RwLock::new(None),
            available: AtomicBool::new(true),
            equipped: AtomicBool::new(true),
            latency_ms: AtomicU64::new(0),
            resets: AtomicU64::new(0),
        }
    }

    fn with<R>(&self, if_index: IfIndex, f: impl FnOnce(&mut SimInterface) -> R) -> R {
        let mut iface = self
            .interfaces
            .entry(if_index)
            .or_insert_with(|| SimInterface::new(if_index));
        f(&mut iface)
    }

    /// Apply injected latency, then fail if the driver is "unloaded".
    async fn enter(&self) -> Result<(), DriverError> {
        let latency = self.latency_ms.load(Ordering::Relaxed);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.available.load(Ordering::Relaxed) {
            Ok(())
        } else {
            Err(DriverError::Unavailable("simulated driver unloaded".into()))
        }
    }

    // ── Platform knobs ───────────────────────────────────────────────

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Relaxed);
    }

    pub fn set_equipped(&self, equipped: bool) {
        self.equipped.store(equipped, Ordering::Relaxed);
    }

    /// Delay applied to every async call.
    pub fn set_latency(&self, latency: Duration) {
        let ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.latency_ms.store(ms, Ordering::Relaxed);
    }

    pub fn record_reset(&self) {
        self.resets.fetch_add(1, Ordering::Relaxed);
    }

    // ── Topology scripting ───────────────────────────────────────────

    /// Add or replace a device in the live table without emitting an event.
    pub fn add_device(&self, if_index: IfIndex, device: AssociatedDevice) {
        self.with(if_index, |iface| {
            iface.devices.insert(device.mac, device);
        });
    }

    pub fn remove_device(&self, if_index: IfIndex, mac: &MacAddress) -> Option<AssociatedDevice> {
        self.with(if_index, |iface| iface.devices.remove(mac))
    }

    /// Move the event sequence counter forward (never backwards).
    pub fn set_sequence(&self, if_index: IfIndex, sequence: u64) {
        self.with(if_index, |iface| iface.sequence = iface.sequence.max(sequence));
    }

    pub fn sequence(&self, if_index: IfIndex) -> u64 {
        self.with(if_index, |iface| iface.sequence)
    }

    /// Keep answering listings with the current table and sequence, as if
    /// the read happened now and its reply is still in flight.
    pub fn freeze_listing(&self, if_index: IfIndex) {
        self.with(if_index, |iface| iface.frozen = Some(iface.listing()));
    }

    pub fn thaw_listing(&self, if_index: IfIndex) {
        self.with(if_index, |iface| iface.frozen = None);
    }

    /// Change the live table, assign the next sequence number and push the
    /// event. Returns the sequence used.
    pub fn emit(&self, if_index: IfIndex, device: AssociatedDevice, activated: bool) -> u64 {
        let event = self.with(if_index, |iface| {
            iface.sequence += 1;
            if activated {
                let mut live = device.clone();
                live.active = true;
                iface.devices.insert(live.mac, live);
            } else {
                iface.devices.remove(&device.mac);
            }
            DeviceEvent {
                if_index,
                sequence: iface.sequence,
                device,
                activated,
            }
        });
        let sequence = event.sequence;
        self.push_event(event);
        sequence
    }

    /// Push a raw event with whatever sequence it carries. The live table
    /// is left alone. Returns `false` if no subscriber is attached.
    pub fn push_event(&self, event: DeviceEvent) -> bool {
        let sink = self
            .sink
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        sink.is_some_and(|sink| sink.send(event))
    }

    pub fn has_subscriber(&self) -> bool {
        self.sink
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|sink| !sink.is_closed())
    }

    pub fn set_mesh_rates(&self, if_index: IfIndex, rates: Vec<MeshRate>) {
        self.with(if_index, |iface| iface.mesh = rates);
    }

    pub fn set_flows(&self, if_index: IfIndex, flows: Vec<FlowEntry>) {
        self.with(if_index, |iface| iface.flows = flows);
    }

    pub fn set_cpe_macs(&self, if_index: IfIndex, macs: Vec<MacAddress>) {
        self.with(if_index, |iface| iface.cpe_macs = macs);
    }

    pub fn set_dynamic_info(&self, if_index: IfIndex, info: DynamicInfo) {
        self.with(if_index, |iface| iface.dynamic = info);
    }

    pub fn set_stats(&self, if_index: IfIndex, stats: InterfaceStats) {
        self.with(if_index, |iface| iface.stats = stats);
    }

    // ── ACA scripting ────────────────────────────────────────────────

    /// Refuse the next `start_aca` with `reason`.
    pub fn reject_next_aca(&self, if_index: IfIndex, reason: impl Into<String>) {
        let reason = reason.into();
        self.with(if_index, |iface| iface.aca.reject_next = Some(reason));
    }

    /// Hold `start_aca` replies until [`release_aca_ack`](Self::release_aca_ack).
    pub fn hold_aca_ack(&self, if_index: IfIndex) {
        self.with(if_index, |iface| iface.ack_gate.send_replace(true));
    }

    pub fn release_aca_ack(&self, if_index: IfIndex) {
        self.with(if_index, |iface| iface.ack_gate.send_replace(false));
    }

    /// Make `cancel_aca` never return while set.
    pub fn stall_aca_abort(&self, if_index: IfIndex, stall: bool) {
        self.with(if_index, |iface| iface.aca.stall_abort = stall);
    }

    /// Fail the next `count` status polls.
    pub fn fail_aca_polls(&self, if_index: IfIndex, count: u32) {
        self.with(if_index, |iface| iface.aca.failing_polls = count);
    }

    /// Finish the running assessment successfully with the trap set, a
    /// full-width power profile and one subcarrier row per reported pair.
    pub fn complete_aca(&self, if_index: IfIndex, rx_power: i32) {
        self.with(if_index, |iface| {
            let Some(config) = iface.aca.config else {
                return;
            };
            let nodes = iface.reported_nodes(&config);
            iface.aca.scmod = nodes
                .iter()
                .flat_map(|peer| {
                    [(config.node_id, *peer), (*peer, config.node_id)]
                        .into_iter()
                        .map(|(tx_node, rx_node)| ScModStats {
                            tx_node,
                            rx_node,
                            channel: config.channel,
                            modulation: SubcarrierProfile::filled(8),
                            nper: SubcarrierProfile::filled(7),
                            vlper: SubcarrierProfile::filled(6),
                        })
                })
                .collect();
            iface.aca.report = Some(AcaReport {
                progress: AcaProgress::Success,
                rx_power,
                power_profile: PowerProfile::filled(rx_power),
                trap_completed: true,
            });
            iface.aca.running = false;
        });
    }

    /// End the running assessment with `progress` and no result.
    pub fn finish_aca(&self, if_index: IfIndex, progress: AcaProgress) {
        self.with(if_index, |iface| {
            iface.aca.report = Some(AcaReport {
                progress,
                ..AcaReport::in_progress()
            });
            iface.aca.running = progress == AcaProgress::InProgress;
        });
    }

    /// Replace the subcarrier rows returned after completion.
    pub fn set_scmod_stats(&self, if_index: IfIndex, rows: Vec<ScModStats>) {
        self.with(if_index, |iface| iface.aca.scmod = rows);
    }

    // ── Call counters ────────────────────────────────────────────────

    pub fn aca_start_calls(&self, if_index: IfIndex) -> u64 {
        self.with(if_index, |iface| iface.aca.start_calls)
    }

    pub fn aca_cancel_calls(&self, if_index: IfIndex) -> u64 {
        self.with(if_index, |iface| iface.aca.cancel_calls)
    }

    pub fn aca_running(&self, if_index: IfIndex) -> bool {
        self.with(if_index, |iface| iface.aca.running)
    }

    pub fn config_writes(&self, if_index: IfIndex) -> u64 {
        self.with(if_index, |iface| iface.config_writes)
    }

    pub fn dynamic_info_reads(&self, if_index: IfIndex) -> u64 {
        self.with(if_index, |iface| iface.dynamic_reads)
    }
}

#[async_trait]
impl DriverGateway for SimGateway {
    async fn read_config(&self, if_index: IfIndex) -> Result<InterfaceConfig, DriverError> {
        self.enter().await?;
        Ok(self.with(if_index, |iface| iface.config.clone()))
    }

    async fn write_config(
        &self,
        if_index: IfIndex,
        config: &InterfaceConfig,
    ) -> Result<(), DriverError> {
        self.enter().await?;
        self.with(if_index, |iface| {
            iface.config = config.clone();
            iface.config_writes += 1;
            iface.dynamic.privacy_enabled = config.privacy_enabled;
            if !config.freq_current_mask.is_empty() {
                iface.dynamic.freq_current_mask.clone_from(&config.freq_current_mask);
            }
        });
        Ok(())
    }

    async fn read_dynamic_info(&self, if_index: IfIndex) -> Result<DynamicInfo, DriverError> {
        self.enter().await?;
        Ok(self.with(if_index, |iface| {
            iface.dynamic_reads += 1;
            let mut info = iface.dynamic.clone();
            info.connected_clients =
                u32::try_from(iface.devices.values().filter(|d| d.active).count()).unwrap_or(u32::MAX);
            info
        }))
    }

    async fn read_static_info(&self, if_index: IfIndex) -> Result<StaticInfo, DriverError> {
        self.enter().await?;
        Ok(self.with(if_index, |iface| iface.static_info.clone()))
    }

    async fn read_stats(&self, if_index: IfIndex) -> Result<InterfaceStats, DriverError> {
        self.enter().await?;
        Ok(self.with(if_index, |iface| iface.stats))
    }

    async fn read_mac_counters(&self, if_index: IfIndex) -> Result<MacCounters, DriverError> {
        self.enter().await?;
        Ok(self.with(if_index, |iface| iface.mac_counters))
    }

    async fn read_aggregate_counters(
        &self,
        if_index: IfIndex,
    ) -> Result<AggregateCounters, DriverError> {
        self.enter().await?;
        Ok(self.with(if_index, |iface| iface.aggregate))
    }

    async fn list_cpe_macs(&self, if_index: IfIndex) -> Result<Vec<MacAddress>, DriverError> {
        self.enter().await?;
        Ok(self.with(if_index, |iface| {
            iface.cpe_macs.iter().take(MAX_CPE_LIST).copied().collect()
        }))
    }

    async fn list_associated_devices(
        &self,
        if_index: IfIndex,
    ) -> Result<DeviceListing, DriverError> {
        self.enter().await?;
        Ok(self.with(if_index, |iface| iface.listing()))
    }

    async fn read_full_mesh_rates(&self, if_index: IfIndex) -> Result<Vec<MeshRate>, DriverError> {
        self.enter().await?;
        Ok(self.with(if_index, |iface| iface.mesh.clone()))
    }

    async fn read_flow_table(&self, if_index: IfIndex) -> Result<Vec<FlowEntry>, DriverError> {
        self.enter().await?;
        Ok(self.with(if_index, |iface| iface.flows.clone()))
    }

    async fn start_aca(&self, if_index: IfIndex, config: AcaConfig) -> Result<(), DriverError> {
        self.enter().await?;
        let mut gate = self.with(if_index, |iface| {
            iface.aca.start_calls += 1;
            if let Some(reason) = iface.aca.reject_next.take() {
                return Err(DriverError::Rejected(reason));
            }
            if config.start && iface.aca.running {
                return Err(DriverError::InProgress);
            }
            iface.aca.config = Some(config);
            if config.start {
                iface.aca.running = true;
                iface.aca.report = Some(AcaReport::in_progress());
                iface.aca.scmod.clear();
            }
            Ok(iface.ack_gate.subscribe())
        })?;

        // A closed gate only means the interface state was dropped.
        let _ = gate.wait_for(|held| !*held).await;
        Ok(())
    }

    async fn cancel_aca(&self, if_index: IfIndex) -> Result<(), DriverError> {
        self.enter().await?;
        let stall = self.with(if_index, |iface| {
            iface.aca.cancel_calls += 1;
            iface.aca.stall_abort
        });
        if stall {
            std::future::pending::<()>().await;
        }
        self.with(if_index, |iface| {
            iface.aca.running = false;
            iface.aca.report = None;
        });
        Ok(())
    }

    async fn poll_aca_status(&self, if_index: IfIndex) -> Result<AcaReport, DriverError> {
        self.enter().await?;
        self.with(if_index, |iface| {
            if iface.aca.failing_polls > 0 {
                iface.aca.failing_polls -= 1;
                return Err(DriverError::Failure("simulated poll failure".into()));
            }
            Ok(iface
                .aca
                .report
                .clone()
                .unwrap_or_else(AcaReport::in_progress))
        })
    }

    async fn read_scmod_stats(&self, if_index: IfIndex) -> Result<Vec<ScModStats>, DriverError> {
        self.enter().await?;
        Ok(self.with(if_index, |iface| iface.aca.scmod.clone()))
    }

    fn subscribe_device_events(&self, sink: DeviceEventSink) {
        *self.sink.write().unwrap_or_else(PoisonError::into_inner) = Some(sink);
    }

    fn hardware_equipped(&self) -> bool {
        self.equipped.load(Ordering::Relaxed)
    }

    async fn reset_count(&self) -> Result<u64, DriverError> {
        self.enter().await?;
        Ok(self.resets.load(Ordering::Relaxed))
    }

    /// The lowest set bit (MSB-first across bytes) selects the channel.
    fn freq_mask_to_value(&self, mask: &[u8]) -> Result<u32, DriverError> {
        if mask.len() > FREQ_MASK_LEN {
            return Err(DriverError::Malformed(format!(
                "frequency mask of {} bytes",
                mask.len()
            )));
        }
        let (index, byte) = mask
            .iter()
            .enumerate()
            .find(|(_, byte)| **byte != 0)
            .ok_or_else(|| DriverError::Malformed("empty frequency mask".into()))?;
        let index = u32::try_from(index).map_err(|e| DriverError::Malformed(e.to_string()))?;
        let bit = index * 8 + byte.leading_zeros();
        Ok(BASE_FREQ_MHZ + bit * CHANNEL_SPACING_MHZ)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn freq_mask_picks_first_set_bit() {
        let sim = SimGateway::new();
        assert_eq!(sim.freq_mask_to_value(&[0x80]).unwrap(), 1150);
        assert_eq!(sim.freq_mask_to_value(&[0x00, 0x40]).unwrap(), 1150 + 9 * 25);
        assert!(sim.freq_mask_to_value(&[0, 0]).is_err());
    }

    #[tokio::test]
    async fn emit_without_subscriber_still_updates_table() {
        let sim = SimGateway::new();
        let device = AssociatedDevice::new(
            MacAddress::parse("aa:bb:cc:dd:ee:01").unwrap(),
            NodeId::new(1).unwrap(),
        );
        assert_eq!(sim.emit(IfIndex::SINGLE, device, true), 1);
        let listing = sim.list_associated_devices(IfIndex::SINGLE).await.unwrap();
        assert_eq!(listing.sequence, 1);
        assert_eq!(listing.devices.len(), 1);
    }

    #[tokio::test]
    async fn rejection_applies_once() {
        let sim = SimGateway::new();
        let config = AcaConfig::from_raw(2, 1, 5, 0).unwrap();
        sim.reject_next_aca(IfIndex::SINGLE, "nope");
        assert_eq!(
            sim.start_aca(IfIndex::SINGLE, config).await,
            Err(DriverError::Rejected("nope".into()))
        );
        assert!(sim.start_aca(IfIndex::SINGLE, config).await.is_ok());
    }
}
