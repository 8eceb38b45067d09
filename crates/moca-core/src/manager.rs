// ── Interface state manager ──
//
// Façade binding one interface index to its topology cache, ACA
// controller and event dispatcher. Every gateway call made here is
// bounded by `gateway_timeout` and error-mapped before it reaches the
// caller.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{Mutex, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::aca::AcaController;
use crate::config::ControllerConfig;
use crate::dispatch::{DeviceObserver, DispatchOutcome, EventDispatcher, ObserverId};
use crate::error::CoreError;
use crate::gateway::{self, DriverError, DriverGateway};
use crate::model::limits::MAX_CPE_LIST;
use crate::model::{
    AcaConfig, AcaState, AcaStatus, AggregateCounters, AssociatedDevice, DeviceEvent,
    DynamicInfo, FlowEntry, IfIndex, InterfaceConfig, InterfaceStats, MacAddress, MacCounters,
    MeshRate, NodeId, ScModStats, StaticInfo,
};
use crate::store::{ListingOutcome, TopologyCache};
use crate::stream::DeviceStream;

/// Per-interface state manager.
///
/// Cheaply cloneable via `Arc`; clones operate on the same interface.
#[derive(Clone)]
pub struct InterfaceManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    if_index: IfIndex,
    gateway: Arc<dyn DriverGateway>,
    config: ControllerConfig,
    topology: Arc<TopologyCache>,
    aca: AcaController,
    dispatcher: EventDispatcher,
    /// Last dynamic-info read and when it was taken.
    dynamic: Mutex<Option<(Instant, DynamicInfo)>>,
    cancel: CancellationToken,
}

impl InterfaceManager {
    pub fn new(
        if_index: IfIndex,
        gateway: Arc<dyn DriverGateway>,
        config: ControllerConfig,
    ) -> Self {
        Self::with_cancel(if_index, gateway, config, CancellationToken::new())
    }

    pub(crate) fn with_cancel(
        if_index: IfIndex,
        gateway: Arc<dyn DriverGateway>,
        config: ControllerConfig,
        cancel: CancellationToken,
    ) -> Self {
        let topology = Arc::new(TopologyCache::new(
            if_index,
            Arc::clone(&gateway),
            config.gateway_timeout,
        ));
        let aca = AcaController::new(if_index, Arc::clone(&gateway), &config, cancel.child_token());
        let dispatcher = EventDispatcher::new(if_index, Arc::clone(&topology), config.observer_timeout);

        Self {
            inner: Arc::new(ManagerInner {
                if_index,
                gateway,
                config,
                topology,
                aca,
                dispatcher,
                dynamic: Mutex::new(None),
                cancel,
            }),
        }
    }

    pub fn if_index(&self) -> IfIndex {
        self.inner.if_index
    }

    pub fn topology(&self) -> &Arc<TopologyCache> {
        &self.inner.topology
    }

    pub fn aca(&self) -> &AcaController {
        &self.inner.aca
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.inner.dispatcher
    }

    async fn call<T, F>(&self, operation: &'static str, fut: F) -> Result<T, CoreError>
    where
        F: Future<Output = Result<T, DriverError>>,
    {
        let result = gateway::bounded(operation, self.inner.config.gateway_timeout, fut).await;
        if let Err(CoreError::Internal(message)) = &result {
            error!(if_index = %self.inner.if_index, operation, "{message}");
        }
        result
    }

    // ── Configuration ────────────────────────────────────────────────

    pub async fn config(&self) -> Result<InterfaceConfig, CoreError> {
        let gw = &self.inner.gateway;
        self.call("read_config", gw.read_config(self.inner.if_index))
            .await
    }

    /// Validate and write `config`. Nothing reaches the gateway unless every
    /// field is valid.
    pub async fn set_config(&self, config: &InterfaceConfig) -> Result<(), CoreError> {
        config.validate(self.inner.if_index)?;
        let gw = &self.inner.gateway;
        self.call("write_config", gw.write_config(self.inner.if_index, config))
            .await?;
        // Link parameters may change with the new config.
        *self.inner.dynamic.lock().await = None;
        debug!(if_index = %self.inner.if_index, "interface config written");
        Ok(())
    }

    // ── Status and counters ──────────────────────────────────────────

    /// Live link status, served from a read younger than
    /// `dynamic_info_max_age` when one exists.
    pub async fn dynamic_info(&self) -> Result<DynamicInfo, CoreError> {
        let max_age = self.inner.config.dynamic_info_max_age;
        if !max_age.is_zero() {
            if let Some((taken, info)) = self.inner.dynamic.lock().await.as_ref() {
                if taken.elapsed() < max_age {
                    return Ok(info.clone());
                }
            }
        }

        let gw = &self.inner.gateway;
        let info = self
            .call("read_dynamic_info", gw.read_dynamic_info(self.inner.if_index))
            .await?;
        if !max_age.is_zero() {
            *self.inner.dynamic.lock().await = Some((Instant::now(), info.clone()));
        }
        Ok(info)
    }

    pub async fn static_info(&self) -> Result<StaticInfo, CoreError> {
        let gw = &self.inner.gateway;
        self.call("read_static_info", gw.read_static_info(self.inner.if_index))
            .await
    }

    pub async fn stats(&self) -> Result<InterfaceStats, CoreError> {
        let gw = &self.inner.gateway;
        self.call("read_stats", gw.read_stats(self.inner.if_index))
            .await
    }

    pub async fn mac_counters(&self) -> Result<MacCounters, CoreError> {
        let gw = &self.inner.gateway;
        self.call("read_mac_counters", gw.read_mac_counters(self.inner.if_index))
            .await
    }

    pub async fn aggregate_counters(&self) -> Result<AggregateCounters, CoreError> {
        let gw = &self.inner.gateway;
        self.call(
            "read_aggregate_counters",
            gw.read_aggregate_counters(self.inner.if_index),
        )
        .await
    }

    /// MACs of the CPEs reachable through this interface (at most 256).
    pub async fn cpe_macs(&self) -> Result<Vec<MacAddress>, CoreError> {
        let gw = &self.inner.gateway;
        let macs = self
            .call("list_cpe_macs", gw.list_cpe_macs(self.inner.if_index))
            .await?;
        if macs.len() > MAX_CPE_LIST {
            let message = format!(
                "list_cpe_macs returned {} entries (limit {MAX_CPE_LIST})",
                macs.len()
            );
            error!(if_index = %self.inner.if_index, "{message}");
            return Err(CoreError::Internal(message));
        }
        Ok(macs)
    }

    /// Refresh from the gateway and count the active devices.
    pub async fn associated_device_count(&self) -> Result<usize, CoreError> {
        self.inner.topology.refresh().await?;
        Ok(self.inner.topology.active_count())
    }

    // ── Topology ─────────────────────────────────────────────────────

    pub async fn refresh_devices(&self) -> Result<ListingOutcome, CoreError> {
        self.inner.topology.refresh().await
    }

    pub fn list_devices(&self) -> Arc<Vec<Arc<AssociatedDevice>>> {
        self.inner.topology.list()
    }

    pub fn device_by_mac(&self, mac: &MacAddress) -> Option<Arc<AssociatedDevice>> {
        self.inner.topology.by_mac(mac)
    }

    pub fn device_by_node(&self, node: NodeId) -> Result<Arc<AssociatedDevice>, CoreError> {
        self.inner
            .topology
            .by_node(node)
            .ok_or_else(|| CoreError::NoSuchNode {
                node: node.to_string(),
            })
    }

    pub fn subscribe_devices(&self) -> DeviceStream {
        self.inner.topology.subscribe()
    }

    pub async fn full_mesh_rates(&self) -> Result<Vec<MeshRate>, CoreError> {
        self.inner.topology.full_mesh_rates().await
    }

    pub async fn flow_statistics(&self) -> Result<Vec<FlowEntry>, CoreError> {
        self.inner.topology.flow_statistics().await
    }

    pub fn invalidate_cache(&self) {
        self.inner.topology.invalidate();
    }

    // ── Channel assessment ───────────────────────────────────────────

    pub async fn aca_start(&self, config: AcaConfig) -> Result<(), CoreError> {
        self.inner.aca.start(config).await
    }

    pub fn aca_config(&self) -> Option<AcaConfig> {
        self.inner.aca.config()
    }

    pub async fn aca_cancel(&self) -> Result<(), CoreError> {
        self.inner.aca.cancel().await
    }

    pub fn aca_status(&self) -> AcaStatus {
        self.inner.aca.status()
    }

    pub async fn aca_poll(&self) -> Result<AcaState, CoreError> {
        self.inner.aca.poll_once().await
    }

    pub async fn aca_subcarrier_stats(&self) -> Result<Vec<ScModStats>, CoreError> {
        self.inner.aca.subcarrier_stats().await
    }

    pub fn aca_subscribe(&self) -> watch::Receiver<AcaStatus> {
        self.inner.aca.subscribe()
    }

    // ── Observers ────────────────────────────────────────────────────

    pub fn register_observer(&self, observer: Arc<dyn DeviceObserver>) -> ObserverId {
        self.inner.dispatcher.register(observer)
    }

    pub fn unregister_observer(&self, id: ObserverId) -> bool {
        self.inner.dispatcher.unregister(id)
    }

    pub async fn dispatch(
        &self,
        device: AssociatedDevice,
        activated: bool,
        sequence: u64,
    ) -> DispatchOutcome {
        self.inner.dispatcher.dispatch(device, activated, sequence).await
    }

    pub(crate) async fn route(&self, event: &DeviceEvent) -> DispatchOutcome {
        self.inner.dispatcher.dispatch_event(event).await
    }

    // ── Teardown ─────────────────────────────────────────────────────

    /// Stop polling, abort any in-flight assessment, drop observers and
    /// purge cached state.
    pub async fn shutdown(&self) {
        if let Err(e) = self.inner.aca.cancel().await {
            warn!(if_index = %self.inner.if_index, error = %e, "ACA abort during shutdown failed");
        }
        self.inner.cancel.cancel();
        self.inner.dispatcher.clear();
        self.inner.topology.invalidate();
        *self.inner.dynamic.lock().await = None;
        debug!(if_index = %self.inner.if_index, "interface manager shut down");
    }
}

impl std::fmt::Debug for InterfaceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterfaceManager")
            .field("if_index", &self.inner.if_index)
            .field("topology", &self.inner.topology)
            .field("aca", &self.inner.aca)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::error::InvalidArgument;
    use crate::sim::SimGateway;

    fn manager(sim: &Arc<SimGateway>, config: ControllerConfig) -> InterfaceManager {
        InterfaceManager::new(IfIndex::SINGLE, Arc::clone(sim) as Arc<dyn DriverGateway>, config)
    }

    #[tokio::test]
    async fn invalid_config_never_reaches_gateway() {
        let sim = Arc::new(SimGateway::new());
        let mgr = manager(&sim, ControllerConfig::default());

        let config = InterfaceConfig {
            instance_number: 3,
            ..InterfaceConfig::default()
        };
        let err = mgr.set_config(&config).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidArgument(InvalidArgument::Field { .. })));
        assert_eq!(sim.config_writes(IfIndex::SINGLE), 0);
    }

    #[tokio::test]
    async fn config_round_trips_through_gateway() {
        let sim = Arc::new(SimGateway::new());
        let mgr = manager(&sim, ControllerConfig::default());

        let config = InterfaceConfig {
            alias: "coax-upstairs".into(),
            enabled: true,
            ..InterfaceConfig::default()
        };
        mgr.set_config(&config).await.unwrap();
        assert_eq!(mgr.config().await.unwrap(), config);
    }

    #[tokio::test(start_paused = true)]
    async fn dynamic_info_is_cached_within_max_age() {
        let sim = Arc::new(SimGateway::new());
        let mgr = manager(
            &sim,
            ControllerConfig {
                dynamic_info_max_age: Duration::from_secs(1),
                ..ControllerConfig::default()
            },
        );

        mgr.dynamic_info().await.unwrap();
        mgr.dynamic_info().await.unwrap();
        assert_eq!(sim.dynamic_info_reads(IfIndex::SINGLE), 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        mgr.dynamic_info().await.unwrap();
        assert_eq!(sim.dynamic_info_reads(IfIndex::SINGLE), 2);
    }

    #[tokio::test]
    async fn unknown_node_is_reported() {
        let sim = Arc::new(SimGateway::new());
        let mgr = manager(&sim, ControllerConfig::default());
        let err = mgr.device_by_node(NodeId::new(9).unwrap()).unwrap_err();
        assert_eq!(err, CoreError::NoSuchNode { node: "9".into() });
    }

    #[tokio::test]
    async fn unavailable_driver_is_surfaced() {
        let sim = Arc::new(SimGateway::new());
        sim.set_available(false);
        let mgr = manager(&sim, ControllerConfig::default());
        assert!(matches!(
            mgr.stats().await.unwrap_err(),
            CoreError::DriverUnavailable { .. }
        ));
    }
}
