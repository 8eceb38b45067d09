// ── Controller abstraction ──
//
// Lifecycle for every MoCA interface on the platform. Owns the gateway,
// lazily creates one `InterfaceManager` per interface index, routes the
// gateway's device events to them in order, and runs the periodic
// topology refresh.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::ControllerConfig;
use crate::error::{CoreError, InvalidArgument};
use crate::gateway::{self, DeviceEventSink, DriverGateway};
use crate::manager::InterfaceManager;
use crate::model::limits::FREQ_MASK_LEN;
use crate::model::{DeviceEvent, IfIndex};

// ── ControllerState ──────────────────────────────────────────────

/// Lifecycle state observable by consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    /// Created; no background tasks yet.
    Idle,
    /// Events are routed and the refresh task (if enabled) is running.
    Running,
    /// Torn down. No new interfaces can be opened.
    ShutDown,
}

// ── Controller ───────────────────────────────────────────────────

/// The main entry point for consumers.
///
/// Cheaply cloneable via `Arc<ControllerInner>`.
#[derive(Clone)]
pub struct Controller {
    inner: Arc<ControllerInner>,
}

struct ControllerInner {
    config: ControllerConfig,
    gateway: Arc<dyn DriverGateway>,
    interfaces: DashMap<IfIndex, InterfaceManager>,
    state: watch::Sender<ControllerState>,
    cancel: CancellationToken,
    task_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Controller {
    /// Create a controller over `gateway`. Does NOT subscribe to events;
    /// call [`start()`](Self::start) for that.
    pub fn new(gateway: Arc<dyn DriverGateway>, config: ControllerConfig) -> Self {
        let (state, _) = watch::channel(ControllerState::Idle);
        Self {
            inner: Arc::new(ControllerInner {
                config,
                gateway,
                interfaces: DashMap::new(),
                state,
                cancel: CancellationToken::new(),
                task_handles: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ControllerState {
        *self.inner.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ControllerState> {
        self.inner.state.subscribe()
    }

    // ── Interfaces ───────────────────────────────────────────────

    /// Manager for interface `raw`, created on first use and shared after.
    pub fn interface(&self, raw: u32) -> Result<InterfaceManager, CoreError> {
        let if_index = IfIndex::new(raw)?;
        self.manager(if_index)
    }

    pub fn manager(&self, if_index: IfIndex) -> Result<InterfaceManager, CoreError> {
        if self.state() == ControllerState::ShutDown {
            return Err(CoreError::DriverUnavailable {
                reason: "controller has been shut down".into(),
            });
        }
        let manager = self
            .inner
            .interfaces
            .entry(if_index)
            .or_insert_with(|| {
                debug!(%if_index, "interface manager created");
                InterfaceManager::with_cancel(
                    if_index,
                    Arc::clone(&self.inner.gateway),
                    self.inner.config.clone(),
                    self.inner.cancel.child_token(),
                )
            })
            .clone();
        Ok(manager)
    }

    /// Interfaces opened so far, ascending.
    pub fn interfaces(&self) -> Vec<IfIndex> {
        let mut indices: Vec<IfIndex> = self.inner.interfaces.iter().map(|r| *r.key()).collect();
        indices.sort_unstable();
        indices
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Subscribe to gateway device events and spawn background tasks.
    ///
    /// Idempotent while running.
    pub async fn start(&self) -> Result<(), CoreError> {
        let mut handles = self.inner.task_handles.lock().await;
        match self.state() {
            ControllerState::Running => return Ok(()),
            ControllerState::ShutDown => {
                return Err(CoreError::DriverUnavailable {
                    reason: "controller has been shut down".into(),
                });
            }
            ControllerState::Idle => {}
        }

        if !self.inner.gateway.hardware_equipped() {
            warn!("gateway reports no MoCA hardware; continuing without devices");
        }

        let (sink, events) = DeviceEventSink::channel();
        self.inner.gateway.subscribe_device_events(sink);

        let cancel = self.inner.cancel.child_token();
        handles.push(tokio::spawn(event_router_task(self.clone(), events, cancel)));

        let refresh = self.inner.config.refresh_interval;
        if !refresh.is_zero() {
            let cancel = self.inner.cancel.child_token();
            handles.push(tokio::spawn(refresh_task(self.clone(), cancel)));
        }

        self.inner.state.send_replace(ControllerState::Running);
        info!(
            refresh_secs = refresh.as_secs(),
            "controller started"
        );
        Ok(())
    }

    /// Stop background tasks, cancel any running assessment and purge
    /// every interface's cached state.
    pub async fn shutdown(&self) {
        if self.inner.state.send_replace(ControllerState::ShutDown) == ControllerState::ShutDown {
            return;
        }

        // Managers first, so their aborts reach the gateway before the
        // parent token stops everything.
        let managers: Vec<InterfaceManager> =
            self.inner.interfaces.iter().map(|r| r.value().clone()).collect();
        for manager in &managers {
            manager.shutdown().await;
        }
        self.inner.interfaces.clear();

        self.inner.cancel.cancel();
        let mut handles = self.inner.task_handles.lock().await;
        for handle in handles.drain(..) {
            let _ = handle.await;
        }
        info!(interfaces = managers.len(), "controller shut down");
    }

    // ── Platform ─────────────────────────────────────────────────

    pub fn hardware_equipped(&self) -> bool {
        self.inner.gateway.hardware_equipped()
    }

    /// Number of MoCA resets since boot.
    pub async fn reset_count(&self) -> Result<u64, CoreError> {
        gateway::bounded(
            "reset_count",
            self.inner.config.gateway_timeout,
            self.inner.gateway.reset_count(),
        )
        .await
    }

    /// Convert a frequency mask to the vendor's frequency value.
    pub fn freq_mask_to_value(&self, mask: &[u8]) -> Result<u32, CoreError> {
        if mask.is_empty() || mask.len() > FREQ_MASK_LEN {
            return Err(InvalidArgument::field(
                "freq_mask",
                format!("{} bytes (expected 1..={FREQ_MASK_LEN})", mask.len()),
            )
            .into());
        }
        self.inner
            .gateway
            .freq_mask_to_value(mask)
            .map_err(|e| CoreError::from_driver("freq_mask_to_value", e))
    }

    /// Refresh the topology of every opened interface. Returns the first
    /// error after attempting all of them.
    pub async fn refresh_all(&self) -> Result<(), CoreError> {
        let managers: Vec<InterfaceManager> =
            self.inner.interfaces.iter().map(|r| r.value().clone()).collect();
        let mut first_err = None;
        for manager in managers {
            if let Err(e) = manager.refresh_devices().await {
                warn!(if_index = %manager.if_index(), error = %e, "topology refresh failed");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("state", &self.state())
            .field("interfaces", &self.interfaces())
            .finish_non_exhaustive()
    }
}

// ── Background tasks ─────────────────────────────────────────────

/// Deliver gateway events to their interface, one at a time in arrival
/// order. Observers run inside `route`; the gateway side never waits.
async fn event_router_task(
    controller: Controller,
    mut events: mpsc::UnboundedReceiver<DeviceEvent>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            event = events.recv() => {
                let Some(event) = event else { break };
                let manager = match controller.manager(event.if_index) {
                    Ok(manager) => manager,
                    Err(e) => {
                        debug!(if_index = %event.if_index, error = %e, "event dropped");
                        continue;
                    }
                };
                let outcome = manager.route(&event).await;
                trace!(
                    if_index = %event.if_index,
                    sequence = event.sequence,
                    applied = outcome.applied,
                    notified = outcome.notified,
                    "device event routed"
                );
            }
        }
    }
    debug!("event router stopped");
}

async fn refresh_task(controller: Controller, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(controller.inner.config.refresh_interval);
    interval.tick().await; // consume the immediate first tick

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = interval.tick() => {
                // Failures are logged per interface inside refresh_all.
                let _ = controller.refresh_all().await;
            }
        }
    }
}
