// ── Device event dispatch ──
//
// Applies activation events to the topology cache, then fans them out to
// registered observers. The observer list is copied before any callback
// runs, so observers may register or unregister from inside a callback.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::future::join_all;
use thiserror::Error;
use tracing::{debug, warn};

use crate::model::{AssociatedDevice, DeviceEvent, IfIndex};
use crate::store::TopologyCache;

/// Failure reported by an observer callback.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ObserverError {
    #[error("{0}")]
    Failed(String),
}

impl ObserverError {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed(reason.into())
    }
}

/// Receives device activation and deactivation notifications.
///
/// Each call runs under the dispatcher's observer timeout. An observer that
/// exceeds it is unregistered.
#[async_trait]
pub trait DeviceObserver: Send + Sync + 'static {
    async fn on_device_event(
        &self,
        if_index: IfIndex,
        device: &AssociatedDevice,
        activated: bool,
    ) -> Result<(), ObserverError>;

    /// Label used in logs.
    fn name(&self) -> &str {
        "observer"
    }
}

/// Handle returned by [`EventDispatcher::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObserverId(u64);

impl std::fmt::Display for ObserverId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "observer#{}", self.0)
    }
}

/// What one dispatch did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    /// False if the cache already held a newer write for the device; no
    /// observer is notified in that case.
    pub applied: bool,
    pub notified: usize,
    pub failed: usize,
    /// Observers unregistered for exceeding the timeout.
    pub dropped: usize,
}

pub struct EventDispatcher {
    if_index: IfIndex,
    cache: Arc<TopologyCache>,
    observers: DashMap<ObserverId, Arc<dyn DeviceObserver>>,
    next_id: AtomicU64,
    observer_timeout: Duration,
}

impl EventDispatcher {
    pub fn new(if_index: IfIndex, cache: Arc<TopologyCache>, observer_timeout: Duration) -> Self {
        Self {
            if_index,
            cache,
            observers: DashMap::new(),
            next_id: AtomicU64::new(1),
            observer_timeout,
        }
    }

    // ── Registry ─────────────────────────────────────────────────────

    pub fn register(&self, observer: Arc<dyn DeviceObserver>) -> ObserverId {
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        debug!(if_index = %self.if_index, %id, name = observer.name(), "observer registered");
        self.observers.insert(id, observer);
        id
    }

    /// Returns `false` if `id` was not registered (or was already dropped).
    pub fn unregister(&self, id: ObserverId) -> bool {
        self.observers.remove(&id).is_some()
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    pub fn clear(&self) {
        self.observers.clear();
    }

    // ── Dispatch ─────────────────────────────────────────────────────

    /// Record an activation change for `device` at gateway `sequence` and
    /// notify observers.
    pub async fn dispatch(
        &self,
        device: AssociatedDevice,
        activated: bool,
        sequence: u64,
    ) -> DispatchOutcome {
        let event = DeviceEvent {
            if_index: self.if_index,
            sequence,
            device,
            activated,
        };
        self.dispatch_event(&event).await
    }

    pub(crate) async fn dispatch_event(&self, event: &DeviceEvent) -> DispatchOutcome {
        let mut outcome = DispatchOutcome {
            applied: self.cache.apply_event(event),
            ..DispatchOutcome::default()
        };
        if !outcome.applied {
            return outcome;
        }

        let mut device = event.device.clone();
        device.active = event.activated;

        // Copy-then-notify: no map guard is held across an await.
        let observers: Vec<(ObserverId, Arc<dyn DeviceObserver>)> = self
            .observers
            .iter()
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect();
        if observers.is_empty() {
            return outcome;
        }

        let limit = self.observer_timeout;
        let device = &device;
        let calls = observers.iter().map(|(id, observer)| async move {
            let result = tokio::time::timeout(
                limit,
                observer.on_device_event(self.if_index, device, event.activated),
            )
            .await;
            (*id, observer.name().to_owned(), result)
        });

        for (id, name, result) in join_all(calls).await {
            match result {
                Ok(Ok(())) => outcome.notified += 1,
                Ok(Err(e)) => {
                    outcome.failed += 1;
                    warn!(
                        if_index = %self.if_index,
                        %id,
                        name = %name,
                        mac = %device.mac,
                        error = %e,
                        "observer failed"
                    );
                }
                Err(_) => {
                    outcome.dropped += 1;
                    self.observers.remove(&id);
                    warn!(
                        if_index = %self.if_index,
                        %id,
                        name = %name,
                        timeout_ms = limit.as_millis(),
                        "observer timed out; unregistered"
                    );
                }
            }
        }
        outcome
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("if_index", &self.if_index)
            .field("observers", &self.observers.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::model::{MacAddress, NodeId};
    use crate::sim::SimGateway;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(MacAddress, bool)>>,
    }

    #[async_trait]
    impl DeviceObserver for Recorder {
        async fn on_device_event(
            &self,
            _if_index: IfIndex,
            device: &AssociatedDevice,
            activated: bool,
        ) -> Result<(), ObserverError> {
            self.seen.lock().unwrap().push((device.mac, activated));
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl DeviceObserver for Failing {
        async fn on_device_event(
            &self,
            _if_index: IfIndex,
            _device: &AssociatedDevice,
            _activated: bool,
        ) -> Result<(), ObserverError> {
            Err(ObserverError::failed("boom"))
        }
    }

    fn dispatcher() -> (Arc<TopologyCache>, EventDispatcher) {
        let cache = Arc::new(TopologyCache::new(
            IfIndex::SINGLE,
            Arc::new(SimGateway::new()),
            Duration::from_secs(1),
        ));
        let dispatcher =
            EventDispatcher::new(IfIndex::SINGLE, Arc::clone(&cache), Duration::from_millis(100));
        (cache, dispatcher)
    }

    fn device(node: u32) -> AssociatedDevice {
        AssociatedDevice::new(
            MacAddress::from_octets([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, u8::try_from(node).unwrap()]),
            NodeId::new(node).unwrap(),
        )
    }

    #[tokio::test]
    async fn cache_is_updated_before_observers_run() {
        let (cache, dispatcher) = dispatcher();
        let recorder = Arc::new(Recorder::default());
        dispatcher.register(recorder.clone());

        let outcome = dispatcher.dispatch(device(1), false, 1).await;
        assert!(outcome.applied);
        assert_eq!(outcome.notified, 1);
        assert!(!cache.by_mac(&device(1).mac).unwrap().active);
        assert_eq!(*recorder.seen.lock().unwrap(), vec![(device(1).mac, false)]);
    }

    #[tokio::test]
    async fn failing_observer_does_not_block_others() {
        let (_cache, dispatcher) = dispatcher();
        let recorder = Arc::new(Recorder::default());
        dispatcher.register(Arc::new(Failing));
        dispatcher.register(recorder.clone());

        let outcome = dispatcher.dispatch(device(2), true, 1).await;
        assert_eq!(outcome.failed, 1);
        assert_eq!(outcome.notified, 1);
        // Failing observers stay registered.
        assert_eq!(dispatcher.observer_count(), 2);
    }

    #[tokio::test]
    async fn stale_event_notifies_nobody() {
        let (_cache, dispatcher) = dispatcher();
        let recorder = Arc::new(Recorder::default());
        dispatcher.register(recorder.clone());

        dispatcher.dispatch(device(3), false, 5).await;
        let outcome = dispatcher.dispatch(device(3), true, 4).await;
        assert!(!outcome.applied);
        assert_eq!(recorder.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unregister_stops_delivery() {
        let (_cache, dispatcher) = dispatcher();
        let recorder = Arc::new(Recorder::default());
        let id = dispatcher.register(recorder.clone());
        assert!(dispatcher.unregister(id));
        assert!(!dispatcher.unregister(id));

        dispatcher.dispatch(device(4), true, 1).await;
        assert!(recorder.seen.lock().unwrap().is_empty());
    }
}
