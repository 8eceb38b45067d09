// ── Sequence-tagged device table ──
//
// Concurrent storage keyed by MAC with push-based change notification via
// a `watch` channel. Every entry remembers the sequence number of the
// writer that produced it; a write carrying an older sequence is refused,
// so the outcome depends on gateway order rather than call order.
//
// Multi-entry writes hold the merge lock from first write to publish, so
// no other publisher can expose a partial merge.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::watch;

use crate::model::{AssociatedDevice, MacAddress};

pub(crate) type DeviceSnapshot = Arc<Vec<Arc<AssociatedDevice>>>;

/// Which writer a sequence number came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Writer {
    /// A gateway event: must be strictly newer than the entry.
    Event,
    /// A refresh listing: reflects every event up to and including its
    /// sequence, so it may overwrite an entry of equal sequence.
    Listing,
}

impl Writer {
    fn supersedes(self, incoming: u64, current: u64) -> bool {
        match self {
            Self::Event => incoming > current,
            Self::Listing => incoming >= current,
        }
    }
}

#[derive(Debug, Clone)]
struct Tracked {
    device: Arc<AssociatedDevice>,
    sequence: u64,
}

pub(crate) struct DeviceTable {
    by_mac: DashMap<MacAddress, Tracked>,

    /// Bumped on every published mutation.
    version: watch::Sender<u64>,

    /// Full snapshot, rebuilt on mutation for subscribers.
    snapshot: watch::Sender<DeviceSnapshot>,

    /// Held by every write that publishes.
    merge: Mutex<()>,
}

impl DeviceTable {
    pub(crate) fn new() -> Self {
        let (version, _) = watch::channel(0u64);
        let (snapshot, _) = watch::channel(Arc::new(Vec::new()));

        Self {
            by_mac: DashMap::new(),
            version,
            snapshot,
            merge: Mutex::new(()),
        }
    }

    /// Exclude other publishing writers until the guard drops. The holder
    /// uses the `_unpublished` writes and calls [`publish`](Self::publish)
    /// before releasing.
    pub(crate) fn lock_merge(&self) -> MutexGuard<'_, ()> {
        // The guarded data is `()`; a panicked holder leaves nothing torn.
        self.merge.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write `device` if `sequence` wins over the stored entry, then publish.
    /// Returns `true` if the write was accepted.
    pub(crate) fn apply(&self, device: AssociatedDevice, sequence: u64, writer: Writer) -> bool {
        let _merge = self.lock_merge();
        let accepted = self.apply_unpublished(device, sequence, writer);
        if accepted {
            self.publish();
        }
        accepted
    }

    /// Same as [`apply`](Self::apply) without rebuilding the snapshot; the
    /// caller must call [`publish`](Self::publish) afterwards.
    pub(crate) fn apply_unpublished(
        &self,
        device: AssociatedDevice,
        sequence: u64,
        writer: Writer,
    ) -> bool {
        // The entry guard holds the shard lock; it is released at the end of
        // this statement, before any publish.
        match self.by_mac.entry(device.mac) {
            Entry::Vacant(slot) => {
                slot.insert(Tracked {
                    device: Arc::new(device),
                    sequence,
                });
                true
            }
            Entry::Occupied(mut slot) => {
                if writer.supersedes(sequence, slot.get().sequence) {
                    slot.insert(Tracked {
                        device: Arc::new(device),
                        sequence,
                    });
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Flip an active entry to inactive if `sequence` is not older than it.
    pub(crate) fn deactivate_unpublished(&self, mac: &MacAddress, sequence: u64) -> bool {
        let Some(mut slot) = self.by_mac.get_mut(mac) else {
            return false;
        };
        if !slot.device.active || !Writer::Listing.supersedes(sequence, slot.sequence) {
            return false;
        }
        let mut device = (*slot.device).clone();
        device.active = false;
        slot.device = Arc::new(device);
        slot.sequence = sequence;
        true
    }

    pub(crate) fn get(&self, mac: &MacAddress) -> Option<Arc<AssociatedDevice>> {
        self.by_mac.get(mac).map(|r| Arc::clone(&r.device))
    }

    #[cfg(test)]
    pub(crate) fn sequence_of(&self, mac: &MacAddress) -> Option<u64> {
        self.by_mac.get(mac).map(|r| r.sequence)
    }

    /// Current snapshot (cheap `Arc` clone).
    pub(crate) fn snapshot(&self) -> DeviceSnapshot {
        self.snapshot.borrow().clone()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<DeviceSnapshot> {
        self.snapshot.subscribe()
    }

    pub(crate) fn version(&self) -> u64 {
        *self.version.borrow()
    }

    pub(crate) fn clear(&self) {
        let _merge = self.lock_merge();
        self.by_mac.clear();
        self.publish();
    }

    pub(crate) fn len(&self) -> usize {
        self.by_mac.len()
    }

    pub(crate) fn macs(&self) -> Vec<MacAddress> {
        self.by_mac.iter().map(|r| *r.key()).collect()
    }

    /// Rebuild the snapshot and notify subscribers.
    ///
    /// The map is read inside the `watch` write lock, so concurrent
    /// publishers are serialised and the last one always observes every
    /// write that preceded it.
    pub(crate) fn publish(&self) {
        self.snapshot.send_modify(|snap| {
            let mut values: Vec<Arc<AssociatedDevice>> =
                self.by_mac.iter().map(|r| Arc::clone(&r.device)).collect();
            values.sort_by_key(|d| (d.node_id, d.mac));
            *snap = Arc::new(values);
        });
        self.version.send_modify(|v| *v += 1);
    }
}
