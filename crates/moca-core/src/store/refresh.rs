// ── Listing and event application ──
//
// Merges gateway listings and device events into the table. Both carry a
// gateway sequence number; the table decides per device which write wins,
// so a listing that raced with a newer event never resurrects stale state.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, trace};

use super::TopologyCache;
use super::collection::Writer;
use crate::model::{AssociatedDevice, DeviceEvent, DeviceListing, MacAddress};

/// What one listing did to the cache.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListingOutcome {
    /// Cache snapshot right after the merge.
    pub devices: Arc<Vec<Arc<AssociatedDevice>>>,
    /// Devices written from the listing.
    pub applied: usize,
    /// Devices skipped because the cache already held newer state.
    pub superseded: usize,
    /// Cached devices absent from the listing, now marked inactive.
    pub deactivated: usize,
}

impl TopologyCache {
    /// Merge a full listing.
    ///
    /// Present devices are written unless the cache holds a newer event for
    /// them. Cached devices the listing omits are kept but marked inactive,
    /// again only if the listing is not older than their entry.
    pub(crate) fn apply_listing(&self, listing: DeviceListing) -> ListingOutcome {
        let now = Utc::now();
        let sequence = listing.sequence;
        let mut outcome = ListingOutcome::default();

        let present: HashSet<MacAddress> = listing.devices.iter().map(AssociatedDevice::key).collect();
        let merge = self.devices.lock_merge();

        for mut device in listing.devices {
            device.last_seen = Some(now);
            if self.devices.apply_unpublished(device, sequence, Writer::Listing) {
                outcome.applied += 1;
            } else {
                outcome.superseded += 1;
            }
        }

        for mac in self.devices.macs() {
            if !present.contains(&mac) && self.devices.deactivate_unpublished(&mac, sequence) {
                outcome.deactivated += 1;
            }
        }

        self.devices.publish();
        outcome.devices = self.devices.snapshot();
        drop(merge);
        self.observe_sequence(sequence);
        self.last_refresh.send_replace(Some(now));

        debug!(
            if_index = %self.if_index,
            sequence,
            applied = outcome.applied,
            superseded = outcome.superseded,
            deactivated = outcome.deactivated,
            "device listing applied"
        );
        outcome
    }

    /// Apply one activation or deactivation. Returns `false` if the cache
    /// already reflects a newer write for that device.
    ///
    /// A deactivation for a device never seen before still creates an
    /// inactive entry, so a later stale activation cannot win over it.
    pub(crate) fn apply_event(&self, event: &DeviceEvent) -> bool {
        let mut device = event.device.clone();
        device.active = event.activated;
        device.last_seen = Some(Utc::now());

        let applied = self.devices.apply(device, event.sequence, Writer::Event);
        self.observe_sequence(event.sequence);

        if applied {
            trace!(
                if_index = %self.if_index,
                mac = %event.device.mac,
                sequence = event.sequence,
                activated = event.activated,
                "device event applied"
            );
        } else {
            debug!(
                if_index = %self.if_index,
                mac = %event.device.mac,
                sequence = event.sequence,
                "stale device event ignored"
            );
        }
        applied
    }

    fn observe_sequence(&self, sequence: u64) {
        self.high_water.send_if_modified(|seen| {
            if sequence > *seen {
                *seen = sequence;
                true
            } else {
                false
            }
        });
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::model::{IfIndex, NodeId};
    use crate::sim::SimGateway;

    fn cache() -> TopologyCache {
        TopologyCache::new(
            IfIndex::SINGLE,
            Arc::new(SimGateway::new()),
            Duration::from_secs(1),
        )
    }

    fn device(mac: &str, node: u32) -> AssociatedDevice {
        AssociatedDevice::new(MacAddress::parse(mac).unwrap(), NodeId::new(node).unwrap())
    }

    fn event(mac: &str, node: u32, sequence: u64, activated: bool) -> DeviceEvent {
        DeviceEvent {
            if_index: IfIndex::SINGLE,
            sequence,
            device: device(mac, node),
            activated,
        }
    }

    #[test]
    fn listing_populates_empty_cache() {
        let cache = cache();
        let outcome = cache.apply_listing(DeviceListing {
            sequence: 4,
            devices: vec![device("aa:bb:cc:dd:ee:01", 1), device("aa:bb:cc:dd:ee:02", 2)],
        });
        assert_eq!(
            (outcome.applied, outcome.superseded, outcome.deactivated),
            (2, 0, 0)
        );
        assert_eq!(cache.list().len(), 2);
        assert!(cache.last_refresh().is_some());
        assert_eq!(cache.high_water_mark(), 4);
    }

    #[test]
    fn stale_listing_does_not_resurrect_deactivated_device() {
        let cache = cache();
        // Listing read at sequence 10 still shows the device active; the
        // deactivation at 11 lands first.
        assert!(cache.apply_event(&event("aa:bb:cc:dd:ee:01", 1, 11, false)));
        let outcome = cache.apply_listing(DeviceListing {
            sequence: 10,
            devices: vec![device("aa:bb:cc:dd:ee:01", 1)],
        });

        assert_eq!(outcome.superseded, 1);
        let mac = MacAddress::parse("aa:bb:cc:dd:ee:01").unwrap();
        assert!(!cache.by_mac(&mac).unwrap().active);
    }

    #[test]
    fn missing_devices_are_marked_inactive_not_removed() {
        let cache = cache();
        cache.apply_event(&event("aa:bb:cc:dd:ee:01", 1, 1, true));
        cache.apply_event(&event("aa:bb:cc:dd:ee:02", 2, 2, true));

        let outcome = cache.apply_listing(DeviceListing {
            sequence: 5,
            devices: vec![device("aa:bb:cc:dd:ee:01", 1)],
        });

        assert_eq!(outcome.deactivated, 1);
        let gone = MacAddress::parse("aa:bb:cc:dd:ee:02").unwrap();
        let entry = cache.by_mac(&gone).unwrap();
        assert!(!entry.active);
        assert_eq!(cache.list().len(), 2);
    }

    #[test]
    fn missing_device_with_newer_event_stays_active() {
        let cache = cache();
        cache.apply_event(&event("aa:bb:cc:dd:ee:02", 2, 9, true));
        let outcome = cache.apply_listing(DeviceListing {
            sequence: 8,
            devices: Vec::new(),
        });
        assert_eq!(outcome.deactivated, 0);
        let mac = MacAddress::parse("aa:bb:cc:dd:ee:02").unwrap();
        assert!(cache.by_mac(&mac).unwrap().active);
    }

    #[test]
    fn deactivation_of_unknown_device_leaves_tombstone() {
        let cache = cache();
        assert!(cache.apply_event(&event("aa:bb:cc:dd:ee:07", 7, 3, false)));
        assert!(!cache.apply_event(&event("aa:bb:cc:dd:ee:07", 7, 2, true)));

        let mac = MacAddress::parse("aa:bb:cc:dd:ee:07").unwrap();
        assert!(!cache.by_mac(&mac).unwrap().active);
    }
}
