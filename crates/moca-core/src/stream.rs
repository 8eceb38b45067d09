// ── Reactive device streams ──
//
// Subscriptions to one interface's device table. Each mutation of the
// table publishes a new immutable snapshot. A listing merge excludes
// event writes until it has published, so subscribers see whole
// snapshots, never a half-applied listing.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_core::Stream;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

use crate::model::AssociatedDevice;
use crate::store::DeviceSnapshot;

/// Which devices a caller wants from a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceFilter {
    #[default]
    All,
    Active,
    Inactive,
}

impl DeviceFilter {
    pub fn matches(self, device: &AssociatedDevice) -> bool {
        match self {
            Self::All => true,
            Self::Active => device.active,
            Self::Inactive => !device.active,
        }
    }

    pub fn apply(self, snapshot: &[Arc<AssociatedDevice>]) -> Vec<Arc<AssociatedDevice>> {
        snapshot
            .iter()
            .filter(|d| self.matches(d))
            .cloned()
            .collect()
    }
}

/// Point-in-time snapshot plus change notification.
pub struct DeviceStream {
    current: DeviceSnapshot,
    receiver: watch::Receiver<DeviceSnapshot>,
}

impl DeviceStream {
    pub(crate) fn new(receiver: watch::Receiver<DeviceSnapshot>) -> Self {
        let current = receiver.borrow().clone();
        Self { current, receiver }
    }

    /// Snapshot as of creation or the last `changed()`.
    pub fn current(&self) -> &Arc<Vec<Arc<AssociatedDevice>>> {
        &self.current
    }

    pub fn latest(&self) -> Arc<Vec<Arc<AssociatedDevice>>> {
        self.receiver.borrow().clone()
    }

    /// Wait for the next change. `None` once the cache is gone.
    pub async fn changed(&mut self) -> Option<Arc<Vec<Arc<AssociatedDevice>>>> {
        self.receiver.changed().await.ok()?;
        let snap = self.receiver.borrow_and_update().clone();
        self.current = Arc::clone(&snap);
        Some(snap)
    }

    pub fn into_stream(self) -> DeviceWatchStream {
        DeviceWatchStream {
            inner: WatchStream::new(self.receiver),
        }
    }
}

/// `Stream` adapter yielding every published snapshot, starting with the
/// current one.
pub struct DeviceWatchStream {
    inner: WatchStream<DeviceSnapshot>,
}

impl Stream for DeviceWatchStream {
    type Item = Arc<Vec<Arc<AssociatedDevice>>>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}
