//! Shared device snapshot.
//!
//! The snapshot is held in a [`tokio::sync::watch`] channel of
//! `Arc<DeviceSnapshot>`. The [`SnapshotPublisher`] is the only writer and
//! swaps the whole snapshot at once; every [`SnapshotReader`] sees either the
//! old or the new snapshot, never a mix of both.

use std::sync::Arc;

use tokio::sync::watch;

use crate::domain::device::DeviceSnapshot;

/// Create a snapshot channel seeded with the initial discovery result.
pub fn channel(initial: DeviceSnapshot) -> (SnapshotPublisher, SnapshotReader) {
    let (tx, rx) = watch::channel(Arc::new(initial));
    (SnapshotPublisher { tx: Arc::new(tx) }, SnapshotReader { rx })
}

/// Writing half of the snapshot channel.
#[derive(Debug, Clone)]
pub struct SnapshotPublisher {
    tx: Arc<watch::Sender<Arc<DeviceSnapshot>>>,
}

impl SnapshotPublisher {
    /// Replace the current snapshot.
    ///
    /// Readers are only notified when the new snapshot differs from the
    /// current one. Returns whether a change was published.
    pub fn publish(&self, snapshot: DeviceSnapshot) -> bool {
        self.tx.send_if_modified(|current| {
            if **current == snapshot {
                false
            } else {
                *current = Arc::new(snapshot);
                true
            }
        })
    }

    pub fn current(&self) -> Arc<DeviceSnapshot> {
        self.tx.borrow().clone()
    }

    pub fn reader(&self) -> SnapshotReader {
        SnapshotReader {
            rx: self.tx.subscribe(),
        }
    }
}

/// Reading half of the snapshot channel, cloned into every RPC handler.
#[derive(Debug, Clone)]
pub struct SnapshotReader {
    rx: watch::Receiver<Arc<DeviceSnapshot>>,
}

impl SnapshotReader {
    /// The latest published snapshot.
    pub fn current(&self) -> Arc<DeviceSnapshot> {
        self.rx.borrow().clone()
    }

    /// A receiver for change notifications, independent from other subscribers.
    pub fn subscribe(&self) -> watch::Receiver<Arc<DeviceSnapshot>> {
        self.rx.clone()
    }
}
