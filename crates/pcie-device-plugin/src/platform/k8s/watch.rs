//! `ListAndWatch` streams.
//!
//! Each connected watcher gets its own task. The task pushes the current
//! snapshot once, then sleeps on the snapshot channel and pushes again only
//! when a new snapshot is published. Snapshots published while a push is
//! in flight are coalesced into the newest one.

use std::pin::Pin;

use futures::Stream;
use tokio::select;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::Status;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::api;
use super::api::ListAndWatchResponse;
use crate::domain::device::DeviceSnapshot;
use crate::domain::snapshot::SnapshotReader;

pub type DeviceStream = Pin<Box<dyn Stream<Item = Result<ListAndWatchResponse, Status>> + Send>>;

const WATCH_BUFFER: usize = 4;

/// Render a snapshot as a kubelet device list.
pub fn to_response(snapshot: &DeviceSnapshot) -> ListAndWatchResponse {
    let devices = snapshot
        .iter()
        .map(|device| api::Device {
            id: device.id.clone(),
            health: device.health.to_string(),
            topology: device.numa_node.map(|id| api::TopologyInfo {
                nodes: vec![api::NumaNode { id }],
            }),
        })
        .collect();

    ListAndWatchResponse { devices }
}

/// Start a watch stream for one watcher.
///
/// The stream ends when `shutdown` is cancelled. When the watcher
/// disconnects, the receiving half is dropped and the task exits.
pub fn watch_devices(reader: &SnapshotReader, shutdown: CancellationToken) -> DeviceStream {
    let (tx, rx) = mpsc::channel(WATCH_BUFFER);
    let mut updates = reader.subscribe();

    tokio::spawn(async move {
        let initial = updates.borrow_and_update().clone();
        debug!(devices = initial.len(), "sending initial device list");
        if !push(&tx, to_response(&initial), &shutdown).await {
            return;
        }

        let mut source_open = true;
        loop {
            select! {
                _ = shutdown.cancelled() => {
                    info!("device plugin stopping, closing device watch stream");
                    break;
                }
                _ = tx.closed() => {
                    info!("watcher disconnected");
                    break;
                }
                changed = updates.changed(), if source_open => {
                    if changed.is_err() {
                        // keep the stream open, kubelet treats a closed stream as a dead plugin
                        warn!("device snapshot source closed, no further updates will be sent");
                        source_open = false;
                        continue;
                    }

                    let snapshot = updates.borrow_and_update().clone();
                    info!(
                        devices = snapshot.len(),
                        healthy = snapshot.healthy_count(),
                        "sending updated device list"
                    );
                    if !push(&tx, to_response(&snapshot), &shutdown).await {
                        break;
                    }
                }
            }
        }
        debug!("device watch task stopped");
    });

    Box::pin(ReceiverStream::new(rx))
}

/// Queue one device list for the watcher. Returns false when the watcher
/// is gone or the plugin stopped while the buffer was full.
async fn push(
    tx: &mpsc::Sender<Result<ListAndWatchResponse, Status>>,
    response: ListAndWatchResponse,
    shutdown: &CancellationToken,
) -> bool {
    select! {
        sent = tx.send(Ok(response)) => {
            if sent.is_err() {
                info!("watcher disconnected");
            }
            sent.is_ok()
        }
        _ = shutdown.cancelled() => {
            info!("device plugin stopping while watcher is not reading");
            false
        }
    }
}
