//! Broadcast dispatcher: fan-out to a picture's watchers.
//!
//! DESIGN
//! ======
//! Sends never await: each recipient gets a `try_send` into its bounded
//! outbound channel. A full or closed channel is a fault for that one
//! recipient, logged and skipped, so a stalled client cannot hold up the
//! consumer worker or the other watchers. Delivery is at-most-once.

use tracing::{debug, warn};

use crate::message::EditNotice;
use crate::services::registry::{ConnectionHandle, ConnectionId, PictureId, RoomRegistry};

#[derive(Debug, thiserror::Error)]
pub enum DispatchFault {
    #[error("outbound buffer full for connection {0}")]
    Backlogged(ConnectionId),
    #[error("connection {0} is closed")]
    Closed(ConnectionId),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub dropped: usize,
}

/// Queue one notice for one connection.
///
/// # Errors
///
/// Returns a `DispatchFault` if the connection's buffer is full or closed.
pub fn send_to(handle: &ConnectionHandle, notice: EditNotice) -> Result<(), DispatchFault> {
    use tokio::sync::mpsc::error::TrySendError;

    handle.tx.try_send(notice).map_err(|e| match e {
        TrySendError::Full(_) => DispatchFault::Backlogged(handle.id),
        TrySendError::Closed(_) => DispatchFault::Closed(handle.id),
    })
}

/// Send `notice` to every watcher of `picture_id` except `exclude`.
pub async fn broadcast(
    registry: &RoomRegistry,
    picture_id: PictureId,
    notice: &EditNotice,
    exclude: Option<ConnectionId>,
) -> BroadcastReport {
    let watchers = registry.watchers_of(picture_id, exclude).await;
    let mut report = BroadcastReport::default();
    if watchers.is_empty() {
        debug!(%picture_id, kind = ?notice.kind, "broadcast: no recipients");
        return report;
    }

    for handle in &watchers {
        match send_to(handle, notice.clone()) {
            Ok(()) => report.delivered += 1,
            Err(fault @ DispatchFault::Closed(_)) => {
                // Socket already gone; its leave event is on the way.
                debug!(%picture_id, error = %fault, "broadcast: skipped closed connection");
                report.dropped += 1;
            }
            Err(fault) => {
                warn!(%picture_id, error = %fault, kind = ?notice.kind, "broadcast: dropped notice");
                report.dropped += 1;
            }
        }
    }
    debug!(%picture_id, kind = ?notice.kind, recipients = watchers.len(), delivered = report.delivered, "broadcast: done");
    report
}

#[cfg(test)]
#[path = "broadcast_test.rs"]
mod tests;
