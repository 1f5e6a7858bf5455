//! Session lifecycle: connect, submit, disconnect.
//!
//! ARCHITECTURE
//! ============
//! A `Session` is the transport's view of one authenticated connection bound
//! to one picture. Membership changes travel through the ordering pipeline
//! like edit requests do, so a disconnect is always processed after every
//! request the session managed to publish.
//!
//! TRADE-OFFS
//! ==========
//! Client requests use `try_publish` and surface saturation to the client.
//! Join and leave wait for capacity instead: dropping a leave would strand
//! the edit lock on a dead connection.

use tokio::sync::mpsc;
use tracing::warn;

use crate::message::{EditNotice, EditRequest, EditUser};
use crate::services::pipeline::{EditPipeline, EventKind, PipelineError};
use crate::services::registry::{ConnectionHandle, ConnectionId, PictureId, RoomRegistry, SessionState};

#[derive(Debug, Clone)]
pub struct Session {
    pub picture_id: PictureId,
    pub handle: ConnectionHandle,
}

impl Session {
    #[must_use]
    pub fn new(picture_id: PictureId, user: EditUser, tx: mpsc::Sender<EditNotice>) -> Self {
        Self { picture_id, handle: ConnectionHandle::new(user, tx) }
    }

    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.handle.id
    }

    /// Queue the join. The session starts WATCHING once it is processed.
    ///
    /// # Errors
    ///
    /// Returns `Closed` if the pipeline is shut down.
    pub async fn connect(&self, pipeline: &EditPipeline) -> Result<u64, PipelineError> {
        pipeline
            .publish(self.picture_id, self.handle.clone(), EventKind::Join)
            .await
    }

    /// Queue one client request without waiting for capacity.
    ///
    /// # Errors
    ///
    /// Returns `QueueSaturated` when the picture's partition is full.
    pub async fn submit(&self, pipeline: &EditPipeline, request: EditRequest) -> Result<u64, PipelineError> {
        pipeline
            .try_publish(self.picture_id, self.handle.clone(), EventKind::Request(request))
            .await
    }

    /// Queue the leave. Releases the edit lock if this session held it.
    pub async fn disconnect(&self, pipeline: &EditPipeline) {
        if let Err(e) = pipeline
            .publish(self.picture_id, self.handle.clone(), EventKind::Leave)
            .await
        {
            warn!(picture_id = %self.picture_id, client_id = %self.id(), error = %e, "session: leave not published");
        }
    }

    pub async fn state(&self, registry: &RoomRegistry) -> Option<SessionState> {
        registry.state_of(self.picture_id, self.id()).await
    }
}

#[cfg(test)]
#[path = "session_test.rs"]
mod tests;
