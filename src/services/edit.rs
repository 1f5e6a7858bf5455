//! Edit service: the WATCHING / EDITING state machine.
//!
//! DESIGN
//! ======
//! `EditProcessor` is the pipeline's event handler. It validates each
//! transition against the registry's editor lock for the target picture,
//! applies it, and hands the resulting notices to the broadcast dispatcher.
//!
//! A session is EDITING exactly when it is the room's lock holder:
//! - ENTER_EDIT takes a free lock; a held lock answers `Conflict`.
//! - EXIT_EDIT and EDIT_ACTION are holder-only; others get `Forbidden`.
//! - Rejections go to the requester alone and change nothing.
//!
//! Accepted ENTER_EDIT / EXIT_EDIT reach every watcher, the originator
//! included (its copy doubles as the acknowledgement). EDIT_ACTION reaches
//! everyone except the originator.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::message::{EditMessageType, EditNotice, EditRequest, ErrorCode};
use crate::services::broadcast::{self, DispatchFault};
use crate::services::pipeline::{EditEvent, EventHandler, EventKind};
use crate::services::registry::{Acquire, PictureId, RoomRegistry};

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EditError {
    #[error("picture {picture_id} is already being edited by {editor}")]
    Conflict { picture_id: PictureId, editor: String },
    #[error("not the current editor of picture {0}")]
    Forbidden(PictureId),
    #[error("not watching picture {0}")]
    UnknownRoom(PictureId),
    #[error("invalid request: {0}")]
    InvalidRequest(&'static str),
}

impl ErrorCode for EditError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Conflict { .. } => "E_CONFLICT",
            Self::Forbidden(_) => "E_FORBIDDEN",
            Self::UnknownRoom(_) => "E_UNKNOWN_ROOM",
            Self::InvalidRequest(_) => crate::message::CODE_INVALID_MESSAGE,
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

// =============================================================================
// PROCESSOR
// =============================================================================

pub struct EditProcessor {
    registry: Arc<RoomRegistry>,
}

impl EditProcessor {
    #[must_use]
    pub fn new(registry: Arc<RoomRegistry>) -> Self {
        Self { registry }
    }

    async fn on_join(&self, event: &EditEvent) -> Result<(), DispatchFault> {
        let session = &event.session;
        let outcome = self.registry.join(event.picture_id, session.clone()).await;

        // Peers are told even when the joiner's own channel faults; the fault
        // is reported after the broadcast.
        let welcome = EditNotice::info(format!("watching picture {}", event.picture_id)).with_user(&session.user);
        let mut fault = broadcast::send_to(session, welcome).err();
        // Late joiners learn who holds the pen.
        if let Some(editor) = &outcome.editor {
            if let Err(e) = broadcast::send_to(session, EditNotice::entered(editor)) {
                fault.get_or_insert(e);
            }
        }

        if outcome.newly_joined {
            let notice = EditNotice::info(format!("{} joined", session.user.user_name)).with_user(&session.user);
            broadcast::broadcast(&self.registry, event.picture_id, &notice, Some(session.id)).await;
        }
        fault.map_or(Ok(()), Err)
    }

    async fn on_leave(&self, event: &EditEvent) {
        let session = &event.session;
        let Some(departure) = self.registry.leave(event.picture_id, session.id).await else {
            debug!(picture_id = %event.picture_id, client_id = %session.id, "edit: leave for non-watcher ignored");
            return;
        };

        if departure.released_lock {
            let report =
                broadcast::broadcast(&self.registry, event.picture_id, &EditNotice::exited(&departure.user), None)
                    .await;
            info!(
                picture_id = %event.picture_id,
                client_id = %session.id,
                delivered = report.delivered,
                "edit: editor disconnected, lock released"
            );
        }

        let notice = EditNotice::info(format!("{} left", departure.user.user_name)).with_user(&departure.user);
        broadcast::broadcast(&self.registry, event.picture_id, &notice, None).await;
    }

    async fn on_request(&self, event: &EditEvent, req: &EditRequest) -> Result<(), DispatchFault> {
        let result = match req.kind {
            EditMessageType::EnterEdit => self.enter_edit(event).await,
            EditMessageType::ExitEdit => self.exit_edit(event).await,
            EditMessageType::EditAction => self.edit_action(event, req.edit_action.as_deref()).await,
        };

        if let Err(err) = result {
            warn!(
                seq = event.sequence,
                picture_id = %event.picture_id,
                client_id = %event.session.id,
                code = err.error_code(),
                error = %err,
                "edit: request rejected"
            );
            broadcast::send_to(&event.session, EditNotice::error_from(&err))?;
        }
        Ok(())
    }

    async fn enter_edit(&self, event: &EditEvent) -> Result<(), EditError> {
        let session = &event.session;
        match self.registry.acquire(event.picture_id, session.id).await? {
            Acquire::Granted => {
                let notice = EditNotice::entered(event.user());
                broadcast::broadcast(&self.registry, event.picture_id, &notice, None).await;
            }
            Acquire::AlreadyEditor => {
                if let Err(e) = broadcast::send_to(session, EditNotice::entered(event.user())) {
                    warn!(
                        seq = event.sequence,
                        picture_id = %event.picture_id,
                        error = %e,
                        "edit: re-enter acknowledgement dropped"
                    );
                }
            }
        }
        Ok(())
    }

    async fn exit_edit(&self, event: &EditEvent) -> Result<(), EditError> {
        self.registry.release(event.picture_id, event.session.id).await?;
        let notice = EditNotice::exited(event.user());
        broadcast::broadcast(&self.registry, event.picture_id, &notice, None).await;
        Ok(())
    }

    async fn edit_action(&self, event: &EditEvent, payload: Option<&str>) -> Result<(), EditError> {
        self.registry
            .ensure_editor(event.picture_id, event.session.id)
            .await?;
        let Some(payload) = payload else {
            return Err(EditError::InvalidRequest("editAction required for EDIT_ACTION"));
        };
        let notice = EditNotice::action(payload);
        broadcast::broadcast(&self.registry, event.picture_id, &notice, Some(event.session.id)).await;
        Ok(())
    }
}

#[async_trait::async_trait]
impl EventHandler for EditProcessor {
    async fn handle(&self, event: &EditEvent) -> Result<(), DispatchFault> {
        match &event.kind {
            EventKind::Join => self.on_join(event).await,
            EventKind::Request(req) => self.on_request(event, req).await,
            EventKind::Leave => {
                self.on_leave(event).await;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
#[path = "edit_test.rs"]
mod tests;
