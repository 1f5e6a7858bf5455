//! Connection registry: who watches which picture, and who holds the pen.
//!
//! DESIGN
//! ======
//! Rooms are keyed by picture id. The id → room map sits behind an async
//! `RwLock` that is only held for lookup, insert and eviction. Every room
//! has its own `Mutex`, so all watcher and editor-lock mutations of one
//! picture are serialized without blocking unrelated pictures.
//!
//! LOCK ORDER
//! ==========
//! Map lock before room lock, never the reverse. A room that empties is
//! marked `closed` under its own lock and evicted afterwards under the map
//! lock; a join that races onto a closed room evicts it and retries on a
//! fresh one.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock, mpsc};
use tracing::{debug, info};
use uuid::Uuid;

use crate::message::{EditNotice, EditUser};
use crate::services::edit::EditError;

pub type PictureId = i64;
pub type ConnectionId = Uuid;

// =============================================================================
// TYPES
// =============================================================================

/// Routing handle for one live connection. The transport owns the socket;
/// the registry only keeps this cloneable sender.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub user: EditUser,
    pub tx: mpsc::Sender<EditNotice>,
}

impl ConnectionHandle {
    #[must_use]
    pub fn new(user: EditUser, tx: mpsc::Sender<EditNotice>) -> Self {
        Self { id: Uuid::new_v4(), user, tx }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Watching,
    Editing,
}

/// Live state of one picture.
#[derive(Debug, Default)]
pub struct PictureRoom {
    watchers: HashMap<ConnectionId, ConnectionHandle>,
    /// Current lock holder. Always a key of `watchers`.
    editor: Option<ConnectionId>,
    closed: bool,
}

impl PictureRoom {
    fn editor_user(&self) -> Option<&EditUser> {
        self.editor
            .and_then(|id| self.watchers.get(&id))
            .map(|h| &h.user)
    }
}

#[derive(Debug, Clone)]
pub struct JoinOutcome {
    /// False when the connection was already watching.
    pub newly_joined: bool,
    pub editor: Option<EditUser>,
    pub watchers: usize,
}

#[derive(Debug, Clone)]
pub struct Departure {
    pub user: EditUser,
    /// The departing connection held edit rights, which are now released.
    pub released_lock: bool,
    pub remaining: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    Granted,
    AlreadyEditor,
}

/// Point-in-time copy of a room's watchers. Iterate as often as needed.
#[derive(Debug, Clone, Default)]
pub struct WatcherSnapshot {
    handles: Vec<ConnectionHandle>,
}

impl WatcherSnapshot {
    pub fn iter(&self) -> std::slice::Iter<'_, ConnectionHandle> {
        self.handles.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

impl<'a> IntoIterator for &'a WatcherSnapshot {
    type Item = &'a ConnectionHandle;
    type IntoIter = std::slice::Iter<'a, ConnectionHandle>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

// =============================================================================
// REGISTRY
// =============================================================================

#[derive(Default)]
pub struct RoomRegistry {
    rooms: RwLock<HashMap<PictureId, Arc<Mutex<PictureRoom>>>>,
}

impl RoomRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handle` as a watcher of `picture_id`, creating the room on
    /// first join. Repeated joins by the same connection are no-ops.
    pub async fn join(&self, picture_id: PictureId, handle: ConnectionHandle) -> JoinOutcome {
        loop {
            let room = {
                let mut rooms = self.rooms.write().await;
                Arc::clone(rooms.entry(picture_id).or_default())
            };
            let mut guard = room.lock().await;
            if guard.closed {
                drop(guard);
                self.evict(picture_id, &room).await;
                continue;
            }

            let client_id = handle.id;
            let newly_joined = !guard.watchers.contains_key(&client_id);
            if newly_joined {
                guard.watchers.insert(client_id, handle);
            }
            let outcome =
                JoinOutcome { newly_joined, editor: guard.editor_user().cloned(), watchers: guard.watchers.len() };
            info!(%picture_id, %client_id, watchers = outcome.watchers, "registry: joined");
            return outcome;
        }
    }

    /// Remove a watcher. Releases its edit lock if it held one and evicts the
    /// room once nobody is left. Returns `None` if it was not watching.
    pub async fn leave(&self, picture_id: PictureId, client_id: ConnectionId) -> Option<Departure> {
        let room = self.room(picture_id).await?;
        let mut guard = room.lock().await;
        if guard.closed {
            return None;
        }

        let handle = guard.watchers.remove(&client_id)?;
        let released_lock = guard.editor == Some(client_id);
        if released_lock {
            guard.editor = None;
            info!(%picture_id, %client_id, "registry: edit lock released on leave");
        }
        let remaining = guard.watchers.len();
        let departure = Departure { user: handle.user, released_lock, remaining };

        if remaining == 0 {
            guard.closed = true;
            drop(guard);
            self.evict(picture_id, &room).await;
        }
        info!(%picture_id, %client_id, remaining, "registry: left");
        Some(departure)
    }

    /// Snapshot of the watchers of `picture_id`, minus `exclude` if given.
    pub async fn watchers_of(&self, picture_id: PictureId, exclude: Option<ConnectionId>) -> WatcherSnapshot {
        let Some(room) = self.room(picture_id).await else {
            return WatcherSnapshot::default();
        };
        let guard = room.lock().await;
        let handles = guard
            .watchers
            .values()
            .filter(|h| exclude != Some(h.id))
            .cloned()
            .collect();
        WatcherSnapshot { handles }
    }

    /// Try to take the edit lock for `client_id`.
    ///
    /// # Errors
    ///
    /// `UnknownRoom` if the connection is not watching the picture, and
    /// `Conflict` if someone else already holds the lock.
    pub async fn acquire(&self, picture_id: PictureId, client_id: ConnectionId) -> Result<Acquire, EditError> {
        let room = self.joined_room(picture_id).await?;
        let mut guard = room.lock().await;
        if guard.closed || !guard.watchers.contains_key(&client_id) {
            return Err(EditError::UnknownRoom(picture_id));
        }

        match guard.editor {
            Some(holder) if holder == client_id => Ok(Acquire::AlreadyEditor),
            Some(_) => {
                let editor = guard
                    .editor_user()
                    .map_or_else(String::new, |u| u.user_name.clone());
                Err(EditError::Conflict { picture_id, editor })
            }
            None => {
                guard.editor = Some(client_id);
                info!(%picture_id, %client_id, "registry: edit lock acquired");
                Ok(Acquire::Granted)
            }
        }
    }

    /// Release the edit lock held by `client_id`.
    ///
    /// # Errors
    ///
    /// `UnknownRoom` if not watching, `Forbidden` if not the holder.
    pub async fn release(&self, picture_id: PictureId, client_id: ConnectionId) -> Result<(), EditError> {
        let room = self.joined_room(picture_id).await?;
        let mut guard = room.lock().await;
        check_holder(&guard, picture_id, client_id)?;
        guard.editor = None;
        info!(%picture_id, %client_id, "registry: edit lock released");
        Ok(())
    }

    /// Confirm `client_id` currently holds the edit lock.
    ///
    /// # Errors
    ///
    /// `UnknownRoom` if not watching, `Forbidden` if not the holder.
    pub async fn ensure_editor(&self, picture_id: PictureId, client_id: ConnectionId) -> Result<(), EditError> {
        let room = self.joined_room(picture_id).await?;
        let guard = room.lock().await;
        check_holder(&guard, picture_id, client_id)
    }

    #[cfg(test)]
    pub async fn editor_of(&self, picture_id: PictureId) -> Option<ConnectionId> {
        let room = self.room(picture_id).await?;
        let guard = room.lock().await;
        guard.editor
    }

    /// Derived per-connection state; `None` when not watching the picture.
    pub async fn state_of(&self, picture_id: PictureId, client_id: ConnectionId) -> Option<SessionState> {
        let room = self.room(picture_id).await?;
        let guard = room.lock().await;
        if !guard.watchers.contains_key(&client_id) {
            return None;
        }
        if guard.editor == Some(client_id) {
            Some(SessionState::Editing)
        } else {
            Some(SessionState::Watching)
        }
    }

    #[cfg(test)]
    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    // =========================================================================
    // HELPERS
    // =========================================================================

    async fn room(&self, picture_id: PictureId) -> Option<Arc<Mutex<PictureRoom>>> {
        self.rooms.read().await.get(&picture_id).cloned()
    }

    async fn joined_room(&self, picture_id: PictureId) -> Result<Arc<Mutex<PictureRoom>>, EditError> {
        self.room(picture_id)
            .await
            .ok_or(EditError::UnknownRoom(picture_id))
    }

    /// Drop `room` from the map if it is still the entry for `picture_id`.
    async fn evict(&self, picture_id: PictureId, room: &Arc<Mutex<PictureRoom>>) {
        let mut rooms = self.rooms.write().await;
        if rooms
            .get(&picture_id)
            .is_some_and(|current| Arc::ptr_eq(current, room))
        {
            rooms.remove(&picture_id);
            debug!(%picture_id, rooms = rooms.len(), "registry: evicted empty room");
        }
    }
}

fn check_holder(room: &PictureRoom, picture_id: PictureId, client_id: ConnectionId) -> Result<(), EditError> {
    if room.closed || !room.watchers.contains_key(&client_id) {
        return Err(EditError::UnknownRoom(picture_id));
    }
    if room.editor != Some(client_id) {
        return Err(EditError::Forbidden(picture_id));
    }
    Ok(())
}

#[cfg(test)]
#[path = "registry_test.rs"]
mod tests;
