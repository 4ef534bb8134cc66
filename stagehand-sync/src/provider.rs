//! Transport seam between a [`SharedDocument`] and its peers.
//!
//! ```text
//! SharedDocument ──publish_update()──► Provider ──► peers' apply_remote_update()
//!                ──publish_awareness()─►        ──► peers' apply_awareness()
//! ```
//!
//! Two implementations ship with the crate: [`MemoryHub`] connects documents
//! living in the same process (tests, single-host tools), and
//! [`crate::client::WsProvider`] talks to the relay server.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use crate::awareness::AwarenessMessage;
use crate::document::SharedDocument;
use crate::model::ClientId;

/// Delivery of local deltas to every other client in the room.
///
/// Providers must not call back into the publishing document while it is
/// inside `publish_*`; fan-out goes to *other* documents only.
pub trait Provider: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Send a yrs v1 update produced by a local transaction.
    fn publish_update(&self, origin: ClientId, update: Vec<u8>);

    fn publish_awareness(&self, origin: ClientId, message: AwarenessMessage);

    /// The document is going away; release the connection.
    fn close(&self, origin: ClientId);
}

// ───────────────────────────────────────────────────────────────────
// In-process hub
// ───────────────────────────────────────────────────────────────────

struct Member {
    client_id: ClientId,
    doc: Weak<SharedDocument>,
    connected: Arc<AtomicBool>,
}

/// In-process fan-out between documents that share a room key.
///
/// Documents are held weakly, so dropping the last `Arc<SharedDocument>`
/// is enough to leave. Disconnected members neither send nor receive; on
/// reconnect the room is resynchronized with state-vector diffs, which is
/// what a network provider does after a connection drop.
#[derive(Default)]
pub struct MemoryHub {
    rooms: Mutex<HashMap<String, Vec<Member>>>,
}

impl MemoryHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create a document for `client_id` in `room` and sync it with the
    /// members already there.
    pub fn join(self: &Arc<Self>, room: &str, client_id: ClientId) -> Arc<SharedDocument> {
        let connected = Arc::new(AtomicBool::new(true));
        let provider = Arc::new(MemoryProvider {
            hub: Arc::clone(self),
            room: room.to_string(),
            connected: Arc::clone(&connected),
        });
        let doc = SharedDocument::new(room, client_id, provider);

        self.lock_rooms().entry(room.to_string()).or_default().push(Member {
            client_id,
            doc: Arc::downgrade(&doc),
            connected,
        });
        log::debug!("Client {client_id} joined in-memory room {room}");

        self.resync(room);
        doc
    }

    /// Simulate a dropped connection.
    pub fn disconnect(&self, doc: &SharedDocument) {
        self.set_connected(doc.room(), doc.client_id(), false);
    }

    /// Restore a dropped connection and resynchronize the room.
    pub fn reconnect(&self, doc: &SharedDocument) {
        self.set_connected(doc.room(), doc.client_id(), true);
        self.resync(doc.room());
    }

    pub fn member_count(&self, room: &str) -> usize {
        self.lock_rooms().get(room).map_or(0, Vec::len)
    }

    fn set_connected(&self, room: &str, client_id: ClientId, connected: bool) {
        if let Some(members) = self.lock_rooms().get(room) {
            for member in members.iter().filter(|m| m.client_id == client_id) {
                member.connected.store(connected, Ordering::SeqCst);
            }
        }
        log::debug!("Client {client_id} in room {room} connected={connected}");
    }

    /// Connected, live members other than `except`.
    fn peers(&self, room: &str, except: Option<ClientId>) -> Vec<Arc<SharedDocument>> {
        let mut rooms = self.lock_rooms();
        let Some(members) = rooms.get_mut(room) else {
            return Vec::new();
        };
        members.retain(|m| m.doc.strong_count() > 0);
        members
            .iter()
            .filter(|m| Some(m.client_id) != except && m.connected.load(Ordering::SeqCst))
            .filter_map(|m| m.doc.upgrade())
            .collect()
    }

    /// Exchange missing state between every pair of connected members.
    pub fn resync(&self, room: &str) {
        let docs = self.peers(room, None);
        for source in &docs {
            for target in &docs {
                if source.client_id() == target.client_id() {
                    continue;
                }
                let diff = target.state_vector().and_then(|sv| source.encode_diff(&sv));
                match diff {
                    Ok(diff) => {
                        if let Err(e) = target.apply_remote_update(&diff) {
                            log::warn!("Resync into {} failed: {e}", target.client_id());
                        }
                    }
                    Err(e) => log::debug!("Skipping resync from {}: {e}", source.client_id()),
                }
                if let Ok(message) = source.awareness_snapshot() {
                    target.apply_awareness(&message);
                }
            }
        }
    }

    fn deliver_update(&self, room: &str, origin: ClientId, update: &[u8]) {
        // Collected first so the hub lock is not held while peers run
        // their change callbacks.
        for peer in self.peers(room, Some(origin)) {
            if let Err(e) = peer.apply_remote_update(update) {
                log::warn!("Dropping update from {origin} at {}: {e}", peer.client_id());
            }
        }
    }

    fn deliver_awareness(&self, room: &str, origin: ClientId, message: &AwarenessMessage) {
        for peer in self.peers(room, Some(origin)) {
            peer.apply_awareness(message);
        }
    }

    fn leave(&self, room: &str, client_id: ClientId) {
        {
            let mut rooms = self.lock_rooms();
            if let Some(members) = rooms.get_mut(room) {
                members.retain(|m| m.client_id != client_id);
                if members.is_empty() {
                    rooms.remove(room);
                }
            }
        }
        for peer in self.peers(room, None) {
            if let Err(e) = peer.remove_peer(&client_id) {
                log::debug!("Peer cleanup for {client_id} skipped: {e}");
            }
        }
        log::debug!("Client {client_id} left in-memory room {room}");
    }

    fn lock_rooms(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<Member>>> {
        self.rooms.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A document's handle on a [`MemoryHub`] room.
pub struct MemoryProvider {
    hub: Arc<MemoryHub>,
    room: String,
    connected: Arc<AtomicBool>,
}

impl Provider for MemoryProvider {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn publish_update(&self, origin: ClientId, update: Vec<u8>) {
        // Offline writes stay in the local document and travel with the
        // next resync.
        if self.is_connected() {
            self.hub.deliver_update(&self.room, origin, &update);
        }
    }

    fn publish_awareness(&self, origin: ClientId, message: AwarenessMessage) {
        if self.is_connected() {
            self.hub.deliver_awareness(&self.room, origin, &message);
        }
    }

    fn close(&self, origin: ClientId) {
        self.connected.store(false, Ordering::SeqCst);
        self.hub.leave(&self.room, origin);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{default_stage_props, PartyState};
    use uuid::Uuid;

    fn party() -> PartyState {
        PartyState {
            is_paused: false,
            active_game_session_id: "gs-1".into(),
            active_scene_id: None,
        }
    }

    #[test]
    fn test_updates_fan_out() {
        let hub = MemoryHub::new();
        let a = hub.join("party", Uuid::new_v4());
        let b = hub.join("party", Uuid::new_v4());
        a.initialize_party_state(&party()).unwrap();
        b.initialize_party_state(&party()).unwrap();

        a.set_paused(true).unwrap();
        assert!(b.party_state().unwrap().is_paused);
    }

    #[test]
    fn test_late_joiner_receives_existing_state() {
        let hub = MemoryHub::new();
        let a = hub.join("party", Uuid::new_v4());
        a.initialize_scene_data("s1", &default_stage_props()).unwrap();

        let b = hub.join("party", Uuid::new_v4());
        assert!(b.has_scene("s1").unwrap());
    }

    #[test]
    fn test_rooms_are_isolated() {
        let hub = MemoryHub::new();
        let a = hub.join("party-a", Uuid::new_v4());
        let b = hub.join("party-b", Uuid::new_v4());
        a.initialize_scene_data("s1", &default_stage_props()).unwrap();
        assert!(!b.has_scene("s1").unwrap());
    }

    #[test]
    fn test_offline_writes_sync_on_reconnect() {
        let hub = MemoryHub::new();
        let a = hub.join("party", Uuid::new_v4());
        let b = hub.join("party", Uuid::new_v4());

        hub.disconnect(&a);
        assert!(!a.is_connected());
        a.initialize_scene_data("s1", &default_stage_props()).unwrap();
        assert!(!b.has_scene("s1").unwrap());

        hub.reconnect(&a);
        assert!(b.has_scene("s1").unwrap());
    }

    #[test]
    fn test_dropped_document_leaves_room() {
        let hub = MemoryHub::new();
        let a = hub.join("party", Uuid::new_v4());
        let b = hub.join("party", Uuid::new_v4());
        drop(b);
        a.initialize_scene_data("s1", &default_stage_props()).unwrap();
        assert_eq!(hub.peers("party", None).len(), 1);
    }

    #[test]
    fn test_destroy_removes_member() {
        let hub = MemoryHub::new();
        let a = hub.join("party", Uuid::new_v4());
        let _b = hub.join("party", Uuid::new_v4());
        assert_eq!(hub.member_count("party"), 2);
        a.destroy();
        assert_eq!(hub.member_count("party"), 1);
    }
}
