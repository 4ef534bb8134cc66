//! Awareness: per-client ephemeral state that is broadcast but never stored.
//!
//! ```text
//! local change ──► Awareness::update_local() ──► AwarenessMessage::Update
//!                                                       │ (provider)
//!                                                       ▼
//!                                   remote Awareness::handle_message()
//! ```
//!
//! Each client owns exactly one state entry, versioned by a Lamport clock.
//! Updates older than the last seen clock are dropped. When a client leaves
//! (or the provider reports it gone) its entry is removed, which takes its
//! ephemeral layers with it.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::ephemeral::EphemeralLayer;
use crate::model::ClientId;

/// What one client advertises about itself.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AwarenessState {
    pub user_id: String,
    pub name: String,
    pub active_scene_id: Option<String>,
    pub ephemeral_layers: Vec<EphemeralLayer>,
}

/// Awareness messages carried in `SyncMessage::Awareness` payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AwarenessMessage {
    /// Full replacement of the sender's state.
    Update {
        client_id: ClientId,
        clock: u64,
        state: AwarenessState,
    },
    /// The sender's state is gone (clean leave).
    Remove { client_id: ClientId },
}

impl AwarenessMessage {
    pub fn client_id(&self) -> ClientId {
        match self {
            AwarenessMessage::Update { client_id, .. } => *client_id,
            AwarenessMessage::Remove { client_id } => *client_id,
        }
    }
}

/// A remote client's last known state.
#[derive(Debug, Clone)]
pub struct PeerAwareness {
    pub state: AwarenessState,
    clock: u64,
    last_update: Instant,
}

impl PeerAwareness {
    pub fn clock(&self) -> u64 {
        self.clock
    }

    pub fn is_idle(&self, timeout: Duration) -> bool {
        self.last_update.elapsed() > timeout
    }
}

/// Local view of every client's awareness state in one room.
pub struct Awareness {
    local_id: ClientId,
    local: AwarenessState,
    clock: u64,
    peers: HashMap<ClientId, PeerAwareness>,
    idle_timeout: Duration,
}

impl Awareness {
    pub fn new(local_id: ClientId) -> Self {
        Self {
            local_id,
            local: AwarenessState::default(),
            clock: 0,
            peers: HashMap::new(),
            idle_timeout: Duration::from_secs(30),
        }
    }

    /// Create with a custom idle timeout (for testing).
    pub fn with_idle_timeout(local_id: ClientId, idle_timeout: Duration) -> Self {
        let mut awareness = Self::new(local_id);
        awareness.idle_timeout = idle_timeout;
        awareness
    }

    pub fn local_id(&self) -> ClientId {
        self.local_id
    }

    pub fn local_state(&self) -> &AwarenessState {
        &self.local
    }

    pub fn clock(&self) -> u64 {
        self.clock
    }

    /// Replace the local state and return the message to broadcast.
    pub fn set_local_state(&mut self, state: AwarenessState) -> AwarenessMessage {
        self.local = state;
        self.local_message()
    }

    /// Mutate the local state in place and return the message to broadcast.
    pub fn update_local<F>(&mut self, f: F) -> AwarenessMessage
    where
        F: FnOnce(&mut AwarenessState),
    {
        f(&mut self.local);
        self.local_message()
    }

    fn local_message(&mut self) -> AwarenessMessage {
        self.clock += 1;
        AwarenessMessage::Update {
            client_id: self.local_id,
            clock: self.clock,
            state: self.local.clone(),
        }
    }

    /// Re-announce the current local state without bumping the clock.
    /// Peers that already hold this clock ignore it.
    pub fn snapshot(&self) -> AwarenessMessage {
        AwarenessMessage::Update {
            client_id: self.local_id,
            clock: self.clock,
            state: self.local.clone(),
        }
    }

    /// Message announcing that the local client is leaving.
    pub fn leave_message(&self) -> AwarenessMessage {
        AwarenessMessage::Remove {
            client_id: self.local_id,
        }
    }

    /// Apply a remote message. Returns true if any state changed.
    pub fn handle_message(&mut self, msg: &AwarenessMessage) -> bool {
        if msg.client_id() == self.local_id {
            return false;
        }

        match msg {
            AwarenessMessage::Update { client_id, clock, state } => {
                if let Some(existing) = self.peers.get(client_id) {
                    if *clock <= existing.clock {
                        log::trace!("Dropping stale awareness from {client_id} (clock {clock})");
                        return false;
                    }
                }
                self.peers.insert(
                    *client_id,
                    PeerAwareness {
                        state: state.clone(),
                        clock: *clock,
                        last_update: Instant::now(),
                    },
                );
                true
            }
            AwarenessMessage::Remove { client_id } => self.remove(client_id),
        }
    }

    /// Drop a peer's state (disconnect).
    pub fn remove(&mut self, client_id: &ClientId) -> bool {
        self.peers.remove(client_id).is_some()
    }

    pub fn peer(&self, client_id: &ClientId) -> Option<&AwarenessState> {
        self.peers.get(client_id).map(|p| &p.state)
    }

    pub fn peers(&self) -> impl Iterator<Item = (&ClientId, &AwarenessState)> {
        self.peers.iter().map(|(id, p)| (id, &p.state))
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Remove peers that have sent nothing for longer than the idle timeout.
    pub fn cleanup_idle_peers(&mut self) -> Vec<ClientId> {
        let timeout = self.idle_timeout;
        let stale: Vec<ClientId> = self
            .peers
            .iter()
            .filter(|(_, p)| p.is_idle(timeout))
            .map(|(id, _)| *id)
            .collect();

        for id in &stale {
            self.peers.remove(id);
        }
        stale
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use uuid::Uuid;

    fn update(client_id: ClientId, clock: u64, name: &str) -> AwarenessMessage {
        AwarenessMessage::Update {
            client_id,
            clock,
            state: AwarenessState {
                name: name.into(),
                ..AwarenessState::default()
            },
        }
    }

    #[test]
    fn test_local_updates_bump_clock() {
        let mut awareness = Awareness::new(Uuid::new_v4());
        let first = awareness.update_local(|s| s.name = "Alice".into());
        let second = awareness.update_local(|s| s.active_scene_id = Some("s1".into()));

        match (first, second) {
            (
                AwarenessMessage::Update { clock: c1, .. },
                AwarenessMessage::Update { clock: c2, state, .. },
            ) => {
                assert!(c2 > c1);
                assert_eq!(state.name, "Alice");
                assert_eq!(state.active_scene_id.as_deref(), Some("s1"));
            }
            _ => panic!("Expected Update messages"),
        }
    }

    #[test]
    fn test_handle_remote_update() {
        let mut awareness = Awareness::new(Uuid::new_v4());
        let remote = Uuid::new_v4();

        assert!(awareness.handle_message(&update(remote, 1, "Bob")));
        assert_eq!(awareness.peer_count(), 1);
        assert_eq!(awareness.peer(&remote).unwrap().name, "Bob");
    }

    #[test]
    fn test_ignores_self() {
        let local = Uuid::new_v4();
        let mut awareness = Awareness::new(local);
        assert!(!awareness.handle_message(&update(local, 1, "Me")));
        assert_eq!(awareness.peer_count(), 0);
    }

    #[test]
    fn test_rejects_stale_clock() {
        let mut awareness = Awareness::new(Uuid::new_v4());
        let remote = Uuid::new_v4();

        awareness.handle_message(&update(remote, 5, "new"));
        assert!(!awareness.handle_message(&update(remote, 3, "old")));
        assert_eq!(awareness.peer(&remote).unwrap().name, "new");
    }

    #[test]
    fn test_remove_message() {
        let mut awareness = Awareness::new(Uuid::new_v4());
        let remote = Uuid::new_v4();
        awareness.handle_message(&update(remote, 1, "Bob"));

        assert!(awareness.handle_message(&AwarenessMessage::Remove { client_id: remote }));
        assert_eq!(awareness.peer_count(), 0);
        assert!(!awareness.remove(&remote));
    }

    #[test]
    fn test_cleanup_idle_peers() {
        let mut awareness = Awareness::with_idle_timeout(Uuid::new_v4(), Duration::from_millis(5));
        let remote = Uuid::new_v4();
        awareness.handle_message(&update(remote, 1, "Bob"));

        thread::sleep(Duration::from_millis(15));
        let removed = awareness.cleanup_idle_peers();
        assert_eq!(removed, vec![remote]);
        assert_eq!(awareness.peer_count(), 0);
    }

    #[test]
    fn test_leave_message_names_local_client() {
        let local = Uuid::new_v4();
        let awareness = Awareness::new(local);
        assert_eq!(awareness.leave_message().client_id(), local);
    }
}
