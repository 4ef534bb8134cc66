//! Per-room fan-out on the relay.
//!
//! Every peer connected to a room holds a receiver on the room's tokio
//! broadcast channel. Frames are encoded once and shared; each receiver
//! buffers up to `capacity` frames before it starts lagging.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{PeerInfo, ProtocolError, SyncMessage};

/// An encoded frame and the peer it came from, so a connection can skip
/// its own traffic without decoding.
#[derive(Debug, Clone)]
pub struct Frame {
    pub origin: Uuid,
    pub bytes: Arc<Vec<u8>>,
}

#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_lagged: u64,
    pub active_peers: usize,
}

/// Peers and fan-out channel for one room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Frame>,
    peers: RwLock<HashMap<Uuid, PeerInfo>>,
    capacity: usize,
    messages_sent: AtomicU64,
    messages_lagged: AtomicU64,
}

impl BroadcastGroup {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            peers: RwLock::new(HashMap::new()),
            capacity,
            messages_sent: AtomicU64::new(0),
            messages_lagged: AtomicU64::new(0),
        }
    }

    /// Register a peer and hand back its receiver.
    pub async fn add_peer(&self, info: PeerInfo) -> broadcast::Receiver<Frame> {
        self.peers.write().await.insert(info.peer_id, info);
        self.sender.subscribe()
    }

    pub async fn remove_peer(&self, peer_id: &Uuid) -> Option<PeerInfo> {
        self.peers.write().await.remove(peer_id)
    }

    /// Encode once and send to every receiver. Returns how many receivers
    /// got the frame, including the sender's own (filtered on its side).
    pub fn broadcast(&self, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        let bytes = Arc::new(msg.encode()?);
        Ok(self.broadcast_raw(msg.peer_id, bytes))
    }

    pub fn broadcast_raw(&self, origin: Uuid, bytes: Arc<Vec<u8>>) -> usize {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        // No receivers is not an error: the room may be between peers.
        self.sender.send(Frame { origin, bytes }).unwrap_or(0)
    }

    /// Count frames a slow receiver skipped.
    pub fn record_lag(&self, skipped: u64) {
        self.messages_lagged.fetch_add(skipped, Ordering::Relaxed);
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn peers(&self) -> Vec<PeerInfo> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn has_peer(&self, peer_id: &Uuid) -> bool {
        self.peers.read().await.contains_key(peer_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_lagged: self.messages_lagged.load(Ordering::Relaxed),
            active_peers: self.peer_count().await,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
