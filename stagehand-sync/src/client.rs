//! WebSocket provider: connects a [`SharedDocument`] to the relay.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect, reconnect, close)
//! - Local deltas out, remote deltas and awareness into the document
//! - State-vector handshake on every (re)connect
//! - Offline queue for deltas produced while disconnected
//!
//! The handshake alone is enough to converge after a drop: the relay's
//! SyncStep1 makes this client send everything the relay lacks. The
//! offline queue replays deltas in their original order ahead of that.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Instant;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::awareness::AwarenessMessage;
use crate::document::SharedDocument;
use crate::error::SyncResult;
use crate::model::ClientId;
use crate::protocol::{MessageType, PeerInfo, ProtocolError, SyncMessage};
use crate::provider::Provider;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// `close()` was called; the provider will not connect again.
    Closed,
}

/// Connection-level events for the application. Document changes are
/// reported through [`SharedDocument::subscribe`] instead.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Connected,
    Disconnected,
    PeerJoined(PeerInfo),
    PeerLeft(Uuid),
    /// The relay answered our state vector; the replica is caught up.
    Synced,
}

/// Deltas produced while disconnected, replayed on reconnect.
pub struct OfflineQueue {
    queue: VecDeque<QueuedDelta>,
    max_size: usize,
}

#[derive(Debug, Clone)]
struct QueuedDelta {
    clock: u64,
    payload: Vec<u8>,
    queued_at: Instant,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Returns `false` when full.
    pub fn enqueue(&mut self, clock: u64, payload: Vec<u8>) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(QueuedDelta {
            clock,
            payload,
            queued_at: Instant::now(),
        });
        true
    }

    pub fn drain(&mut self) -> Vec<(u64, Vec<u8>)> {
        self.queue.drain(..).map(|d| (d.clock, d.payload)).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    pub fn total_bytes(&self) -> usize {
        self.queue.iter().map(|d| d.payload.len()).sum()
    }

    /// How long the oldest queued delta has been waiting.
    pub fn oldest_age(&self) -> Option<std::time::Duration> {
        self.queue.front().map(|d| d.queued_at.elapsed())
    }
}

/// Live socket: the writer channel and the reader task.
struct Link {
    outgoing: mpsc::UnboundedSender<Message>,
    reader: JoinHandle<()>,
}

/// [`Provider`] backed by a WebSocket connection to the relay.
pub struct WsProvider {
    peer: PeerInfo,
    room: String,
    server_url: String,
    state: Mutex<ConnectionState>,
    clock: AtomicU64,
    offline_queue: Mutex<OfflineQueue>,
    link: Mutex<Option<Link>>,
    doc: Mutex<Weak<SharedDocument>>,
    events: mpsc::Sender<SyncEvent>,
    event_rx: Mutex<Option<mpsc::Receiver<SyncEvent>>>,
    closed: AtomicBool,
}

impl WsProvider {
    /// `peer.peer_id` must be the client id of the document this provider
    /// will serve.
    pub fn new(peer: PeerInfo, room: impl Into<String>, server_url: impl Into<String>) -> Arc<Self> {
        let (events, event_rx) = mpsc::channel(256);
        Arc::new(Self {
            peer,
            room: room.into(),
            server_url: server_url.into(),
            state: Mutex::new(ConnectionState::Disconnected),
            clock: AtomicU64::new(0),
            offline_queue: Mutex::new(OfflineQueue::new(10_000)),
            link: Mutex::new(None),
            doc: Mutex::new(Weak::new()),
            events,
            event_rx: Mutex::new(Some(event_rx)),
            closed: AtomicBool::new(false),
        })
    }

    /// Create a document wired to a new provider and connect it.
    pub async fn connect_document(
        peer: PeerInfo,
        room: &str,
        server_url: &str,
    ) -> SyncResult<(Arc<SharedDocument>, Arc<WsProvider>)> {
        let provider = WsProvider::new(peer, room, server_url);
        let doc = SharedDocument::new(room, provider.peer.peer_id, provider.clone());
        provider.attach(&doc);
        provider.connect().await?;
        Ok((doc, provider))
    }

    /// Bind the document that inbound frames are applied to.
    pub fn attach(&self, doc: &Arc<SharedDocument>) {
        *lock(&self.doc) = Arc::downgrade(doc);
    }

    /// Take the event receiver (only once).
    pub fn take_event_rx(&self) -> Option<mpsc::Receiver<SyncEvent>> {
        lock(&self.event_rx).take()
    }

    /// Open the socket, join the room, start the handshake and replay the
    /// offline queue. Calling it while connected is a no-op.
    pub async fn connect(self: &Arc<Self>) -> Result<(), ProtocolError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ProtocolError::ConnectionClosed);
        }
        if self.connection_state() == ConnectionState::Connected {
            return Ok(());
        }
        self.set_state(ConnectionState::Connecting);

        let url = format!("{}/{}", self.server_url, self.room);
        let ws_stream = match tokio_tungstenite::connect_async(&url).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                log::warn!("Could not reach relay at {url}: {e}");
                return Err(ProtocolError::Connect(e.to_string()));
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if ws_writer.send(message).await.is_err() || closing {
                    break;
                }
            }
        });

        let this = Arc::downgrade(self);
        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                let Some(provider) = this.upgrade() else { break };
                match msg {
                    Ok(Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        match SyncMessage::decode(&bytes) {
                            Ok(sync_msg) => provider.handle_frame(sync_msg),
                            Err(e) => log::warn!("Undecodable frame from relay: {e}"),
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            if let Some(provider) = this.upgrade() {
                provider.on_disconnect();
            }
        });

        self.open_link(Link {
            outgoing: out_tx,
            reader,
        })?;
        log::info!("Connected to relay room {} as {}", self.room, self.peer.peer_id);
        self.emit(SyncEvent::Connected);
        Ok(())
    }

    /// Send the join and handshake, flush the offline queue, then make the
    /// link live. Holding the link lock keeps replayed deltas ahead of any
    /// new ones.
    fn open_link(&self, link: Link) -> Result<(), ProtocolError> {
        let mut slot = lock(&self.link);
        let send = |msg: &SyncMessage| -> Result<(), ProtocolError> {
            link.outgoing
                .send(Message::Binary(msg.encode()?.into()))
                .map_err(|_| ProtocolError::ConnectionClosed)
        };

        send(&SyncMessage::peer_joined(&self.room, &self.peer)?)?;
        if let Some(doc) = self.document() {
            match doc.state_vector() {
                Ok(sv) => send(&SyncMessage::sync_step1(self.peer.peer_id, &self.room, sv))?,
                Err(e) => log::debug!("Skipping handshake for room {}: {e}", self.room),
            }
        }

        let queued = lock(&self.offline_queue).drain();
        if !queued.is_empty() {
            log::info!("Replaying {} queued delta(s) into room {}", queued.len(), self.room);
        }
        for (clock, payload) in queued {
            send(&SyncMessage::update(self.peer.peer_id, &self.room, clock, payload))?;
        }

        if let Some(doc) = self.document() {
            if let Ok(snapshot) = doc.awareness_snapshot() {
                send(&SyncMessage::awareness(self.peer.peer_id, &self.room, self.current_clock(), &snapshot)?)?;
            }
        }

        *slot = Some(link);
        self.set_state(ConnectionState::Connected);
        Ok(())
    }

    /// Drop the connection without closing the provider; a later
    /// `connect()` resumes.
    pub fn disconnect(&self) {
        if let Some(link) = lock(&self.link).take() {
            let _ = link.outgoing.send(Message::Close(None));
            link.reader.abort();
        }
        if !self.closed.load(Ordering::SeqCst) {
            self.set_state(ConnectionState::Disconnected);
        }
        self.emit(SyncEvent::Disconnected);
    }

    fn on_disconnect(&self) {
        lock(&self.link).take();
        if !self.closed.load(Ordering::SeqCst) {
            self.set_state(ConnectionState::Disconnected);
            log::warn!("Lost connection to relay room {}", self.room);
        }
        self.emit(SyncEvent::Disconnected);
    }

    /// Apply one inbound frame to the attached document.
    fn handle_frame(&self, msg: SyncMessage) {
        if msg.peer_id == self.peer.peer_id {
            return;
        }
        let Some(doc) = self.document() else {
            log::debug!("No document attached; dropping {:?}", msg.msg_type);
            return;
        };

        match msg.msg_type {
            MessageType::Update | MessageType::SyncStep2 => {
                if let Err(e) = doc.apply_remote_update(&msg.payload) {
                    log::warn!("Dropping update from {} in room {}: {e}", msg.peer_id, self.room);
                    return;
                }
                if msg.msg_type == MessageType::SyncStep2 {
                    self.emit(SyncEvent::Synced);
                }
            }
            MessageType::SyncStep1 => match doc.encode_diff(&msg.payload) {
                Ok(diff) => self.send_frame(&SyncMessage::sync_step2(self.peer.peer_id, &self.room, diff)),
                Err(e) => log::warn!("Could not answer state vector in room {}: {e}", self.room),
            },
            MessageType::Awareness => match msg.awareness_message() {
                Ok(message) => doc.apply_awareness(&message),
                Err(e) => log::warn!("Bad awareness from {}: {e}", msg.peer_id),
            },
            MessageType::PeerJoined => {
                if let Ok(info) = msg.peer_info() {
                    log::debug!("Peer {} ({}) joined room {}", info.name, info.peer_id, self.room);
                    self.emit(SyncEvent::PeerJoined(info));
                }
            }
            MessageType::PeerLeft => {
                if let Err(e) = doc.remove_peer(&msg.peer_id) {
                    log::debug!("Peer cleanup for {} skipped: {e}", msg.peer_id);
                }
                self.emit(SyncEvent::PeerLeft(msg.peer_id));
            }
            MessageType::Pong => log::trace!("Pong from relay"),
            MessageType::Ping => self.send_frame(&SyncMessage::pong(self.peer.peer_id)),
        }
    }

    fn send_frame(&self, msg: &SyncMessage) {
        let bytes = match msg.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                log::warn!("Could not encode {:?}: {e}", msg.msg_type);
                return;
            }
        };
        if let Some(link) = lock(&self.link).as_ref() {
            let _ = link.outgoing.send(Message::Binary(bytes.into()));
        }
    }

    pub fn send_ping(&self) {
        self.send_frame(&SyncMessage::ping(self.peer.peer_id));
    }

    fn document(&self) -> Option<Arc<SharedDocument>> {
        lock(&self.doc).upgrade()
    }

    fn emit(&self, event: SyncEvent) {
        if self.events.try_send(event).is_err() {
            log::trace!("Sync event dropped (receiver full or gone)");
        }
    }

    fn set_state(&self, state: ConnectionState) {
        *lock(&self.state) = state;
    }

    pub fn connection_state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    pub fn peer_info(&self) -> &PeerInfo {
        &self.peer
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub fn current_clock(&self) -> u64 {
        self.clock.load(Ordering::SeqCst)
    }

    pub fn offline_queue_len(&self) -> usize {
        lock(&self.offline_queue).len()
    }
}

impl Provider for WsProvider {
    fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    fn publish_update(&self, origin: ClientId, update: Vec<u8>) {
        let clock = self.clock.fetch_add(1, Ordering::SeqCst) + 1;
        let link = lock(&self.link);
        if let Some(link) = link.as_ref() {
            match SyncMessage::update(origin, &self.room, clock, update).encode() {
                Ok(bytes) => {
                    let _ = link.outgoing.send(Message::Binary(bytes.into()));
                }
                Err(e) => log::warn!("Could not encode update for room {}: {e}", self.room),
            }
            return;
        }
        if !lock(&self.offline_queue).enqueue(clock, update) {
            // Still in the document; the reconnect handshake carries it.
            log::warn!("Offline queue full for room {}; relying on resync", self.room);
        }
    }

    fn publish_awareness(&self, origin: ClientId, message: AwarenessMessage) {
        // Offline awareness is dropped; a fresh snapshot goes out on connect.
        match SyncMessage::awareness(origin, &self.room, self.current_clock(), &message) {
            Ok(msg) => self.send_frame(&msg),
            Err(e) => log::warn!("Could not encode awareness for room {}: {e}", self.room),
        }
    }

    fn close(&self, origin: ClientId) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.set_state(ConnectionState::Closed);
        if let Some(link) = lock(&self.link).take() {
            let _ = link.outgoing.send(Message::Close(None));
            link.reader.abort();
        }
        lock(&self.offline_queue).clear();
        log::debug!("Provider for {origin} in room {} closed", self.room);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{default_stage_props, ClientId};
    use crate::provider::MemoryHub;

    fn provider() -> Arc<WsProvider> {
        WsProvider::new(PeerInfo::new("user-1", "TestUser"), "party", "ws://localhost:9090")
    }

    fn attached() -> (Arc<WsProvider>, Arc<SharedDocument>) {
        let provider = provider();
        let doc = SharedDocument::new("party", provider.peer_info().peer_id, provider.clone());
        provider.attach(&doc);
        (provider, doc)
    }

    #[test]
    fn test_provider_creation() {
        let provider = provider();
        assert_eq!(provider.peer_info().name, "TestUser");
        assert_eq!(provider.room(), "party");
        assert_eq!(provider.server_url(), "ws://localhost:9090");
        assert_eq!(provider.connection_state(), ConnectionState::Disconnected);
        assert!(!provider.is_connected());
        assert_eq!(provider.current_clock(), 0);
    }

    #[test]
    fn test_offline_writes_are_queued() {
        let (provider, doc) = attached();
        doc.initialize_scene_data("s1", &default_stage_props()).unwrap();

        assert_eq!(provider.offline_queue_len(), 1);
        assert_eq!(provider.current_clock(), 1);
    }

    #[test]
    fn test_offline_awareness_is_dropped() {
        let (provider, doc) = attached();
        doc.update_awareness(|s| s.name = "GM".into()).unwrap();
        assert_eq!(provider.offline_queue_len(), 0);
    }

    #[test]
    fn test_inbound_update_applies_to_document() {
        let (provider, doc) = attached();
        let hub = MemoryHub::new();
        let other = hub.join("elsewhere", Uuid::new_v4());
        other.initialize_scene_data("s1", &default_stage_props()).unwrap();

        let update = other.encode_state().unwrap();
        provider.handle_frame(SyncMessage::update(other.client_id(), "party", 1, update));
        assert!(doc.has_scene("s1").unwrap());
    }

    #[test]
    fn test_inbound_garbage_is_dropped() {
        let (provider, doc) = attached();
        provider.handle_frame(SyncMessage::update(Uuid::new_v4(), "party", 1, vec![0xFF, 0xFF, 0xFF]));
        assert!(!doc.has_scene("s1").unwrap());
    }

    #[test]
    fn test_own_frames_are_ignored() {
        let (provider, doc) = attached();
        let hub = MemoryHub::new();
        let other = hub.join("elsewhere", Uuid::new_v4());
        other.initialize_scene_data("s1", &default_stage_props()).unwrap();

        let me = provider.peer_info().peer_id;
        provider.handle_frame(SyncMessage::update(me, "party", 1, other.encode_state().unwrap()));
        assert!(!doc.has_scene("s1").unwrap());
    }

    #[test]
    fn test_peer_left_prunes_awareness() {
        let (provider, doc) = attached();
        let peer: ClientId = Uuid::new_v4();
        let mut remote = crate::awareness::Awareness::new(peer);
        let update = remote.update_local(|s| s.name = "Player".into());
        provider.handle_frame(SyncMessage::awareness(peer, "party", 1, &update).unwrap());
        assert_eq!(doc.peer_awareness().unwrap().len(), 1);

        provider.handle_frame(SyncMessage::peer_left(peer, "party"));
        assert!(doc.peer_awareness().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_close_is_final() {
        let (provider, doc) = attached();
        doc.destroy();
        assert_eq!(provider.connection_state(), ConnectionState::Closed);
        assert_eq!(provider.connect().await, Err(ProtocolError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_connect_to_nothing_fails() {
        let provider = WsProvider::new(PeerInfo::new("u", "Nobody"), "party", "ws://127.0.0.1:1");
        assert!(matches!(provider.connect().await, Err(ProtocolError::Connect(_))));
        assert_eq!(provider.connection_state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_take_event_rx() {
        let provider = provider();
        assert!(provider.take_event_rx().is_some());
        assert!(provider.take_event_rx().is_none());
    }

    #[test]
    fn test_offline_queue() {
        let mut queue = OfflineQueue::new(100);
        assert!(queue.is_empty());
        assert!(queue.oldest_age().is_none());

        queue.enqueue(1, vec![1, 2, 3]);
        queue.enqueue(2, vec![4, 5, 6, 7]);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.total_bytes(), 7);
        assert!(queue.oldest_age().is_some());

        let drained = queue.drain();
        assert_eq!(drained, vec![(1, vec![1, 2, 3]), (2, vec![4, 5, 6, 7])]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_offline_queue_capacity() {
        let mut queue = OfflineQueue::new(3);
        assert!(queue.enqueue(1, vec![1]));
        assert!(queue.enqueue(2, vec![2]));
        assert!(queue.enqueue(3, vec![3]));
        assert!(!queue.enqueue(4, vec![4]));
        assert_eq!(queue.len(), 3);

        queue.clear();
        assert!(queue.is_empty());
    }
}
