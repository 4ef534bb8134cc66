//! Room relay: WebSocket server that fans out document updates and
//! awareness between the clients of a party.
//!
//! ```text
//! client ──PeerJoined──► relay   (room = party id)
//!        ◄─SyncStep1──── relay   relay's state vector
//!        ◄─PeerJoined*── relay   peers already in the room
//!        ◄─Awareness*─── relay   last awareness of each peer
//!        ──SyncStep1───► relay   client's state vector
//!        ◄─SyncStep2──── relay   what the client is missing
//!        ──Update──────► relay ──Update──► other clients
//! ```
//!
//! Each room keeps an authoritative yrs document so late joiners can be
//! brought up to date without any other client online. Nothing is written
//! to disk; durable state lives behind the persistence API.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::broadcast::Receiver;
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

use crate::awareness::AwarenessMessage;
use crate::broadcast::{BroadcastGroup, Frame};
use crate::error::{SyncError, SyncResult};
use crate::protocol::{MessageType, PeerInfo, SyncMessage};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// Joins beyond this are refused and the socket is closed.
    pub max_peers_per_room: usize,
    /// Frames buffered per peer before it lags.
    pub broadcast_capacity: usize,
    /// WebSocket ping interval; 0 disables heartbeats.
    pub heartbeat_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
            heartbeat_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    pub rejected_joins: u64,
    pub rejected_updates: u64,
}

/// One party: authoritative document, fan-out group and the last
/// awareness frame of every peer.
struct Room {
    doc: Mutex<Doc>,
    group: BroadcastGroup,
    awareness: Mutex<HashMap<Uuid, Arc<Vec<u8>>>>,
}

impl Room {
    fn new(capacity: usize) -> Self {
        Self {
            doc: Mutex::new(Doc::new()),
            group: BroadcastGroup::new(capacity),
            awareness: Mutex::new(HashMap::new()),
        }
    }

    fn lock_doc(&self) -> MutexGuard<'_, Doc> {
        self.doc.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_awareness(&self) -> MutexGuard<'_, HashMap<Uuid, Arc<Vec<u8>>>> {
        self.awareness.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn apply_update(&self, bytes: &[u8]) -> SyncResult<()> {
        let update = Update::decode_v1(bytes).map_err(|e| SyncError::Crdt(e.to_string()))?;
        let doc = self.lock_doc();
        let mut txn = doc.transact_mut();
        txn.apply_update(update).map_err(|e| SyncError::Crdt(e.to_string()))
    }

    fn state_vector(&self) -> Vec<u8> {
        let doc = self.lock_doc();
        let txn = doc.transact();
        txn.state_vector().encode_v1()
    }

    fn diff(&self, state_vector: &[u8]) -> SyncResult<Vec<u8>> {
        let sv = StateVector::decode_v1(state_vector).map_err(|e| SyncError::Crdt(e.to_string()))?;
        let doc = self.lock_doc();
        let txn = doc.transact();
        Ok(txn.encode_state_as_update_v1(&sv))
    }

    fn full_state(&self) -> Vec<u8> {
        let doc = self.lock_doc();
        let txn = doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }
}

/// The relay server.
pub struct SyncServer {
    config: ServerConfig,
    rooms: Arc<RwLock<HashMap<String, Arc<Room>>>>,
    stats: Arc<RwLock<ServerStats>>,
}

/// What a connection has joined, once it has.
struct Session {
    peer: PeerInfo,
    room_key: String,
    room: Arc<Room>,
}

impl SyncServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            rooms: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind `bind_addr` and serve until the listener fails.
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Relay listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let rooms = Arc::clone(&self.rooms);
            let stats = Arc::clone(&self.stats);
            let config = self.config.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, rooms, stats, config).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        rooms: Arc<RwLock<HashMap<String, Arc<Room>>>>,
        stats: Arc<RwLock<ServerStats>>,
        config: ServerConfig,
    ) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut session: Option<Session> = None;
        let mut broadcast_rx: Option<Receiver<Frame>> = None;
        let mut heartbeat = (config.heartbeat_interval_secs > 0)
            .then(|| tokio::time::interval(Duration::from_secs(config.heartbeat_interval_secs)));

        let result: Result<(), BoxError> = async {
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        let data = match msg {
                            Some(Ok(Message::Binary(data))) => data,
                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                                continue;
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection closed from {addr}");
                                break;
                            }
                            Some(Err(e)) => {
                                log::warn!("WebSocket error from {addr}: {e}");
                                break;
                            }
                            Some(Ok(_)) => continue,
                        };
                        let bytes: Vec<u8> = data.into();
                        let sync_msg = match SyncMessage::decode(&bytes) {
                            Ok(m) => m,
                            Err(e) => {
                                log::warn!("Failed to decode frame from {addr}: {e}");
                                continue;
                            }
                        };
                        {
                            let mut s = stats.write().await;
                            s.total_messages += 1;
                            s.total_bytes += bytes.len() as u64;
                        }

                        if sync_msg.msg_type == MessageType::PeerJoined {
                            if session.is_some() {
                                log::debug!("Ignoring repeated join from {addr}");
                                continue;
                            }
                            match Self::join(&rooms, &stats, &config, &sync_msg).await {
                                Some((joined, rx, greeting)) => {
                                    for frame in greeting {
                                        ws_sender.send(Message::Binary(frame.into())).await?;
                                    }
                                    session = Some(joined);
                                    broadcast_rx = Some(rx);
                                }
                                None => {
                                    ws_sender.send(Message::Close(None)).await?;
                                    break;
                                }
                            }
                            continue;
                        }

                        let Some(joined) = &session else {
                            log::debug!("Dropping {:?} from {addr} before join", sync_msg.msg_type);
                            continue;
                        };
                        for reply in Self::handle_message(joined, &stats, sync_msg, bytes).await? {
                            ws_sender.send(Message::Binary(reply.into())).await?;
                        }
                    }

                    frame = next_frame(&mut broadcast_rx) => {
                        let Some(joined) = &session else { continue };
                        match frame {
                            Ok(frame) if frame.origin == joined.peer.peer_id => {}
                            Ok(frame) => {
                                ws_sender.send(Message::Binary(frame.bytes.to_vec().into())).await?;
                            }
                            Err(RecvError::Lagged(n)) => {
                                log::warn!(
                                    "Peer {} lagged by {n} frames in room {}; sending full state",
                                    joined.peer.peer_id,
                                    joined.room_key
                                );
                                joined.room.group.record_lag(n);
                                let state = SyncMessage::sync_step2(Uuid::nil(), &joined.room_key, joined.room.full_state());
                                ws_sender.send(Message::Binary(state.encode()?.into())).await?;
                            }
                            Err(RecvError::Closed) => break,
                        }
                    }

                    _ = tick(&mut heartbeat) => {
                        ws_sender.send(Message::Ping(Vec::new().into())).await?;
                    }
                }
            }
            Ok(())
        }
        .await;

        if let Some(joined) = session {
            Self::leave(&rooms, &stats, joined).await;
        }
        stats.write().await.active_connections -= 1;
        result
    }

    /// Register the peer in its room. Returns the frames that bring it up
    /// to date, or `None` when the room is full.
    async fn join(
        rooms: &RwLock<HashMap<String, Arc<Room>>>,
        stats: &RwLock<ServerStats>,
        config: &ServerConfig,
        msg: &SyncMessage,
    ) -> Option<(Session, Receiver<Frame>, Vec<Vec<u8>>)> {
        let info = msg
            .peer_info()
            .unwrap_or_else(|_| PeerInfo::with_id(msg.peer_id, "", "Anonymous"));

        let mut rooms_w = rooms.write().await;
        let room = Arc::clone(
            rooms_w
                .entry(msg.room.clone())
                .or_insert_with(|| Arc::new(Room::new(config.broadcast_capacity))),
        );
        let existing = room.group.peers().await;
        if existing.len() >= config.max_peers_per_room {
            log::warn!("Room {} is full; refusing {}", msg.room, info.peer_id);
            if existing.is_empty() {
                rooms_w.remove(&msg.room);
            }
            drop(rooms_w);
            stats.write().await.rejected_joins += 1;
            return None;
        }
        let rx = room.group.add_peer(info.clone()).await;
        let room_count = rooms_w.len();
        drop(rooms_w);

        let mut greeting = Vec::new();
        let step1 = SyncMessage::sync_step1(Uuid::nil(), &msg.room, room.state_vector());
        push_encoded(&mut greeting, &step1);
        for peer in &existing {
            if let Ok(joined) = SyncMessage::peer_joined(&msg.room, peer) {
                push_encoded(&mut greeting, &joined);
            }
        }
        greeting.extend(room.lock_awareness().values().map(|frame| frame.to_vec()));

        match SyncMessage::peer_joined(&msg.room, &info) {
            Ok(announce) => {
                if let Err(e) = room.group.broadcast(&announce) {
                    log::warn!("Could not announce {} in room {}: {e}", info.peer_id, msg.room);
                }
            }
            Err(e) => log::warn!("Could not encode join of {}: {e}", info.peer_id),
        }

        stats.write().await.active_rooms = room_count;
        log::info!("Peer {} ({}) joined room {}", info.name, info.peer_id, msg.room);

        Some((
            Session {
                peer: info,
                room_key: msg.room.clone(),
                room,
            },
            rx,
            greeting,
        ))
    }

    /// Handle a frame from a joined peer; returns direct replies.
    async fn handle_message(
        joined: &Session,
        stats: &RwLock<ServerStats>,
        msg: SyncMessage,
        bytes: Vec<u8>,
    ) -> Result<Vec<Vec<u8>>, BoxError> {
        let peer_id = joined.peer.peer_id;
        let room_key = &joined.room_key;
        if msg.peer_id != peer_id && msg.msg_type != MessageType::Ping {
            log::warn!("Frame from {peer_id} claims to be from {}; dropped", msg.peer_id);
            return Ok(Vec::new());
        }

        match msg.msg_type {
            MessageType::Update => {
                if Self::absorb(joined, stats, &msg.payload).await {
                    joined.room.group.broadcast_raw(peer_id, Arc::new(bytes));
                }
            }
            MessageType::SyncStep2 => {
                // The client's answer to our SyncStep1; everyone else needs it too.
                if Self::absorb(joined, stats, &msg.payload).await {
                    let update = SyncMessage::update(peer_id, room_key, msg.clock, msg.payload);
                    joined.room.group.broadcast(&update)?;
                }
            }
            MessageType::SyncStep1 => match joined.room.diff(&msg.payload) {
                Ok(diff) => {
                    let reply = SyncMessage::sync_step2(Uuid::nil(), room_key, diff);
                    return Ok(vec![reply.encode()?]);
                }
                Err(e) => log::warn!("Bad state vector from {peer_id} in room {room_key}: {e}"),
            },
            MessageType::Awareness => {
                let frame = Arc::new(bytes);
                match msg.awareness_message() {
                    Ok(AwarenessMessage::Remove { .. }) => {
                        joined.room.lock_awareness().remove(&peer_id);
                        log::info!("Presence: {peer_id} left room {room_key}");
                    }
                    Ok(AwarenessMessage::Update { .. }) => {
                        joined.room.lock_awareness().insert(peer_id, Arc::clone(&frame));
                        log::trace!("Presence: update from {peer_id} in room {room_key}");
                    }
                    Err(e) => {
                        log::warn!("Bad awareness payload from {peer_id}: {e}");
                        return Ok(Vec::new());
                    }
                }
                joined.room.group.broadcast_raw(peer_id, frame);
            }
            MessageType::Ping => return Ok(vec![SyncMessage::pong(peer_id).encode()?]),
            other => log::debug!("Unhandled {other:?} from {peer_id}"),
        }
        Ok(Vec::new())
    }

    /// Apply a client update to the room document. Malformed updates are
    /// counted and not forwarded.
    async fn absorb(joined: &Session, stats: &RwLock<ServerStats>, update: &[u8]) -> bool {
        match joined.room.apply_update(update) {
            Ok(()) => true,
            Err(e) => {
                log::warn!(
                    "Rejected update from {} in room {}: {e}",
                    joined.peer.peer_id,
                    joined.room_key
                );
                stats.write().await.rejected_updates += 1;
                false
            }
        }
    }

    async fn leave(rooms: &RwLock<HashMap<String, Arc<Room>>>, stats: &RwLock<ServerStats>, joined: Session) {
        let peer_id = joined.peer.peer_id;
        let mut rooms_w = rooms.write().await;
        joined.room.group.remove_peer(&peer_id).await;
        joined.room.lock_awareness().remove(&peer_id);
        if let Err(e) = joined.room.group.broadcast(&SyncMessage::peer_left(peer_id, &joined.room_key)) {
            log::warn!("Could not announce departure of {peer_id}: {e}");
        }

        if joined.room.group.peer_count().await == 0 {
            rooms_w.remove(&joined.room_key);
            log::info!("Room {} removed (empty)", joined.room_key);
        }
        let room_count = rooms_w.len();
        drop(rooms_w);
        stats.write().await.active_rooms = room_count;
        log::info!("Peer {peer_id} left room {}", joined.room_key);
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn peer_count(&self, room: &str) -> usize {
        let group = self.rooms.read().await.get(room).cloned();
        match group {
            Some(room) => room.group.peer_count().await,
            None => 0,
        }
    }

    /// Full yrs state of a room's document, if the room is open.
    pub async fn room_state(&self, room: &str) -> Option<Vec<u8>> {
        let room = self.rooms.read().await.get(room).cloned()?;
        Some(room.full_state())
    }
}

fn push_encoded(frames: &mut Vec<Vec<u8>>, msg: &SyncMessage) {
    match msg.encode() {
        Ok(bytes) => frames.push(bytes),
        Err(e) => log::warn!("Could not encode {:?}: {e}", msg.msg_type),
    }
}

async fn next_frame(rx: &mut Option<Receiver<Frame>>) -> Result<Frame, RecvError> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn tick(heartbeat: &mut Option<tokio::time::Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
