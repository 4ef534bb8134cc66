//! Binary relay protocol carrying document updates and awareness.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬──────────────┬──────────┬──────────┐
//! │ msg_type │ peer_id   │ room         │ clock    │ payload  │
//! │ 1 byte   │ 16 bytes  │ len + utf-8  │ varint   │ variable │
//! └──────────┴───────────┴──────────────┴──────────┴──────────┘
//! ```
//!
//! The room key is the party identifier: one replicated document per room.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::awareness::AwarenessMessage;

/// Message types for the relay protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// yrs state vector: "send me what I'm missing"
    SyncStep1 = 1,
    /// yrs state diff answering a SyncStep1
    SyncStep2 = 2,
    /// Incremental document update
    Update = 3,
    /// Awareness (ephemeral per-client state)
    Awareness = 4,
    PeerJoined = 5,
    PeerLeft = 6,
    Ping = 7,
    Pong = 8,
}

/// Peer identity announced on join.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerInfo {
    pub peer_id: Uuid,
    /// Application user behind this client (GM or player).
    pub user_id: String,
    pub name: String,
}

impl PeerInfo {
    pub fn new(user_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4(), user_id, name)
    }

    pub fn with_id(peer_id: Uuid, user_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            peer_id,
            user_id: user_id.into(),
            name: name.into(),
        }
    }
}

/// Top-level protocol frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub peer_id: Uuid,
    pub room: String,
    /// Sender's Lamport clock, for ordering diagnostics.
    pub clock: u64,
    pub payload: Vec<u8>,
}

impl SyncMessage {
    fn new(msg_type: MessageType, peer_id: Uuid, room: impl Into<String>, clock: u64, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            peer_id,
            room: room.into(),
            clock,
            payload,
        }
    }

    pub fn update(peer_id: Uuid, room: impl Into<String>, clock: u64, update: Vec<u8>) -> Self {
        Self::new(MessageType::Update, peer_id, room, clock, update)
    }

    pub fn sync_step1(peer_id: Uuid, room: impl Into<String>, state_vector: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep1, peer_id, room, 0, state_vector)
    }

    pub fn sync_step2(peer_id: Uuid, room: impl Into<String>, diff: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep2, peer_id, room, 0, diff)
    }

    pub fn awareness(
        peer_id: Uuid,
        room: impl Into<String>,
        clock: u64,
        message: &AwarenessMessage,
    ) -> Result<Self, ProtocolError> {
        let payload = bincode::serde::encode_to_vec(message, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        Ok(Self::new(MessageType::Awareness, peer_id, room, clock, payload))
    }

    pub fn peer_joined(room: impl Into<String>, info: &PeerInfo) -> Result<Self, ProtocolError> {
        let payload = bincode::serde::encode_to_vec(info, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        Ok(Self::new(MessageType::PeerJoined, info.peer_id, room, 0, payload))
    }

    pub fn peer_left(peer_id: Uuid, room: impl Into<String>) -> Self {
        Self::new(MessageType::PeerLeft, peer_id, room, 0, Vec::new())
    }

    pub fn ping(peer_id: Uuid) -> Self {
        Self::new(MessageType::Ping, peer_id, String::new(), 0, Vec::new())
    }

    pub fn pong(peer_id: Uuid) -> Self {
        Self::new(MessageType::Pong, peer_id, String::new(), 0, Vec::new())
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }

    /// Parse an awareness payload.
    pub fn awareness_message(&self) -> Result<AwarenessMessage, ProtocolError> {
        if self.msg_type != MessageType::Awareness {
            return Err(ProtocolError::InvalidMessageType(self.msg_type));
        }
        let (message, _) = bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(message)
    }

    /// Parse a peer-joined payload.
    pub fn peer_info(&self) -> Result<PeerInfo, ProtocolError> {
        if self.msg_type != MessageType::PeerJoined {
            return Err(ProtocolError::InvalidMessageType(self.msg_type));
        }
        let (info, _) = bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(info)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("unexpected message type {0:?}")]
    InvalidMessageType(MessageType),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("connection closed")]
    ConnectionClosed,
}
