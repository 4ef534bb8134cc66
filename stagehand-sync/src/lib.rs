//! # stagehand-sync — real-time state sync for tabletop game sessions
//!
//! Every client of a party (the GM and the players) holds a replica of one
//! shared yrs document. Local edits are applied optimistically, throttled,
//! and written in single transactions; remote edits arrive through a
//! [`provider::Provider`]. One client at a time persists a scene to the
//! durable store.
//!
//! ## Architecture
//!
//! ```text
//!   UI edits                                       durable store (HTTP)
//!      │                                                  ▲   │
//!      ▼                                                  │   │ timestamps
//! ┌─────────────┐  one txn   ┌────────────────┐  save  ┌─┴───┴──────────┐
//! │ UpdateQueue │ ─────────► │ SharedDocument │ ◄────► │ SaveCoordinator│
//! │ (throttle)  │            │  (yrs Doc)     │        │ DriftDetector  │
//! └─────────────┘            └───────┬────────┘        └────────────────┘
//!        ▲  MarkerTracker            │ Provider
//!        └── (merge protection)      ▼
//!                            ┌────────────────┐  WebSocket  ┌────────────┐
//!                            │ WsProvider /   │ ◄─────────► │ SyncServer │
//!                            │ MemoryHub      │             │ (relay)    │
//!                            └────────────────┘             └────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`mask`] — run-length codec for fog-of-war and annotation masks
//! - [`queue`] — optimistic local view and throttled, batched writes
//! - [`merge`] — protection of markers being moved, edited or deleted
//! - [`document`] — the shared document and its typed operations
//! - [`saver`] — single-saver coordination and drift detection
//! - [`ephemeral`] — short-lived layers carried in awareness
//! - [`persistence`] — the durable store API (HTTP and in-memory)
//! - [`provider`], [`client`], [`server`], [`protocol`], [`broadcast`] —
//!   transport between replicas

pub mod awareness;
pub mod broadcast;
pub mod client;
pub mod config;
pub mod convert;
pub mod document;
pub mod ephemeral;
pub mod error;
pub mod mask;
pub mod merge;
pub mod model;
pub mod persistence;
pub mod protocol;
pub mod provider;
pub mod queue;
pub mod saver;
pub mod server;

// Re-exports for convenience
pub use awareness::{Awareness, AwarenessMessage, AwarenessState};
pub use client::{ConnectionState, SyncEvent, WsProvider};
pub use config::SyncConfig;
pub use document::{DocumentChange, SaverClaim, SharedDocument, Subscription};
pub use ephemeral::{EphemeralKind, EphemeralLayer, EphemeralLayerManager};
pub use error::{SyncError, SyncResult};
pub use mask::{Mask, MaskError};
pub use merge::{reconcile, MarkerTracker, Tracked};
pub use model::{
    ClientId, CursorData, Marker, PartyState, Point, SceneData, SceneMetadata, UpdateClass, Viewport, Visibility,
};
pub use persistence::{HttpPersistence, MemoryPersistence, Persistence, PersistenceError, SceneRecord};
pub use protocol::{MessageType, PeerInfo, ProtocolError, SyncMessage};
pub use provider::{MemoryHub, Provider};
pub use queue::UpdateQueue;
pub use saver::{DriftDetector, SaveCoordinator, SaveOutcome};
pub use server::{ServerConfig, ServerStats, SyncServer};
