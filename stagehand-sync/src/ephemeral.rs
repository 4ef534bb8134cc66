//! Temporary annotation layers that live only in awareness.
//!
//! A layer is added to the owning client's awareness state and broadcast
//! with it. It never touches the replicated document, so it can never reach
//! the durable store. Every client sweeps its *own* expired layers on a
//! timer; layers of a client that disconnects vanish with its awareness
//! entry.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::document::SharedDocument;
use crate::error::{SyncError, SyncResult};
use crate::model::{now_millis, ClientId, Point};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EphemeralKind {
    /// Short pulse at a point.
    Ping,
    /// Freehand stroke.
    Drawing,
    /// Painted region carried as an encoded mask.
    Highlight,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EphemeralLayer {
    pub id: String,
    pub owner: ClientId,
    pub kind: EphemeralKind,
    pub color: String,
    pub points: Vec<Point>,
    /// Base64 RLE mask for `Highlight` layers.
    pub mask: Option<String>,
    pub created_at: i64,
    pub expires_at: i64,
}

impl EphemeralLayer {
    pub fn new(owner: ClientId, kind: EphemeralKind, color: impl Into<String>, ttl: Duration) -> Self {
        let created_at = now_millis();
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        Self {
            id: Uuid::new_v4().to_string(),
            owner,
            kind,
            color: color.into(),
            points: Vec::new(),
            mask: None,
            created_at,
            expires_at: created_at.saturating_add(ttl_ms),
        }
    }

    pub fn with_points(mut self, points: Vec<Point>) -> Self {
        self.points = points;
        self
    }

    pub fn with_mask(mut self, mask: impl Into<String>) -> Self {
        self.mask = Some(mask.into());
        self
    }

    pub fn is_expired(&self, now: i64) -> bool {
        now >= self.expires_at
    }
}

/// Adds, removes and expires the local client's ephemeral layers.
pub struct EphemeralLayerManager {
    doc: Arc<SharedDocument>,
}

impl EphemeralLayerManager {
    pub fn new(doc: Arc<SharedDocument>) -> Self {
        Self { doc }
    }

    /// Broadcast a new layer owned by this client.
    pub fn add_layer(&self, mut layer: EphemeralLayer) -> SyncResult<String> {
        layer.owner = self.doc.client_id();
        let id = layer.id.clone();
        self.doc.update_awareness(|state| {
            state.ephemeral_layers.retain(|l| l.id != layer.id);
            state.ephemeral_layers.push(layer);
        })?;
        Ok(id)
    }

    pub fn remove_layer(&self, id: &str) -> SyncResult<bool> {
        if !self.doc.local_awareness()?.ephemeral_layers.iter().any(|l| l.id == id) {
            return Ok(false);
        }
        self.doc
            .update_awareness(|state| state.ephemeral_layers.retain(|l| l.id != id))?;
        Ok(true)
    }

    pub fn own_layers(&self) -> SyncResult<Vec<EphemeralLayer>> {
        Ok(self.doc.local_awareness()?.ephemeral_layers)
    }

    /// Remove this client's expired layers. Broadcasts only if something
    /// expired. Returns how many were removed.
    pub fn sweep(&self, now: i64) -> SyncResult<usize> {
        let expired = self
            .doc
            .local_awareness()?
            .ephemeral_layers
            .iter()
            .filter(|l| l.is_expired(now))
            .count();
        if expired > 0 {
            self.doc
                .update_awareness(|state| state.ephemeral_layers.retain(|l| !l.is_expired(now)))?;
            log::debug!(
                "Swept {expired} expired ephemeral layer(s) in room {}",
                self.doc.room()
            );
        }
        Ok(expired)
    }

    /// Every unexpired layer known to this client, its own first.
    ///
    /// Remote owners sweep on their own schedule, so expired remote layers
    /// are filtered here rather than waiting for their next broadcast.
    pub fn visible_layers(&self, now: i64) -> SyncResult<Vec<EphemeralLayer>> {
        let mut layers: Vec<EphemeralLayer> = self
            .doc
            .local_awareness()?
            .ephemeral_layers
            .into_iter()
            .filter(|l| !l.is_expired(now))
            .collect();
        for (_, state) in self.doc.peer_awareness()? {
            layers.extend(state.ephemeral_layers.into_iter().filter(|l| !l.is_expired(now)));
        }
        Ok(layers)
    }

    /// Run `sweep` every `interval` until the document is destroyed.
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration) -> SyncResult<JoinHandle<()>> {
        let handle = Handle::try_current().map_err(|e| SyncError::NoRuntime(e.to_string()))?;
        Ok(handle.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match self.sweep(now_millis()) {
                    Ok(_) => {}
                    Err(SyncError::Destroyed(room)) => {
                        log::debug!("Ephemeral sweeper for room {room} stopping");
                        break;
                    }
                    Err(e) => log::warn!("Ephemeral sweep failed: {e}"),
                }
            }
        }))
    }
}
