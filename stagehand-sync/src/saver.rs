//! Save coordination and drift detection against the durable store.
//!
//! ```text
//!   Idle ──become_active_saver()──► Saving ──release_active_saver(ok)──► Idle
//!     ▲            │ held by peer                                          │
//!     └── Skipped ◄┘                          lastSavedAt = now (on ok) ◄──┘
//! ```
//!
//! Only one client per scene holds the saver role at a time; the claim lives
//! in the replicated scene data so every peer sees it. Failing to get the
//! role is the normal outcome when several editors auto-save together.
//!
//! The drift detector polls the store's per-scene timestamps and pulls a
//! scene back into the document when the store is newer than the replica's
//! `lastSavedAt`, i.e. someone wrote to the store out of band.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::config::SyncConfig;
use crate::document::{SaverClaim, SharedDocument};
use crate::error::{SyncError, SyncResult};
use crate::model::{now_millis, Marker};
use crate::persistence::{Persistence, PersistenceError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    Saved {
        markers_created: usize,
        markers_updated: usize,
        markers_deleted: usize,
    },
    /// Another client is saving this scene.
    Skipped { holder: Option<String> },
}

/// Marker writes needed to bring the store from `persisted` to `current`.
#[derive(Debug, Default, PartialEq)]
pub struct MarkerDiff {
    pub created: Vec<Marker>,
    pub updated: Vec<Marker>,
    pub deleted: Vec<String>,
}

impl MarkerDiff {
    pub fn between(persisted: &HashMap<String, Marker>, current: &[Marker]) -> Self {
        let mut diff = MarkerDiff::default();
        for marker in current {
            match persisted.get(&marker.id) {
                None => diff.created.push(marker.clone()),
                Some(previous) if previous != marker => diff.updated.push(marker.clone()),
                Some(_) => {}
            }
        }
        let mut deleted: Vec<String> = persisted
            .keys()
            .filter(|id| !current.iter().any(|m| &m.id == *id))
            .cloned()
            .collect();
        deleted.sort();
        diff.deleted = deleted;
        diff
    }

    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }
}

pub struct SaveCoordinator {
    doc: Arc<SharedDocument>,
    store: Arc<dyn Persistence>,
    lease_ms: Option<i64>,
    settle: Duration,
}

impl SaveCoordinator {
    pub fn new(doc: Arc<SharedDocument>, store: Arc<dyn Persistence>, config: &SyncConfig) -> Self {
        Self {
            doc,
            store,
            lease_ms: config.saver_lease(),
            settle: config.saver_settle(),
        }
    }

    /// Try to take the saver role. `Ok(false)` means someone else has it.
    pub fn become_active_saver(&self, scene_id: &str) -> SyncResult<bool> {
        match self.doc.try_claim_saver(scene_id, now_millis(), self.lease_ms)? {
            SaverClaim::Acquired => Ok(true),
            SaverClaim::HeldBy(holder) => {
                log::debug!("Scene {scene_id} is being saved by {holder}; skipping");
                Ok(false)
            }
        }
    }

    /// Whether the replicated claim still names this client. Two clients
    /// that claimed while partitioned both succeed locally; after the merge
    /// only one of them is still named.
    pub fn confirm_active_saver(&self, scene_id: &str) -> SyncResult<bool> {
        let me = self.doc.client_id().to_string();
        Ok(self.doc.active_saver(scene_id)?.as_deref() == Some(me.as_str()))
    }

    pub fn release_active_saver(&self, scene_id: &str, success: bool) -> SyncResult<()> {
        if !self.doc.release_saver(scene_id, success, now_millis())? {
            log::debug!("Saver claim on scene {scene_id} was no longer ours at release");
        }
        Ok(())
    }

    /// Persist the scene if this client can become its saver.
    ///
    /// The claim is checked again after the settle delay and before every
    /// store write. Losing it stops the save with `Skipped`; writes already
    /// made stay in the store and the new holder's diff picks up from there.
    pub async fn save_scene(&self, scene_id: &str) -> SyncResult<SaveOutcome> {
        if !self.become_active_saver(scene_id)? {
            return self.skipped(scene_id);
        }
        tokio::time::sleep(self.settle).await;
        if !self.confirm_active_saver(scene_id)? {
            log::debug!("Lost the saver claim on scene {scene_id} to a concurrent peer");
            return self.skipped(scene_id);
        }

        let result = self.persist(scene_id).await;
        if let Err(e) = &result {
            log::warn!("Saving scene {scene_id} failed: {e}");
        }
        let saved = matches!(result, Ok(SaveOutcome::Saved { .. }));
        self.release_active_saver(scene_id, saved)?;
        result
    }

    fn skipped(&self, scene_id: &str) -> SyncResult<SaveOutcome> {
        Ok(SaveOutcome::Skipped {
            holder: self.doc.active_saver(scene_id)?,
        })
    }

    /// `Some(Skipped)` once a peer has taken the claim over.
    fn lost_claim(&self, scene_id: &str) -> SyncResult<Option<SaveOutcome>> {
        if self.confirm_active_saver(scene_id)? {
            return Ok(None);
        }
        log::warn!("Saver claim on scene {scene_id} was taken over mid-save; stopping");
        self.skipped(scene_id).map(Some)
    }

    async fn persist(&self, scene_id: &str) -> SyncResult<SaveOutcome> {
        let data = self.doc.scene_data(scene_id)?;
        self.store.save_scene_props(scene_id, &data.stage_props).await?;

        // Peers save too, so only the store knows which markers it holds.
        let baseline = self.baseline(scene_id).await?;
        let diff = MarkerDiff::between(&baseline, &data.markers);
        for marker in &diff.created {
            if let Some(lost) = self.lost_claim(scene_id)? {
                return Ok(lost);
            }
            self.store.create_marker(scene_id, marker).await?;
        }
        for marker in &diff.updated {
            if let Some(lost) = self.lost_claim(scene_id)? {
                return Ok(lost);
            }
            self.store.update_marker(scene_id, marker).await?;
        }
        for marker_id in &diff.deleted {
            if let Some(lost) = self.lost_claim(scene_id)? {
                return Ok(lost);
            }
            self.store.delete_marker(scene_id, marker_id).await?;
        }

        log::info!(
            "Saved scene {scene_id}: {} created, {} updated, {} deleted marker(s)",
            diff.created.len(),
            diff.updated.len(),
            diff.deleted.len()
        );
        Ok(SaveOutcome::Saved {
            markers_created: diff.created.len(),
            markers_updated: diff.updated.len(),
            markers_deleted: diff.deleted.len(),
        })
    }

    async fn baseline(&self, scene_id: &str) -> SyncResult<HashMap<String, Marker>> {
        match self.store.load_scene(scene_id).await {
            Ok(record) => Ok(record.markers.into_iter().map(|m| (m.id.clone(), m)).collect()),
            Err(PersistenceError::NotFound(_)) => Ok(HashMap::new()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Polls durable timestamps and refreshes scenes changed out of band.
pub struct DriftDetector {
    doc: Arc<SharedDocument>,
    store: Arc<dyn Persistence>,
    party_id: String,
    /// Durable timestamp already reconciled, per scene.
    handled: Mutex<HashMap<String, i64>>,
}

impl DriftDetector {
    pub fn new(doc: Arc<SharedDocument>, store: Arc<dyn Persistence>, party_id: impl Into<String>) -> Self {
        Self {
            doc,
            store,
            party_id: party_id.into(),
            handled: Mutex::new(HashMap::new()),
        }
    }

    fn lock_handled(&self) -> MutexGuard<'_, HashMap<String, i64>> {
        self.handled.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Scenes whose durable timestamp is newer than the replica's
    /// `lastSavedAt` and has not been reconciled yet. Scenes without
    /// replicated data are ignored.
    pub fn detect(&self, durable: &HashMap<String, i64>) -> SyncResult<Vec<(String, i64)>> {
        let mut drifted = Vec::new();
        for (scene_id, &stored_at) in durable {
            if !self.doc.has_scene(scene_id)? {
                continue;
            }
            let replicated = self.doc.last_saved_at(scene_id)?;
            let already = self.lock_handled().get(scene_id).is_some_and(|&ts| ts >= stored_at);
            if stored_at > replicated && !already {
                drifted.push((scene_id.clone(), stored_at));
            }
        }
        drifted.sort();
        Ok(drifted)
    }

    /// One poll: fetch timestamps, refresh drifted scenes. Returns the
    /// scenes that were refreshed.
    pub async fn poll_once(&self) -> SyncResult<Vec<String>> {
        let durable = self.store.scene_timestamps(&self.party_id).await?;
        let mut refreshed = Vec::new();
        for (scene_id, stored_at) in self.detect(&durable)? {
            log::info!("Scene {scene_id} changed in the store at {stored_at}; refreshing");
            match self.refresh(&scene_id, stored_at).await {
                Ok(()) => {
                    self.lock_handled().insert(scene_id.clone(), stored_at);
                    refreshed.push(scene_id);
                }
                Err(SyncError::Destroyed(room)) => return Err(SyncError::Destroyed(room)),
                Err(e) => log::warn!("Refreshing scene {scene_id} failed: {e}"),
            }
        }
        Ok(refreshed)
    }

    async fn refresh(&self, scene_id: &str, stored_at: i64) -> SyncResult<()> {
        let record = self.store.load_scene(scene_id).await?;
        let saved_at = record.updated_at.max(stored_at);
        self.doc
            .apply_durable_scene(scene_id, &record.stage_props, &record.markers, saved_at)
    }

    /// Run `poll_once` every `interval` until the document is destroyed.
    pub fn spawn(self: Arc<Self>, interval: Duration) -> SyncResult<JoinHandle<()>> {
        let handle = Handle::try_current().map_err(|e| SyncError::NoRuntime(e.to_string()))?;
        Ok(handle.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match self.poll_once().await {
                    Ok(_) => {}
                    Err(SyncError::Destroyed(room)) => {
                        log::debug!("Drift detector for room {room} stopping");
                        break;
                    }
                    Err(e) => log::warn!("Drift poll failed: {e}"),
                }
            }
        }))
    }
}
