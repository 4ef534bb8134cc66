//! Update Queue: optimistic local edits, throttled replicated writes.
//!
//! ```text
//! queue_update(path, value, class)
//!     │ 1. set_path(local_view)            (UI sees it now; bad path ► error)
//!     │ 2. local-only path? ── yes ──► done
//!     │ 3. pending[path] = value           (last write per path wins)
//!     │ 4. no flush scheduled? ──► sleep(delay(class)) ──► flush
//!     ▼
//! flush: replica = doc.stage_props(scene)   (latest, not local_view)
//!        apply pending onto replica
//!        doc.update_scene_stage_props(scene, replica)   (one transaction)
//! ```
//!
//! While the provider is offline, flushed batches wait in a retry queue that
//! a readiness loop drains, in order, once the provider reconnects.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde_json::{Map as JsonMap, Value};
use tokio::runtime::Handle;

use crate::config::SyncConfig;
use crate::convert::{get_path, set_path};
use crate::document::{DocumentChange, SharedDocument, Subscription};
use crate::error::{SyncError, SyncResult};
use crate::model::UpdateClass;

/// Dot-paths that only ever affect this client's view.
pub const LOCAL_ONLY_PATHS: &[&str] = &[
    "scene.offset",
    "scene.zoom",
    "scene.rotation",
    "fogOfWar.tool.mode",
    "annotations.activeTool",
    "measurement.activeTool",
];

/// True if `path` is, or lies under, one of [`LOCAL_ONLY_PATHS`].
pub fn is_local_only(path: &[String]) -> bool {
    let joined = path.join(".");
    LOCAL_ONLY_PATHS.iter().any(|local| {
        joined == *local
            || joined
                .strip_prefix(local)
                .is_some_and(|rest| rest.starts_with('.'))
    })
}

#[derive(Debug, Clone, PartialEq)]
struct PendingUpdate {
    key: String,
    path: Vec<String>,
    value: Value,
}

#[derive(Debug, Clone)]
struct Batch {
    scene_id: String,
    updates: Vec<PendingUpdate>,
}

#[derive(Default)]
struct QueueState {
    scene_id: Option<String>,
    local_view: Value,
    /// Submission order; a path set again moves to the end.
    pending: Vec<PendingUpdate>,
    flush_scheduled: bool,
    retry: VecDeque<Batch>,
    retry_running: bool,
}

struct Inner {
    doc: Arc<SharedDocument>,
    config: SyncConfig,
    runtime: Handle,
    state: Mutex<QueueState>,
}

/// Per-client batching of stage-prop edits for the active scene.
#[derive(Clone)]
pub struct UpdateQueue {
    inner: Arc<Inner>,
}

impl UpdateQueue {
    /// Must be called from within a tokio runtime; timers run on it.
    pub fn new(doc: Arc<SharedDocument>, config: SyncConfig) -> SyncResult<Self> {
        let runtime = Handle::try_current().map_err(|e| SyncError::NoRuntime(e.to_string()))?;
        Ok(Self {
            inner: Arc::new(Inner {
                doc,
                config,
                runtime,
                state: Mutex::new(QueueState {
                    local_view: Value::Object(JsonMap::new()),
                    ..QueueState::default()
                }),
            }),
        })
    }

    /// Switch scenes. Pending edits for the previous scene are flushed
    /// first, then the local view is rebuilt from the replica.
    pub fn set_active_scene(&self, scene_id: &str) -> SyncResult<Value> {
        self.flush_now();
        self.inner.lock().scene_id = Some(scene_id.to_string());
        self.resync_local_view()
    }

    pub fn active_scene(&self) -> Option<String> {
        self.inner.lock().scene_id.clone()
    }

    /// The optimistic tree the UI renders from.
    pub fn local_view(&self) -> Value {
        self.inner.lock().local_view.clone()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Batches waiting for the provider to connect.
    pub fn retry_count(&self) -> usize {
        self.inner.lock().retry.len()
    }

    /// Apply `value` at `path` locally and schedule its replication.
    pub fn queue_update(&self, path: &[&str], value: Value, class: UpdateClass) -> SyncResult<()> {
        let path: Vec<String> = path.iter().map(|s| s.to_string()).collect();
        if path.is_empty() || path.iter().any(String::is_empty) {
            return Err(SyncError::InvalidPath(path));
        }

        let schedule = {
            let mut state = self.inner.lock();
            let local_only = is_local_only(&path);
            if !local_only && state.scene_id.is_none() {
                return Err(SyncError::NoActiveScene);
            }
            if !set_path(&mut state.local_view, &path, value.clone()) {
                return Err(SyncError::InvalidPath(path));
            }
            if local_only {
                return Ok(());
            }

            let key = path.join(".");
            state.pending.retain(|u| u.key != key);
            state.pending.push(PendingUpdate { key, path, value });

            let first = !state.flush_scheduled;
            state.flush_scheduled = true;
            first
        };

        if schedule {
            let delay = self.inner.config.throttle_delay(class);
            let inner = Arc::clone(&self.inner);
            self.inner.runtime.spawn(async move {
                tokio::time::sleep(delay).await;
                inner.flush();
            });
        }
        Ok(())
    }

    /// Flush pending updates immediately instead of waiting for the timer.
    pub fn flush_now(&self) {
        self.inner.flush();
    }

    /// Rebuild the local view from the replica, then re-apply edits that
    /// have not been replicated yet and this client's local-only values.
    pub fn resync_local_view(&self) -> SyncResult<Value> {
        self.inner.resync_local_view()
    }

    /// Keep the local view in step with remote changes to the active scene.
    /// The subscription ends when the returned handle is dropped.
    pub fn follow_document(&self) -> Subscription {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        self.inner.doc.subscribe(move |change| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let relevant = match change {
                DocumentChange::Remote => true,
                DocumentChange::Scene(id) => inner.lock().scene_id.as_deref() == Some(id.as_str()),
                _ => false,
            };
            if relevant {
                if let Err(e) = inner.resync_local_view() {
                    log::debug!("Local view resync skipped: {e}");
                }
            }
        })
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn flush(self: &Arc<Self>) {
        let (batch, start_retry) = {
            let mut state = self.lock();
            state.flush_scheduled = false;
            if state.pending.is_empty() {
                return;
            }
            let Some(scene_id) = state.scene_id.clone() else {
                return;
            };
            let batch = Batch {
                scene_id,
                updates: std::mem::take(&mut state.pending),
            };
            // Keep submission order behind batches already waiting.
            let defer = !self.doc.is_connected() || !state.retry.is_empty();
            if defer {
                state.retry.push_back(batch);
                (None, !state.retry_running)
            } else {
                (Some(batch), false)
            }
        };

        match batch {
            Some(batch) => self.deliver(&batch),
            None => {
                log::debug!("Provider for room {} not ready; batch queued for retry", self.doc.room());
                if start_retry {
                    self.start_retry_loop();
                }
            }
        }
    }

    /// Read-merge-write against the latest replica.
    fn deliver(&self, batch: &Batch) {
        let result = self.doc.stage_props(&batch.scene_id).and_then(|mut tree| {
            for update in &batch.updates {
                if !set_path(&mut tree, &update.path, update.value.clone()) {
                    log::warn!(
                        "Skipping update to {} in scene {}: path no longer fits the replica",
                        update.key,
                        batch.scene_id
                    );
                }
            }
            self.doc.update_scene_stage_props(&batch.scene_id, &tree)
        });
        match result {
            Ok(changed) => log::trace!(
                "Flushed {} update(s) to scene {} (changed={changed})",
                batch.updates.len(),
                batch.scene_id
            ),
            Err(SyncError::Destroyed(room)) => {
                log::debug!("Dropping {} update(s): room {room} closed", batch.updates.len());
            }
            Err(e) => log::warn!(
                "Dropping {} update(s) for scene {}: {e}",
                batch.updates.len(),
                batch.scene_id
            ),
        }
    }

    fn start_retry_loop(self: &Arc<Self>) {
        {
            let mut state = self.lock();
            if state.retry_running {
                return;
            }
            state.retry_running = true;
        }
        let inner = Arc::clone(self);
        let interval = self.config.retry_interval();
        self.runtime.spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if inner.doc.is_destroyed() {
                    let mut state = inner.lock();
                    log::warn!(
                        "Room {} closed with {} unsent batch(es)",
                        inner.doc.room(),
                        state.retry.len()
                    );
                    state.retry.clear();
                    state.retry_running = false;
                    break;
                }
                if !inner.doc.is_connected() {
                    continue;
                }
                // Drain one at a time so a batch flushed meanwhile queues
                // behind the ones still waiting.
                loop {
                    let next = {
                        let mut state = inner.lock();
                        let next = state.retry.pop_front();
                        if next.is_none() {
                            state.retry_running = false;
                        }
                        next
                    };
                    match next {
                        Some(batch) => inner.deliver(&batch),
                        None => return,
                    }
                }
            }
        });
    }

    fn resync_local_view(&self) -> SyncResult<Value> {
        let Some(scene_id) = self.lock().scene_id.clone() else {
            return Err(SyncError::NoActiveScene);
        };
        let mut tree = self.doc.stage_props(&scene_id)?;

        let mut state = self.lock();
        if state.scene_id.as_deref() != Some(scene_id.as_str()) {
            return Ok(state.local_view.clone());
        }
        for local in LOCAL_ONLY_PATHS {
            let path: Vec<String> = local.split('.').map(str::to_string).collect();
            if let Some(value) = get_path(&state.local_view, &path) {
                set_path(&mut tree, &path, value.clone());
            }
        }
        let unsent = state
            .retry
            .iter()
            .filter(|b| b.scene_id == scene_id)
            .flat_map(|b| b.updates.iter())
            .chain(state.pending.iter());
        for update in unsent {
            set_path(&mut tree, &update.path, update.value.clone());
        }
        state.local_view = tree.clone();
        Ok(tree)
    }
}
