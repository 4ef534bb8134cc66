//! Shared Document Manager: one replicated yrs document per party.
//!
//! ```text
//!            ┌──────────────────── SharedDocument (room = party id) ───────────────────┐
//!            │ partyState  : Map   { isPaused, activeGameSessionId, activeSceneId }     │
//!            │ scenesList  : Array [ Map { id, name, order, mapLocation, gameSessionId } ]│
//!            │ scenes      : Map   { sceneId → Map { stageProps, markers, localStates,  │
//!            │                        lastSavedAt, saveInProgress, activeSaver, … } }  │
//!            │ cursors     : Map   { clientId → Map { userId, position, … } }          │
//!            └───────────────────────────────┬────────────────────────────────────────┘
//!                  local txn ─► encode_update_v1 ─► Provider ─► peers
//!                  peers ─► apply_remote_update ─► subscribers
//! ```
//!
//! Every mutating operation runs in exactly one `TransactionMut`. Inputs are
//! validated before the transaction writes anything, so a rejected call
//! leaves the document untouched. The delta of a committed transaction is
//! handed to the provider and then subscribers are notified; no lock is held
//! while either runs.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde_json::{Map as JsonMap, Value};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
    Any, Array, ArrayRef, Doc, Map, MapPrelim, MapRef, Out, ReadTxn, StateVector, Transact, Transaction,
    TransactionMut, Update,
};

use crate::awareness::{Awareness, AwarenessMessage, AwarenessState};
use crate::convert::{
    get_array, get_map, get_or_create_array, get_or_create_map, insert_value, map_to_json, merge_object,
    merge_value, out_to_json, push_value,
};
use crate::error::{SyncError, SyncResult};
use crate::model::{ClientId, CursorData, Marker, PartyState, SceneData, SceneMetadata, Viewport};
use crate::provider::Provider;

pub const PARTY_STATE: &str = "partyState";
pub const SCENES_LIST: &str = "scenesList";
pub const SCENES: &str = "scenes";
pub const CURSORS: &str = "cursors";

const STAGE_PROPS: &str = "stageProps";
const MARKERS: &str = "markers";
const LOCAL_STATES: &str = "localStates";
const LAST_SAVED_AT: &str = "lastSavedAt";
const SAVE_IN_PROGRESS: &str = "saveInProgress";
const ACTIVE_SAVER: &str = "activeSaver";
const SAVE_STARTED_AT: &str = "saveStartedAt";

/// What a notification is about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentChange {
    PartyState,
    ScenesList,
    Scene(String),
    Cursors,
    Awareness,
    /// A peer's update was applied; any root may have changed.
    Remote,
}

type Callback = Arc<dyn Fn(&DocumentChange) + Send + Sync>;

#[derive(Default)]
struct Subscribers {
    next_id: AtomicU64,
    callbacks: Mutex<Vec<(u64, Callback)>>,
}

impl Subscribers {
    fn lock(&self) -> MutexGuard<'_, Vec<(u64, Callback)>> {
        self.callbacks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remove(&self, id: u64) {
        self.lock().retain(|(existing, _)| *existing != id);
    }
}

/// Handle returned by [`SharedDocument::subscribe`]. Dropping it
/// unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    id: u64,
    subscribers: Weak<Subscribers>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(subscribers) = self.subscribers.upgrade() {
            subscribers.remove(self.id);
        }
    }
}

/// Result of a saver claim attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaverClaim {
    Acquired,
    /// Another client holds an unexpired claim.
    HeldBy(String),
}

pub struct SharedDocument {
    room: String,
    client_id: ClientId,
    doc: Doc,
    party_state: MapRef,
    scenes_list: ArrayRef,
    scenes: MapRef,
    cursors: MapRef,
    provider: Arc<dyn Provider>,
    awareness: Mutex<Awareness>,
    subscribers: Arc<Subscribers>,
    txn_lock: Mutex<()>,
    party_ready: AtomicBool,
    scenes_list_ready: AtomicBool,
    destroyed: AtomicBool,
}

impl SharedDocument {
    pub fn new(room: &str, client_id: ClientId, provider: Arc<dyn Provider>) -> Arc<Self> {
        let doc = Doc::new();
        let party_state = doc.get_or_insert_map(PARTY_STATE);
        let scenes_list = doc.get_or_insert_array(SCENES_LIST);
        let scenes = doc.get_or_insert_map(SCENES);
        let cursors = doc.get_or_insert_map(CURSORS);
        log::debug!("Created shared document for room {room} (client {client_id})");

        Arc::new(Self {
            room: room.to_string(),
            client_id,
            doc,
            party_state,
            scenes_list,
            scenes,
            cursors,
            provider,
            awareness: Mutex::new(Awareness::new(client_id)),
            subscribers: Arc::new(Subscribers::default()),
            txn_lock: Mutex::new(()),
            party_ready: AtomicBool::new(false),
            scenes_list_ready: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
        })
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn is_connected(&self) -> bool {
        !self.is_destroyed() && self.provider.is_connected()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    // ───────────────────────────────────────────────────────────────
    // Transaction plumbing
    // ───────────────────────────────────────────────────────────────

    fn ensure_alive(&self) -> SyncResult<()> {
        if self.is_destroyed() {
            return Err(SyncError::Destroyed(self.room.clone()));
        }
        Ok(())
    }

    fn lock_txn(&self) -> MutexGuard<'_, ()> {
        self.txn_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read<R>(&self, f: impl FnOnce(&Transaction<'_>) -> R) -> SyncResult<R> {
        self.ensure_alive()?;
        let _guard = self.lock_txn();
        let txn = self.doc.transact();
        Ok(f(&txn))
    }

    /// Run `f` in one write transaction. `f` reports whether it wrote
    /// anything; only then is the delta published and `change` announced.
    fn write<R>(
        &self,
        change: DocumentChange,
        f: impl FnOnce(&mut TransactionMut<'_>) -> SyncResult<(R, bool)>,
    ) -> SyncResult<R> {
        self.ensure_alive()?;
        let (result, update) = {
            let _guard = self.lock_txn();
            let mut txn = self.doc.transact_mut();
            let (result, changed) = f(&mut txn)?;
            (result, changed.then(|| txn.encode_update_v1()))
        };
        if let Some(update) = update {
            self.provider.publish_update(self.client_id, update);
            self.notify(&change);
        }
        Ok(result)
    }

    fn notify(&self, change: &DocumentChange) {
        let callbacks: Vec<Callback> = self.subscribers.lock().iter().map(|(_, cb)| Arc::clone(cb)).collect();
        for callback in callbacks {
            callback(change);
        }
    }

    fn require_party(&self) -> SyncResult<()> {
        if self.party_ready.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SyncError::NotInitialized(PARTY_STATE))
        }
    }

    fn require_scenes_list(&self) -> SyncResult<()> {
        if self.scenes_list_ready.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SyncError::NotInitialized(SCENES_LIST))
        }
    }

    fn scene_map<T: ReadTxn>(&self, txn: &T, scene_id: &str) -> SyncResult<MapRef> {
        get_map(txn, &self.scenes, scene_id).ok_or_else(|| SyncError::SceneNotFound(scene_id.to_string()))
    }

    // ───────────────────────────────────────────────────────────────
    // Initialization (idempotent)
    // ───────────────────────────────────────────────────────────────

    /// Populate party-state keys that no peer has set yet.
    pub fn initialize_party_state(&self, defaults: &PartyState) -> SyncResult<()> {
        let Value::Object(entries) = serde_json::to_value(defaults)? else {
            return Ok(());
        };
        self.write(DocumentChange::PartyState, |txn| {
            let mut changed = false;
            for (key, value) in &entries {
                if !self.party_state.contains_key(&*txn, key) {
                    insert_value(txn, &self.party_state, key, value);
                    changed = true;
                }
            }
            Ok(((), changed))
        })?;
        self.party_ready.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Seed the scene registry if it is still empty.
    pub fn initialize_scenes_list(&self, scenes: &[SceneMetadata]) -> SyncResult<()> {
        let entries = scenes.iter().map(serde_json::to_value).collect::<Result<Vec<_>, _>>()?;
        self.write(DocumentChange::ScenesList, |txn| {
            if self.scenes_list.len(&*txn) > 0 || entries.is_empty() {
                return Ok(((), false));
            }
            for entry in &entries {
                push_value(txn, &self.scenes_list, entry);
            }
            Ok(((), true))
        })?;
        self.scenes_list_ready.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Create `scenes[scene_id]` with the given stage props unless a peer
    /// already did.
    pub fn initialize_scene_data(&self, scene_id: &str, stage_props: &Value) -> SyncResult<()> {
        if !stage_props.is_object() {
            return Err(SyncError::InvalidPath(vec![STAGE_PROPS.to_string()]));
        }
        self.write(DocumentChange::Scene(scene_id.to_string()), |txn| {
            if self.scenes.contains_key(&*txn, scene_id) {
                return Ok(((), false));
            }
            create_scene(txn, &self.scenes, scene_id, stage_props);
            log::debug!("Initialized scene {scene_id} in room {}", self.room);
            Ok(((), true))
        })
    }

    pub fn has_scene(&self, scene_id: &str) -> SyncResult<bool> {
        self.read(|txn| self.scenes.contains_key(txn, scene_id))
    }

    // ───────────────────────────────────────────────────────────────
    // Party state
    // ───────────────────────────────────────────────────────────────

    pub fn party_state(&self) -> SyncResult<PartyState> {
        self.require_party()?;
        let json = self.read(|txn| map_to_json(txn, &self.party_state))?;
        Ok(serde_json::from_value(json)?)
    }

    pub fn set_paused(&self, paused: bool) -> SyncResult<()> {
        self.set_party_value("isPaused", Value::Bool(paused))
    }

    pub fn set_active_game_session(&self, game_session_id: &str) -> SyncResult<()> {
        self.set_party_value("activeGameSessionId", Value::from(game_session_id))
    }

    pub fn set_active_scene(&self, scene_id: Option<&str>) -> SyncResult<()> {
        self.set_party_value("activeSceneId", scene_id.map_or(Value::Null, Value::from))
    }

    fn set_party_value(&self, key: &str, value: Value) -> SyncResult<()> {
        self.require_party()?;
        self.write(DocumentChange::PartyState, |txn| {
            let changed = merge_value(txn, &self.party_state, key, &value);
            Ok(((), changed))
        })
    }

    // ───────────────────────────────────────────────────────────────
    // Scene registry
    // ───────────────────────────────────────────────────────────────

    /// Scenes in registry order. Entries are unique by id; a duplicate
    /// left behind by two concurrent seeds is hidden.
    pub fn scenes_list(&self) -> SyncResult<Vec<SceneMetadata>> {
        self.require_scenes_list()?;
        let raw = self.read(|txn| {
            self.scenes_list
                .iter(txn)
                .map(|item| out_to_json(txn, &item))
                .collect::<Vec<_>>()
        })?;

        let mut seen = HashSet::new();
        let mut scenes = Vec::with_capacity(raw.len());
        for value in raw {
            match serde_json::from_value::<SceneMetadata>(value) {
                Ok(meta) if seen.insert(meta.id.clone()) => scenes.push(meta),
                Ok(meta) => log::debug!("Ignoring duplicate scene entry {}", meta.id),
                Err(e) => log::warn!("Skipping malformed scene entry in room {}: {e}", self.room),
            }
        }
        Ok(scenes)
    }

    /// Append a scene. Adding an id that already exists updates it instead.
    pub fn add_scene(&self, scene: &SceneMetadata) -> SyncResult<()> {
        self.require_scenes_list()?;
        let Value::Object(entry) = serde_json::to_value(scene)? else {
            return Ok(());
        };
        self.write(DocumentChange::ScenesList, |txn| {
            match find_entry(&*txn, &self.scenes_list, &scene.id) {
                Some((_, existing)) => Ok(((), merge_object(txn, &existing, &entry, false))),
                None => {
                    push_value(txn, &self.scenes_list, &Value::Object(entry.clone()));
                    Ok(((), true))
                }
            }
        })
    }

    /// Edit one scene's metadata in place. Only fields that differ are
    /// written.
    ///
    /// `edit` runs with no lock or transaction held, so it may read the
    /// document. A peer write that lands between the read and the write is
    /// kept for any field `edit` leaves alone.
    pub fn update_scene<F>(&self, scene_id: &str, edit: F) -> SyncResult<()>
    where
        F: FnOnce(&mut SceneMetadata),
    {
        self.require_scenes_list()?;
        let current = self
            .read(|txn| find_entry(txn, &self.scenes_list, scene_id).map(|(_, entry)| map_to_json(txn, &entry)))?
            .ok_or_else(|| SyncError::SceneNotFound(scene_id.to_string()))?;
        let before: SceneMetadata = serde_json::from_value(current)?;
        let mut meta = before.clone();
        edit(&mut meta);
        meta.id = scene_id.to_string();

        let (Value::Object(old), Value::Object(new)) = (serde_json::to_value(&before)?, serde_json::to_value(&meta)?)
        else {
            return Ok(());
        };
        let fields: JsonMap<String, Value> = new.into_iter().filter(|(key, value)| old.get(key) != Some(value)).collect();
        if fields.is_empty() {
            return Ok(());
        }
        self.write(DocumentChange::ScenesList, |txn| {
            let (_, entry) = find_entry(&*txn, &self.scenes_list, scene_id)
                .ok_or_else(|| SyncError::SceneNotFound(scene_id.to_string()))?;
            Ok(((), merge_object(txn, &entry, &fields, false)))
        })
    }

    pub fn remove_scene(&self, scene_id: &str) -> SyncResult<bool> {
        self.require_scenes_list()?;
        self.write(DocumentChange::ScenesList, |txn| {
            match find_entry(&*txn, &self.scenes_list, scene_id) {
                Some((index, _)) => {
                    self.scenes_list.remove(txn, index);
                    Ok((true, true))
                }
                None => Ok((false, false)),
            }
        })
    }

    /// Reorder the registry so `ordered_ids` come first, in that order, and
    /// rewrite every `order` field to match. Ids not listed keep their
    /// relative order after the listed ones.
    pub fn reorder_scenes(&self, ordered_ids: &[String]) -> SyncResult<()> {
        self.require_scenes_list()?;
        self.write(DocumentChange::ScenesList, |txn| {
            let current: Vec<Value> = self
                .scenes_list
                .iter(&*txn)
                .map(|item| out_to_json(&*txn, &item))
                .collect();

            let id_of = |value: &Value| value.get("id").and_then(Value::as_str).map(str::to_string);
            let mut reordered: Vec<Value> = Vec::with_capacity(current.len());
            for id in ordered_ids {
                if let Some(entry) = current.iter().find(|v| id_of(v).as_deref() == Some(id.as_str())) {
                    if !reordered.iter().any(|v| id_of(v).as_deref() == Some(id.as_str())) {
                        reordered.push(entry.clone());
                    }
                }
            }
            for entry in &current {
                let listed = id_of(entry).is_some_and(|id| ordered_ids.contains(&id));
                if !listed {
                    reordered.push(entry.clone());
                }
            }
            for (index, entry) in reordered.iter_mut().enumerate() {
                if let Value::Object(fields) = entry {
                    fields.insert("order".to_string(), Value::from(index));
                }
            }
            if reordered == current {
                return Ok(((), false));
            }

            let len = self.scenes_list.len(&*txn);
            self.scenes_list.remove_range(txn, 0, len);
            for entry in &reordered {
                push_value(txn, &self.scenes_list, entry);
            }
            Ok(((), true))
        })
    }

    // ───────────────────────────────────────────────────────────────
    // Scene data
    // ───────────────────────────────────────────────────────────────

    pub fn scene_data(&self, scene_id: &str) -> SyncResult<SceneData> {
        let json = self.read(|txn| self.scene_map(txn, scene_id).map(|scene| map_to_json(txn, &scene)))??;
        Ok(self.parse_scene(scene_id, &json))
    }

    pub fn stage_props(&self, scene_id: &str) -> SyncResult<Value> {
        self.read(|txn| {
            let scene = self.scene_map(txn, scene_id)?;
            Ok(get_map(txn, &scene, STAGE_PROPS).map_or_else(|| Value::Object(JsonMap::new()), |m| map_to_json(txn, &m)))
        })?
    }

    /// Write a complete stage-props tree. Only leaves that differ from the
    /// replicated tree are touched; keys absent from `tree` are removed.
    ///
    /// Returns whether anything changed.
    pub fn update_scene_stage_props(&self, scene_id: &str, tree: &Value) -> SyncResult<bool> {
        let Value::Object(entries) = tree else {
            return Err(SyncError::InvalidPath(vec![STAGE_PROPS.to_string()]));
        };
        self.write(DocumentChange::Scene(scene_id.to_string()), |txn| {
            let scene = self.scene_map(&*txn, scene_id)?;
            let props = get_or_create_map(txn, &scene, STAGE_PROPS);
            let changed = merge_object(txn, &props, entries, true);
            Ok((changed, changed))
        })
    }

    fn parse_scene(&self, scene_id: &str, json: &Value) -> SceneData {
        let markers = json
            .get(MARKERS)
            .and_then(Value::as_array)
            .map(|items| self.parse_markers(scene_id, items))
            .unwrap_or_default();

        let local_states = json
            .get(LOCAL_STATES)
            .and_then(Value::as_object)
            .map(|states| {
                states
                    .iter()
                    .filter_map(|(client, value)| {
                        serde_json::from_value::<Viewport>(value.clone())
                            .ok()
                            .map(|v| (client.clone(), v))
                    })
                    .collect()
            })
            .unwrap_or_default();

        SceneData {
            stage_props: json.get(STAGE_PROPS).cloned().unwrap_or_else(|| Value::Object(JsonMap::new())),
            markers,
            local_states,
            last_saved_at: json.get(LAST_SAVED_AT).map_or(0, number_as_i64),
            save_in_progress: json.get(SAVE_IN_PROGRESS).and_then(Value::as_bool).unwrap_or(false),
            active_saver: json.get(ACTIVE_SAVER).and_then(Value::as_str).map(str::to_string),
            save_started_at: json.get(SAVE_STARTED_AT).map_or(0, number_as_i64),
        }
    }

    fn parse_markers(&self, scene_id: &str, items: &[Value]) -> Vec<Marker> {
        let mut seen = HashSet::new();
        items
            .iter()
            .filter_map(|item| match serde_json::from_value::<Marker>(item.clone()) {
                Ok(marker) => Some(marker),
                Err(e) => {
                    log::warn!("Skipping malformed marker in scene {scene_id}: {e}");
                    None
                }
            })
            .filter(|marker| seen.insert(marker.id.clone()))
            .collect()
    }

    // ───────────────────────────────────────────────────────────────
    // Markers
    // ───────────────────────────────────────────────────────────────

    pub fn markers(&self, scene_id: &str) -> SyncResult<Vec<Marker>> {
        let items = self.read(|txn| -> SyncResult<Vec<Value>> {
            let scene = self.scene_map(txn, scene_id)?;
            Ok(get_array(txn, &scene, MARKERS)
                .map(|array| array.iter(txn).map(|item| out_to_json(txn, &item)).collect())
                .unwrap_or_default())
        })??;
        Ok(self.parse_markers(scene_id, &items))
    }

    /// Create the marker or update the fields that differ.
    pub fn upsert_marker(&self, scene_id: &str, marker: &Marker) -> SyncResult<bool> {
        let Value::Object(fields) = serde_json::to_value(marker)? else {
            return Ok(false);
        };
        self.write(DocumentChange::Scene(scene_id.to_string()), |txn| {
            let scene = self.scene_map(&*txn, scene_id)?;
            let markers = get_or_create_array(txn, &scene, MARKERS);
            let changed = upsert_entry(txn, &markers, &marker.id, &fields);
            Ok((changed, changed))
        })
    }

    pub fn remove_marker(&self, scene_id: &str, marker_id: &str) -> SyncResult<bool> {
        self.write(DocumentChange::Scene(scene_id.to_string()), |txn| {
            let scene = self.scene_map(&*txn, scene_id)?;
            let Some(markers) = get_array(&*txn, &scene, MARKERS) else {
                return Ok((false, false));
            };
            match find_entry(&*txn, &markers, marker_id) {
                Some((index, _)) => {
                    markers.remove(txn, index);
                    Ok((true, true))
                }
                None => Ok((false, false)),
            }
        })
    }

    /// Make the replicated marker list equal `markers`, by id: missing
    /// markers are removed, others are upserted field by field.
    pub fn replace_markers(&self, scene_id: &str, markers: &[Marker]) -> SyncResult<bool> {
        let entries = serialize_markers(markers)?;
        self.write(DocumentChange::Scene(scene_id.to_string()), |txn| {
            let scene = self.scene_map(&*txn, scene_id)?;
            let array = get_or_create_array(txn, &scene, MARKERS);
            let changed = replace_entries(txn, &array, &entries);
            Ok((changed, changed))
        })
    }

    // ───────────────────────────────────────────────────────────────
    // Viewports and cursors
    // ───────────────────────────────────────────────────────────────

    /// Store this client's viewport for `scene_id`.
    pub fn set_local_state(&self, scene_id: &str, viewport: &Viewport) -> SyncResult<()> {
        let value = serde_json::to_value(viewport)?;
        let key = self.client_id.to_string();
        self.write(DocumentChange::Scene(scene_id.to_string()), |txn| {
            let scene = self.scene_map(&*txn, scene_id)?;
            let states = get_or_create_map(txn, &scene, LOCAL_STATES);
            let changed = merge_value(txn, &states, &key, &value);
            Ok(((), changed))
        })
    }

    pub fn local_state(&self, scene_id: &str) -> SyncResult<Option<Viewport>> {
        Ok(self
            .scene_data(scene_id)?
            .local_states
            .remove(&self.client_id.to_string()))
    }

    pub fn update_cursor(&self, cursor: &CursorData) -> SyncResult<()> {
        let value = serde_json::to_value(cursor)?;
        let key = self.client_id.to_string();
        self.write(DocumentChange::Cursors, |txn| {
            let changed = merge_value(txn, &self.cursors, &key, &value);
            Ok(((), changed))
        })
    }

    /// Every peer's cursor. The local client's own entry is excluded.
    pub fn cursors(&self) -> SyncResult<HashMap<ClientId, CursorData>> {
        let raw = self.read(|txn| {
            self.cursors
                .iter(txn)
                .map(|(key, value)| (key.to_string(), out_to_json(txn, &value)))
                .collect::<Vec<_>>()
        })?;
        Ok(raw
            .into_iter()
            .filter_map(|(key, value)| {
                let client = key.parse::<ClientId>().ok()?;
                if client == self.client_id {
                    return None;
                }
                serde_json::from_value::<CursorData>(value).ok().map(|c| (client, c))
            })
            .collect())
    }

    /// Forget a departed peer: its cursor and awareness entries.
    pub fn remove_peer(&self, client_id: &ClientId) -> SyncResult<()> {
        let key = client_id.to_string();
        self.write(DocumentChange::Cursors, |txn| {
            let removed = self.cursors.remove(txn, &key).is_some();
            Ok(((), removed))
        })?;
        if self.lock_awareness().remove(client_id) {
            self.notify(&DocumentChange::Awareness);
        }
        Ok(())
    }

    /// Drop peers' cursors whose `lastMoveTime` is older than `max_age_ms`.
    pub fn prune_stale_cursors(&self, now: i64, max_age_ms: i64) -> SyncResult<Vec<ClientId>> {
        let stale: Vec<ClientId> = self
            .cursors()?
            .into_iter()
            .filter(|(_, cursor)| now.saturating_sub(cursor.last_move_time) > max_age_ms)
            .map(|(client, _)| client)
            .collect();
        if stale.is_empty() {
            return Ok(stale);
        }
        self.write(DocumentChange::Cursors, |txn| {
            for client in &stale {
                self.cursors.remove(txn, &client.to_string());
            }
            Ok(((), true))
        })?;
        log::debug!("Pruned {} stale cursor(s) in room {}", stale.len(), self.room);
        Ok(stale)
    }

    // ───────────────────────────────────────────────────────────────
    // Save coordination primitives
    // ───────────────────────────────────────────────────────────────

    /// Claim the active-saver role for `scene_id`.
    ///
    /// A claim held by another client blocks unless it started more than
    /// `lease_ms` ago (`None` means claims never expire).
    pub fn try_claim_saver(&self, scene_id: &str, now: i64, lease_ms: Option<i64>) -> SyncResult<SaverClaim> {
        let me = self.client_id.to_string();
        self.write(DocumentChange::Scene(scene_id.to_string()), |txn| {
            let scene = self.scene_map(&*txn, scene_id)?;
            if let Some(holder) = read_string(&*txn, &scene, ACTIVE_SAVER).filter(|h| *h != me) {
                let started = read_i64(&*txn, &scene, SAVE_STARTED_AT);
                let expired = lease_ms.is_some_and(|lease| now.saturating_sub(started) >= lease);
                if !expired {
                    return Ok((SaverClaim::HeldBy(holder), false));
                }
                log::warn!("Taking over expired saver claim of {holder} on scene {scene_id}");
            }
            scene.insert(txn, SAVE_IN_PROGRESS, true);
            scene.insert(txn, ACTIVE_SAVER, me.as_str());
            scene.insert(txn, SAVE_STARTED_AT, Any::BigInt(now));
            Ok((SaverClaim::Acquired, true))
        })
    }

    /// Clear this client's claim. A claim owned by someone else is left
    /// alone. On success `lastSavedAt` becomes `now`.
    pub fn release_saver(&self, scene_id: &str, success: bool, now: i64) -> SyncResult<bool> {
        let me = self.client_id.to_string();
        self.write(DocumentChange::Scene(scene_id.to_string()), |txn| {
            let scene = self.scene_map(&*txn, scene_id)?;
            if read_string(&*txn, &scene, ACTIVE_SAVER).as_deref() != Some(me.as_str()) {
                return Ok((false, false));
            }
            scene.insert(txn, SAVE_IN_PROGRESS, false);
            scene.remove(txn, ACTIVE_SAVER);
            scene.insert(txn, SAVE_STARTED_AT, Any::BigInt(0));
            if success {
                scene.insert(txn, LAST_SAVED_AT, Any::BigInt(now));
            }
            Ok((true, true))
        })
    }

    pub fn active_saver(&self, scene_id: &str) -> SyncResult<Option<String>> {
        self.read(|txn| {
            let scene = self.scene_map(txn, scene_id)?;
            Ok(read_string(txn, &scene, ACTIVE_SAVER))
        })?
    }

    pub fn last_saved_at(&self, scene_id: &str) -> SyncResult<i64> {
        self.read(|txn| {
            let scene = self.scene_map(txn, scene_id)?;
            Ok(read_i64(txn, &scene, LAST_SAVED_AT))
        })?
    }

    /// Replace a scene's replicated content with what the durable store
    /// holds, creating the scene if needed.
    pub fn apply_durable_scene(
        &self,
        scene_id: &str,
        stage_props: &Value,
        markers: &[Marker],
        saved_at: i64,
    ) -> SyncResult<()> {
        let Value::Object(props) = stage_props else {
            return Err(SyncError::InvalidPath(vec![STAGE_PROPS.to_string()]));
        };
        let entries = serialize_markers(markers)?;
        self.write(DocumentChange::Scene(scene_id.to_string()), |txn| {
            let scene = match get_map(&*txn, &self.scenes, scene_id) {
                Some(scene) => scene,
                None => create_scene(txn, &self.scenes, scene_id, stage_props),
            };
            let props_map = get_or_create_map(txn, &scene, STAGE_PROPS);
            merge_object(txn, &props_map, props, true);
            let array = get_or_create_array(txn, &scene, MARKERS);
            replace_entries(txn, &array, &entries);
            scene.insert(txn, LAST_SAVED_AT, Any::BigInt(saved_at));
            Ok(((), true))
        })
    }

    // ───────────────────────────────────────────────────────────────
    // Awareness
    // ───────────────────────────────────────────────────────────────

    fn lock_awareness(&self) -> MutexGuard<'_, Awareness> {
        self.awareness.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn local_awareness(&self) -> SyncResult<AwarenessState> {
        self.ensure_alive()?;
        Ok(self.lock_awareness().local_state().clone())
    }

    pub fn peer_awareness(&self) -> SyncResult<Vec<(ClientId, AwarenessState)>> {
        self.ensure_alive()?;
        Ok(self
            .lock_awareness()
            .peers()
            .map(|(id, state)| (*id, state.clone()))
            .collect())
    }

    /// Mutate the local awareness state and broadcast it.
    pub fn update_awareness<F>(&self, f: F) -> SyncResult<()>
    where
        F: FnOnce(&mut AwarenessState),
    {
        self.ensure_alive()?;
        let message = self.lock_awareness().update_local(f);
        self.provider.publish_awareness(self.client_id, message);
        self.notify(&DocumentChange::Awareness);
        Ok(())
    }

    /// The local state as it stands, for re-announcing after a reconnect.
    pub fn awareness_snapshot(&self) -> SyncResult<AwarenessMessage> {
        self.ensure_alive()?;
        Ok(self.lock_awareness().snapshot())
    }

    /// Apply a peer's awareness message. Stale or self-originated messages
    /// are ignored.
    pub fn apply_awareness(&self, message: &AwarenessMessage) {
        if self.is_destroyed() {
            return;
        }
        let changed = self.lock_awareness().handle_message(message);
        if changed {
            self.notify(&DocumentChange::Awareness);
        }
    }

    // ───────────────────────────────────────────────────────────────
    // Sync plumbing
    // ───────────────────────────────────────────────────────────────

    /// Apply a yrs v1 update from a peer. A malformed update is rejected
    /// before anything is applied.
    pub fn apply_remote_update(&self, update: &[u8]) -> SyncResult<()> {
        self.ensure_alive()?;
        let update = Update::decode_v1(update).map_err(|e| SyncError::Crdt(e.to_string()))?;
        {
            let _guard = self.lock_txn();
            let mut txn = self.doc.transact_mut();
            txn.apply_update(update).map_err(|e| SyncError::Crdt(e.to_string()))?;
        }
        self.notify(&DocumentChange::Remote);
        Ok(())
    }

    pub fn state_vector(&self) -> SyncResult<Vec<u8>> {
        self.read(|txn| txn.state_vector().encode_v1())
    }

    /// Everything this replica has that `state_vector` lacks.
    pub fn encode_diff(&self, state_vector: &[u8]) -> SyncResult<Vec<u8>> {
        let sv = StateVector::decode_v1(state_vector).map_err(|e| SyncError::Crdt(e.to_string()))?;
        self.read(|txn| txn.encode_state_as_update_v1(&sv))
    }

    pub fn encode_state(&self) -> SyncResult<Vec<u8>> {
        self.read(|txn| txn.encode_state_as_update_v1(&StateVector::default()))
    }

    // ───────────────────────────────────────────────────────────────
    // Lifecycle
    // ───────────────────────────────────────────────────────────────

    /// Register `callback` for every change: local commits, remote
    /// updates and awareness.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&DocumentChange) + Send + Sync + 'static,
    {
        let id = self.subscribers.next_id.fetch_add(1, Ordering::SeqCst);
        self.subscribers.lock().push((id, Arc::new(callback)));
        Subscription {
            id,
            subscribers: Arc::downgrade(&self.subscribers),
        }
    }

    /// Leave the room: withdraw this client's cursor and awareness, close
    /// the provider, and refuse every later call. Idempotent.
    pub fn destroy(&self) {
        if self.is_destroyed() {
            return;
        }
        let key = self.client_id.to_string();
        if let Err(e) = self.write(DocumentChange::Cursors, |txn| {
            Ok(((), self.cursors.remove(txn, &key).is_some()))
        }) {
            log::debug!("Cursor cleanup on destroy skipped: {e}");
        }
        let leave = self.lock_awareness().leave_message();
        self.provider.publish_awareness(self.client_id, leave);

        self.destroyed.store(true, Ordering::SeqCst);
        self.provider.close(self.client_id);
        self.subscribers.lock().clear();
        log::info!("Destroyed shared document for room {} (client {})", self.room, self.client_id);
    }
}

impl Drop for SharedDocument {
    fn drop(&mut self) {
        if !self.is_destroyed() {
            self.destroyed.store(true, Ordering::SeqCst);
            self.provider.close(self.client_id);
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Helpers over yrs values
// ───────────────────────────────────────────────────────────────────

fn create_scene(txn: &mut TransactionMut, scenes: &MapRef, scene_id: &str, stage_props: &Value) -> MapRef {
    let scene = scenes.insert(txn, scene_id, MapPrelim::default());
    insert_value(txn, &scene, STAGE_PROPS, stage_props);
    insert_value(txn, &scene, MARKERS, &Value::Array(Vec::new()));
    insert_value(txn, &scene, LOCAL_STATES, &Value::Object(JsonMap::new()));
    scene.insert(txn, LAST_SAVED_AT, Any::BigInt(0));
    scene.insert(txn, SAVE_IN_PROGRESS, false);
    scene
}

fn serialize_markers(markers: &[Marker]) -> SyncResult<Vec<(String, JsonMap<String, Value>)>> {
    markers
        .iter()
        .map(|marker| match serde_json::to_value(marker)? {
            Value::Object(fields) => Ok((marker.id.clone(), fields)),
            _ => Ok((marker.id.clone(), JsonMap::new())),
        })
        .collect()
}

fn entry_id<T: ReadTxn>(txn: &T, entry: &MapRef) -> Option<String> {
    match entry.get(txn, "id") {
        Some(Out::Any(Any::String(id))) => Some(id.to_string()),
        _ => None,
    }
}

/// Index and map of the array entry whose `id` field equals `id`.
fn find_entry<T: ReadTxn>(txn: &T, array: &ArrayRef, id: &str) -> Option<(u32, MapRef)> {
    array.iter(txn).enumerate().find_map(|(index, item)| match item {
        Out::YMap(entry) if entry_id(txn, &entry).as_deref() == Some(id) => {
            u32::try_from(index).ok().map(|i| (i, entry))
        }
        _ => None,
    })
}

fn upsert_entry(txn: &mut TransactionMut, array: &ArrayRef, id: &str, fields: &JsonMap<String, Value>) -> bool {
    match find_entry(&*txn, array, id) {
        Some((_, entry)) => merge_object(txn, &entry, fields, true),
        None => {
            push_value(txn, array, &Value::Object(fields.clone()));
            true
        }
    }
}

fn replace_entries(txn: &mut TransactionMut, array: &ArrayRef, entries: &[(String, JsonMap<String, Value>)]) -> bool {
    let keep: HashSet<&str> = entries.iter().map(|(id, _)| id.as_str()).collect();
    let doomed: Vec<u32> = array
        .iter(&*txn)
        .enumerate()
        .filter(|(_, item)| match item {
            Out::YMap(entry) => !entry_id(&*txn, entry).is_some_and(|id| keep.contains(id.as_str())),
            _ => true,
        })
        .filter_map(|(index, _)| u32::try_from(index).ok())
        .collect();

    let mut changed = !doomed.is_empty();
    for index in doomed.into_iter().rev() {
        array.remove(txn, index);
    }
    for (id, fields) in entries {
        changed |= upsert_entry(txn, array, id, fields);
    }
    changed
}

fn read_string<T: ReadTxn>(txn: &T, map: &MapRef, key: &str) -> Option<String> {
    match map.get(txn, key) {
        Some(Out::Any(Any::String(s))) => Some(s.to_string()),
        _ => None,
    }
}

fn read_i64<T: ReadTxn>(txn: &T, map: &MapRef, key: &str) -> i64 {
    match map.get(txn, key) {
        Some(Out::Any(Any::BigInt(n))) => n,
        Some(Out::Any(Any::Number(n))) => n as i64,
        _ => 0,
    }
}

fn number_as_i64(value: &Value) -> i64 {
    value
        .as_i64()
        .or_else(|| value.as_f64().map(|f| f as i64))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{default_stage_props, Point};
    use crate::provider::MemoryHub;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use uuid::Uuid;

    fn scene(id: &str, order: i64) -> SceneMetadata {
        SceneMetadata {
            id: id.into(),
            name: format!("Scene {id}"),
            order,
            map_location: None,
            game_session_id: "gs-1".into(),
        }
    }

    fn pair() -> (Arc<MemoryHub>, Arc<SharedDocument>, Arc<SharedDocument>) {
        let hub = MemoryHub::new();
        let a = hub.join("party", Uuid::new_v4());
        let b = hub.join("party", Uuid::new_v4());
        (hub, a, b)
    }

    #[test]
    fn test_party_state_requires_initialization() {
        let (_hub, a, _b) = pair();
        assert!(matches!(a.party_state(), Err(SyncError::NotInitialized(PARTY_STATE))));
        assert!(matches!(a.set_paused(true), Err(SyncError::NotInitialized(_))));
    }

    #[test]
    fn test_initialize_party_state_does_not_clobber_peer() {
        let (_hub, a, b) = pair();
        a.initialize_party_state(&PartyState {
            is_paused: true,
            active_game_session_id: "gs-a".into(),
            active_scene_id: Some("s1".into()),
        })
        .unwrap();
        b.initialize_party_state(&PartyState::default()).unwrap();

        let state = b.party_state().unwrap();
        assert!(state.is_paused);
        assert_eq!(state.active_game_session_id, "gs-a");
        assert_eq!(state.active_scene_id.as_deref(), Some("s1"));
    }

    #[test]
    fn test_set_active_scene_clears_with_none() {
        let (_hub, a, _b) = pair();
        a.initialize_party_state(&PartyState::default()).unwrap();
        a.set_active_scene(Some("s2")).unwrap();
        assert_eq!(a.party_state().unwrap().active_scene_id.as_deref(), Some("s2"));
        a.set_active_scene(None).unwrap();
        assert_eq!(a.party_state().unwrap().active_scene_id, None);
    }

    #[test]
    fn test_scene_registry_operations() {
        let (_hub, a, b) = pair();
        a.initialize_scenes_list(&[scene("s1", 0), scene("s2", 1)]).unwrap();
        b.initialize_scenes_list(&[scene("other", 0)]).unwrap();

        a.add_scene(&scene("s3", 2)).unwrap();
        b.update_scene("s1", |meta| meta.name = "Tavern".into()).unwrap();
        assert!(a.remove_scene("s2").unwrap());
        assert!(!a.remove_scene("s2").unwrap());

        let ids: Vec<String> = b.scenes_list().unwrap().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["s1", "s3"]);
        assert_eq!(a.scenes_list().unwrap()[0].name, "Tavern");
    }

    #[test]
    fn test_update_scene_callback_can_use_document() {
        let (_hub, a, b) = pair();
        a.initialize_scenes_list(&[scene("s1", 0), scene("s2", 1)]).unwrap();

        let doc = Arc::clone(&a);
        a.update_scene("s2", |meta| {
            let count = doc.scenes_list().unwrap().len();
            meta.name = format!("Scene {count}");
            doc.add_scene(&scene("s3", 2)).unwrap();
        })
        .unwrap();

        let scenes = b.scenes_list().unwrap();
        let ids: Vec<&str> = scenes.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["s1", "s2", "s3"]);
        assert_eq!(scenes[1].name, "Scene 2");
    }

    #[test]
    fn test_reorder_scenes_rewrites_order() {
        let (_hub, a, b) = pair();
        a.initialize_scenes_list(&[scene("s1", 0), scene("s2", 1), scene("s3", 2)]).unwrap();
        b.initialize_scenes_list(&[]).unwrap();

        a.reorder_scenes(&["s3".to_string(), "s1".to_string()]).unwrap();

        let scenes = b.scenes_list().unwrap();
        let ids: Vec<&str> = scenes.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["s3", "s1", "s2"]);
        let orders: Vec<i64> = scenes.iter().map(|s| s.order).collect();
        assert_eq!(orders, vec![0, 1, 2]);
    }

    #[test]
    fn test_reorder_is_one_update() {
        let (_hub, a, b) = pair();
        a.initialize_scenes_list(&[scene("s1", 0), scene("s2", 1)]).unwrap();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let _sub = b.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        a.reorder_scenes(&["s2".to_string()]).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_update_unknown_scene_is_not_found() {
        let (_hub, a, _b) = pair();
        a.initialize_scenes_list(&[]).unwrap();
        assert!(matches!(
            a.update_scene("missing", |_| {}),
            Err(SyncError::SceneNotFound(_))
        ));
        assert!(matches!(
            a.update_scene_stage_props("missing", &json!({})),
            Err(SyncError::SceneNotFound(_))
        ));
    }

    #[test]
    fn test_initialize_scene_data_is_idempotent() {
        let (_hub, a, b) = pair();
        a.initialize_scene_data("s1", &json!({ "grid": { "size": 70 } })).unwrap();
        b.initialize_scene_data("s1", &default_stage_props()).unwrap();

        assert_eq!(b.stage_props("s1").unwrap(), json!({ "grid": { "size": 70 } }));
        let data = a.scene_data("s1").unwrap();
        assert_eq!(data.last_saved_at, 0);
        assert!(!data.save_in_progress);
        assert!(data.markers.is_empty());
    }

    #[test]
    fn test_stage_props_write_touches_only_changed_leaves() {
        let (_hub, a, b) = pair();
        a.initialize_scene_data("s1", &default_stage_props()).unwrap();

        let mut left = a.stage_props("s1").unwrap();
        left["grid"]["size"] = json!(80);
        assert!(a.update_scene_stage_props("s1", &left).unwrap());

        let mut latest = b.stage_props("s1").unwrap();
        latest["fogOfWar"]["opacity"] = json!(0.4);
        assert!(b.update_scene_stage_props("s1", &latest).unwrap());

        let merged = a.stage_props("s1").unwrap();
        assert_eq!(merged["grid"]["size"], 80);
        assert_eq!(merged["fogOfWar"]["opacity"], 0.4);
    }

    #[test]
    fn test_concurrent_disjoint_writes_both_survive() {
        let (hub, a, b) = pair();
        a.initialize_scene_data("s1", &default_stage_props()).unwrap();

        hub.disconnect(&a);
        let mut left = a.stage_props("s1").unwrap();
        let mut right = b.stage_props("s1").unwrap();
        left["grid"]["size"] = json!(80);
        right["fogOfWar"]["opacity"] = json!(0.4);
        a.update_scene_stage_props("s1", &left).unwrap();
        b.update_scene_stage_props("s1", &right).unwrap();
        hub.reconnect(&a);

        for doc in [&a, &b] {
            let merged = doc.stage_props("s1").unwrap();
            assert_eq!(merged["grid"]["size"], 80);
            assert_eq!(merged["fogOfWar"]["opacity"], 0.4);
        }
    }

    #[test]
    fn test_unchanged_stage_props_publish_nothing() {
        let (_hub, a, b) = pair();
        a.initialize_scene_data("s1", &default_stage_props()).unwrap();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let _sub = b.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(!a.update_scene_stage_props("s1", &default_stage_props()).unwrap());
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_marker_operations() {
        let (_hub, a, b) = pair();
        a.initialize_scene_data("s1", &default_stage_props()).unwrap();

        let mut goblin = Marker::new("m1", Point::new(1.0, 1.0));
        a.upsert_marker("s1", &goblin).unwrap();
        goblin.label = "Goblin".into();
        b.upsert_marker("s1", &goblin).unwrap();
        a.upsert_marker("s1", &Marker::new("m2", Point::new(5.0, 5.0))).unwrap();

        let markers = b.markers("s1").unwrap();
        assert_eq!(markers.len(), 2);
        assert_eq!(markers[0].label, "Goblin");

        assert!(b.remove_marker("s1", "m1").unwrap());
        assert!(!b.remove_marker("s1", "m1").unwrap());
        assert_eq!(a.markers("s1").unwrap().len(), 1);
    }

    #[test]
    fn test_replace_markers_by_id() {
        let (_hub, a, _b) = pair();
        a.initialize_scene_data("s1", &default_stage_props()).unwrap();
        a.replace_markers("s1", &[Marker::new("m1", Point::new(0.0, 0.0)), Marker::new("m2", Point::new(1.0, 0.0))])
            .unwrap();

        let mut moved = Marker::new("m2", Point::new(9.0, 9.0));
        moved.title = "Chest".into();
        assert!(a.replace_markers("s1", &[moved.clone(), Marker::new("m3", Point::new(2.0, 2.0))]).unwrap());

        let ids: Vec<String> = a.markers("s1").unwrap().into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec!["m2", "m3"]);
        assert_eq!(a.markers("s1").unwrap()[0], moved);
    }

    #[test]
    fn test_cursors_exclude_self_and_prune() {
        let (_hub, a, b) = pair();
        let cursor = |t| CursorData {
            user_id: "u".into(),
            position: Point::new(1.0, 2.0),
            normalized_position: Point::new(0.1, 0.2),
            last_move_time: t,
        };
        a.update_cursor(&cursor(1_000)).unwrap();
        b.update_cursor(&cursor(9_000)).unwrap();

        let seen_by_a = a.cursors().unwrap();
        assert_eq!(seen_by_a.len(), 1);
        assert!(seen_by_a.contains_key(&b.client_id()));

        let pruned = b.prune_stale_cursors(10_000, 5_000).unwrap();
        assert_eq!(pruned, vec![a.client_id()]);
        assert!(b.cursors().unwrap().is_empty());
    }

    #[test]
    fn test_destroy_removes_cursor_and_blocks_calls() {
        let (_hub, a, b) = pair();
        a.update_cursor(&CursorData {
            user_id: "u".into(),
            position: Point::default(),
            normalized_position: Point::default(),
            last_move_time: 1,
        })
        .unwrap();
        assert_eq!(b.cursors().unwrap().len(), 1);

        a.destroy();
        assert!(b.cursors().unwrap().is_empty());
        assert!(matches!(a.state_vector(), Err(SyncError::Destroyed(_))));
        a.destroy();
    }

    #[test]
    fn test_local_state_per_client() {
        let (_hub, a, b) = pair();
        a.initialize_scene_data("s1", &default_stage_props()).unwrap();
        let view = Viewport {
            offset: Point::new(10.0, -4.0),
            zoom: 2.0,
            rotation: 0.0,
        };
        a.set_local_state("s1", &view).unwrap();

        assert_eq!(a.local_state("s1").unwrap(), Some(view));
        assert_eq!(b.local_state("s1").unwrap(), None);
        assert_eq!(b.scene_data("s1").unwrap().local_states.len(), 1);
    }

    #[test]
    fn test_saver_claim_is_exclusive() {
        let (_hub, a, b) = pair();
        a.initialize_scene_data("s1", &default_stage_props()).unwrap();

        assert_eq!(a.try_claim_saver("s1", 100, None).unwrap(), SaverClaim::Acquired);
        assert_eq!(
            b.try_claim_saver("s1", 101, None).unwrap(),
            SaverClaim::HeldBy(a.client_id().to_string())
        );
        assert!(!b.release_saver("s1", true, 102).unwrap());

        assert!(a.release_saver("s1", true, 200).unwrap());
        let data = b.scene_data("s1").unwrap();
        assert_eq!(data.active_saver, None);
        assert!(!data.save_in_progress);
        assert_eq!(data.last_saved_at, 200);
    }

    #[test]
    fn test_expired_saver_claim_can_be_taken_over() {
        let (_hub, a, b) = pair();
        a.initialize_scene_data("s1", &default_stage_props()).unwrap();
        a.try_claim_saver("s1", 1_000, Some(30_000)).unwrap();

        assert!(matches!(b.try_claim_saver("s1", 20_000, Some(30_000)).unwrap(), SaverClaim::HeldBy(_)));
        assert_eq!(b.try_claim_saver("s1", 31_000, Some(30_000)).unwrap(), SaverClaim::Acquired);
        assert_eq!(a.active_saver("s1").unwrap(), Some(b.client_id().to_string()));
    }

    #[test]
    fn test_failed_release_keeps_last_saved_at() {
        let (_hub, a, _b) = pair();
        a.initialize_scene_data("s1", &default_stage_props()).unwrap();
        a.try_claim_saver("s1", 10, None).unwrap();
        a.release_saver("s1", false, 20).unwrap();
        assert_eq!(a.last_saved_at("s1").unwrap(), 0);
    }

    #[test]
    fn test_apply_durable_scene() {
        let (_hub, a, b) = pair();
        a.apply_durable_scene("s9", &json!({ "grid": { "size": 40 } }), &[Marker::new("m1", Point::new(3.0, 4.0))], 777)
            .unwrap();

        let data = b.scene_data("s9").unwrap();
        assert_eq!(data.stage_props, json!({ "grid": { "size": 40 } }));
        assert_eq!(data.markers.len(), 1);
        assert_eq!(data.last_saved_at, 777);
    }

    #[test]
    fn test_malformed_remote_update_is_rejected() {
        let (_hub, a, _b) = pair();
        a.initialize_scene_data("s1", &default_stage_props()).unwrap();
        let before = a.encode_state().unwrap();
        assert!(matches!(a.apply_remote_update(&[0xFF, 0xFF, 0xFF]), Err(SyncError::Crdt(_))));
        assert_eq!(a.encode_state().unwrap(), before);
    }

    #[test]
    fn test_unsubscribe_stops_notifications() {
        let (_hub, a, _b) = pair();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let sub = a.subscribe(move |change| {
            if *change == DocumentChange::Scene("s1".into()) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        a.initialize_scene_data("s1", &default_stage_props()).unwrap();
        sub.unsubscribe();
        a.upsert_marker("s1", &Marker::new("m1", Point::default())).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_state_vector_diff_sync() {
        let hub_a = MemoryHub::new();
        let hub_b = MemoryHub::new();
        let a = hub_a.join("party", Uuid::new_v4());
        let b = hub_b.join("party", Uuid::new_v4());
        a.initialize_scene_data("s1", &default_stage_props()).unwrap();

        let diff = a.encode_diff(&b.state_vector().unwrap()).unwrap();
        b.apply_remote_update(&diff).unwrap();
        assert!(b.has_scene("s1").unwrap());
    }
}
