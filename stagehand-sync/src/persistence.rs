//! The durable store, seen through the HTTP API of the main application.
//!
//! Endpoints (relative to the configured base URL):
//!
//! ```text
//! POST   /api/fog-mask                          { sceneId, partyId, maskData: [u8] }
//! GET    /api/fog-mask?sceneId=…                → { maskData: base64 }
//! POST   /api/annotation-mask                   { annotationId, partyId, maskData: [u8] }
//! GET    /api/annotation-mask?annotationId=…    → { maskData: base64 }
//! GET    /api/scenes/{id}                       → SceneRecord
//! PUT    /api/scenes/{id}/props                 { stageProps }
//! POST   /api/scenes/{id}/markers               Marker
//! PUT    /api/scenes/{id}/markers/{markerId}    Marker
//! DELETE /api/scenes/{id}/markers/{markerId}
//! GET    /api/parties/{partyId}/scene-timestamps → { timestamps: { sceneId: epoch-ms } }
//! ```

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::config::SyncConfig;
use crate::mask::{Mask, MaskError};
use crate::model::{now_millis, Marker};

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{method} {url} returned {status}")]
    Status {
        method: &'static str,
        url: String,
        status: u16,
    },
    #[error("{0} not found")]
    NotFound(String),
    #[error(transparent)]
    Mask(#[from] MaskError),
}

/// A scene as the durable store holds it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SceneRecord {
    pub id: String,
    pub stage_props: Value,
    #[serde(default)]
    pub markers: Vec<Marker>,
    /// Epoch milliseconds of the last durable write.
    pub updated_at: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FogMaskBody<'a> {
    scene_id: &'a str,
    party_id: &'a str,
    mask_data: &'a [u8],
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AnnotationMaskBody<'a> {
    annotation_id: &'a str,
    party_id: &'a str,
    mask_data: &'a [u8],
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MaskResponse {
    mask_data: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PropsBody<'a> {
    stage_props: &'a Value,
}

#[derive(Debug, Deserialize)]
struct TimestampsResponse {
    timestamps: HashMap<String, i64>,
}

/// Operations the sync engine needs from the durable store.
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Store RLE-encoded fog bytes for a scene.
    async fn save_fog_mask(&self, scene_id: &str, party_id: &str, mask_data: &[u8]) -> Result<(), PersistenceError>;

    /// Stored fog mask as base64 text, if any.
    async fn load_fog_mask(&self, scene_id: &str) -> Result<Option<String>, PersistenceError>;

    async fn save_annotation_mask(
        &self,
        annotation_id: &str,
        party_id: &str,
        mask_data: &[u8],
    ) -> Result<(), PersistenceError>;

    async fn load_annotation_mask(&self, annotation_id: &str) -> Result<Option<String>, PersistenceError>;

    async fn load_scene(&self, scene_id: &str) -> Result<SceneRecord, PersistenceError>;

    async fn save_scene_props(&self, scene_id: &str, stage_props: &Value) -> Result<(), PersistenceError>;

    async fn create_marker(&self, scene_id: &str, marker: &Marker) -> Result<(), PersistenceError>;

    async fn update_marker(&self, scene_id: &str, marker: &Marker) -> Result<(), PersistenceError>;

    async fn delete_marker(&self, scene_id: &str, marker_id: &str) -> Result<(), PersistenceError>;

    /// `sceneId → last durable write` for every scene of the party.
    async fn scene_timestamps(&self, party_id: &str) -> Result<HashMap<String, i64>, PersistenceError>;
}

// ───────────────────────────────────────────────────────────────────
// Mask helpers
// ───────────────────────────────────────────────────────────────────

pub async fn store_fog_mask(
    store: &dyn Persistence,
    scene_id: &str,
    party_id: &str,
    mask: &Mask,
) -> Result<(), PersistenceError> {
    store.save_fog_mask(scene_id, party_id, &mask.encode()).await
}

/// Decode a stored fog mask. A missing mask is `Ok(None)`; corrupt data is
/// an error.
pub async fn load_fog_mask(
    store: &dyn Persistence,
    scene_id: &str,
    width: u32,
    height: u32,
) -> Result<Option<Mask>, PersistenceError> {
    match store.load_fog_mask(scene_id).await? {
        Some(text) => Ok(Some(Mask::from_stored(width, height, &text)?)),
        None => Ok(None),
    }
}

pub async fn store_annotation_mask(
    store: &dyn Persistence,
    annotation_id: &str,
    party_id: &str,
    mask: &Mask,
) -> Result<(), PersistenceError> {
    store.save_annotation_mask(annotation_id, party_id, &mask.encode()).await
}

pub async fn load_annotation_mask(
    store: &dyn Persistence,
    annotation_id: &str,
    width: u32,
    height: u32,
) -> Result<Option<Mask>, PersistenceError> {
    match store.load_annotation_mask(annotation_id).await? {
        Some(text) => Ok(Some(Mask::from_stored(width, height, &text)?)),
        None => Ok(None),
    }
}

// ───────────────────────────────────────────────────────────────────
// HTTP
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct HttpPersistence {
    client: Client,
    base_url: String,
}

impl HttpPersistence {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, PersistenceError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn from_config(config: &SyncConfig) -> Result<Self, PersistenceError> {
        Self::new(config.persistence_url.clone(), config.http_timeout())
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn check(method: &'static str, url: &str, status: StatusCode) -> Result<(), PersistenceError> {
        if status.is_success() {
            Ok(())
        } else {
            Err(PersistenceError::Status {
                method,
                url: url.to_string(),
                status: status.as_u16(),
            })
        }
    }

    async fn fetch_mask(&self, url: String, query: (&str, &str)) -> Result<Option<String>, PersistenceError> {
        let response = self.client.get(&url).query(&[query]).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Self::check("GET", &url, response.status())?;
        let body: MaskResponse = response.json().await?;
        Ok(body.mask_data.filter(|text| !text.is_empty()))
    }
}

#[async_trait]
impl Persistence for HttpPersistence {
    async fn save_fog_mask(&self, scene_id: &str, party_id: &str, mask_data: &[u8]) -> Result<(), PersistenceError> {
        let url = self.url("/api/fog-mask");
        let body = FogMaskBody {
            scene_id,
            party_id,
            mask_data,
        };
        let response = self.client.post(&url).json(&body).send().await?;
        Self::check("POST", &url, response.status())
    }

    async fn load_fog_mask(&self, scene_id: &str) -> Result<Option<String>, PersistenceError> {
        self.fetch_mask(self.url("/api/fog-mask"), ("sceneId", scene_id)).await
    }

    async fn save_annotation_mask(
        &self,
        annotation_id: &str,
        party_id: &str,
        mask_data: &[u8],
    ) -> Result<(), PersistenceError> {
        let url = self.url("/api/annotation-mask");
        let body = AnnotationMaskBody {
            annotation_id,
            party_id,
            mask_data,
        };
        let response = self.client.post(&url).json(&body).send().await?;
        Self::check("POST", &url, response.status())
    }

    async fn load_annotation_mask(&self, annotation_id: &str) -> Result<Option<String>, PersistenceError> {
        self.fetch_mask(self.url("/api/annotation-mask"), ("annotationId", annotation_id))
            .await
    }

    async fn load_scene(&self, scene_id: &str) -> Result<SceneRecord, PersistenceError> {
        let url = self.url(&format!("/api/scenes/{scene_id}"));
        let response = self.client.get(&url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(PersistenceError::NotFound(format!("scene {scene_id}")));
        }
        Self::check("GET", &url, response.status())?;
        Ok(response.json().await?)
    }

    async fn save_scene_props(&self, scene_id: &str, stage_props: &Value) -> Result<(), PersistenceError> {
        let url = self.url(&format!("/api/scenes/{scene_id}/props"));
        let response = self.client.put(&url).json(&PropsBody { stage_props }).send().await?;
        Self::check("PUT", &url, response.status())
    }

    async fn create_marker(&self, scene_id: &str, marker: &Marker) -> Result<(), PersistenceError> {
        let url = self.url(&format!("/api/scenes/{scene_id}/markers"));
        let response = self.client.post(&url).json(marker).send().await?;
        Self::check("POST", &url, response.status())
    }

    async fn update_marker(&self, scene_id: &str, marker: &Marker) -> Result<(), PersistenceError> {
        let url = self.url(&format!("/api/scenes/{scene_id}/markers/{}", marker.id));
        let response = self.client.put(&url).json(marker).send().await?;
        Self::check("PUT", &url, response.status())
    }

    async fn delete_marker(&self, scene_id: &str, marker_id: &str) -> Result<(), PersistenceError> {
        let url = self.url(&format!("/api/scenes/{scene_id}/markers/{marker_id}"));
        let response = self.client.delete(&url).send().await?;
        // Already gone is as good as deleted.
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Self::check("DELETE", &url, response.status())
    }

    async fn scene_timestamps(&self, party_id: &str) -> Result<HashMap<String, i64>, PersistenceError> {
        let url = self.url(&format!("/api/parties/{party_id}/scene-timestamps"));
        let response = self.client.get(&url).send().await?;
        Self::check("GET", &url, response.status())?;
        let body: TimestampsResponse = response.json().await?;
        Ok(body.timestamps)
    }
}

// ───────────────────────────────────────────────────────────────────
// In-memory store
// ───────────────────────────────────────────────────────────────────

#[derive(Default)]
struct MemoryState {
    fog: HashMap<String, String>,
    annotations: HashMap<String, String>,
    scenes: HashMap<String, SceneRecord>,
    scene_loads: usize,
    fail_writes: bool,
}

/// Process-local store with the same semantics as the HTTP API. Used for
/// offline tools and tests.
#[derive(Default)]
pub struct MemoryPersistence {
    state: Mutex<MemoryState>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert_scene(&self, record: SceneRecord) {
        self.lock().scenes.insert(record.id.clone(), record);
    }

    pub fn scene(&self, scene_id: &str) -> Option<SceneRecord> {
        self.lock().scenes.get(scene_id).cloned()
    }

    /// How many times `load_scene` was called.
    pub fn scene_loads(&self) -> usize {
        self.lock().scene_loads
    }

    /// Make every write fail with a 503, to exercise error paths.
    pub fn set_fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    fn write<F>(&self, what: &str, f: F) -> Result<(), PersistenceError>
    where
        F: FnOnce(&mut MemoryState) -> Result<(), PersistenceError>,
    {
        let mut state = self.lock();
        if state.fail_writes {
            return Err(PersistenceError::Status {
                method: "WRITE",
                url: what.to_string(),
                status: 503,
            });
        }
        f(&mut state)
    }

    fn scene_mut<'a>(state: &'a mut MemoryState, scene_id: &str) -> Result<&'a mut SceneRecord, PersistenceError> {
        state
            .scenes
            .get_mut(scene_id)
            .ok_or_else(|| PersistenceError::NotFound(format!("scene {scene_id}")))
    }
}

#[async_trait]
impl Persistence for MemoryPersistence {
    async fn save_fog_mask(&self, scene_id: &str, _party_id: &str, mask_data: &[u8]) -> Result<(), PersistenceError> {
        let text = crate::mask::to_base64(mask_data);
        self.write("fog-mask", |state| {
            state.fog.insert(scene_id.to_string(), text);
            Ok(())
        })
    }

    async fn load_fog_mask(&self, scene_id: &str) -> Result<Option<String>, PersistenceError> {
        Ok(self.lock().fog.get(scene_id).cloned())
    }

    async fn save_annotation_mask(
        &self,
        annotation_id: &str,
        _party_id: &str,
        mask_data: &[u8],
    ) -> Result<(), PersistenceError> {
        let text = crate::mask::to_base64(mask_data);
        self.write("annotation-mask", |state| {
            state.annotations.insert(annotation_id.to_string(), text);
            Ok(())
        })
    }

    async fn load_annotation_mask(&self, annotation_id: &str) -> Result<Option<String>, PersistenceError> {
        Ok(self.lock().annotations.get(annotation_id).cloned())
    }

    async fn load_scene(&self, scene_id: &str) -> Result<SceneRecord, PersistenceError> {
        let mut state = self.lock();
        state.scene_loads += 1;
        state
            .scenes
            .get(scene_id)
            .cloned()
            .ok_or_else(|| PersistenceError::NotFound(format!("scene {scene_id}")))
    }

    async fn save_scene_props(&self, scene_id: &str, stage_props: &Value) -> Result<(), PersistenceError> {
        self.write("scene-props", |state| {
            let record = state
                .scenes
                .entry(scene_id.to_string())
                .or_insert_with(|| SceneRecord {
                    id: scene_id.to_string(),
                    stage_props: Value::Null,
                    markers: Vec::new(),
                    updated_at: 0,
                });
            record.stage_props = stage_props.clone();
            record.updated_at = now_millis();
            Ok(())
        })
    }

    async fn create_marker(&self, scene_id: &str, marker: &Marker) -> Result<(), PersistenceError> {
        self.write("marker", |state| {
            let record = Self::scene_mut(state, scene_id)?;
            if record.markers.iter().any(|m| m.id == marker.id) {
                return Err(PersistenceError::Status {
                    method: "POST",
                    url: format!("/api/scenes/{scene_id}/markers"),
                    status: 409,
                });
            }
            record.markers.push(marker.clone());
            record.updated_at = now_millis();
            Ok(())
        })
    }

    async fn update_marker(&self, scene_id: &str, marker: &Marker) -> Result<(), PersistenceError> {
        self.write("marker", |state| {
            let record = Self::scene_mut(state, scene_id)?;
            match record.markers.iter_mut().find(|m| m.id == marker.id) {
                Some(existing) => *existing = marker.clone(),
                None => return Err(PersistenceError::NotFound(format!("marker {}", marker.id))),
            }
            record.updated_at = now_millis();
            Ok(())
        })
    }

    async fn delete_marker(&self, scene_id: &str, marker_id: &str) -> Result<(), PersistenceError> {
        self.write("marker", |state| {
            let record = Self::scene_mut(state, scene_id)?;
            record.markers.retain(|m| m.id != marker_id);
            record.updated_at = now_millis();
            Ok(())
        })
    }

    async fn scene_timestamps(&self, _party_id: &str) -> Result<HashMap<String, i64>, PersistenceError> {
        Ok(self
            .lock()
            .scenes
            .values()
            .map(|record| (record.id.clone(), record.updated_at))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Point;

    #[test]
    fn test_base_url_is_normalized() {
        let http = HttpPersistence::new("http://api.local/", Duration::from_secs(1)).unwrap();
        assert_eq!(http.url("/api/fog-mask"), "http://api.local/api/fog-mask");
    }

    #[test]
    fn test_mask_body_shape() {
        let body = FogMaskBody {
            scene_id: "s1",
            party_id: "p1",
            mask_data: &[0, 3, 7],
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json, serde_json::json!({ "sceneId": "s1", "partyId": "p1", "maskData": [0, 3, 7] }));
    }

    #[test]
    fn test_scene_record_parses_camel_case() {
        let record: SceneRecord = serde_json::from_value(serde_json::json!({
            "id": "s1",
            "stageProps": { "grid": { "size": 50 } },
            "updatedAt": 1700000000000i64
        }))
        .unwrap();
        assert!(record.markers.is_empty());
        assert_eq!(record.updated_at, 1_700_000_000_000);
    }

    #[tokio::test]
    async fn test_fog_mask_roundtrip_through_store() {
        let store = MemoryPersistence::new();
        let mut mask = Mask::new(64, 64);
        for x in 10..20 {
            mask.set(x, 5, true);
        }
        store_fog_mask(&store, "s1", "p1", &mask).await.unwrap();

        let loaded = load_fog_mask(&store, "s1", 64, 64).await.unwrap().unwrap();
        assert_eq!(loaded, mask);
        assert!(load_fog_mask(&store, "other", 64, 64).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_annotation_mask_roundtrip_through_store() {
        let store = MemoryPersistence::new();
        let mut mask = Mask::new(32, 32);
        mask.set(31, 31, true);
        store_annotation_mask(&store, "a1", "p1", &mask).await.unwrap();
        assert_eq!(load_annotation_mask(&store, "a1", 32, 32).await.unwrap(), Some(mask));
    }

    #[tokio::test]
    async fn test_corrupt_stored_mask_is_an_error() {
        let store = MemoryPersistence::new();
        store.lock().fog.insert("s1".into(), "not base64!!".into());
        assert!(matches!(
            load_fog_mask(&store, "s1", 8, 8).await,
            Err(PersistenceError::Mask(_))
        ));
    }

    #[tokio::test]
    async fn test_memory_store_marker_crud() {
        let store = MemoryPersistence::new();
        store.save_scene_props("s1", &serde_json::json!({})).await.unwrap();
        let mut marker = Marker::new("m1", Point::new(1.0, 1.0));
        store.create_marker("s1", &marker).await.unwrap();
        marker.label = "Door".into();
        store.update_marker("s1", &marker).await.unwrap();
        assert_eq!(store.scene("s1").unwrap().markers[0].label, "Door");

        store.delete_marker("s1", "m1").await.unwrap();
        assert!(store.scene("s1").unwrap().markers.is_empty());
        assert!(store.update_marker("s1", &marker).await.is_err());
    }

    #[tokio::test]
    async fn test_memory_store_rejects_duplicate_marker() {
        let store = MemoryPersistence::new();
        store.save_scene_props("s1", &serde_json::json!({})).await.unwrap();
        let marker = Marker::new("m1", Point::new(1.0, 1.0));
        store.create_marker("s1", &marker).await.unwrap();

        let mut again = marker.clone();
        again.label = "Copy".into();
        assert!(matches!(
            store.create_marker("s1", &again).await,
            Err(PersistenceError::Status { status: 409, .. })
        ));
        assert_eq!(store.scene("s1").unwrap().markers, vec![marker]);
    }

    #[tokio::test]
    async fn test_failing_writes() {
        let store = MemoryPersistence::new();
        store.set_fail_writes(true);
        assert!(matches!(
            store.save_scene_props("s1", &serde_json::json!({})).await,
            Err(PersistenceError::Status { status: 503, .. })
        ));
    }
}
