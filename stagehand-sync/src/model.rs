//! Data model shared by every collaborator of a game session.
//!
//! These are the plain Rust views of what lives in the replicated document.
//! JSON field names are camelCase so the same records travel unchanged to
//! the persistence endpoints.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Identity of one connected client (one browser tab / process).
pub type ClientId = Uuid;

/// 2D point in map coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Party-wide flags, last-writer-wins per key.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PartyState {
    pub is_paused: bool,
    pub active_game_session_id: String,
    pub active_scene_id: Option<String>,
}

/// Entry of the ordered scene registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SceneMetadata {
    pub id: String,
    pub name: String,
    pub order: i64,
    #[serde(default)]
    pub map_location: Option<String>,
    pub game_session_id: String,
}

/// Who may see a marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Visibility {
    #[default]
    Always,
    GmOnly,
    Hover,
}

/// A map marker. Identity is `id`; every other field is mutable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Marker {
    pub id: String,
    #[serde(default)]
    pub title: String,
    pub position: Point,
    #[serde(default = "default_marker_size")]
    pub size: String,
    #[serde(default = "default_marker_shape")]
    pub shape: String,
    #[serde(default)]
    pub shape_color: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default = "default_image_scale")]
    pub image_scale: f64,
    #[serde(default)]
    pub visibility: Visibility,
    #[serde(default)]
    pub note: String,
    #[serde(default)]
    pub pinned_tooltip: Option<bool>,
}

fn default_marker_size() -> String {
    "medium".to_string()
}

fn default_marker_shape() -> String {
    "circle".to_string()
}

fn default_image_scale() -> f64 {
    1.0
}

impl Marker {
    /// A marker with default styling at `position`.
    pub fn new(id: impl Into<String>, position: Point) -> Self {
        Self {
            id: id.into(),
            title: String::new(),
            position,
            size: default_marker_size(),
            shape: default_marker_shape(),
            shape_color: "#ff0000".to_string(),
            label: String::new(),
            image_url: None,
            image_scale: default_image_scale(),
            visibility: Visibility::default(),
            note: String::new(),
            pinned_tooltip: None,
        }
    }
}

/// Per-client viewport. Never shared as stage props; stored under
/// `localStates[clientId]` so a reconnecting client can restore its view.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Viewport {
    pub offset: Point,
    pub zoom: f64,
    pub rotation: f64,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            offset: Point::default(),
            zoom: 1.0,
            rotation: 0.0,
        }
    }
}

/// Remote pointer, overwritten continuously by its owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorData {
    pub user_id: String,
    pub position: Point,
    pub normalized_position: Point,
    /// Epoch milliseconds.
    pub last_move_time: i64,
}

/// Read-only snapshot of `scenes[sceneId]`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SceneData {
    pub stage_props: Value,
    pub markers: Vec<Marker>,
    pub local_states: HashMap<String, Viewport>,
    /// Epoch milliseconds of the last successful save (0 = never).
    pub last_saved_at: i64,
    pub save_in_progress: bool,
    pub active_saver: Option<String>,
    /// Epoch milliseconds at which `active_saver` claimed the role.
    pub save_started_at: i64,
}

/// How urgently a queued property change should reach peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdateClass {
    /// High-frequency entity updates such as marker drags.
    Continuous,
    /// UI control changes (sliders, toggles).
    Discrete,
    /// Scene-wide settings.
    Structural,
}

/// Default StageProps tree for a freshly initialized scene.
pub fn default_stage_props() -> Value {
    serde_json::json!({
        "fogOfWar": {
            "enabled": false,
            "opacity": 0.8,
            "tool": { "size": 32, "mode": "reveal" }
        },
        "grid": {
            "enabled": true,
            "size": 50,
            "color": "#000000",
            "opacity": 0.3
        },
        "map": { "imageUrl": null, "width": 0, "height": 0 },
        "markers": { "showLabels": true },
        "annotations": { "layers": [] },
        "measurement": { "unit": "ft", "scale": 5 },
        "ping": { "enabled": true },
        "weather": { "type": "none", "intensity": 0.5 },
        "scene": { "offset": { "x": 0.0, "y": 0.0 }, "zoom": 1.0, "rotation": 0.0 },
        "display": { "mode": "gm" },
        "postProcessing": { "enabled": false }
    })
}

/// Current wall-clock time in epoch milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
