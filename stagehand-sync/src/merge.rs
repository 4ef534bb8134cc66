//! Merge protection for entity lists that the local user is manipulating.
//!
//! Remote snapshots of the marker list arrive while the local user may be
//! dragging or editing a marker. Applying them verbatim would snap the
//! marker back mid-gesture or resurrect one just deleted locally.
//! [`reconcile`] filters and patches the incoming list so that:
//!
//! - ids recently removed here stay removed,
//! - a marker being moved keeps the local position (other fields follow the
//!   remote),
//! - a marker being edited keeps the whole local version,
//! - protected markers missing from the remote list are kept.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use crate::model::{Marker, Point};

/// Something with a stable identity and a position.
pub trait Tracked: Clone {
    fn id(&self) -> &str;
    fn position(&self) -> Point;
    fn set_position(&mut self, position: Point);
}

impl Tracked for Marker {
    fn id(&self) -> &str {
        &self.id
    }

    fn position(&self) -> Point {
        self.position
    }

    fn set_position(&mut self, position: Point) {
        self.position = position;
    }
}

/// Merge an incoming snapshot with local entities under protection.
///
/// The result is ordered like `incoming`, followed by protected local
/// entities the snapshot does not contain yet. Ids are unique.
pub fn reconcile<T: Tracked>(
    local: &[T],
    incoming: &[T],
    being_moved: &HashSet<String>,
    being_edited: &HashSet<String>,
    recently_removed: &HashSet<String>,
) -> Vec<T> {
    let mut seen = HashSet::new();
    let mut merged: Vec<T> = incoming
        .iter()
        .filter(|e| !recently_removed.contains(e.id()))
        .filter(|e| seen.insert(e.id().to_string()))
        .cloned()
        .collect();

    let mut index: HashMap<String, usize> = merged
        .iter()
        .enumerate()
        .map(|(i, e)| (e.id().to_string(), i))
        .collect();

    for entity in local {
        let id = entity.id();
        let editing = being_edited.contains(id);
        let moving = being_moved.contains(id);
        if !(editing || moving) || recently_removed.contains(id) {
            continue;
        }
        match index.get(id) {
            Some(&i) if editing => merged[i] = entity.clone(),
            Some(&i) => merged[i].set_position(entity.position()),
            None => {
                index.insert(id.to_string(), merged.len());
                merged.push(entity.clone());
            }
        }
    }
    merged
}

/// Per-client gesture state for markers plus the last reconciled list.
pub struct MarkerTracker {
    local: Vec<Marker>,
    moving: HashSet<String>,
    editing: HashSet<String>,
    removed: HashMap<String, Instant>,
    removed_ttl: Duration,
}

impl MarkerTracker {
    pub fn new(removed_ttl: Duration) -> Self {
        Self {
            local: Vec::new(),
            moving: HashSet::new(),
            editing: HashSet::new(),
            removed: HashMap::new(),
            removed_ttl,
        }
    }

    pub fn markers(&self) -> &[Marker] {
        &self.local
    }

    pub fn marker(&self, id: &str) -> Option<&Marker> {
        self.local.iter().find(|m| m.id == id)
    }

    pub fn begin_move(&mut self, id: &str) {
        self.moving.insert(id.to_string());
    }

    /// Update the local position of a marker mid-drag.
    pub fn move_to(&mut self, id: &str, position: Point) -> bool {
        match self.local.iter_mut().find(|m| m.id == id) {
            Some(marker) => {
                marker.position = position;
                true
            }
            None => false,
        }
    }

    pub fn end_move(&mut self, id: &str) {
        self.moving.remove(id);
    }

    pub fn begin_edit(&mut self, id: &str) {
        self.editing.insert(id.to_string());
    }

    pub fn end_edit(&mut self, id: &str) {
        self.editing.remove(id);
    }

    pub fn is_protected(&self, id: &str) -> bool {
        self.moving.contains(id) || self.editing.contains(id)
    }

    /// Create or replace a marker locally (before it is written out).
    pub fn upsert_local(&mut self, marker: Marker) {
        match self.local.iter_mut().find(|m| m.id == marker.id) {
            Some(existing) => *existing = marker,
            None => self.local.push(marker),
        }
    }

    /// Delete locally and shield the id from stale snapshots.
    pub fn mark_removed(&mut self, id: &str) {
        self.local.retain(|m| m.id != id);
        self.moving.remove(id);
        self.editing.remove(id);
        self.removed.insert(id.to_string(), Instant::now());
    }

    pub fn is_recently_removed(&self, id: &str) -> bool {
        self.removed.contains_key(id)
    }

    /// Forget removals older than the TTL.
    pub fn expire_removed(&mut self, now: Instant) {
        let ttl = self.removed_ttl;
        self.removed
            .retain(|_, removed_at| now.saturating_duration_since(*removed_at) < ttl);
    }

    /// Merge a replicated snapshot into the local list and return it.
    pub fn apply_snapshot(&mut self, incoming: &[Marker]) -> &[Marker] {
        self.apply_snapshot_at(incoming, Instant::now())
    }

    pub fn apply_snapshot_at(&mut self, incoming: &[Marker], now: Instant) -> &[Marker] {
        self.expire_removed(now);
        let removed: HashSet<String> = self.removed.keys().cloned().collect();
        self.local = reconcile(&self.local, incoming, &self.moving, &self.editing, &removed);

        // Once the replica stops listing an id, the delete has landed.
        let present: HashSet<&str> = incoming.iter().map(|m| m.id.as_str()).collect();
        self.removed.retain(|id, _| present.contains(id.as_str()));
        &self.local
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn marker(id: &str, x: f64, color: &str) -> Marker {
        let mut m = Marker::new(id, Point::new(x, x));
        m.shape_color = color.into();
        m
    }

    fn ids(markers: &[Marker]) -> Vec<&str> {
        markers.iter().map(|m| m.id.as_str()).collect()
    }

    fn set(ids: &[&str]) -> HashSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_moving_keeps_local_position_only() {
        let local = vec![marker("m", 10.0, "#ff0000")];
        let incoming = vec![marker("m", 99.0, "#00ff00")];

        let merged = reconcile(&local, &incoming, &set(&["m"]), &set(&[]), &set(&[]));
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].position, Point::new(10.0, 10.0));
        assert_eq!(merged[0].shape_color, "#00ff00");
    }

    #[test]
    fn test_editing_keeps_whole_local_entity() {
        let mut mine = marker("m", 1.0, "#ff0000");
        mine.note = "draft".into();
        let incoming = vec![marker("m", 5.0, "#00ff00")];

        let merged = reconcile(&[mine.clone()], &incoming, &set(&[]), &set(&["m"]), &set(&[]));
        assert_eq!(merged, vec![mine]);
    }

    #[test]
    fn test_recently_removed_never_resurrects() {
        let incoming = vec![marker("gone", 1.0, "#fff"), marker("kept", 2.0, "#fff")];
        let merged = reconcile(&[], &incoming, &set(&[]), &set(&[]), &set(&["gone"]));
        assert_eq!(ids(&merged), vec!["kept"]);
    }

    #[test]
    fn test_protected_local_missing_remotely_is_kept() {
        let local = vec![marker("new", 3.0, "#fff")];
        let incoming = vec![marker("a", 1.0, "#fff")];
        let merged = reconcile(&local, &incoming, &set(&["new"]), &set(&[]), &set(&[]));
        assert_eq!(ids(&merged), vec!["a", "new"]);
    }

    #[test]
    fn test_unprotected_local_follows_remote() {
        let local = vec![marker("a", 1.0, "#fff"), marker("b", 2.0, "#fff")];
        let incoming = vec![marker("a", 7.0, "#000")];
        let merged = reconcile(&local, &incoming, &set(&[]), &set(&[]), &set(&[]));
        assert_eq!(merged, incoming);
    }

    #[test]
    fn test_no_duplicate_ids() {
        let local = vec![marker("a", 1.0, "#fff")];
        let incoming = vec![marker("a", 2.0, "#fff"), marker("a", 3.0, "#fff")];
        let merged = reconcile(&local, &incoming, &set(&["a"]), &set(&["a"]), &set(&[]));
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].position, Point::new(1.0, 1.0));
    }

    #[test]
    fn test_tracker_drag_then_release() {
        let mut tracker = MarkerTracker::new(Duration::from_secs(5));
        tracker.apply_snapshot(&[marker("m1", 0.0, "#fff")]);

        tracker.begin_move("m1");
        tracker.move_to("m1", Point::new(40.0, 40.0));
        let mut relabeled = marker("m1", 0.0, "#fff");
        relabeled.label = "Boss".into();
        tracker.apply_snapshot(&[relabeled]);

        let during = tracker.marker("m1").unwrap();
        assert_eq!(during.position, Point::new(40.0, 40.0));
        assert_eq!(during.label, "Boss");

        tracker.end_move("m1");
        assert!(!tracker.is_protected("m1"));
    }

    #[test]
    fn test_tracker_removed_ttl() {
        let mut tracker = MarkerTracker::new(Duration::from_millis(100));
        tracker.apply_snapshot(&[marker("m1", 0.0, "#fff")]);
        tracker.mark_removed("m1");

        let start = Instant::now();
        let stale = [marker("m1", 0.0, "#fff")];
        assert!(tracker.apply_snapshot_at(&stale, start).is_empty());
        assert!(tracker.is_recently_removed("m1"));

        // After the TTL a snapshot that still lists it wins.
        let later = start + Duration::from_millis(500);
        assert_eq!(tracker.apply_snapshot_at(&stale, later).len(), 1);
    }

    #[test]
    fn test_tracker_forgets_removal_once_replica_agrees() {
        let mut tracker = MarkerTracker::new(Duration::from_secs(60));
        tracker.apply_snapshot(&[marker("m1", 0.0, "#fff")]);
        tracker.mark_removed("m1");
        tracker.apply_snapshot(&[]);
        assert!(!tracker.is_recently_removed("m1"));
    }
}
