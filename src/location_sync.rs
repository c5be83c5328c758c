//! The merged friend-location set.
//!
//! [`LocationSyncEngine`] owns two pieces of state: the current friend-id
//! set and the merged [`FriendLocation`] list, keyed by friend id with at
//! most one entry per id.  `rebuild` seeds the list from profile rows after
//! the friend graph changes; `apply_event` folds realtime profile updates
//! into it as they stream in.  A rebuild fully replaces the list; events
//! applied afterwards are applied against the rebuilt state (last write
//! observed wins).

use std::collections::HashSet;

use serde_json::Value;

use crate::colors::ColorStore;
use crate::store::{FriendLocation, ProfileStore, StoreError, DEFAULT_MARKER_COLOR};

// ---------------------------------------------------------------------------
// Typed realtime event
// ---------------------------------------------------------------------------

/// A decoded profile-update event from the realtime channel.
///
/// The channel delivers the changed row as a loose field map; [`decode`]
/// turns it into this struct and fails closed — a missing or mistyped
/// required field drops the whole event rather than guessing.
///
/// [`decode`]: ProfileChange::decode
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileChange {
    pub id: String,
    pub display_name: Option<String>,
    pub marker_color: Option<String>,
    pub is_sharing_location: bool,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub last_updated: Option<String>,
}

/// Read an optional field: absent or null is `Some(None)`, present with the
/// wrong type is `None` (reject the event).
fn opt_field<T>(
    obj: &serde_json::Map<String, Value>,
    key: &str,
    read: impl Fn(&Value) -> Option<T>,
) -> Option<Option<T>> {
    match obj.get(key) {
        None | Some(Value::Null) => Some(None),
        Some(v) => read(v).map(Some),
    }
}

impl ProfileChange {
    /// Decode the changed-row field map.  Returns `None` when `id` or
    /// `is_sharing_location` is missing or mistyped, or when any optional
    /// field is present with the wrong type.
    pub fn decode(record: &Value) -> Option<Self> {
        let obj = record.as_object()?;
        let id = obj.get("id")?.as_str()?.to_string();
        let is_sharing_location = obj.get("is_sharing_location")?.as_bool()?;
        let display_name = opt_field(obj, "display_name", |v| v.as_str().map(str::to_string))?;
        let marker_color = opt_field(obj, "marker_color", |v| v.as_str().map(str::to_string))?;
        let latitude = opt_field(obj, "last_location_lat", Value::as_f64)?;
        let longitude = opt_field(obj, "last_location_lon", Value::as_f64)?;
        let last_updated = opt_field(obj, "last_location_updated", |v| {
            v.as_str().map(str::to_string)
        })?;
        Some(Self {
            id,
            display_name,
            marker_color,
            is_sharing_location,
            latitude,
            longitude,
            last_updated,
        })
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct LocationSyncEngine {
    owner_id: String,
    friend_ids: HashSet<String>,
    /// Keyed by friend_id; at most one entry per id after every mutation.
    locations: Vec<FriendLocation>,
}

impl LocationSyncEngine {
    pub fn new(owner_id: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            friend_ids: HashSet::new(),
            locations: Vec::new(),
        }
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn friend_ids(&self) -> &HashSet<String> {
        &self.friend_ids
    }

    pub fn locations(&self) -> &[FriendLocation] {
        &self.locations
    }

    /// Drop all state.  Used on sign-out.
    pub fn clear(&mut self) {
        self.friend_ids.clear();
        self.locations.clear();
    }

    /// Replace the friend-id set and recompute the location list wholesale
    /// from profile rows.
    ///
    /// Profiles without both coordinates are excluded (not an error).  The
    /// local colour override, when present, replaces the profile's marker
    /// colour.  An empty id set clears the list without touching the
    /// backend.
    pub fn rebuild(
        &mut self,
        friend_ids: Vec<String>,
        profiles: &ProfileStore,
        colors: &ColorStore,
    ) -> Result<(), StoreError> {
        self.friend_ids = friend_ids.iter().cloned().collect();
        if friend_ids.is_empty() {
            self.locations.clear();
            return Ok(());
        }

        let rows = profiles.fetch_many(&friend_ids)?;
        let mut next = Vec::with_capacity(rows.len());
        for profile in rows {
            let Some((lat, lon)) = profile.coordinates() else {
                continue;
            };
            let marker_color =
                colors.effective_color(&self.owner_id, &profile.id, &profile.marker_color);
            next.push(FriendLocation {
                friend_id: profile.id,
                display_name: profile.display_name,
                latitude: lat,
                longitude: lon,
                marker_color,
                is_sharing_location: profile.is_sharing_location,
                last_updated: profile.last_location_updated,
            });
        }
        self.locations = next;
        crate::cvlog!(
            "rebuild: {} friend(s), {} with location",
            self.friend_ids.len(),
            self.locations.len()
        );
        Ok(())
    }

    /// Fold one realtime profile update into the list.  Returns true when
    /// the list changed.
    ///
    /// Dropped without effect: events for ids outside the friend set,
    /// events with `is_sharing_location == false` (the existing entry is
    /// intentionally left in place, stale coordinates and all — pending a
    /// product decision), and events missing either coordinate.
    pub fn apply_event(&mut self, event: &ProfileChange, colors: &ColorStore) -> bool {
        if !self.friend_ids.contains(&event.id) {
            return false;
        }
        if !event.is_sharing_location {
            return false;
        }
        let (Some(lat), Some(lon)) = (event.latitude, event.longitude) else {
            return false;
        };

        let existing = self.locations.iter().position(|l| l.friend_id == event.id);
        let display_name = match (&event.display_name, existing) {
            (Some(name), _) => name.clone(),
            (None, Some(i)) => self.locations[i].display_name.clone(),
            (None, None) => event.id.clone(),
        };
        let base_color = match (&event.marker_color, existing) {
            (Some(color), _) => color.clone(),
            (None, Some(i)) => self.locations[i].marker_color.clone(),
            (None, None) => DEFAULT_MARKER_COLOR.to_string(),
        };
        let marker_color = colors.effective_color(&self.owner_id, &event.id, &base_color);

        let entry = FriendLocation {
            friend_id: event.id.clone(),
            display_name,
            latitude: lat,
            longitude: lon,
            marker_color,
            is_sharing_location: true,
            last_updated: event.last_updated.clone(),
        };
        match existing {
            Some(i) => self.locations[i] = entry,
            None => self.locations.push(entry),
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    use crate::store::{Connection, ConnectionStatus, DataStore, UserProfile};

    /// In-memory profile table; connection methods are unused here.
    #[derive(Default)]
    struct FakeStore {
        profiles: Mutex<HashMap<String, UserProfile>>,
    }

    impl FakeStore {
        fn with_profiles(profiles: Vec<UserProfile>) -> Arc<Self> {
            let map = profiles.into_iter().map(|p| (p.id.clone(), p)).collect();
            Arc::new(Self {
                profiles: Mutex::new(map),
            })
        }
    }

    impl DataStore for FakeStore {
        fn get_profile(&self, user_id: &str) -> Result<Option<UserProfile>, StoreError> {
            Ok(self.profiles.lock().unwrap().get(user_id).cloned())
        }
        fn fetch_profiles(&self, user_ids: &[String]) -> Result<Vec<UserProfile>, StoreError> {
            let map = self.profiles.lock().unwrap();
            Ok(user_ids.iter().filter_map(|id| map.get(id).cloned()).collect())
        }
        fn upsert_profile(&self, profile: &UserProfile) -> Result<(), StoreError> {
            self.profiles
                .lock()
                .unwrap()
                .insert(profile.id.clone(), profile.clone());
            Ok(())
        }
        fn update_display_name(&self, _: &str, _: &str) -> Result<(), StoreError> {
            Ok(())
        }
        fn update_marker_color(&self, _: &str, _: &str) -> Result<(), StoreError> {
            Ok(())
        }
        fn set_sharing(&self, _: &str, _: bool) -> Result<(), StoreError> {
            Ok(())
        }
        fn update_location(&self, _: &str, _: f64, _: f64, _: &str) -> Result<(), StoreError> {
            Ok(())
        }
        fn list_connections(&self) -> Result<Vec<Connection>, StoreError> {
            Ok(Vec::new())
        }
        fn insert_connection(&self, _: &Connection) -> Result<(), StoreError> {
            Ok(())
        }
        fn set_connection_status(
            &self,
            _: &str,
            _: ConnectionStatus,
        ) -> Result<bool, StoreError> {
            Ok(false)
        }
        fn delete_connection(&self, _: &str) -> Result<bool, StoreError> {
            Ok(false)
        }
    }

    fn profile_at(id: &str, lat: f64, lon: f64, color: &str) -> UserProfile {
        let mut p = UserProfile::new(id, format!("{id}@example.com"));
        p.last_location_lat = Some(lat);
        p.last_location_lon = Some(lon);
        p.marker_color = color.to_string();
        p.is_sharing_location = true;
        p
    }

    fn event(id: &str, sharing: bool, lat: Option<f64>, lon: Option<f64>) -> ProfileChange {
        ProfileChange {
            id: id.to_string(),
            display_name: None,
            marker_color: None,
            is_sharing_location: sharing,
            latitude: lat,
            longitude: lon,
            last_updated: None,
        }
    }

    #[test]
    fn decode_requires_id_and_sharing_flag() {
        assert!(ProfileChange::decode(&serde_json::json!({ "id": "u1" })).is_none());
        assert!(ProfileChange::decode(
            &serde_json::json!({ "is_sharing_location": true })
        )
        .is_none());
        // Mistyped flag fails closed.
        assert!(ProfileChange::decode(
            &serde_json::json!({ "id": "u1", "is_sharing_location": "yes" })
        )
        .is_none());

        let ev = ProfileChange::decode(
            &serde_json::json!({ "id": "u1", "is_sharing_location": true }),
        )
        .unwrap();
        assert_eq!(ev.id, "u1");
        assert_eq!(ev.latitude, None);
    }

    #[test]
    fn decode_rejects_mistyped_optional_fields() {
        assert!(ProfileChange::decode(&serde_json::json!({
            "id": "u1",
            "is_sharing_location": true,
            "last_location_lat": "12.0",
        }))
        .is_none());

        // Explicit nulls are fine.
        let ev = ProfileChange::decode(&serde_json::json!({
            "id": "u1",
            "is_sharing_location": true,
            "last_location_lat": null,
            "last_location_lon": null,
        }))
        .unwrap();
        assert_eq!(ev.latitude, None);
        assert_eq!(ev.longitude, None);
    }

    #[test]
    fn rebuild_excludes_profiles_without_coordinates() {
        let store = FakeStore::with_profiles(vec![
            profile_at("u2", 12.0, 77.0, "#111111"),
            UserProfile::new("u3", "u3@example.com"),
        ]);
        let profiles = ProfileStore::new(store);
        let colors = ColorStore::open_in_memory().unwrap();

        let mut engine = LocationSyncEngine::new("u1");
        engine
            .rebuild(vec!["u2".into(), "u3".into()], &profiles, &colors)
            .unwrap();

        assert_eq!(engine.locations().len(), 1);
        assert_eq!(engine.locations()[0].friend_id, "u2");
        assert_eq!(engine.locations()[0].marker_color, "#111111");
    }

    #[test]
    fn rebuild_with_empty_set_yields_empty_list() {
        let store = FakeStore::with_profiles(vec![profile_at("u2", 1.0, 2.0, "#111111")]);
        let profiles = ProfileStore::new(store);
        let colors = ColorStore::open_in_memory().unwrap();

        let mut engine = LocationSyncEngine::new("u1");
        engine
            .rebuild(vec!["u2".into()], &profiles, &colors)
            .unwrap();
        assert_eq!(engine.locations().len(), 1);

        engine.rebuild(Vec::new(), &profiles, &colors).unwrap();
        assert!(engine.locations().is_empty());
        assert!(engine.friend_ids().is_empty());
    }

    #[test]
    fn rebuild_replaces_state_wholesale() {
        let store = FakeStore::with_profiles(vec![
            profile_at("u2", 1.0, 2.0, "#111111"),
            profile_at("u3", 3.0, 4.0, "#222222"),
        ]);
        let profiles = ProfileStore::new(store);
        let colors = ColorStore::open_in_memory().unwrap();

        let mut engine = LocationSyncEngine::new("u1");
        engine
            .rebuild(vec!["u2".into(), "u3".into()], &profiles, &colors)
            .unwrap();
        assert_eq!(engine.locations().len(), 2);

        // u3 dropped from the friend set — the rebuilt list must not retain it.
        engine
            .rebuild(vec!["u2".into()], &profiles, &colors)
            .unwrap();
        let ids: Vec<&str> = engine.locations().iter().map(|l| l.friend_id.as_str()).collect();
        assert_eq!(ids, vec!["u2"]);
    }

    #[test]
    fn sharing_off_event_never_adds_and_leaves_others_untouched() {
        let store = FakeStore::with_profiles(vec![profile_at("u2", 1.0, 2.0, "#111111")]);
        let profiles = ProfileStore::new(store);
        let colors = ColorStore::open_in_memory().unwrap();

        let mut engine = LocationSyncEngine::new("u1");
        engine
            .rebuild(vec!["u2".into(), "u3".into()], &profiles, &colors)
            .unwrap();
        assert_eq!(engine.locations().len(), 1);

        // u3 not in the list; a sharing-off event must not add it.
        assert!(!engine.apply_event(&event("u3", false, Some(5.0), Some(6.0)), &colors));
        assert_eq!(engine.locations().len(), 1);

        // u2 already present; a sharing-off event must not remove it either.
        assert!(!engine.apply_event(&event("u2", false, Some(9.0), Some(9.0)), &colors));
        assert_eq!(engine.locations().len(), 1);
        assert_eq!(engine.locations()[0].latitude, 1.0);
    }

    #[test]
    fn events_missing_a_coordinate_are_dropped() {
        let colors = ColorStore::open_in_memory().unwrap();
        let mut engine = LocationSyncEngine::new("u1");
        engine.friend_ids = ["u2".to_string()].into_iter().collect();

        assert!(!engine.apply_event(&event("u2", true, Some(1.0), None), &colors));
        assert!(!engine.apply_event(&event("u2", true, None, Some(2.0)), &colors));
        assert!(engine.locations().is_empty());
    }

    #[test]
    fn upsert_keeps_one_entry_per_friend() {
        let colors = ColorStore::open_in_memory().unwrap();
        let mut engine = LocationSyncEngine::new("u1");
        engine.friend_ids = ["u2".to_string()].into_iter().collect();

        assert!(engine.apply_event(&event("u2", true, Some(1.0), Some(2.0)), &colors));
        assert!(engine.apply_event(&event("u2", true, Some(12.0), Some(77.0)), &colors));

        assert_eq!(engine.locations().len(), 1);
        assert_eq!(engine.locations()[0].latitude, 12.0);
        assert_eq!(engine.locations()[0].longitude, 77.0);
    }

    #[test]
    fn events_outside_friend_set_are_ignored() {
        let colors = ColorStore::open_in_memory().unwrap();
        let mut engine = LocationSyncEngine::new("u1");
        engine.friend_ids = ["u2".to_string()].into_iter().collect();

        assert!(!engine.apply_event(&event("u9", true, Some(1.0), Some(2.0)), &colors));
        assert!(engine.locations().is_empty());
    }

    #[test]
    fn event_without_color_keeps_existing_entry_color() {
        let store = FakeStore::with_profiles(vec![profile_at("u2", 1.0, 2.0, "#111111")]);
        let profiles = ProfileStore::new(store);
        let colors = ColorStore::open_in_memory().unwrap();

        let mut engine = LocationSyncEngine::new("u1");
        engine
            .rebuild(vec!["u2".into()], &profiles, &colors)
            .unwrap();
        assert_eq!(engine.locations()[0].marker_color, "#111111");

        // A coordinate-only update carries no colour field; the entry must
        // not reset to the default colour.
        assert!(engine.apply_event(&event("u2", true, Some(3.0), Some(4.0)), &colors));
        assert_eq!(engine.locations()[0].marker_color, "#111111");
        assert_eq!(engine.locations()[0].latitude, 3.0);

        // With no prior entry and no colour field, the default applies.
        engine.friend_ids.insert("u3".to_string());
        assert!(engine.apply_event(&event("u3", true, Some(5.0), Some(6.0)), &colors));
        let u3 = engine.locations().iter().find(|l| l.friend_id == "u3").unwrap();
        assert_eq!(u3.marker_color, DEFAULT_MARKER_COLOR);
    }

    #[test]
    fn color_override_wins_in_both_paths() {
        let store = FakeStore::with_profiles(vec![profile_at("u2", 1.0, 2.0, "#111111")]);
        let profiles = ProfileStore::new(store);
        let colors = ColorStore::open_in_memory().unwrap();
        colors.set_override("u1", "u2", "#FF0000").unwrap();

        let mut engine = LocationSyncEngine::new("u1");
        engine
            .rebuild(vec!["u2".into()], &profiles, &colors)
            .unwrap();
        assert_eq!(engine.locations()[0].marker_color, "#FF0000");

        let mut ev = event("u2", true, Some(3.0), Some(4.0));
        ev.marker_color = Some("#111111".to_string());
        engine.apply_event(&ev, &colors);
        assert_eq!(engine.locations()[0].marker_color, "#FF0000");
    }
}
