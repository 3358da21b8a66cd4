// ── Offline resource cache ──
//
// Keyed store of last-known remote resources: resource-type name → id →
// JSON object. Populated on successful fetches, updated on successful
// writes, served verbatim while the remote API is unreachable. Entries
// never expire; they are only overwritten or deleted.

use std::collections::HashMap;
use std::path::Path;

use dashmap::DashMap;
use serde_json::Value;
use tracing::warn;

use crate::error::CoreError;

/// In-memory cache of remote-API resources, optionally persisted as a
/// JSON snapshot.
#[derive(Default)]
pub struct ResourceCache {
    entries: DashMap<String, HashMap<String, Value>>,
}

/// Extract the cache key from a resource object: `id` wins over `uuid`,
/// numbers are stringified.
fn resource_key(resource: &Value) -> Option<String> {
    for field in ["id", "uuid"] {
        match resource.get(field) {
            Some(Value::String(s)) if !s.is_empty() => return Some(s.clone()),
            Some(Value::Number(n)) => return Some(n.to_string()),
            _ => {}
        }
    }
    None
}

impl ResourceCache {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Reads ────────────────────────────────────────────────────────

    /// All cached resources of a type, in unspecified order.
    /// Unseen types yield an empty list, not an error.
    pub fn all(&self, resource_type: &str) -> Vec<Value> {
        self.entries
            .get(resource_type)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    /// A single resource by id, or `None`.
    pub fn one(&self, resource_type: &str, resource_id: &str) -> Option<Value> {
        self.entries
            .get(resource_type)?
            .get(resource_id)
            .cloned()
    }

    // ── Writes ───────────────────────────────────────────────────────

    /// Insert or replace a resource, keyed by its `id`/`uuid` field.
    /// Resources without either field cannot be cached and are dropped.
    pub fn add(&self, resource_type: &str, resource: Value) {
        let Some(key) = resource_key(&resource) else {
            warn!(resource_type, "resource has no id or uuid, not caching");
            return;
        };
        self.entries
            .entry(resource_type.to_owned())
            .or_default()
            .insert(key, resource);
    }

    /// Shallow-merge `data`'s fields into an existing entry.
    /// A miss on type or id is a no-op.
    pub fn update(&self, resource_type: &str, resource_id: &str, data: &Value) {
        let Some(mut map) = self.entries.get_mut(resource_type) else {
            return;
        };
        let Some(existing) = map.get_mut(resource_id) else {
            return;
        };

        if let (Value::Object(target), Value::Object(patch)) = (existing, data) {
            for (k, v) in patch {
                target.insert(k.clone(), v.clone());
            }
        }
    }

    /// Remove one resource. Misses are a no-op.
    pub fn delete(&self, resource_type: &str, resource_id: &str) {
        if let Some(mut map) = self.entries.get_mut(resource_type) {
            map.remove(resource_id);
        }
    }

    /// Drop one resource type, or everything.
    pub fn clear(&self, resource_type: Option<&str>) {
        match resource_type {
            Some(t) => {
                self.entries.remove(t);
            }
            None => self.entries.clear(),
        }
    }

    // ── Snapshot persistence ─────────────────────────────────────────

    /// Serialize the full cache to a JSON file.
    pub fn save_snapshot(&self, path: &Path) -> Result<(), CoreError> {
        let mut snapshot: HashMap<String, HashMap<String, Value>> = HashMap::new();
        for entry in self.entries.iter() {
            snapshot.insert(entry.key().clone(), entry.value().clone());
        }

        let data = serde_json::to_vec_pretty(&snapshot)
            .map_err(|e| CoreError::Snapshot(e.to_string()))?;
        std::fs::write(path, data).map_err(|e| CoreError::Snapshot(e.to_string()))
    }

    /// Replace the cache contents from a JSON snapshot file.
    pub fn load_snapshot(&self, path: &Path) -> Result<(), CoreError> {
        let data = std::fs::read(path).map_err(|e| CoreError::Snapshot(e.to_string()))?;
        let snapshot: HashMap<String, HashMap<String, Value>> =
            serde_json::from_slice(&data).map_err(|e| CoreError::Snapshot(e.to_string()))?;

        self.entries.clear();
        for (resource_type, resources) in snapshot {
            self.entries.insert(resource_type, resources);
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn add_then_get_round_trip() {
        let cache = ResourceCache::new();
        let resource = json!({"uuid": "d1", "name": "Desk plug"});

        cache.add("devices", resource.clone());

        assert_eq!(cache.one("devices", "d1"), Some(resource.clone()));
        assert!(cache.all("devices").contains(&resource));
    }

    #[test]
    fn id_wins_over_uuid() {
        let cache = ResourceCache::new();
        cache.add("devices", json!({"id": 7, "uuid": "d1"}));

        assert!(cache.one("devices", "7").is_some());
        assert!(cache.one("devices", "d1").is_none());
    }

    #[test]
    fn unseen_type_shapes() {
        let cache = ResourceCache::new();
        // List read: empty vec. Single read: None. The asymmetry is part
        // of the contract -- callers must not conflate the two.
        assert!(cache.all("devices").is_empty());
        assert!(cache.one("devices", "d1").is_none());
    }

    #[test]
    fn update_is_a_shallow_merge() {
        let cache = ResourceCache::new();
        cache.add("lights", json!({"uuid": "l1", "brightness": 20, "is_on": false}));

        cache.update("lights", "l1", &json!({"brightness": 80}));

        let light = cache.one("lights", "l1").unwrap();
        assert_eq!(light["brightness"], 80);
        assert_eq!(light["is_on"], false);
    }

    #[test]
    fn update_miss_is_noop() {
        let cache = ResourceCache::new();
        cache.update("lights", "nope", &json!({"brightness": 80}));
        assert!(cache.all("lights").is_empty());
    }

    #[test]
    fn delete_removes_entry() {
        let cache = ResourceCache::new();
        cache.add("plugs", json!({"uuid": "p1"}));
        cache.delete("plugs", "p1");
        assert!(cache.one("plugs", "p1").is_none());
    }

    #[test]
    fn resource_without_key_is_not_cached() {
        let cache = ResourceCache::new();
        cache.add("devices", json!({"name": "anonymous"}));
        assert!(cache.all("devices").is_empty());
    }

    #[test]
    fn snapshot_round_trip() {
        let cache = ResourceCache::new();
        cache.add("devices", json!({"uuid": "d1", "name": "Desk plug"}));
        cache.add("plugs", json!({"uuid": "p1", "is_on": true}));

        let file = tempfile::NamedTempFile::new().unwrap();
        cache.save_snapshot(file.path()).unwrap();

        let restored = ResourceCache::new();
        restored.load_snapshot(file.path()).unwrap();

        assert_eq!(
            restored.one("devices", "d1").unwrap()["name"],
            "Desk plug"
        );
        assert_eq!(restored.one("plugs", "p1").unwrap()["is_on"], true);
    }
}
