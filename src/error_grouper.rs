//! Resolves a parsed `ErrorDefinition` to a stable error key, maintaining
//! the in-process write-through caches and the `errordef:*` reverse index.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::MonitorError;
use crate::models::error_def::ErrorDefinition;
use crate::store::{keys, Store};

const SLOTS: [&str; 4] = ["id0", "id1", "id2", "id3"];

/// Single-lock, read-mostly caches: a def cache keyed by error key, and a
/// per-identifier-slot reverse index. Never the source of truth — a miss or
/// a stale entry always falls through to the Store.
pub struct ErrorGrouperCache {
    defs: RwLock<HashMap<String, ErrorDefinition>>,
    id_index: RwLock<HashMap<&'static str, HashMap<String, String>>>,
}

impl Default for ErrorGrouperCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorGrouperCache {
    pub fn new() -> Self {
        Self {
            defs: RwLock::new(HashMap::new()),
            id_index: RwLock::new(HashMap::new()),
        }
    }

    /// Test-only hook: clears both caches.
    pub fn reset(&self) {
        self.defs.write().unwrap().clear();
        self.id_index.write().unwrap().clear();
    }

    pub async fn lookup_or_create(
        &self,
        store: &dyn Store,
        ttl_secs: i64,
        def: ErrorDefinition,
    ) -> Result<String, MonitorError> {
        if self.defs.read().unwrap().contains_key(&def.key) {
            return self.resolve_existing(store, ttl_secs, &def.key.clone(), &def).await;
        }

        let canonical_key = keys::error_def(&def.key);
        if store.get(&canonical_key).await?.is_some() {
            return self.resolve_existing(store, ttl_secs, &def.key.clone(), &def).await;
        }

        for (slot, id_val) in SLOTS.iter().zip(def.ids()) {
            let Some(id_val) = non_empty(id_val) else { continue };
            let hit = self
                .id_index
                .read()
                .unwrap()
                .get(*slot)
                .and_then(|m| m.get(id_val).cloned());
            if let Some(existing_key) = hit {
                return self.resolve_existing(store, ttl_secs, &existing_key, &def).await;
            }
        }

        for (slot, id_val) in SLOTS.iter().zip(def.ids()) {
            let Some(id_val) = non_empty(id_val) else { continue };
            let hash_key = keys::error_id_index(slot);
            if let Some(existing_key) = store.hash_get(&hash_key, id_val).await? {
                return self.resolve_existing(store, ttl_secs, &existing_key, &def).await;
            }
        }

        self.write_fresh(store, ttl_secs, &def.key.clone(), &def).await?;
        Ok(def.key)
    }

    async fn resolve_existing(
        &self,
        store: &dyn Store,
        ttl_secs: i64,
        existing_key: &str,
        incoming: &ErrorDefinition,
    ) -> Result<String, MonitorError> {
        let canonical_key = keys::error_def(existing_key);
        let existing_payload = store.get(&canonical_key).await?;
        let merged = match existing_payload.and_then(|raw| serde_json::from_str::<ErrorDefinition>(&raw).ok()) {
            Some(mut existing) => {
                existing.title = incoming.title.clone();
                existing.status = incoming.status.clone();
                existing.level = incoming.level.clone();
                existing
            }
            None => {
                let mut fresh = incoming.clone();
                fresh.key = existing_key.to_string();
                fresh
            }
        };
        self.write_fresh(store, ttl_secs, existing_key, &merged).await?;
        Ok(existing_key.to_string())
    }

    async fn write_fresh(
        &self,
        store: &dyn Store,
        ttl_secs: i64,
        key: &str,
        def: &ErrorDefinition,
    ) -> Result<(), MonitorError> {
        let canonical_key = keys::error_def(key);
        let payload = serde_json::to_string(def).map_err(|e| MonitorError::BadRequest(e.to_string()))?;
        store.set_with_ttl(&canonical_key, &payload, ttl_secs).await?;
        self.defs.write().unwrap().insert(key.to_string(), def.clone());

        for (slot, id_val) in SLOTS.iter().zip(def.ids()) {
            let Some(id_val) = non_empty(id_val) else { continue };
            let hash_key = keys::error_id_index(slot);
            store.hash_set(&hash_key, id_val, key).await?;
            self.id_index
                .write()
                .unwrap()
                .entry(slot)
                .or_default()
                .insert(id_val.to_string(), key.to_string());
        }
        Ok(())
    }
}

fn non_empty(id: Option<&str>) -> Option<&str> {
    id.filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error_parser::parse_message;
    use crate::store::fake::FakeStore;

    #[tokio::test]
    async fn same_definition_groups_under_one_key() {
        let store = FakeStore::new();
        let grouper = ErrorGrouperCache::new();
        let (d1, _, _) = parse_message("Error while parsing directive 1", "500", "3");
        let (d2, _, _) = parse_message("Error while parsing directive 2", "500", "3");
        let k1 = grouper.lookup_or_create(&store, 3600, d1).await.unwrap();
        let k2 = grouper.lookup_or_create(&store, 3600, d2).await.unwrap();
        assert_eq!(k1, k2);
    }

    #[tokio::test]
    async fn resolving_by_id_updates_title_to_latest() {
        let store = FakeStore::new();
        let grouper = ErrorGrouperCache::new();
        let (d1, _, _) = parse_message("Error while parsing directive 1", "500", "3");
        let key = grouper.lookup_or_create(&store, 3600, d1).await.unwrap();

        let (d2, _, _) = parse_message("Error while parsing directive 42", "500", "3");
        grouper.lookup_or_create(&store, 3600, d2).await.unwrap();

        let raw = store.get(&keys::error_def(&key)).await.unwrap().unwrap();
        let def: ErrorDefinition = serde_json::from_str(&raw).unwrap();
        assert_eq!(def.title, "Error while parsing directive 42");
        assert_eq!(def.key, key);
    }

    #[tokio::test]
    async fn expired_payload_recreated_under_same_key() {
        let store = FakeStore::new();
        let grouper = ErrorGrouperCache::new();
        let (d1, _, _) = parse_message("Error while parsing directive 1", "500", "3");
        let key = grouper.lookup_or_create(&store, 3600, d1).await.unwrap();

        grouper.reset();
        store.del(&keys::error_def(&key)).await.unwrap();

        let (d2, _, _) = parse_message("Error while parsing directive 7", "500", "3");
        let key2 = grouper.lookup_or_create(&store, 3600, d2).await.unwrap();
        assert_eq!(key, key2);
        assert!(store.get(&keys::error_def(&key)).await.unwrap().is_some());
    }
}
