use std::collections::HashMap;

use metarepo_core::{CacheInvalidator, ObjectRef, PersistentId};
use serde::{Deserialize, Serialize};

use crate::ObjectRecord;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// In-process cache of object rows, association collections and query results.
///
/// Entries are keyed by persistent ID, so eviction after a deletion is exact
/// for entities and collections; query results are dropped per region.
#[derive(Debug, Default)]
pub struct ObjectCache {
    entities: HashMap<(String, PersistentId), ObjectRecord>,
    collections: HashMap<(String, PersistentId), Vec<ObjectRef>>,
    queries: HashMap<String, HashMap<String, Vec<ObjectRecord>>>,
    stats: CacheStats,
}

impl ObjectCache {
    pub fn entity(&mut self, type_name: &str, id: PersistentId) -> Option<ObjectRecord> {
        let hit = self.entities.get(&(type_name.to_string(), id)).cloned();
        self.record(hit.is_some());
        hit
    }

    pub fn put_entity(&mut self, record: ObjectRecord) {
        self.entities.insert((record.type_name.clone(), record.id), record);
    }

    pub fn collection(&mut self, collection: &str, owner: PersistentId) -> Option<Vec<ObjectRef>> {
        let hit = self.collections.get(&(collection.to_string(), owner)).cloned();
        self.record(hit.is_some());
        hit
    }

    pub fn put_collection(&mut self, collection: &str, owner: PersistentId, members: Vec<ObjectRef>) {
        self.collections.insert((collection.to_string(), owner), members);
    }

    pub fn query(&mut self, region: &str, key: &str) -> Option<Vec<ObjectRecord>> {
        let hit = self.queries.get(region).and_then(|entries| entries.get(key)).cloned();
        self.record(hit.is_some());
        hit
    }

    pub fn put_query(&mut self, region: &str, key: &str, records: Vec<ObjectRecord>) {
        self.queries.entry(region.to_string()).or_default().insert(key.to_string(), records);
    }

    /// Drop everything, e.g. after writes that bypass the deletion path.
    pub fn clear(&mut self) {
        let dropped = self.entities.len()
            + self.collections.len()
            + self.queries.values().map(HashMap::len).sum::<usize>();
        self.entities.clear();
        self.collections.clear();
        self.queries.clear();
        self.stats.evictions += dropped as u64;
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    fn record(&mut self, hit: bool) {
        if hit {
            self.stats.hits += 1;
        } else {
            self.stats.misses += 1;
        }
    }
}

impl CacheInvalidator for ObjectCache {
    fn evict_entity(&mut self, type_name: &str, id: PersistentId) {
        if self.entities.remove(&(type_name.to_string(), id)).is_some() {
            self.stats.evictions += 1;
        }
    }

    fn evict_collection(&mut self, association: &str, collection: &str, owner: PersistentId) {
        if self.collections.remove(&(collection.to_string(), owner)).is_some() {
            tracing::trace!(association, collection, owner = owner.get(), "evicted collection");
            self.stats.evictions += 1;
        }
    }

    fn evict_queries(&mut self, region: &str) {
        if let Some(entries) = self.queries.remove(region) {
            self.stats.evictions += entries.len() as u64;
        }
    }
}
