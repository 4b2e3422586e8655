use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use switchyard_core::{Persistence, SwitchyardResult};

/// Process-local record store.
///
/// Each record remembers a write sequence number so listings come back
/// newest first.
pub struct MemoryStore {
    collections: RwLock<HashMap<String, HashMap<String, (u64, serde_json::Value)>>>,
    seq: AtomicU64,
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
            seq: AtomicU64::new(0),
        }
    }

    /// Number of records in `collection`.
    pub fn count(&self, collection: &str) -> usize {
        self.collections
            .read()
            .get(collection)
            .map_or(0, HashMap::len)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Persistence for MemoryStore {
    async fn upsert(
        &self,
        collection: &str,
        key: &str,
        record: serde_json::Value,
    ) -> SwitchyardResult<()> {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        self.collections
            .write()
            .entry(collection.to_string())
            .or_default()
            .insert(key.to_string(), (seq, record));
        Ok(())
    }

    async fn fetch(
        &self,
        collection: &str,
        key: &str,
    ) -> SwitchyardResult<Option<serde_json::Value>> {
        Ok(self
            .collections
            .read()
            .get(collection)
            .and_then(|c| c.get(key))
            .map(|(_, v)| v.clone()))
    }

    async fn list(&self, collection: &str, limit: usize) -> SwitchyardResult<Vec<serde_json::Value>> {
        let collections = self.collections.read();
        let Some(records) = collections.get(collection) else {
            return Ok(Vec::new());
        };
        let mut entries: Vec<&(u64, serde_json::Value)> = records.values().collect();
        entries.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(entries
            .into_iter()
            .take(limit)
            .map(|(_, v)| v.clone())
            .collect())
    }
}
