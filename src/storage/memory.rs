//! In-process store backend.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::CacheStorage;
use crate::error::Result;
use crate::request::RequestKey;
use crate::response::StoredResponse;

type Store = HashMap<RequestKey, StoredResponse>;

/// Stores kept in memory for the lifetime of the process.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    stores: RwLock<BTreeMap<String, Store>>,
}

impl MemoryStorage {
    /// Creates an empty storage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStorage for MemoryStorage {
    async fn open(&self, name: &str) -> Result<()> {
        self.stores
            .write()
            .await
            .entry(name.to_string())
            .or_default();
        Ok(())
    }

    async fn names(&self) -> Result<Vec<String>> {
        Ok(self.stores.read().await.keys().cloned().collect())
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        Ok(self.stores.write().await.remove(name).is_some())
    }

    async fn get(&self, name: &str, key: &RequestKey) -> Result<Option<StoredResponse>> {
        Ok(self
            .stores
            .read()
            .await
            .get(name)
            .and_then(|store| store.get(key))
            .cloned())
    }

    async fn put(&self, name: &str, key: RequestKey, response: StoredResponse) -> Result<()> {
        self.stores
            .write()
            .await
            .entry(name.to_string())
            .or_default()
            .insert(key, response.stamped());
        Ok(())
    }

    async fn put_all(&self, name: &str, entries: Vec<(RequestKey, StoredResponse)>) -> Result<()> {
        let mut stores = self.stores.write().await;
        let store = stores.entry(name.to_string()).or_default();
        store.extend(entries.into_iter().map(|(k, v)| (k, v.stamped())));
        Ok(())
    }

    async fn len(&self, name: &str) -> Result<usize> {
        Ok(self.stores.read().await.get(name).map_or(0, HashMap::len))
    }
}
