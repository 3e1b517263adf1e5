//! In-memory implementation of the StoreBackend and CacheStore traits
//!
//! Used by tests and by embedders that want the lifecycle without
//! durability.

use crate::cache::{CacheError, CacheStore, GenerationId, RequestKey, StoreBackend, StoredResponse};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// In-memory store backend
#[derive(Default)]
pub struct MemoryStoreBackend {
    stores: RwLock<HashMap<String, Arc<MemoryCacheStore>>>,
}

impl MemoryStoreBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl StoreBackend for MemoryStoreBackend {
    async fn open(&self, generation: &GenerationId) -> Result<Arc<dyn CacheStore>, CacheError> {
        let mut stores = self.stores.write().unwrap();
        let store = stores
            .entry(generation.as_str().to_string())
            .or_insert_with(|| Arc::new(MemoryCacheStore::default()))
            .clone();
        Ok(store)
    }

    async fn list_generations(&self) -> Result<Vec<String>, CacheError> {
        let stores = self.stores.read().unwrap();
        let mut names: Vec<String> = stores.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn delete_generation(&self, generation: &GenerationId) -> Result<(), CacheError> {
        // Removing the map entry drops the whole store at once
        self.stores.write().unwrap().remove(generation.as_str());
        Ok(())
    }
}

/// One generation's in-memory entry map
#[derive(Default)]
pub struct MemoryCacheStore {
    entries: RwLock<HashMap<RequestKey, StoredResponse>>,
}

#[async_trait::async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, key: &RequestKey) -> Result<Option<StoredResponse>, CacheError> {
        Ok(self.entries.read().unwrap().get(key).cloned())
    }

    async fn put(&self, key: &RequestKey, response: &StoredResponse) -> Result<(), CacheError> {
        self.entries
            .write()
            .unwrap()
            .insert(key.clone(), response.clone());
        Ok(())
    }

    async fn len(&self) -> Result<usize, CacheError> {
        Ok(self.entries.read().unwrap().len())
    }

    async fn keys(&self) -> Result<Vec<RequestKey>, CacheError> {
        let mut keys: Vec<RequestKey> = self.entries.read().unwrap().keys().cloned().collect();
        keys.sort_by(|a, b| a.url.cmp(&b.url).then_with(|| a.method.cmp(&b.method)));
        Ok(keys)
    }
}
