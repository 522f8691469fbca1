//! Caching decorator over a dataset store.
//!
//! Reads go through the dataset's shared cache; writes go to the store first
//! and, once the store accepts them, update the local cache and enqueue a
//! change-log record for peers.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use super::dataset::{CacheKey, CacheValue, DatasetDescriptor};
use super::entry::{DatasetCache, RefreshReport};
use super::store::DatasetStore;
use crate::changelog::{ChangeLogWriter, Operation};
use crate::error::{CacheError, StoreError};

const SOURCE: &str = "cachesync::cache::decorator";

/// A [`DatasetStore`] that serves reads from a shared cache and records its
/// writes in the change log.
pub struct CachedDataset<K: CacheKey, V: CacheValue> {
    store: Arc<dyn DatasetStore<K, V>>,
    cache: DatasetCache<K, V>,
    writer: ChangeLogWriter,
}

impl<K: CacheKey, V: CacheValue> Clone for CachedDataset<K, V> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            cache: self.cache.clone(),
            writer: self.writer.clone(),
        }
    }
}

impl<K: CacheKey, V: CacheValue> CachedDataset<K, V> {
    pub(crate) fn new(
        store: Arc<dyn DatasetStore<K, V>>,
        cache: DatasetCache<K, V>,
        writer: ChangeLogWriter,
    ) -> Self {
        Self {
            store,
            cache,
            writer,
        }
    }

    pub fn cache(&self) -> &DatasetCache<K, V> {
        &self.cache
    }

    pub async fn refresh(&self, key: &K) -> Result<(), CacheError> {
        self.cache.refresh(key).await
    }

    pub async fn refresh_all(&self) -> Result<RefreshReport, CacheError> {
        self.cache.refresh_all().await
    }

    pub fn invalidate(&self, key: &K) {
        self.cache.invalidate(key);
    }

    /// Live values currently cached, without touching the store.
    pub fn get_all_cached(&self) -> Vec<V> {
        self.cache.live_values()
    }

    /// Keys currently cached, tombstones included.
    pub fn cached_keys(&self) -> Vec<K> {
        self.cache.keys()
    }

    fn record(&self, operation: Operation, key: Option<&K>) {
        let changed_key = match key.map(serde_json::to_string).transpose() {
            Ok(encoded) => encoded,
            Err(err) => {
                warn!(
                    source_module = SOURCE,
                    dataset = self.descriptor().name(),
                    operation = operation.as_str(),
                    error = %err,
                    "Failed to encode changed key; change not recorded"
                );
                return;
            }
        };
        self.writer.record(
            self.descriptor(),
            operation,
            changed_key,
            self.cache.live_count(),
        );
    }
}

fn into_store_error(err: CacheError) -> StoreError {
    match err {
        CacheError::Store { source, .. } => source,
        other => StoreError::serialization(other.to_string()),
    }
}

#[async_trait]
impl<K: CacheKey, V: CacheValue> DatasetStore<K, V> for CachedDataset<K, V> {
    fn descriptor(&self) -> &DatasetDescriptor {
        self.store.descriptor()
    }

    async fn get_one(&self, key: &K) -> Result<Option<V>, StoreError> {
        self.cache.get(key).await.map_err(into_store_error)
    }

    async fn get_all_as_map(&self, keys: &[K]) -> Result<HashMap<K, Option<V>>, StoreError> {
        let resolved = self.cache.get_all(keys).await.map_err(into_store_error)?;
        Ok(resolved.into_iter().collect())
    }

    async fn get_keys(&self) -> Result<Vec<K>, StoreError> {
        self.store.get_keys().await
    }

    async fn set_one(&self, key: K, value: V) -> Result<(), StoreError> {
        self.store.set_one(key.clone(), value.clone()).await?;
        self.cache.put(key.clone(), value);
        self.record(Operation::Create, Some(&key));
        Ok(())
    }

    async fn set_multiple(&self, entries: Vec<(K, V)>) -> Result<(), StoreError> {
        self.store.set_multiple(entries.clone()).await?;
        for (key, value) in entries {
            self.cache.put(key.clone(), value);
            self.record(Operation::Create, Some(&key));
        }
        Ok(())
    }

    async fn delete_one(&self, key: &K) -> Result<(), StoreError> {
        self.store.delete_one(key).await?;
        self.cache.invalidate(key);
        self.record(Operation::Delete, Some(key));
        Ok(())
    }

    /// Clears the local cache and records the truncate even when the store
    /// reports a failure, since a partial truncate may already be visible.
    async fn truncate(&self) -> Result<(), StoreError> {
        let result = self.store.truncate().await;
        self.cache.invalidate_all();
        self.record(Operation::Truncate, None);
        result
    }

    async fn get_all(&self, keys: &[K]) -> Result<Vec<V>, StoreError> {
        let resolved = self.cache.get_all(keys).await.map_err(into_store_error)?;
        Ok(resolved.into_iter().filter_map(|(_, value)| value).collect())
    }
}
