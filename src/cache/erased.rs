//! Type-erased view of a dataset cache.
//!
//! The reconciler and the admin surface only know dataset ids and JSON keys;
//! this trait lets them drive caches of any key/value type.

use std::any::Any;

use async_trait::async_trait;
use serde_json::Value;

use super::dataset::{CacheKey, CacheValue, DatasetDescriptor};
use super::entry::{DatasetCache, RefreshReport};
use super::hash::canonical_checksum;
use crate::error::CacheError;

#[async_trait]
pub trait DynCache: Send + Sync {
    fn descriptor(&self) -> &DatasetDescriptor;

    /// Reload the key whose JSON form is `encoded_key`.
    async fn refresh_encoded(&self, encoded_key: &str) -> Result<(), CacheError>;

    fn invalidate_encoded(&self, encoded_key: &str) -> Result<(), CacheError>;

    fn invalidate_all(&self);

    fn live_count(&self) -> usize;

    async fn refresh_all(&self) -> Result<RefreshReport, CacheError>;

    async fn precache(&self) -> Result<RefreshReport, CacheError>;

    /// Checksum of every live value, in no particular order.
    fn value_checksums(&self) -> Result<Vec<u32>, CacheError>;

    /// Checksum of the live value cached under `item`, matched against the
    /// key's JSON form or its bare string form.
    fn item_checksum(&self, item: &str) -> Result<Option<u32>, CacheError>;

    fn as_any(&self) -> &dyn Any;
}

fn decode_key<K: CacheKey>(dataset: &str, encoded: &str) -> Result<K, CacheError> {
    serde_json::from_str(encoded)
        .map_err(|err| CacheError::key_codec(dataset, encoded, err.to_string()))
}

/// Decode a key supplied by a person: JSON first, then the raw text as a
/// JSON string.
fn decode_item<K: CacheKey>(dataset: &str, item: &str) -> Result<K, CacheError> {
    decode_key(dataset, item).or_else(|_| {
        serde_json::from_value(Value::String(item.to_owned()))
            .map_err(|err| CacheError::key_codec(dataset, item, err.to_string()))
    })
}

#[async_trait]
impl<K: CacheKey, V: CacheValue> DynCache for DatasetCache<K, V> {
    fn descriptor(&self) -> &DatasetDescriptor {
        DatasetCache::descriptor(self)
    }

    async fn refresh_encoded(&self, encoded_key: &str) -> Result<(), CacheError> {
        let key: K = decode_key(self.descriptor().name(), encoded_key)?;
        self.refresh(&key).await
    }

    fn invalidate_encoded(&self, encoded_key: &str) -> Result<(), CacheError> {
        let key: K = decode_key(self.descriptor().name(), encoded_key)?;
        self.invalidate(&key);
        Ok(())
    }

    fn invalidate_all(&self) {
        DatasetCache::invalidate_all(self);
    }

    fn live_count(&self) -> usize {
        DatasetCache::live_count(self)
    }

    async fn refresh_all(&self) -> Result<RefreshReport, CacheError> {
        DatasetCache::refresh_all(self).await
    }

    async fn precache(&self) -> Result<RefreshReport, CacheError> {
        DatasetCache::precache(self).await
    }

    fn value_checksums(&self) -> Result<Vec<u32>, CacheError> {
        self.live_values()
            .iter()
            .map(|value| {
                canonical_checksum(value).map_err(|err| CacheError::ValueCodec {
                    dataset: self.descriptor().name().to_owned(),
                    reason: err.to_string(),
                })
            })
            .collect()
    }

    fn item_checksum(&self, item: &str) -> Result<Option<u32>, CacheError> {
        let key: K = match decode_item(self.descriptor().name(), item) {
            Ok(key) => key,
            Err(_) => return Ok(None),
        };
        match self.peek(&key).flatten() {
            Some(value) => canonical_checksum(&value).map(Some).map_err(|err| {
                CacheError::ValueCodec {
                    dataset: self.descriptor().name().to_owned(),
                    reason: err.to_string(),
                }
            }),
            None => Ok(None),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::cache::config::CacheConfig;
    use crate::cache::store::{DatasetStore, MemoryStore};

    #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
    struct OrderKey {
        shop: u32,
        order: u64,
    }

    fn string_cache() -> (Arc<MemoryStore<String, u32>>, Arc<dyn DynCache>) {
        let store = Arc::new(MemoryStore::new("Counters"));
        let loader: Arc<dyn DatasetStore<String, u32>> = store.clone();
        let cache: Arc<dyn DynCache> = Arc::new(DatasetCache::new(loader, &CacheConfig::default()));
        (store, cache)
    }

    #[tokio::test]
    async fn refreshes_by_json_key() {
        let (store, cache) = string_cache();
        store.put_raw("a".into(), 5);

        cache.refresh_encoded("\"a\"").await.expect("refresh");
        assert_eq!(cache.live_count(), 1);
        assert_eq!(store.loads_for(&"a".to_string()), 1);
    }

    #[tokio::test]
    async fn undecodable_key_is_a_codec_error() {
        let (_store, cache) = string_cache();
        let err = cache.refresh_encoded("not json").await.unwrap_err();
        assert!(matches!(err, CacheError::KeyCodec { .. }));
    }

    #[tokio::test]
    async fn item_checksum_accepts_bare_strings() {
        let (store, cache) = string_cache();
        store.put_raw("a".into(), 5);
        cache.refresh_encoded("\"a\"").await.expect("refresh");

        let bare = cache.item_checksum("a").expect("checksum");
        let quoted = cache.item_checksum("\"a\"").expect("checksum");
        assert!(bare.is_some());
        assert_eq!(bare, quoted);
        assert_eq!(cache.item_checksum("zzz").expect("checksum"), None);
    }

    #[tokio::test]
    async fn structured_keys_round_trip_through_json() {
        let store: Arc<MemoryStore<OrderKey, String>> = Arc::new(MemoryStore::new("Orders"));
        let key = OrderKey { shop: 1, order: 9 };
        store.put_raw(key.clone(), "paid".into());
        let loader: Arc<dyn DatasetStore<OrderKey, String>> = store.clone();
        let cache = DatasetCache::new(loader, &CacheConfig::default());

        let encoded = serde_json::to_string(&key).expect("encode");
        cache.refresh_encoded(&encoded).await.expect("refresh");
        assert_eq!(cache.peek(&key), Some(Some("paid".to_string())));

        cache.invalidate_encoded(&encoded).expect("invalidate");
        assert_eq!(cache.peek(&key), None);
    }

    #[tokio::test]
    async fn downcasts_to_concrete_cache() {
        let (_store, cache) = string_cache();
        assert!(
            cache
                .as_any()
                .downcast_ref::<DatasetCache<String, u32>>()
                .is_some()
        );
        assert!(
            cache
                .as_any()
                .downcast_ref::<DatasetCache<String, u64>>()
                .is_none()
        );
    }
}
