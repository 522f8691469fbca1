//! Per-dataset loading cache.
//!
//! Holds one slot per key: either a present value or a tombstone recording
//! that the store confirmed the key absent. Misses load from the store; bulk
//! misses use one bulk read and fall back to per-key loads when the store
//! returns fewer entries than requested.
//!
//! `put` and `invalidate` stamp the key while its slot shard is locked, and
//! `invalidate_all` advances an epoch. A load only lands if neither changed
//! since it started, so a slow load never replaces a newer write.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::{StreamExt, stream};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use super::config::CacheConfig;
use super::dataset::{CacheKey, CacheValue, DatasetDescriptor};
use super::store::DatasetStore;
use crate::error::CacheError;

const SOURCE: &str = "cachesync::cache::entry";

struct Slot<V> {
    value: Option<V>,
    loaded_at: Instant,
}

impl<V> Slot<V> {
    fn new(value: Option<V>) -> Self {
        Self {
            value,
            loaded_at: Instant::now(),
        }
    }
}

/// Write state observed when a load started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LoadTicket {
    epoch: u64,
    stamp: u64,
}

/// Summary of a full dataset reload or precache pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshReport {
    pub dataset: String,
    pub keys: usize,
    pub live: usize,
    pub failed: usize,
    pub elapsed_ms: u64,
}

/// Loading cache for one dataset. Cloning shares the same entries.
pub struct DatasetCache<K: CacheKey, V: CacheValue> {
    inner: Arc<CacheInner<K, V>>,
}

impl<K: CacheKey, V: CacheValue> Clone for DatasetCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct CacheInner<K: CacheKey, V: CacheValue> {
    descriptor: DatasetDescriptor,
    loader: Arc<dyn DatasetStore<K, V>>,
    slots: DashMap<K, Slot<V>>,
    stamps: DashMap<K, u64>,
    next_stamp: AtomicU64,
    epoch: AtomicU64,
    reloading: DashMap<K, ()>,
    reload_after_write: Option<Duration>,
    refresh_concurrency: usize,
    precache_chunk_size: usize,
    /// Serializes full reloads and precache passes for this dataset.
    bulk_gate: Mutex<()>,
}

impl<K: CacheKey, V: CacheValue> DatasetCache<K, V> {
    pub fn new(loader: Arc<dyn DatasetStore<K, V>>, config: &CacheConfig) -> Self {
        let descriptor = loader.descriptor().clone();
        Self {
            inner: Arc::new(CacheInner {
                descriptor,
                loader,
                slots: DashMap::new(),
                stamps: DashMap::new(),
                next_stamp: AtomicU64::new(1),
                epoch: AtomicU64::new(0),
                reloading: DashMap::new(),
                reload_after_write: config.reload_after_write(),
                refresh_concurrency: config.refresh_concurrency_non_zero().get(),
                precache_chunk_size: config.precache_chunk_size_non_zero().get(),
                bulk_gate: Mutex::new(()),
            }),
        }
    }

    pub fn descriptor(&self) -> &DatasetDescriptor {
        &self.inner.descriptor
    }

    fn name(&self) -> &str {
        self.inner.descriptor.name()
    }

    /// Cached value for `key`, loading it on a miss.
    ///
    /// `Ok(None)` means the store confirmed the key absent; that answer is
    /// cached as a tombstone and served until the key is refreshed or
    /// invalidated.
    pub async fn get(&self, key: &K) -> Result<Option<V>, CacheError> {
        if let Some(value) = self.lookup_slot(key) {
            counter!("cachesync_cache_hit_total", "dataset" => self.name().to_owned())
                .increment(1);
            return Ok(value);
        }

        counter!("cachesync_cache_miss_total", "dataset" => self.name().to_owned()).increment(1);
        let ticket = self.ticket(key);
        let loaded = self
            .inner
            .loader
            .get_one(key)
            .await
            .map_err(|source| CacheError::store(self.name(), source))?;
        self.store_loaded(key, ticket, loaded.clone());
        Ok(loaded)
    }

    /// Cached values for `keys`, in request order with duplicates removed.
    pub async fn get_all(&self, keys: &[K]) -> Result<Vec<(K, Option<V>)>, CacheError> {
        let mut seen = HashSet::with_capacity(keys.len());
        let mut resolved = Vec::with_capacity(keys.len());
        let mut misses = Vec::new();

        for key in keys {
            if !seen.insert(key) {
                continue;
            }
            match self.lookup_slot(key) {
                Some(value) => resolved.push((key.clone(), Some(value))),
                None => {
                    misses.push(key.clone());
                    resolved.push((key.clone(), None));
                }
            }
        }

        let hits = (resolved.len() - misses.len()) as u64;
        if hits > 0 {
            counter!("cachesync_cache_hit_total", "dataset" => self.name().to_owned())
                .increment(hits);
        }
        if misses.is_empty() {
            return Ok(resolved
                .into_iter()
                .map(|(key, value)| (key, value.flatten()))
                .collect());
        }
        counter!("cachesync_cache_miss_total", "dataset" => self.name().to_owned())
            .increment(misses.len() as u64);

        let mut loaded = self.load_many(&misses).await?;
        Ok(resolved
            .into_iter()
            .map(|(key, value)| match value {
                Some(cached) => (key, cached),
                None => {
                    let fresh = loaded.remove(&key).flatten();
                    (key, fresh)
                }
            })
            .collect())
    }

    async fn load_many(
        &self,
        keys: &[K],
    ) -> Result<std::collections::HashMap<K, Option<V>>, CacheError> {
        let tickets: Vec<LoadTicket> = keys.iter().map(|key| self.ticket(key)).collect();
        let mut found = self
            .inner
            .loader
            .get_all_as_map(keys)
            .await
            .map_err(|source| CacheError::store(self.name(), source))?;

        if found.len() < keys.len() {
            debug!(
                source_module = SOURCE,
                dataset = self.name(),
                requested = keys.len(),
                returned = found.len(),
                "Bulk read came back short; loading keys one by one"
            );
            found.clear();
            for key in keys {
                let value = self
                    .inner
                    .loader
                    .get_one(key)
                    .await
                    .map_err(|source| CacheError::store(self.name(), source))?;
                found.insert(key.clone(), value);
            }
        }

        for (key, ticket) in keys.iter().zip(tickets) {
            let value = found.get(key).cloned().flatten();
            self.store_loaded(key, ticket, value);
        }
        Ok(found)
    }

    /// Reload `key` from the store and replace its slot.
    ///
    /// Concurrent readers see either the old slot or the new one. On failure,
    /// or when a write to `key` lands first, the slot in place is kept.
    pub async fn refresh(&self, key: &K) -> Result<(), CacheError> {
        let ticket = self.ticket(key);
        let loaded = self
            .inner
            .loader
            .get_one(key)
            .await
            .map_err(|source| CacheError::store(self.name(), source))?;
        self.store_loaded(key, ticket, loaded);
        Ok(())
    }

    /// Store a value the caller just wrote through to the store.
    pub fn put(&self, key: K, value: V) {
        let slot = self.inner.slots.entry(key.clone());
        self.stamp(key);
        slot.insert(Slot::new(Some(value)));
    }

    pub fn invalidate(&self, key: &K) {
        let slot = self.inner.slots.entry(key.clone());
        self.stamp(key.clone());
        if let Entry::Occupied(slot) = slot {
            slot.remove();
        }
    }

    pub fn invalidate_all(&self) {
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        self.inner.slots.clear();
        self.inner.stamps.clear();
    }

    /// Slot for `key` without loading: `None` when not cached,
    /// `Some(None)` for a tombstone.
    pub fn peek(&self, key: &K) -> Option<Option<V>> {
        self.inner.slots.get(key).map(|slot| slot.value.clone())
    }

    /// Number of cached slots holding a present value.
    pub fn live_count(&self) -> usize {
        self.inner
            .slots
            .iter()
            .filter(|slot| slot.value.is_some())
            .count()
    }

    /// Number of cached slots, tombstones included.
    pub fn len(&self) -> usize {
        self.inner.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.slots.is_empty()
    }

    pub fn keys(&self) -> Vec<K> {
        self.inner
            .slots
            .iter()
            .map(|slot| slot.key().clone())
            .collect()
    }

    pub fn live_entries(&self) -> Vec<(K, V)> {
        self.inner
            .slots
            .iter()
            .filter_map(|slot| {
                slot.value
                    .as_ref()
                    .map(|value| (slot.key().clone(), value.clone()))
            })
            .collect()
    }

    pub fn live_values(&self) -> Vec<V> {
        self.inner
            .slots
            .iter()
            .filter_map(|slot| slot.value.clone())
            .collect()
    }

    /// Reload every key the store or the cache knows about.
    ///
    /// Per-key failures are counted and logged; the pass only fails when the
    /// key listing itself fails.
    #[instrument(skip(self), fields(dataset = %self.inner.descriptor.name()))]
    pub async fn refresh_all(&self) -> Result<RefreshReport, CacheError> {
        let _gate = self.inner.bulk_gate.lock().await;
        let started = Instant::now();

        let mut keys = self
            .inner
            .loader
            .get_keys()
            .await
            .map_err(|source| CacheError::store(self.name(), source))?;
        let known: HashSet<K> = keys.iter().cloned().collect();
        keys.extend(self.keys().into_iter().filter(|key| !known.contains(key)));
        let total = keys.len();

        let failed = stream::iter(keys)
            .map(|key| async move { self.refresh(&key).await.err().map(|err| (key, err)) })
            .buffer_unordered(self.inner.refresh_concurrency)
            .filter_map(|outcome| async move { outcome })
            .fold(0usize, |failed, (key, err)| async move {
                warn!(
                    source_module = SOURCE,
                    dataset = self.name(),
                    key = ?key,
                    error = %err,
                    "Key reload failed during full refresh"
                );
                failed + 1
            })
            .await;

        let report = RefreshReport {
            dataset: self.name().to_owned(),
            keys: total,
            live: self.live_count(),
            failed,
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        counter!("cachesync_full_reload_total", "dataset" => self.name().to_owned())
            .increment(1);
        info!(
            source_module = SOURCE,
            keys = report.keys,
            live = report.live,
            failed = report.failed,
            elapsed_ms = report.elapsed_ms,
            "Dataset reloaded"
        );
        Ok(report)
    }

    /// Load every stored key in chunks using bulk reads.
    #[instrument(skip(self), fields(dataset = %self.inner.descriptor.name()))]
    pub async fn precache(&self) -> Result<RefreshReport, CacheError> {
        let _gate = self.inner.bulk_gate.lock().await;
        let started = Instant::now();

        let keys = self
            .inner
            .loader
            .get_keys()
            .await
            .map_err(|source| CacheError::store(self.name(), source))?;
        for chunk in keys.chunks(self.inner.precache_chunk_size) {
            self.load_many(chunk).await?;
        }

        let report = RefreshReport {
            dataset: self.name().to_owned(),
            keys: keys.len(),
            live: self.live_count(),
            failed: 0,
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            source_module = SOURCE,
            keys = report.keys,
            live = report.live,
            elapsed_ms = report.elapsed_ms,
            "Dataset precached"
        );
        Ok(report)
    }

    fn ticket(&self, key: &K) -> LoadTicket {
        LoadTicket {
            epoch: self.inner.epoch.load(Ordering::SeqCst),
            stamp: self.stamp_of(key),
        }
    }

    fn stamp_of(&self, key: &K) -> u64 {
        self.inner.stamps.get(key).map_or(0, |stamp| *stamp)
    }

    /// Caller holds the slot shard for `key`.
    fn stamp(&self, key: K) {
        let stamp = self.inner.next_stamp.fetch_add(1, Ordering::SeqCst);
        self.inner.stamps.insert(key, stamp);
    }

    /// Install a loaded value unless `key` was written or the cache was
    /// cleared after `ticket` was taken.
    fn store_loaded(&self, key: &K, ticket: LoadTicket, value: Option<V>) {
        let slot = self.inner.slots.entry(key.clone());
        if self.inner.epoch.load(Ordering::SeqCst) != ticket.epoch
            || self.stamp_of(key) != ticket.stamp
        {
            drop(slot);
            debug!(
                source_module = SOURCE,
                dataset = self.name(),
                key = ?key,
                "Discarding load overtaken by a write"
            );
            return;
        }
        slot.insert(Slot::new(value));
    }

    /// Cached slot value, scheduling a background reload when it is stale.
    fn lookup_slot(&self, key: &K) -> Option<Option<V>> {
        let (value, stale) = {
            let slot = self.inner.slots.get(key)?;
            let stale = self
                .inner
                .reload_after_write
                .is_some_and(|after| slot.loaded_at.elapsed() >= after);
            (slot.value.clone(), stale)
        };
        if stale {
            self.spawn_reload(key.clone());
        }
        Some(value)
    }

    fn spawn_reload(&self, key: K) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        if self.inner.reloading.insert(key.clone(), ()).is_some() {
            return;
        }
        let cache = self.clone();
        handle.spawn(async move {
            if let Err(err) = cache.refresh(&key).await {
                warn!(
                    source_module = SOURCE,
                    dataset = cache.name(),
                    key = ?key,
                    error = %err,
                    "Background reload failed; serving previous value"
                );
            }
            cache.inner.reloading.remove(&key);
        });
    }
}
