//! Dataset store contract and an in-memory implementation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};

use async_trait::async_trait;
use tokio::sync::{Notify, watch};

use super::dataset::{CacheKey, CacheValue, DatasetDescriptor};
use super::lock::{mutex_lock, rw_read, rw_write};
use crate::error::StoreError;

const SOURCE: &str = "cachesync::cache::store";

/// Keyed persistent collection behind a dataset cache.
///
/// `Ok(None)` from a read means the store confirmed the key is absent.
/// Transport or decoding failures must come back as [`StoreError`].
#[async_trait]
pub trait DatasetStore<K: CacheKey, V: CacheValue>: Send + Sync {
    fn descriptor(&self) -> &DatasetDescriptor;

    async fn get_one(&self, key: &K) -> Result<Option<V>, StoreError>;

    /// Bulk read. Keys the store confirmed absent map to `None`; keys it did
    /// not resolve may be missing from the map entirely.
    async fn get_all_as_map(&self, keys: &[K]) -> Result<HashMap<K, Option<V>>, StoreError>;

    async fn get_keys(&self) -> Result<Vec<K>, StoreError>;

    async fn set_one(&self, key: K, value: V) -> Result<(), StoreError>;

    async fn set_multiple(&self, entries: Vec<(K, V)>) -> Result<(), StoreError>;

    async fn delete_one(&self, key: &K) -> Result<(), StoreError>;

    async fn truncate(&self) -> Result<(), StoreError>;

    /// Present values for `keys`, in request order.
    async fn get_all(&self, keys: &[K]) -> Result<Vec<V>, StoreError> {
        let mut found = self.get_all_as_map(keys).await?;
        Ok(keys
            .iter()
            .filter_map(|key| found.remove(key).flatten())
            .collect())
    }
}

/// Process-local [`DatasetStore`] with load accounting and failure injection.
pub struct MemoryStore<K, V> {
    descriptor: DatasetDescriptor,
    rows: RwLock<HashMap<K, V>>,
    loads: Mutex<HashMap<K, usize>>,
    total_loads: AtomicUsize,
    failing: AtomicBool,
    partial_bulk_reads: AtomicBool,
    read_hold: watch::Sender<bool>,
    parked: Notify,
}

impl<K: CacheKey, V: CacheValue> MemoryStore<K, V> {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_descriptor(DatasetDescriptor::of::<K, V>(name))
    }

    pub fn with_descriptor(descriptor: DatasetDescriptor) -> Self {
        Self {
            descriptor,
            rows: RwLock::new(HashMap::new()),
            loads: Mutex::new(HashMap::new()),
            total_loads: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
            partial_bulk_reads: AtomicBool::new(false),
            read_hold: watch::Sender::new(false),
            parked: Notify::new(),
        }
    }

    /// Write directly, bypassing load accounting. Stands in for another
    /// process mutating the backing store.
    pub fn put_raw(&self, key: K, value: V) {
        rw_write(&self.rows, SOURCE, "put_raw").insert(key, value);
    }

    pub fn remove_raw(&self, key: &K) -> Option<V> {
        rw_write(&self.rows, SOURCE, "remove_raw").remove(key)
    }

    pub fn clear_raw(&self) {
        rw_write(&self.rows, SOURCE, "clear_raw").clear();
    }

    pub fn peek_raw(&self, key: &K) -> Option<V> {
        rw_read(&self.rows, SOURCE, "peek_raw").get(key).cloned()
    }

    pub fn len(&self) -> usize {
        rw_read(&self.rows, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Make every subsequent operation fail with `StoreError::Unavailable`.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Make bulk reads drop every other requested key from the result.
    pub fn set_partial_bulk_reads(&self, partial: bool) {
        self.partial_bulk_reads.store(partial, Ordering::SeqCst);
    }

    /// While held, every `get_one` parks after reading its row and resumes
    /// once the hold is lifted.
    pub fn hold_reads(&self, hold: bool) {
        self.read_hold.send_replace(hold);
    }

    /// Resolves once a `get_one` has parked on [`Self::hold_reads`].
    pub async fn read_parked(&self) {
        self.parked.notified().await;
    }

    /// Number of times `key` was read from this store.
    pub fn loads_for(&self, key: &K) -> usize {
        mutex_lock(&self.loads, SOURCE, "loads_for")
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_loads(&self) -> usize {
        self.total_loads.load(Ordering::SeqCst)
    }

    pub fn reset_load_counts(&self) {
        mutex_lock(&self.loads, SOURCE, "reset_load_counts").clear();
        self.total_loads.store(0, Ordering::SeqCst);
    }

    fn check_available(&self, operation: &'static str) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::unavailable(format!(
                "{} store rejected {operation}",
                self.descriptor.name()
            )));
        }
        Ok(())
    }

    async fn park_if_held(&self) {
        let mut release = self.read_hold.subscribe();
        let held = *release.borrow_and_update();
        if !held {
            return;
        }
        self.parked.notify_one();
        let _ = release.wait_for(|held| !*held).await;
    }

    fn count_load(&self, key: &K) {
        *mutex_lock(&self.loads, SOURCE, "count_load")
            .entry(key.clone())
            .or_insert(0) += 1;
        self.total_loads.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl<K: CacheKey, V: CacheValue> DatasetStore<K, V> for MemoryStore<K, V> {
    fn descriptor(&self) -> &DatasetDescriptor {
        &self.descriptor
    }

    async fn get_one(&self, key: &K) -> Result<Option<V>, StoreError> {
        self.check_available("get_one")?;
        self.count_load(key);
        let value = rw_read(&self.rows, SOURCE, "get_one").get(key).cloned();
        self.park_if_held().await;
        Ok(value)
    }

    async fn get_all_as_map(&self, keys: &[K]) -> Result<HashMap<K, Option<V>>, StoreError> {
        self.check_available("get_all_as_map")?;
        let partial = self.partial_bulk_reads.load(Ordering::SeqCst);
        let rows = rw_read(&self.rows, SOURCE, "get_all_as_map");
        let mut found = HashMap::with_capacity(keys.len());
        for (index, key) in keys.iter().enumerate() {
            if partial && index % 2 == 1 {
                continue;
            }
            self.count_load(key);
            found.insert(key.clone(), rows.get(key).cloned());
        }
        Ok(found)
    }

    async fn get_keys(&self) -> Result<Vec<K>, StoreError> {
        self.check_available("get_keys")?;
        Ok(rw_read(&self.rows, SOURCE, "get_keys")
            .keys()
            .cloned()
            .collect())
    }

    async fn set_one(&self, key: K, value: V) -> Result<(), StoreError> {
        self.check_available("set_one")?;
        rw_write(&self.rows, SOURCE, "set_one").insert(key, value);
        Ok(())
    }

    async fn set_multiple(&self, entries: Vec<(K, V)>) -> Result<(), StoreError> {
        self.check_available("set_multiple")?;
        rw_write(&self.rows, SOURCE, "set_multiple").extend(entries);
        Ok(())
    }

    async fn delete_one(&self, key: &K) -> Result<(), StoreError> {
        self.check_available("delete_one")?;
        rw_write(&self.rows, SOURCE, "delete_one").remove(key);
        Ok(())
    }

    async fn truncate(&self) -> Result<(), StoreError> {
        self.check_available("truncate")?;
        rw_write(&self.rows, SOURCE, "truncate").clear();
        Ok(())
    }
}
