//! Dataset cache registry.
//!
//! Owns one cache per dataset id. Static registrations are built once at
//! startup from a list of dataset definitions; dynamic ones are created on
//! first use. Lookups prefer a dynamic registration over a static one.
//!
//! Static caches are created through the same get-or-create entry as dynamic
//! ones, so a dataset never ends up with two caches.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{debug, info, instrument, warn};

use super::config::CacheConfig;
use super::dataset::{CacheKey, CacheValue, DatasetDescriptor, DatasetId, TypePair};
use super::decorator::CachedDataset;
use super::entry::{DatasetCache, RefreshReport};
use super::erased::DynCache;
use super::hash::{ConsistencyHasher, dataset_hash};
use super::store::DatasetStore;
use crate::changelog::ChangeLogWriter;
use crate::error::{CacheError, RegistryError};

const SOURCE: &str = "cachesync::cache::registry";

/// A dataset to register at startup.
pub struct DatasetDefinition {
    descriptor: DatasetDescriptor,
    cached: bool,
    build: Box<dyn FnOnce(&CacheConfig) -> Arc<dyn DynCache> + Send>,
}

impl DatasetDefinition {
    pub fn new<K: CacheKey, V: CacheValue>(store: Arc<dyn DatasetStore<K, V>>) -> Self {
        Self {
            descriptor: store.descriptor().clone(),
            cached: true,
            build: Box::new(move |config: &CacheConfig| -> Arc<dyn DynCache> {
                Arc::new(DatasetCache::new(store, config))
            }),
        }
    }

    /// Register the dataset's types without building a cache for it.
    pub fn non_cached(mut self) -> Self {
        self.cached = false;
        self
    }

    pub fn descriptor(&self) -> &DatasetDescriptor {
        &self.descriptor
    }
}

#[derive(Clone)]
struct Registration {
    cache: Arc<dyn DynCache>,
}

#[derive(Default)]
struct StaticRegistrations {
    caches: HashMap<DatasetId, Registration>,
    types: HashMap<DatasetId, (String, TypePair)>,
}

pub struct CacheRegistry {
    config: CacheConfig,
    writer: ChangeLogWriter,
    statics: OnceLock<StaticRegistrations>,
    dynamics: DashMap<DatasetId, Registration>,
}

impl CacheRegistry {
    pub fn new(config: CacheConfig, writer: ChangeLogWriter) -> Self {
        Self {
            config,
            writer,
            statics: OnceLock::new(),
            dynamics: DashMap::new(),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn writer(&self) -> &ChangeLogWriter {
        &self.writer
    }

    /// Build the static registrations. May only be called once.
    ///
    /// A dataset already given a dynamic cache keeps that cache instead of
    /// getting a second one.
    pub fn register_static(&self, definitions: Vec<DatasetDefinition>) -> Result<(), RegistryError> {
        let mut built = None;
        let statics = self.statics.get_or_init(|| {
            let (statics, created) = self.build_statics(definitions);
            built = Some(created);
            statics
        });
        let built = built.ok_or(RegistryError::AlreadyInitialized)?;

        info!(
            source_module = SOURCE,
            caches = statics.caches.len(),
            "Static dataset caches registered"
        );
        for cache in built {
            self.schedule_precache(cache);
        }
        Ok(())
    }

    fn build_statics(
        &self,
        definitions: Vec<DatasetDefinition>,
    ) -> (StaticRegistrations, Vec<Arc<dyn DynCache>>) {
        let mut statics = StaticRegistrations::default();
        let mut built = Vec::new();
        for definition in definitions {
            let id = definition.descriptor.id();
            statics.types.insert(
                id,
                (
                    definition.descriptor.name().to_owned(),
                    definition.descriptor.types(),
                ),
            );
            if !definition.cached {
                debug!(
                    source_module = SOURCE,
                    dataset = definition.descriptor.name(),
                    "Registered non-cached dataset"
                );
                continue;
            }
            let cache = match self.dynamics.entry(id) {
                Entry::Occupied(existing) => Arc::clone(&existing.get().cache),
                Entry::Vacant(slot) => {
                    let cache = (definition.build)(&self.config);
                    slot.insert(Registration {
                        cache: Arc::clone(&cache),
                    });
                    built.push(Arc::clone(&cache));
                    cache
                }
            };
            statics.caches.insert(id, Registration { cache });
        }
        (statics, built)
    }

    /// Cached view of `store`, creating its dataset cache on first use.
    ///
    /// Concurrent callers for the same dataset share one cache.
    pub fn cached<K: CacheKey, V: CacheValue>(
        &self,
        store: Arc<dyn DatasetStore<K, V>>,
    ) -> Result<CachedDataset<K, V>, RegistryError> {
        let descriptor = store.descriptor().clone();
        let id = descriptor.id();

        let registration = match self.find(id) {
            Some(registration) => registration,
            None => {
                if self.is_static_non_cached(id) {
                    return Err(RegistryError::NonCached {
                        dataset: descriptor.name().to_owned(),
                    });
                }
                let (registration, created) = match self.dynamics.entry(id) {
                    Entry::Occupied(entry) => (entry.get().clone(), false),
                    Entry::Vacant(entry) => {
                        let cache: Arc<dyn DynCache> =
                            Arc::new(DatasetCache::new(Arc::clone(&store), &self.config));
                        let registration = Registration { cache };
                        entry.insert(registration.clone());
                        (registration, true)
                    }
                };
                if created {
                    info!(
                        source_module = SOURCE,
                        dataset = descriptor.name(),
                        dataset_id = %id,
                        "Dynamic dataset cache created"
                    );
                    self.schedule_precache(Arc::clone(&registration.cache));
                }
                registration
            }
        };

        let cache = downcast::<K, V>(registration.cache.as_any()).ok_or_else(|| {
            RegistryError::TypeMismatch {
                dataset: descriptor.name().to_owned(),
            }
        })?;
        Ok(CachedDataset::new(store, cache, self.writer.clone()))
    }

    /// Cache registered for `id`, dynamic registrations first.
    pub fn lookup(&self, id: DatasetId) -> Result<Arc<dyn DynCache>, RegistryError> {
        self.find(id)
            .map(|registration| registration.cache)
            .ok_or(RegistryError::NotRegistered(id))
    }

    pub fn has_cache_for(&self, id: DatasetId) -> bool {
        self.find(id).is_some()
    }

    /// Key and value types registered for `id`, including non-cached
    /// static datasets.
    pub fn type_params(&self, id: DatasetId) -> Result<TypePair, RegistryError> {
        if let Some(registration) = self.dynamics.get(&id) {
            return Ok(registration.cache.descriptor().types());
        }
        self.statics
            .get()
            .and_then(|statics| statics.types.get(&id))
            .map(|(_, types)| *types)
            .ok_or(RegistryError::NotRegistered(id))
    }

    /// Every registered cache, ordered by dataset id.
    pub fn caches(&self) -> BTreeMap<DatasetId, Arc<dyn DynCache>> {
        let mut caches = BTreeMap::new();
        if let Some(statics) = self.statics.get() {
            for (id, registration) in &statics.caches {
                caches.insert(*id, Arc::clone(&registration.cache));
            }
        }
        for registration in self.dynamics.iter() {
            caches.insert(*registration.key(), Arc::clone(&registration.cache));
        }
        caches
    }

    pub fn find_by_name(&self, name: &str) -> Option<Arc<dyn DynCache>> {
        self.caches()
            .into_values()
            .find(|cache| cache.descriptor().name() == name)
    }

    /// Reload every registered dataset not excluded from refresh.
    ///
    /// Returns the names of datasets that were not refreshed: excluded ones
    /// and ones whose reload failed.
    #[instrument(skip(self))]
    pub async fn refresh_all(&self) -> Vec<String> {
        let mut not_refreshed = Vec::new();
        for cache in self.caches().into_values() {
            let name = cache.descriptor().name().to_owned();
            if self.config.is_excluded(&name) {
                debug!(source_module = SOURCE, dataset = %name, "Refresh skipped: excluded");
                not_refreshed.push(name);
                continue;
            }
            if let Err(err) = cache.refresh_all().await {
                warn!(
                    source_module = SOURCE,
                    dataset = %name,
                    error = %err,
                    "Dataset refresh failed"
                );
                not_refreshed.push(name);
            }
        }
        not_refreshed
    }

    /// Reload one dataset by name. Excluded datasets are reported with an
    /// empty report.
    pub async fn refresh_dataset(&self, name: &str) -> Result<RefreshReport, RegistryError> {
        let cache = self
            .find_by_name(name)
            .ok_or_else(|| RegistryError::UnknownDataset(name.to_owned()))?;
        if self.config.is_excluded(name) {
            return Ok(RefreshReport {
                dataset: name.to_owned(),
                ..RefreshReport::default()
            });
        }
        Ok(cache.refresh_all().await?)
    }

    /// Hash over every registered dataset, folded in dataset-id order.
    pub fn calculate_hash(&self) -> Result<u32, CacheError> {
        let mut hasher = ConsistencyHasher::new();
        for cache in self.caches().into_values() {
            hasher.absorb(cache.value_checksums()?);
        }
        Ok(hasher.finish())
    }

    /// Hash of one dataset. Excluded datasets hash to 0.
    pub fn calculate_dataset_hash(&self, name: &str) -> Result<u32, RegistryError> {
        if self.config.is_excluded(name) {
            return Ok(0);
        }
        let cache = self
            .find_by_name(name)
            .ok_or_else(|| RegistryError::UnknownDataset(name.to_owned()))?;
        Ok(dataset_hash(cache.value_checksums()?))
    }

    /// Checksum of one cached item, or 0 when it is not cached or its
    /// dataset is excluded.
    pub fn calculate_item_hash(&self, name: &str, item: &str) -> Result<u32, RegistryError> {
        if self.config.is_excluded(name) {
            return Ok(0);
        }
        let cache = self
            .find_by_name(name)
            .ok_or_else(|| RegistryError::UnknownDataset(name.to_owned()))?;
        Ok(cache.item_checksum(item)?.unwrap_or(0))
    }

    /// Precache every registered dataset and wait for completion.
    pub async fn precache_all(&self) -> Vec<RefreshReport> {
        let mut reports = Vec::new();
        for cache in self.caches().into_values() {
            match cache.precache().await {
                Ok(report) => reports.push(report),
                Err(err) => warn!(
                    source_module = SOURCE,
                    dataset = cache.descriptor().name(),
                    error = %err,
                    "Precache failed"
                ),
            }
        }
        reports
    }

    fn find(&self, id: DatasetId) -> Option<Registration> {
        if let Some(registration) = self.dynamics.get(&id) {
            return Some(registration.clone());
        }
        self.statics
            .get()
            .and_then(|statics| statics.caches.get(&id))
            .cloned()
    }

    fn is_static_non_cached(&self, id: DatasetId) -> bool {
        self.statics.get().is_some_and(|statics| {
            statics.types.contains_key(&id) && !statics.caches.contains_key(&id)
        })
    }

    fn schedule_precache(&self, cache: Arc<dyn DynCache>) {
        if !self.config.precache {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!(
                source_module = SOURCE,
                dataset = cache.descriptor().name(),
                "No runtime available; precache skipped"
            );
            return;
        };
        handle.spawn(async move {
            if let Err(err) = cache.precache().await {
                warn!(
                    source_module = SOURCE,
                    dataset = cache.descriptor().name(),
                    error = %err,
                    "Background precache failed"
                );
            }
        });
    }
}

fn downcast<K: CacheKey, V: CacheValue>(cache: &dyn Any) -> Option<DatasetCache<K, V>> {
    cache.downcast_ref::<DatasetCache<K, V>>().cloned()
}
