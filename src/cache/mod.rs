//! Dataset caches.
//!
//! Each registered dataset gets one in-memory loading cache shared by every
//! caller in the process:
//!
//! - **Reads** are served from the cache; misses load from the dataset store
//!   and confirmed absences are cached as tombstones.
//! - **Writes** go through [`CachedDataset`] to the store first, then update
//!   the local cache and enqueue a change-log record for peers.
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! precache = false
//! precache_chunk_size = 500
//! refresh_concurrency = 8
//! exclude_from_refresh = ["Audit"]
//! # reload_after_write_ms = 600000
//! ```

mod config;
mod dataset;
mod decorator;
mod entry;
mod erased;
mod hash;
pub(crate) mod lock;
mod registry;
mod store;

pub use config::CacheConfig;
pub use dataset::{CacheKey, CacheValue, DatasetDescriptor, DatasetId, TypePair};
pub use decorator::CachedDataset;
pub use entry::{DatasetCache, RefreshReport};
pub use erased::DynCache;
pub use hash::{ConsistencyHasher, canonical_checksum, dataset_hash};
pub use registry::{CacheRegistry, DatasetDefinition};
pub use store::{DatasetStore, MemoryStore};
