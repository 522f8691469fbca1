//! Order-insensitive consistency checksums.
//!
//! Each live value is serialized canonically and checksummed. A dataset's
//! checksums are grouped into a sorted multiset and folded into one global
//! CRC32, so two caches holding the same values produce the same hash no
//! matter how their entries were inserted.

use std::collections::BTreeMap;

use serde::Serialize;

/// CRC32 over the canonical JSON of `value`.
///
/// Serializing through `serde_json::Value` sorts object keys, so maps with
/// nondeterministic iteration order still hash identically.
pub fn canonical_checksum<V: Serialize>(value: &V) -> Result<u32, serde_json::Error> {
    let canonical = serde_json::to_value(value)?;
    let bytes = serde_json::to_vec(&canonical)?;
    Ok(crc32fast::hash(&bytes))
}

/// Accumulates per-dataset checksum multisets into one global hash.
#[derive(Default)]
pub struct ConsistencyHasher {
    global: crc32fast::Hasher,
    datasets: usize,
}

impl ConsistencyHasher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one dataset's value checksums into the running hash.
    pub fn absorb(&mut self, checksums: impl IntoIterator<Item = u32>) {
        let mut counts: BTreeMap<u32, u64> = BTreeMap::new();
        for checksum in checksums {
            *counts.entry(checksum).or_insert(0) += 1;
        }
        for (checksum, count) in counts {
            let bytes = checksum.to_be_bytes();
            for _ in 0..count {
                self.global.update(&bytes);
            }
        }
        self.datasets += 1;
    }

    pub fn datasets(&self) -> usize {
        self.datasets
    }

    pub fn finish(self) -> u32 {
        self.global.finalize()
    }
}

/// Hash of a single dataset's checksums.
pub fn dataset_hash(checksums: impl IntoIterator<Item = u32>) -> u32 {
    let mut hasher = ConsistencyHasher::new();
    hasher.absorb(checksums);
    hasher.finish()
}
