//! Dataset identity.
//!
//! A dataset is identified by a stable integer derived from its name and the
//! names of its key and value types, so every process built from the same
//! definitions agrees on the id written into the change log.

use std::fmt;
use std::hash::Hash;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Bounds required of a dataset key.
///
/// Keys travel through the change log as JSON, so they must round-trip
/// through serde.
pub trait CacheKey:
    Clone + Eq + Hash + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<T> CacheKey for T where
    T: Clone + Eq + Hash + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

/// Bounds required of a dataset value.
///
/// Values are handed out as clones and serialized for consistency hashing.
pub trait CacheValue: Clone + Serialize + Send + Sync + 'static {}

impl<T> CacheValue for T where T: Clone + Serialize + Send + Sync + 'static {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DatasetId(u32);

impl DatasetId {
    pub fn derive(name: &str, key_type: &str, value_type: &str) -> Self {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(name.as_bytes());
        hasher.update(b"\0");
        hasher.update(key_type.as_bytes());
        hasher.update(b"\0");
        hasher.update(value_type.as_bytes());
        Self(hasher.finalize())
    }

    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for DatasetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Key and value type names of a registered dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TypePair {
    pub key_type: &'static str,
    pub value_type: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetDescriptor {
    name: String,
    types: TypePair,
    id: DatasetId,
}

impl DatasetDescriptor {
    pub fn new(name: impl Into<String>, key_type: &'static str, value_type: &'static str) -> Self {
        let name = name.into();
        let id = DatasetId::derive(&name, key_type, value_type);
        Self {
            name,
            types: TypePair {
                key_type,
                value_type,
            },
            id,
        }
    }

    /// Describe a dataset using the Rust type names of `K` and `V`.
    pub fn of<K: 'static, V: 'static>(name: impl Into<String>) -> Self {
        Self::new(
            name,
            std::any::type_name::<K>(),
            std::any::type_name::<V>(),
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> DatasetId {
        self.id
    }

    pub fn types(&self) -> TypePair {
        self.types
    }
}
