use thiserror::Error;

use crate::cache::DatasetId;

/// Failure reported by a dataset store or the change-log store.
///
/// Store clients must report these distinctly from "confirmed absent",
/// which is an `Ok(None)` on the read path.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unavailable: {message}")]
    Unavailable { message: String },
    #[error("serialization failed: {message}")]
    Serialization { message: String },
}

impl StoreError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("store error for `{dataset}`: {source}")]
    Store {
        dataset: String,
        #[source]
        source: StoreError,
    },
    #[error("failed to decode key `{raw}` for `{dataset}`: {reason}")]
    KeyCodec {
        dataset: String,
        raw: String,
        reason: String,
    },
    #[error("failed to encode value for `{dataset}`: {reason}")]
    ValueCodec { dataset: String, reason: String },
}

impl CacheError {
    pub fn store(dataset: impl Into<String>, source: StoreError) -> Self {
        Self::Store {
            dataset: dataset.into(),
            source,
        }
    }

    pub fn key_codec(
        dataset: impl Into<String>,
        raw: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::KeyCodec {
            dataset: dataset.into(),
            raw: raw.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("no cache registered for dataset id {0}")]
    NotRegistered(DatasetId),
    #[error("no dataset named `{0}`")]
    UnknownDataset(String),
    #[error("static registrations were already built")]
    AlreadyInitialized,
    #[error("dataset `{dataset}` is registered with different key/value types")]
    TypeMismatch { dataset: String },
    #[error("dataset `{dataset}` is excluded from caching")]
    NonCached { dataset: String },
    #[error(transparent)]
    Cache(#[from] CacheError),
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("failed to scan change log: {0}")]
    Scan(#[source] StoreError),
    #[error("failed to apply change for `{dataset}`: {source}")]
    Apply {
        dataset: String,
        #[source]
        source: CacheError,
    },
}

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("failed to install tracing subscriber: {0}")]
    Subscriber(String),
}
