//! Change-log persistence and windowed reads.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use uuid::Uuid;

use super::record::{ChangeLogRecord, bucket_of, query_sequence};
use crate::cache::lock::{rw_read, rw_write};
use crate::error::StoreError;

const SOURCE: &str = "cachesync::changelog::store";

/// One bucket to read, optionally starting at a sequence id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketRange {
    pub bucket: i64,
    pub from: Option<Uuid>,
}

/// Shared, durable change log. Records are partitioned by bucket and ordered
/// by sequence id within a bucket.
#[async_trait]
pub trait ChangeLogStore: Send + Sync {
    async fn append(&self, record: ChangeLogRecord) -> Result<(), StoreError>;

    /// Records of every range, ordered by bucket then sequence id.
    async fn scan(&self, ranges: &[BucketRange]) -> Result<Vec<ChangeLogRecord>, StoreError>;
}

/// In-process [`ChangeLogStore`] with failure injection.
#[derive(Default)]
pub struct MemoryChangeLog {
    buckets: RwLock<BTreeMap<i64, BTreeMap<Uuid, ChangeLogRecord>>>,
    failing_appends: AtomicBool,
    failing_scans: AtomicUsize,
}

impl MemoryChangeLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `record` as-is, including incomplete ones.
    pub fn insert_raw(&self, record: ChangeLogRecord) {
        rw_write(&self.buckets, SOURCE, "insert_raw")
            .entry(record.bucket)
            .or_default()
            .insert(record.sequence, record);
    }

    pub fn records(&self) -> Vec<ChangeLogRecord> {
        rw_read(&self.buckets, SOURCE, "records")
            .values()
            .flat_map(|bucket| bucket.values().cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        rw_read(&self.buckets, SOURCE, "len")
            .values()
            .map(BTreeMap::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn set_failing_appends(&self, failing: bool) {
        self.failing_appends.store(failing, Ordering::SeqCst);
    }

    /// Fail the next `count` scans.
    pub fn fail_next_scans(&self, count: usize) {
        self.failing_scans.store(count, Ordering::SeqCst);
    }

    fn take_scan_failure(&self) -> bool {
        self.failing_scans
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl ChangeLogStore for MemoryChangeLog {
    async fn append(&self, record: ChangeLogRecord) -> Result<(), StoreError> {
        if self.failing_appends.load(Ordering::SeqCst) {
            return Err(StoreError::unavailable("change log rejected append"));
        }
        self.insert_raw(record);
        Ok(())
    }

    async fn scan(&self, ranges: &[BucketRange]) -> Result<Vec<ChangeLogRecord>, StoreError> {
        if self.take_scan_failure() {
            return Err(StoreError::unavailable("change log rejected scan"));
        }
        let buckets = rw_read(&self.buckets, SOURCE, "scan");
        let mut found = Vec::new();
        for range in ranges {
            let Some(bucket) = buckets.get(&range.bucket) else {
                continue;
            };
            match range.from {
                Some(from) => found.extend(bucket.range(from..).map(|(_, record)| record.clone())),
                None => found.extend(bucket.values().cloned()),
            }
        }
        Ok(found)
    }
}

/// Reads the records of a time window from a [`ChangeLogStore`].
#[derive(Clone)]
pub struct ChangeLogReader {
    store: Arc<dyn ChangeLogStore>,
    window_millis: i64,
}

impl ChangeLogReader {
    pub fn new(store: Arc<dyn ChangeLogStore>, window_millis: i64) -> Self {
        Self {
            store,
            window_millis,
        }
    }

    pub fn window_millis(&self) -> i64 {
        self.window_millis
    }

    /// Bucket ranges covering `[start, end]`.
    ///
    /// The first bucket is read from the lowest sequence of `start`; later
    /// buckets are read whole, up to and including the bucket holding `end`.
    /// Over-reading the tail is harmless because replay is idempotent.
    pub fn ranges(&self, start_millis: i64, end_millis: i64) -> Vec<BucketRange> {
        let first = bucket_of(start_millis, self.window_millis);
        let last = bucket_of(end_millis, self.window_millis);
        let mut ranges = vec![BucketRange {
            bucket: first,
            from: Some(query_sequence(start_millis)),
        }];
        let mut bucket = first + self.window_millis;
        while bucket <= last {
            ranges.push(BucketRange { bucket, from: None });
            bucket += self.window_millis;
        }
        ranges
    }

    pub async fn changes(
        &self,
        start_millis: i64,
        end_millis: i64,
    ) -> Result<Vec<ChangeLogRecord>, StoreError> {
        self.store
            .scan(&self.ranges(start_millis, end_millis))
            .await
    }
}
